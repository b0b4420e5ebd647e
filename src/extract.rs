//! Best-effort recovery of structured JSON from model free text.
//!
//! Steps, in order: prefer fenced code blocks, then every balanced
//! object/array in the text from left to right, each checked against the
//! schema through serde until one fits. Failure
//! is an explicit [`Extraction::Failed`] value rather than an error, since
//! every caller has a defined fallback.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)```").expect("Invalid fenced block regex")
});

/// Outcome of parsing a model response against a schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction<T> {
    Parsed(T),
    Failed { reason: String },
}

impl<T> Extraction<T> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Extraction::Parsed(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Extraction::Parsed(v) => Some(v),
            Extraction::Failed { .. } => None,
        }
    }
}

/// Parse `raw` into `T`, tolerating prose and markdown fences around the JSON.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Extraction<T> {
    if raw.trim().is_empty() {
        return Extraction::Failed {
            reason: "empty response".to_string(),
        };
    }

    let mut last_error = String::from("no JSON found");
    let mut tried: Vec<&str> = Vec::new();
    for candidate in candidates(raw) {
        if tried.contains(&candidate) {
            continue;
        }
        tried.push(candidate);
        match serde_json::from_str::<T>(candidate) {
            Ok(v) => return Extraction::Parsed(v),
            Err(e) => last_error = e.to_string(),
        }
    }

    let preview: String = raw.chars().take(200).collect();
    Extraction::Failed {
        reason: format!("{last_error} (response starts: {preview:?})"),
    }
}

/// Candidate JSON slices in preference order: spans inside fenced blocks
/// first, then spans anywhere in the text. Produced lazily so parsing stops at
/// the first span that fits the schema.
fn candidates<'a>(raw: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    FENCED_BLOCK
        .captures_iter(raw)
        .filter_map(|c| c.get(1))
        .flat_map(|block| balanced_spans(block.as_str()))
        .chain(balanced_spans(raw))
}

/// Every balanced `{...}` or `[...]` span, ordered by start offset. Nested
/// spans are included after their parent.
fn balanced_spans<'a>(text: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    text.char_indices()
        .filter(|&(_, c)| c == '{' || c == '[')
        .filter_map(move |(start, _)| {
            let rest = &text[start..];
            find_matching_delimiter(rest).map(|end| &rest[..end])
        })
}

/// The first balanced JSON object or array in `raw`, or the trimmed input
/// when there is none.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    balanced_spans(trimmed).next().unwrap_or(trimmed)
}

/// Byte offset just past the delimiter that closes the one `s` starts with.
/// Brackets inside `"..."` strings are ignored.
fn find_matching_delimiter(s: &str) -> Option<usize> {
    let (open, close) = match s.chars().next()? {
        '{' => ('{', '}'),
        '[' => ('[', ']'),
        _ => return None,
    };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(i + c.len_utf8());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Doc {
        tips: Vec<String>,
    }

    #[test]
    fn pure_json() {
        let input = r#"{"tips": ["a"]}"#;
        assert_eq!(extract_json(input), input);
        assert_eq!(
            parse_structured::<Doc>(input),
            Extraction::Parsed(Doc {
                tips: vec!["a".into()]
            })
        );
    }

    #[test]
    fn fenced_block_wins_over_prose_braces() {
        let input = "Thinking about {stuff} first.\n```json\n{\"tips\": [\"b\"]}\n```\nDone.";
        let doc = parse_structured::<Doc>(input).ok().unwrap();
        assert_eq!(doc.tips, vec!["b".to_string()]);
    }

    #[test]
    fn braces_in_strings_are_ignored() {
        let wrapped = r#"Result: {"tips": ["use {braces} \"literally\""]} trailing"#;
        assert_eq!(
            extract_json(wrapped),
            r#"{"tips": ["use {braces} \"literally\""]}"#
        );
    }

    #[test]
    fn top_level_array() {
        let input = "Here you go: [1, 2, [3]] ok";
        assert_eq!(extract_json(input), "[1, 2, [3]]");
        let parsed: Vec<serde_json::Value> = parse_structured(input).ok().unwrap();
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn garbage_fails_soft() {
        match parse_structured::<Doc>("I could not watch the video.") {
            Extraction::Failed { reason } => assert!(reason.contains("response starts")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!parse_structured::<Doc>("   ").is_parsed());
        assert!(!parse_structured::<Doc>(r#"{"tips": "#).is_parsed());
    }

    #[test]
    fn brackets_in_leading_prose_are_skipped() {
        let input = r#"Reviewed rounds [1-3] carefully. Result: {"tips": ["c"]}"#;
        let doc = parse_structured::<Doc>(input).ok().unwrap();
        assert_eq!(doc.tips, vec!["c".to_string()]);

        let value = parse_structured::<serde_json::Value>(r#"Note {see below}. {"tips": []}"#)
            .ok()
            .unwrap();
        assert_eq!(value, serde_json::json!({"tips": []}));
    }

    #[test]
    fn valid_json_that_misses_the_schema_is_passed_over() {
        let input = r#"Context: {"round": 2}. Answer: {"tips": ["d"]}"#;
        let doc = parse_structured::<Doc>(input).ok().unwrap();
        assert_eq!(doc.tips, vec!["d".to_string()]);
    }

    #[test]
    fn schema_mismatch_fails() {
        assert!(!parse_structured::<Doc>(r#"{"other": 1}"#).is_parsed());
    }
}
