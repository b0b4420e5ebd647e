//! Tip records passed between the pipeline stages.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize, Serializer};

use crate::timeline::format_clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    #[default]
    Important,
    Minor,
}

impl Severity {
    /// Lenient parse; anything unrecognized is `Important`.
    pub fn from_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "high" => Severity::Critical,
            "minor" | "low" => Severity::Minor,
            _ => Severity::Important,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Important => "important",
            Severity::Minor => "minor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TipTimestamp {
    /// Whole seconds into the video. Kept as `f64` for comparisons against
    /// window bounds; written out as an integer.
    #[serde(serialize_with = "whole_seconds")]
    pub video_seconds: f64,
    /// `M:SS` rendering of `video_seconds`.
    pub display: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_time: Option<String>,
}

impl TipTimestamp {
    /// Truncates to whole seconds, the resolution tips are reported at.
    pub fn at(video_seconds: f64) -> Self {
        let video_seconds = if video_seconds.is_finite() {
            video_seconds.max(0.0).floor()
        } else {
            0.0
        };
        Self {
            video_seconds,
            display: format_clock(video_seconds),
            game_time: None,
        }
    }
}

fn whole_seconds<S: Serializer>(seconds: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    let whole = if seconds.is_finite() {
        seconds.max(0.0).floor() as u64
    } else {
        0
    };
    serializer.serialize_u64(whole)
}

/// An unverified observation proposed by the observer stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTip {
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<TipTimestamp>,
    pub category: String,
    #[serde(default)]
    pub severity: Severity,
    pub observation: String,
    /// Why the observation matters.
    #[serde(alias = "why_it_matters")]
    pub rationale: String,
    pub fix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Other `M:SS` moments where the same pattern shows up.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recurring_timestamps: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TipSource {
    #[default]
    Observer,
    Validator,
}

/// A tip that survived verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedTip {
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<TipTimestamp>,
    pub category: String,
    pub severity: Severity,
    pub tip_text: String,
    /// 1..=10.
    pub confidence: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_notes: Option<String>,
    pub source: TipSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectionStage {
    Prefilter,
    Validator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedTip {
    pub id: String,
    pub reason: String,
    /// 0 for deterministic rejections.
    pub confidence: u8,
    pub stage: RejectionStage,
}

impl RejectedTip {
    pub fn prefilter(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reason: reason.into(),
            confidence: 0,
            stage: RejectionStage::Prefilter,
        }
    }

    pub fn validator(id: impl Into<String>, reason: impl Into<String>, confidence: u8) -> Self {
        Self {
            id: id.into(),
            reason: reason.into(),
            confidence,
            stage: RejectionStage::Validator,
        }
    }
}

/// Anything placed on the video timeline.
pub trait Timestamped {
    fn video_seconds(&self) -> Option<f64>;
}

impl Timestamped for CandidateTip {
    fn video_seconds(&self) -> Option<f64> {
        self.timestamp.as_ref().map(|t| t.video_seconds)
    }
}

impl Timestamped for VerifiedTip {
    fn video_seconds(&self) -> Option<f64> {
        self.timestamp.as_ref().map(|t| t.video_seconds)
    }
}

/// Stable sort by video time; untimestamped tips keep their order at the front.
pub fn sort_chronologically<T: Timestamped>(tips: &mut [T]) {
    tips.sort_by(|a, b| match (a.video_seconds(), b.video_seconds()) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.total_cmp(&y),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, t: Option<f64>) -> CandidateTip {
        CandidateTip {
            id: id.into(),
            timestamp: t.map(TipTimestamp::at),
            category: "positioning".into(),
            severity: Severity::Important,
            observation: "o".into(),
            rationale: "r".into(),
            fix: "f".into(),
            reasoning: None,
            recurring_timestamps: vec![],
        }
    }

    #[test]
    fn severity_parse_is_lenient() {
        assert_eq!(Severity::from_loose(" Critical "), Severity::Critical);
        assert_eq!(Severity::from_loose("minor"), Severity::Minor);
        assert_eq!(Severity::from_loose("whatever"), Severity::Important);
    }

    #[test]
    fn chronological_sort_is_stable_with_untimed_first() {
        let mut tips = vec![
            candidate("c", Some(30.0)),
            candidate("a", None),
            candidate("d", Some(10.0)),
            candidate("b", None),
            candidate("e", Some(10.0)),
        ];
        sort_chronologically(&mut tips);
        let ids: Vec<&str> = tips.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "d", "e", "c"]);
    }

    #[test]
    fn timestamp_serializes_whole_seconds() {
        let ts = TipTimestamp::at(30.0);
        assert_eq!(
            serde_json::to_value(&ts).unwrap(),
            serde_json::json!({"video_seconds": 30, "display": "0:30"})
        );

        let fractional = TipTimestamp::at(95.8);
        assert_eq!(fractional.video_seconds, 95.0);
        assert_eq!(fractional.display, "1:35");
        assert!(serde_json::to_value(&fractional).unwrap()["video_seconds"].is_u64());
    }

    #[test]
    fn candidate_accepts_why_it_matters_alias() {
        let raw = r#"{"id":"tip_001","category":"aim","observation":"o","why_it_matters":"w","fix":"f"}"#;
        let tip: CandidateTip = serde_json::from_str(raw).unwrap();
        assert_eq!(tip.rationale, "w");
        assert_eq!(tip.severity, Severity::Important);
        assert!(tip.timestamp.is_none());
    }
}
