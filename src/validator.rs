//! Validator stage: a second model pass that scores each surviving candidate
//! against the video and the replay data.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::extract::{parse_structured, Extraction};
use crate::knowledge::render_knowledge;
use crate::gateway::{
    Attribution, ChainContext, InvokeRequest, ModelGateway, ProviderError, ThinkingLevel,
    VideoReference,
};
use crate::prompts::{
    render_candidates, render_replay_context, render_windows, validator_template, GameFamily,
    PromptInstance,
};
use crate::replay::ReplayDataset;
use crate::timeline::{parse_clock, Timeline};
use crate::tips::{
    sort_chronologically, CandidateTip, RejectedTip, Severity, TipSource, TipTimestamp,
    VerifiedTip,
};

/// Summary used when the validator response cannot be parsed.
pub const VERIFICATION_FAILED_SUMMARY: &str = "Verification could not be completed for this \
match, so no tips are shown yet. Please run the analysis again to get verified coaching feedback.";

/// Summary used when no candidate reached the validator.
pub const NOTHING_TO_VERIFY_SUMMARY: &str = "No coaching moments could be tied to the times you \
were on screen in this recording. Try a longer clip or one where more of your own play is visible.";

/// Appended to summaries that come back too short.
const SUMMARY_PAD: &str = "Review the verified tips below, starting with the critical ones, and \
focus on fixing one habit at a time in your next match.";

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    /// Lowest confidence (1..=10) that keeps a tip.
    pub min_confidence: u8,
    pub summary_min_chars: usize,
    pub summary_max_chars: usize,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            min_confidence: 8,
            summary_min_chars: 100,
            summary_max_chars: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub model: String,
    pub thinking: ThinkingLevel,
    pub policy: ValidationPolicy,
    /// Continue from the observer interaction instead of re-sending the video.
    pub chain_from_observer: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            thinking: ThinkingLevel::High,
            policy: ValidationPolicy::default(),
            chain_from_observer: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorOutput {
    /// Tips at or above the confidence threshold, ordered by timestamp.
    pub verified: Vec<VerifiedTip>,
    pub rejected: Vec<RejectedTip>,
    /// Always within the policy's summary length bounds.
    pub summary: String,
    pub parsed: bool,
    /// Whether a model call was made.
    pub called_model: bool,
    pub raw_text: String,
    pub prompt_fingerprint: Option<String>,
}

// =============================================================================
// Raw response
// =============================================================================

#[derive(Deserialize)]
struct RawValidatorResponse {
    verified_tips: Vec<serde_json::Value>,
    #[serde(default)]
    removed_tips: Vec<serde_json::Value>,
    #[serde(default)]
    summary_text: Option<String>,
}

#[derive(Deserialize)]
struct RawVerified {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    tip_text: Option<String>,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
    #[serde(default)]
    verification_notes: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Deserialize)]
struct RawRemoved {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
}

/// Accepts `9`, `9.4`, or `"9"`; clamps into 1..=10.
fn parse_confidence(v: Option<&serde_json::Value>) -> Option<u8> {
    let n = match v? {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !n.is_finite() {
        return None;
    }
    Some(n.round().clamp(1.0, 10.0) as u8)
}

fn parse_timestamp(v: Option<&serde_json::Value>) -> Option<TipTimestamp> {
    let seconds = match v? {
        serde_json::Value::Object(map) => map
            .get("video_seconds")
            .and_then(|s| s.as_f64())
            .or_else(|| map.get("display").and_then(|d| d.as_str()).and_then(parse_clock)),
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => parse_clock(s),
        _ => None,
    }?;
    (seconds.is_finite() && seconds >= 0.0).then(|| TipTimestamp::at(seconds))
}

// =============================================================================
// Prompt
// =============================================================================

pub fn build_validator_prompt(
    dataset: &ReplayDataset,
    timeline: &Timeline,
    candidates: &[CandidateTip],
    policy: &ValidationPolicy,
) -> PromptInstance {
    let family = GameFamily::of(timeline);
    let replay = render_replay_context(dataset, timeline);
    let windows = render_windows(timeline);
    let rendered = render_candidates(candidates);
    let count = candidates.len().to_string();
    let min_confidence = policy.min_confidence.to_string();

    validator_template(family).render(&[
        ("replay", &replay),
        ("windows", &windows),
        ("candidates", &rendered),
        ("candidate_count", &count),
        ("min_confidence", &min_confidence),
        ("knowledge", &render_knowledge(&dataset.game)),
    ])
}

// =============================================================================
// Stage
// =============================================================================

/// Run the validator pass over the candidates that survived pre-filtering.
///
/// With no candidates the model is not called. An unusable response yields
/// zero verified tips and a fixed summary rather than an error.
#[allow(clippy::too_many_arguments)]
pub async fn validate(
    gateway: &dyn ModelGateway,
    dataset: &ReplayDataset,
    timeline: &Timeline,
    candidates: &[CandidateTip],
    video: Option<&VideoReference>,
    chain: Option<ChainContext>,
    config: &ValidatorConfig,
    attribution: Attribution,
) -> Result<ValidatorOutput, ProviderError> {
    if candidates.is_empty() {
        info!("no candidates survived pre-filtering; skipping validator call");
        return Ok(ValidatorOutput {
            verified: Vec::new(),
            rejected: Vec::new(),
            summary: normalize_summary(NOTHING_TO_VERIFY_SUMMARY, &config.policy),
            parsed: true,
            called_model: false,
            raw_text: String::new(),
            prompt_fingerprint: None,
        });
    }

    let prompt = build_validator_prompt(dataset, timeline, candidates, &config.policy);
    let fingerprint = prompt.fingerprint();
    debug!(
        template = %prompt.template_slug,
        fingerprint = %fingerprint,
        candidates = candidates.len(),
        "validator prompt built"
    );

    let mut req = InvokeRequest::new(&config.model, prompt.system, prompt.user, attribution)
        .thinking(config.thinking)
        .json();
    if let Some(v) = video {
        req = req.video(v.clone());
    }
    if config.chain_from_observer {
        req = req.chain(chain);
    }

    let resp = gateway.invoke(req).await?;
    let mut out = interpret_validator_response(&resp.text, candidates, timeline, &config.policy);
    out.raw_text = resp.text;
    out.prompt_fingerprint = Some(fingerprint);
    Ok(out)
}

/// Apply the threshold and consistency checks to a validator response.
pub fn interpret_validator_response(
    raw: &str,
    candidates: &[CandidateTip],
    timeline: &Timeline,
    policy: &ValidationPolicy,
) -> ValidatorOutput {
    let parsed = match parse_structured::<RawValidatorResponse>(raw) {
        Extraction::Parsed(p) => p,
        Extraction::Failed { reason } => {
            warn!(%reason, "validator response could not be parsed; no tips verified");
            return ValidatorOutput {
                verified: Vec::new(),
                rejected: Vec::new(),
                summary: normalize_summary(VERIFICATION_FAILED_SUMMARY, policy),
                parsed: false,
                called_model: true,
                raw_text: String::new(),
                prompt_fingerprint: None,
            };
        }
    };

    let by_id: HashMap<&str, &CandidateTip> =
        candidates.iter().map(|c| (c.id.as_str(), c)).collect();
    let mut decided: HashSet<String> = HashSet::new();
    let mut verified = Vec::new();
    let mut rejected = Vec::new();

    for item in parsed.verified_tips {
        let Ok(raw_tip) = serde_json::from_value::<RawVerified>(item) else {
            warn!("skipping malformed verified tip");
            continue;
        };
        let id = raw_tip.id.clone().unwrap_or_default();
        let confidence = parse_confidence(raw_tip.confidence.as_ref());

        let Some(candidate) = by_id.get(id.as_str()).copied() else {
            warn!(tip = %id, "validator returned a tip that was never proposed");
            rejected.push(RejectedTip::validator(
                id,
                "Validator returned an unknown tip id",
                confidence.unwrap_or(1),
            ));
            continue;
        };
        if !decided.insert(id.clone()) {
            debug!(tip = %id, "duplicate verdict ignored");
            continue;
        }

        let Some(confidence) = confidence else {
            rejected.push(RejectedTip::validator(id, "No confidence score given", 1));
            continue;
        };
        if confidence < policy.min_confidence {
            let reason = raw_tip
                .verification_notes
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| {
                    format!("Confidence {confidence} is below {}", policy.min_confidence)
                });
            rejected.push(RejectedTip::validator(id, reason, confidence));
            continue;
        }

        let timestamp =
            parse_timestamp(raw_tip.timestamp.as_ref()).or_else(|| candidate.timestamp.clone());
        if let Some(ts) = &timestamp {
            if !timeline.is_empty() && timeline.accepting_window(ts.video_seconds).is_none() {
                rejected.push(RejectedTip::validator(
                    id,
                    format!(
                        "Verified timestamp {} is outside the subject's observable time",
                        ts.display
                    ),
                    confidence,
                ));
                continue;
            }
        }

        let tip_text = raw_tip
            .tip_text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("{} {}", candidate.observation, candidate.fix).trim().to_string());

        verified.push(VerifiedTip {
            id,
            timestamp,
            category: raw_tip
                .category
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| candidate.category.clone()),
            severity: raw_tip
                .severity
                .as_deref()
                .map(Severity::from_loose)
                .unwrap_or(candidate.severity),
            tip_text,
            confidence,
            verification_notes: raw_tip.verification_notes,
            source: match raw_tip.source.as_deref() {
                Some(s) if s.eq_ignore_ascii_case("validator") => TipSource::Validator,
                _ => TipSource::Observer,
            },
        });
    }

    for item in parsed.removed_tips {
        let Ok(raw_tip) = serde_json::from_value::<RawRemoved>(item) else {
            continue;
        };
        let id = raw_tip.id.unwrap_or_default();
        if !by_id.contains_key(id.as_str()) || !decided.insert(id.clone()) {
            continue;
        }
        rejected.push(RejectedTip::validator(
            id,
            raw_tip
                .reason
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| "Removed by validator".to_string()),
            parse_confidence(raw_tip.confidence.as_ref()).unwrap_or(1),
        ));
    }

    for candidate in candidates {
        if !decided.contains(&candidate.id) {
            rejected.push(RejectedTip::validator(
                candidate.id.clone(),
                "Not returned by validator",
                0,
            ));
        }
    }

    sort_chronologically(&mut verified);
    info!(
        verified = verified.len(),
        rejected = rejected.len(),
        "validator finished"
    );

    let summary = match parsed.summary_text.as_deref() {
        Some(s) if !s.trim().is_empty() => normalize_summary(s, policy),
        _ => normalize_summary(SUMMARY_PAD, policy),
    };

    ValidatorOutput {
        verified,
        rejected,
        summary,
        parsed: true,
        called_model: true,
        raw_text: String::new(),
        prompt_fingerprint: None,
    }
}

/// Collapse whitespace, then pad or truncate into the policy's character bounds.
pub fn normalize_summary(raw: &str, policy: &ValidationPolicy) -> String {
    let min = policy.summary_min_chars;
    let max = policy.summary_max_chars.max(min).max(4);

    let mut text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() < min {
        // Pad with the stock sentence until long enough.
        while text.chars().count() < min {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(SUMMARY_PAD);
        }
    }

    if text.chars().count() > max {
        let keep = max - 3;
        let cut: String = text.chars().take(keep).collect();
        // Prefer a word boundary when it does not cost too much length.
        let trimmed = match cut.rfind(' ') {
            Some(i) if cut[..i].chars().count() >= min.saturating_sub(3).max(keep / 2) => {
                cut[..i].trim_end().to_string()
            }
            _ => cut,
        };
        text = format!("{trimmed}...");
    }
    text
}
