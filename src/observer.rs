//! Observer stage: one model pass over the video that proposes candidate tips.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::extract::{parse_structured, Extraction};
use crate::knowledge::render_knowledge;
use crate::gateway::{
    Attribution, ChainContext, InvokeRequest, ModelGateway, ProviderError, ThinkingLevel,
    VideoReference,
};
use crate::prompts::{
    observer_template, render_replay_context, render_windows, GameFamily, PromptInstance,
    TipPolicy,
};
use crate::replay::ReplayDataset;
use crate::timeline::{format_clock, parse_clock, Timeline};
use crate::tips::{sort_chronologically, CandidateTip, Severity, TipTimestamp};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub model: String,
    pub thinking: ThinkingLevel,
    pub tip_policy: TipPolicy,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            thinking: ThinkingLevel::High,
            tip_policy: TipPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObserverOutput {
    /// Candidates ordered by timestamp.
    pub tips: Vec<CandidateTip>,
    /// Unmodified model text, kept for diagnostics.
    pub raw_text: String,
    /// Whether the response parsed at all.
    pub parsed: bool,
    /// Tips dropped for being malformed.
    pub skipped: usize,
    /// Context the validator can continue from.
    pub chain: Option<ChainContext>,
    /// Video as registered for the credential that answered.
    pub video: Option<VideoReference>,
    pub prompt_fingerprint: String,
}

#[derive(Deserialize)]
struct TipEnvelope {
    tips: Vec<serde_json::Value>,
}

/// A bare list of tips. Lists holding no objects at all (e.g. `[1, 3]` in
/// prose) are rejected so extraction moves on to the next span.
#[derive(Deserialize)]
#[serde(try_from = "Vec<serde_json::Value>")]
struct TipList(Vec<serde_json::Value>);

impl TryFrom<Vec<serde_json::Value>> for TipList {
    type Error = &'static str;

    fn try_from(items: Vec<serde_json::Value>) -> Result<Self, Self::Error> {
        if items.is_empty() || items.iter().any(serde_json::Value::is_object) {
            Ok(TipList(items))
        } else {
            Err("list holds no tip objects")
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Structured {
        #[serde(default)]
        video_seconds: Option<f64>,
        #[serde(default)]
        display: Option<String>,
        #[serde(default)]
        game_time: Option<String>,
    },
    Seconds(f64),
    Display(String),
}

#[derive(Deserialize)]
struct RawTip {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<RawTimestamp>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    observation: Option<String>,
    #[serde(default, alias = "rationale")]
    why_it_matters: Option<String>,
    #[serde(default)]
    fix: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    recurring_timestamps: Option<Vec<String>>,
}

// =============================================================================
// Prompt
// =============================================================================

pub fn build_observer_prompt(
    dataset: &ReplayDataset,
    timeline: &Timeline,
    policy: &TipPolicy,
) -> PromptInstance {
    let family = GameFamily::of(timeline);
    let duration = timeline.video_duration_seconds();
    let (low, high) = policy.target(duration);

    let replay = render_replay_context(dataset, timeline);
    let windows = render_windows(timeline);
    let duration_text = if duration > 0.0 {
        format_clock(duration)
    } else {
        "an unknown length".to_string()
    };
    let low = low.to_string();
    let high = high.to_string();
    let categories = family.categories().join(", ");

    observer_template(family).render(&[
        ("replay", &replay),
        ("windows", &windows),
        ("duration", &duration_text),
        ("tip_low", &low),
        ("tip_high", &high),
        ("categories", &categories),
        ("knowledge", &render_knowledge(&dataset.game)),
    ])
}

// =============================================================================
// Stage
// =============================================================================

/// Run the observer pass. Only gateway failures are errors; an unusable
/// response yields an empty candidate list.
pub async fn observe(
    gateway: &dyn ModelGateway,
    dataset: &ReplayDataset,
    timeline: &Timeline,
    video: &VideoReference,
    config: &ObserverConfig,
    attribution: Attribution,
) -> Result<ObserverOutput, ProviderError> {
    let prompt = build_observer_prompt(dataset, timeline, &config.tip_policy);
    let prompt_fingerprint = prompt.fingerprint();
    debug!(
        template = %prompt.template_slug,
        fingerprint = %prompt_fingerprint,
        chars = prompt.user.len(),
        "observer prompt built"
    );

    let req = InvokeRequest::new(&config.model, prompt.system, prompt.user, attribution)
        .video(video.clone())
        .thinking(config.thinking)
        .json();

    let resp = gateway.invoke(req).await?;
    let chain = resp.chain_context();

    let (tips, parsed, skipped) = match parse_observer_response(&resp.text) {
        Extraction::Parsed((tips, skipped)) => (tips, true, skipped),
        Extraction::Failed { reason } => {
            warn!(%reason, "observer response could not be parsed; no candidates");
            (Vec::new(), false, 0)
        }
    };

    info!(
        candidates = tips.len(),
        skipped,
        parsed,
        "observer finished"
    );

    Ok(ObserverOutput {
        tips,
        raw_text: resp.text,
        parsed,
        skipped,
        chain,
        video: resp.video,
        prompt_fingerprint,
    })
}

/// Parse observer text into chronologically ordered candidates.
///
/// Returns the candidates plus how many items were skipped as malformed.
pub fn parse_observer_response(raw: &str) -> Extraction<(Vec<CandidateTip>, usize)> {
    // The envelope is tried across the whole text before any bare list.
    let items = match parse_structured::<TipEnvelope>(raw) {
        Extraction::Parsed(envelope) => envelope.tips,
        Extraction::Failed { reason } => match parse_structured::<TipList>(raw) {
            Extraction::Parsed(TipList(items)) => items,
            Extraction::Failed { .. } => return Extraction::Failed { reason },
        },
    };

    let mut tips = Vec::with_capacity(items.len());
    let mut seen_ids = HashSet::new();
    let mut skipped = 0;

    for (i, item) in items.into_iter().enumerate() {
        let raw_tip = match serde_json::from_value::<RawTip>(item) {
            Ok(t) => t,
            Err(e) => {
                warn!(index = i, error = %e, "skipping malformed tip");
                skipped += 1;
                continue;
            }
        };
        match normalize_tip(raw_tip, tips.len() + 1, &mut seen_ids) {
            Some(tip) => tips.push(tip),
            None => {
                warn!(index = i, "skipping tip without an observation");
                skipped += 1;
            }
        }
    }

    sort_chronologically(&mut tips);
    Extraction::Parsed((tips, skipped))
}

fn normalize_tip(raw: RawTip, ordinal: usize, seen_ids: &mut HashSet<String>) -> Option<CandidateTip> {
    let observation = raw.observation.map(|s| s.trim().to_string()).unwrap_or_default();
    if observation.is_empty() {
        return None;
    }

    let mut id = raw
        .id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("tip_{ordinal:03}"));
    if seen_ids.contains(&id) {
        id = format!("{id}_{ordinal}");
    }
    seen_ids.insert(id.clone());

    let category = raw
        .category
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "general".to_string());

    Some(CandidateTip {
        id,
        timestamp: raw.timestamp.and_then(normalize_timestamp),
        category,
        severity: raw
            .severity
            .as_deref()
            .map(Severity::from_loose)
            .unwrap_or_default(),
        observation,
        rationale: raw.why_it_matters.unwrap_or_default(),
        fix: raw.fix.unwrap_or_default(),
        reasoning: raw.reasoning.filter(|r| !r.trim().is_empty()),
        recurring_timestamps: raw
            .recurring_timestamps
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| parse_clock(t).is_some())
            .collect(),
    })
}

fn normalize_timestamp(raw: RawTimestamp) -> Option<TipTimestamp> {
    let (seconds, game_time) = match raw {
        RawTimestamp::Structured {
            video_seconds,
            display,
            game_time,
        } => (
            video_seconds.or_else(|| display.as_deref().and_then(parse_clock)),
            game_time,
        ),
        RawTimestamp::Seconds(s) => (Some(s), None),
        RawTimestamp::Display(d) => (parse_clock(&d), None),
    };
    let seconds = seconds.filter(|s| s.is_finite() && *s >= 0.0)?;
    Some(TipTimestamp {
        game_time,
        ..TipTimestamp::at(seconds)
    })
}
