//! Deterministic temporal filter between the two model passes.
//!
//! A candidate survives only if its timestamp falls where the subject was
//! observable. No model call is made here.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::timeline::{format_clock, parse_clock, Timeline};
use crate::tips::{CandidateTip, RejectedTip};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefilterOutcome {
    pub accepted: Vec<CandidateTip>,
    pub rejected: Vec<RejectedTip>,
}

/// Split candidates into those inside an observation window and those outside.
///
/// Untimestamped candidates pass. An empty timeline cannot be checked against,
/// so everything passes.
pub fn prefilter(candidates: Vec<CandidateTip>, timeline: &Timeline) -> PrefilterOutcome {
    if timeline.is_empty() {
        debug!(
            candidates = candidates.len(),
            "no observation windows; passing all candidates"
        );
        return PrefilterOutcome {
            accepted: candidates,
            rejected: Vec::new(),
        };
    }

    let mut outcome = PrefilterOutcome::default();
    for mut tip in candidates {
        let Some(t) = tip.timestamp.as_ref().map(|ts| ts.video_seconds) else {
            outcome.accepted.push(tip);
            continue;
        };

        if timeline.accepting_window(t).is_some() {
            prune_recurring(&mut tip, timeline);
            outcome.accepted.push(tip);
            continue;
        }

        let reason = rejection_reason(&tip, t, timeline);
        info!(tip = %tip.id, %reason, "pre-filter rejected tip");
        outcome.rejected.push(RejectedTip::prefilter(tip.id, reason));
    }

    info!(
        accepted = outcome.accepted.len(),
        rejected = outcome.rejected.len(),
        "pre-filter finished"
    );
    outcome
}

fn rejection_reason(tip: &CandidateTip, t: f64, timeline: &Timeline) -> String {
    let display = tip
        .timestamp
        .as_ref()
        .map(|ts| ts.display.clone())
        .unwrap_or_else(|| format_clock(t));

    match timeline.spanning_window(t) {
        Some(window) => {
            let exit = format_clock(window.acceptance_bound());
            match &window.exit_detail {
                Some(detail) => format!(
                    "Timestamp {display} is outside the subject's observable time ({}: subject exited at {exit}, {detail})",
                    window.label
                ),
                None => format!(
                    "Timestamp {display} is outside the subject's observable time ({}: subject exited at {exit})",
                    window.label
                ),
            }
        }
        None => format!("Timestamp {display} is outside every observation window"),
    }
}

/// Drop recurring timestamps that point at unobservable footage.
fn prune_recurring(tip: &mut CandidateTip, timeline: &Timeline) {
    let before = tip.recurring_timestamps.len();
    tip.recurring_timestamps.retain(|ts| {
        parse_clock(ts).map_or(false, |t| timeline.accepting_window(t).is_some())
    });
    let dropped = before - tip.recurring_timestamps.len();
    if dropped > 0 {
        debug!(tip = %tip.id, dropped, "pruned recurring timestamps outside windows");
    }
}
