//! Prompt templates for the observer and validator stages.
//!
//! Domain logic for rendering replay context into prompts. Provider-agnostic.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::replay::{EventKind, ReplayDataset, ReplayEvent};
use crate::timeline::{format_clock, RoundOutcome, Timeline};
use crate::tips::CandidateTip;

/// Kill feed entries shown before truncation.
const MAX_KILL_LINES: usize = 30;
/// Subject action lines shown for continuous games before truncation.
const MAX_ACTION_LINES: usize = 50;

// =============================================================================
// Prompt templates
// =============================================================================

/// Rendered prompt ready for the gateway.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    /// Stable hash of the rendered prompt, for correlating runs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.template_slug.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.system.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.user.as_bytes());
        hasher.finalize().to_hex()[..16].to_string()
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
pub fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// A prompt template with `{name}` placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Substitute placeholders in a single pass. Substituted text is never
    /// re-scanned, and braces that do not name a variable are left alone.
    pub fn render(&self, vars: &[(&str, &str)]) -> PromptInstance {
        PromptInstance {
            template_slug: self.slug.to_string(),
            system: substitute(self.system, vars),
            user: substitute(self.user, vars),
        }
    }
}

fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let name = &after[..close];
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v, close))
        });
        match value {
            Some((v, close)) => {
                out.push_str(v);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Whether the game is played in discrete rounds with deaths, or on one clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameFamily {
    Session,
    Continuous,
}

impl GameFamily {
    pub fn of(timeline: &Timeline) -> Self {
        if timeline.is_session() {
            GameFamily::Session
        } else {
            GameFamily::Continuous
        }
    }

    pub fn categories(&self) -> &'static [&'static str] {
        match self {
            GameFamily::Session => &[
                "exploitable_pattern",
                "rank_up_habit",
                "missed_adaptation",
                "positioning",
                "utility",
                "economy",
                "aim",
            ],
            GameFamily::Continuous => &[
                "exploitable_pattern",
                "rank_up_habit",
                "missed_adaptation",
                "economy",
                "military",
                "scouting",
                "macro",
            ],
        }
    }
}

pub const OBSERVER_SESSION: PromptTemplate = PromptTemplate {
    slug: "observer_session_v1",
    system: "You are a gameplay coach reviewing a recorded round-based match from the point of view \
of one player (the subject). The video shows the subject's screen while they are alive; after they \
die the camera spectates teammates, and that footage says nothing about the subject.

Analyze the subject's play from three angles:
1. EXPLOITABLE PATTERNS: habits an attentive opponent could predict and punish (same timings, \
same angles, same utility every round).
2. RANK-UP HABITS: fundamentals that separate this player from the next skill tier (crosshair \
placement, counter-strafing, trading, utility usage, economy decisions).
3. MISSED ADAPTATIONS: moments where information was available (sound, kill feed, teammate \
calls, utility) and the subject did not react to it.

Rules:
- Every tip must be about the subject's own actions.
- Only cite moments inside the valid analysis windows you are given. Never describe footage \
after the subject's death in a round.
- When a pattern repeats, write ONE tip and list every occurrence in recurring_timestamps.
- Use the replay data as ground truth for who did what; the video shows how.

{knowledge}

Respond with JSON only:
{
  \"tips\": [
    {
      \"id\": \"tip_001\",
      \"timestamp\": {\"video_seconds\": 45, \"display\": \"0:45\"},
      \"category\": \"exploitable_pattern\",
      \"severity\": \"critical\",
      \"observation\": \"what happened on screen\",
      \"why_it_matters\": \"the consequence\",
      \"fix\": \"what to do instead\",
      \"reasoning\": \"evidence, including rounds and times\",
      \"recurring_timestamps\": [\"0:45\", \"2:15\"]
    }
  ]
}",
    user: "<replay_data>
{replay}
</replay_data>

<valid_analysis_windows>
The subject is only observable during these ranges. Tips outside them will be rejected.
{windows}
</valid_analysis_windows>

<task>
The video is about {duration} long. Produce between {tip_low} and {tip_high} tips.
Allowed categories: {categories}.
Allowed severities: critical, important, minor.
</task>",
};

pub const OBSERVER_CONTINUOUS: PromptTemplate = PromptTemplate {
    slug: "observer_continuous_v1",
    system: "You are a gameplay coach reviewing a recorded real-time strategy match from the point \
of view of one player (the subject). The in-game clock runs faster than the video; the replay data \
below has already been converted to video time where it says so.

Analyze the subject's play from three angles:
1. EXPLOITABLE PATTERNS: predictable builds, timings, or unit compositions an opponent could punish.
2. RANK-UP HABITS: macro fundamentals (idle production, housing, age-up timing, resource balance).
3. MISSED ADAPTATIONS: moments where scouting or the opponent's army revealed information and the \
subject did not respond.

Rules:
- Every tip must be about the subject's own decisions.
- Timestamps are video time, not in-game time. Put the in-game time in game_time if useful.
- When a pattern repeats, write ONE tip and list every occurrence in recurring_timestamps.

{knowledge}

Respond with JSON only:
{
  \"tips\": [
    {
      \"id\": \"tip_001\",
      \"timestamp\": {\"video_seconds\": 60, \"display\": \"1:00\", \"game_time\": \"1:30\"},
      \"category\": \"macro\",
      \"severity\": \"important\",
      \"observation\": \"what happened on screen\",
      \"why_it_matters\": \"the consequence\",
      \"fix\": \"what to do instead\",
      \"reasoning\": \"evidence\",
      \"recurring_timestamps\": []
    }
  ]
}",
    user: "<replay_data>
{replay}
</replay_data>

<valid_analysis_windows>
{windows}
</valid_analysis_windows>

<task>
The video is about {duration} long. Produce between {tip_low} and {tip_high} tips.
Allowed categories: {categories}.
Allowed severities: critical, important, minor.
</task>",
};

pub const VALIDATOR_SESSION: PromptTemplate = PromptTemplate {
    slug: "validator_session_v1",
    system: "You are a verifier. Another analyst watched this match and proposed coaching tips. \
Your job is to check each one against the video and the replay data, not to add new tips.

For EACH tip:
1. Go to the claimed timestamp and watch 5 seconds before and 5 seconds after it.
2. Confirm the described event happened, at roughly that time, on the subject's screen.
3. Check the replay data: the subject must have been alive (see the valid analysis windows), and \
any claimed kill, death, grenade, purchase or objective must appear in the subject's own actions \
with a matching type and time. Actions by teammates or opponents do not count.
4. Assign an integer confidence from 1 to 10:
   - 9-10: clearly visible and confirmed by the replay data
   - 8: visible, replay data supports it
   - 5-7: something happened but the time, actor, or details are off
   - 1-4: did not happen, happened to someone else, or happened while spectating

Keep tips with confidence >= {min_confidence} in verified_tips and rewrite them as one concise \
tip_text (\"Issue observed. How to fix.\"). Put every other tip in removed_tips with a reason.
Write summary_text: 100-300 characters, spoken aloud, covering the two or three most important \
improvements, encouraging but honest.

{knowledge}

Respond with JSON only:
{
  \"verified_tips\": [
    {
      \"id\": \"tip_001\",
      \"timestamp\": {\"video_seconds\": 45, \"display\": \"0:45\"},
      \"category\": \"exploitable_pattern\",
      \"severity\": \"critical\",
      \"tip_text\": \"...\",
      \"confidence\": 9,
      \"verification_notes\": \"what you checked\"
    }
  ],
  \"removed_tips\": [{\"id\": \"tip_002\", \"reason\": \"...\", \"confidence\": 3}],
  \"summary_text\": \"...\"
}",
    user: "<replay_data>
{replay}
</replay_data>

<valid_analysis_windows>
{windows}
</valid_analysis_windows>

<tips_to_verify count=\"{candidate_count}\">
{candidates}
</tips_to_verify>",
};

pub const VALIDATOR_CONTINUOUS: PromptTemplate = PromptTemplate {
    slug: "validator_continuous_v1",
    system: "You are a verifier. Another analyst watched this real-time strategy match and proposed \
coaching tips. Check each one against the video and the replay data; do not add new tips.

For EACH tip:
1. Go to the claimed video timestamp and watch 5 seconds before and after it.
2. Confirm the described decision or event is visible on the subject's screen.
3. Cross-check builds, research, unit production and age-up times against the subject's actions \
in the replay data (in-game time runs faster than video time; both are listed).
4. Assign an integer confidence from 1 to 10 (9-10 confirmed, 8 supported, 5-7 partly wrong, \
1-4 did not happen or concerns the opponent).

Keep tips with confidence >= {min_confidence} in verified_tips with a concise tip_text. Put every \
other tip in removed_tips with a reason. Write summary_text: 100-300 characters, spoken aloud.

{knowledge}

Respond with JSON only:
{
  \"verified_tips\": [{\"id\": \"tip_001\", \"timestamp\": {\"video_seconds\": 60, \"display\": \"1:00\"}, \"category\": \"macro\", \"severity\": \"important\", \"tip_text\": \"...\", \"confidence\": 9, \"verification_notes\": \"...\"}],
  \"removed_tips\": [{\"id\": \"tip_002\", \"reason\": \"...\", \"confidence\": 3}],
  \"summary_text\": \"...\"
}",
    user: "<replay_data>
{replay}
</replay_data>

<valid_analysis_windows>
{windows}
</valid_analysis_windows>

<tips_to_verify count=\"{candidate_count}\">
{candidates}
</tips_to_verify>",
};

pub fn observer_template(family: GameFamily) -> PromptTemplate {
    match family {
        GameFamily::Session => OBSERVER_SESSION,
        GameFamily::Continuous => OBSERVER_CONTINUOUS,
    }
}

pub fn validator_template(family: GameFamily) -> PromptTemplate {
    match family {
        GameFamily::Session => VALIDATOR_SESSION,
        GameFamily::Continuous => VALIDATOR_CONTINUOUS,
    }
}

// =============================================================================
// Tip count policy
// =============================================================================

/// How many tips to ask for, scaled to video length.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TipPolicy {
    /// Dense end of the range: one tip per this many seconds.
    pub dense_seconds_per_tip: f64,
    /// Sparse end of the range: one tip per this many seconds.
    pub sparse_seconds_per_tip: f64,
    pub min_tips: usize,
    pub max_tips: usize,
}

impl Default for TipPolicy {
    fn default() -> Self {
        Self {
            dense_seconds_per_tip: 30.0,
            sparse_seconds_per_tip: 60.0,
            min_tips: 3,
            max_tips: 20,
        }
    }
}

impl TipPolicy {
    /// Inclusive `(low, high)` tip count for a video of `duration_seconds`.
    pub fn target(&self, duration_seconds: f64) -> (usize, usize) {
        let duration = duration_seconds.max(0.0);
        let (floor, ceil) = (
            self.min_tips.min(self.max_tips),
            self.min_tips.max(self.max_tips),
        );
        let clamp = |n: f64| (n.round() as usize).clamp(floor, ceil);
        let low = clamp(duration / self.sparse_seconds_per_tip.max(1.0));
        let high = clamp(duration / self.dense_seconds_per_tip.max(1.0));
        (low.min(high), low.max(high))
    }
}

// =============================================================================
// Context rendering
// =============================================================================

fn video_time(timeline: &Timeline, event: &ReplayEvent) -> String {
    timeline
        .event_video_seconds(event)
        .map(format_clock)
        .unwrap_or_else(|| "?:??".to_string())
}

fn stat_line(stats: &BTreeMap<String, serde_json::Value>) -> String {
    stats
        .iter()
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render the replay dataset as prompt text. All free-text fields are escaped.
pub fn render_replay_context(dataset: &ReplayDataset, timeline: &Timeline) -> String {
    let mut out = String::new();
    let esc = esc_str;

    let _ = writeln!(out, "Game: {}", esc(&dataset.game));
    if let Some(map) = &dataset.map {
        let _ = writeln!(out, "Map: {}", esc(map));
    }
    match &dataset.subject {
        Some(subject) => {
            let _ = writeln!(
                out,
                "Subject (coach THIS player only): {}",
                esc(subject)
            );
        }
        None => {
            let _ = writeln!(out, "Subject: unknown (coach the player whose screen is shown)");
        }
    }
    if timeline.is_session() {
        let _ = writeln!(out, "Rounds in video: {}", timeline.windows.len());
        let (wins, losses) = timeline.windows.iter().fold((0, 0), |(w, l), win| match win.outcome {
            Some(RoundOutcome::Win) => (w + 1, l),
            Some(RoundOutcome::Loss) => (w, l + 1),
            None => (w, l),
        });
        if wins + losses > 0 {
            let _ = writeln!(out, "Subject's rounds won/lost: {wins}-{losses}");
        }
    }

    if !dataset.players.is_empty() {
        let _ = writeln!(out, "\nPlayers:");
        let mut players: Vec<_> = dataset.players.iter().collect();
        players.sort_by(|a, b| {
            a.starting_side
                .as_deref()
                .or(a.side.as_deref())
                .cmp(&b.starting_side.as_deref().or(b.side.as_deref()))
                .then_with(|| a.name.cmp(&b.name))
        });
        for p in players {
            let marker = if dataset.is_subject(Some(&p.name)) {
                "  <<< SUBJECT"
            } else {
                ""
            };
            let side = p
                .starting_side
                .as_deref()
                .or(p.side.as_deref())
                .unwrap_or("-");
            let result = match p.winner {
                Some(true) => " [WON]",
                Some(false) => " [LOST]",
                None => "",
            };
            let _ = writeln!(
                out,
                "  [{}] {}{result}: {}{marker}",
                esc(side),
                esc(&p.name),
                esc(&stat_line(&p.stats))
            );
        }
    }

    if timeline.is_session() {
        render_session_events(&mut out, dataset, timeline);
    } else {
        render_continuous_events(&mut out, dataset, timeline);
    }

    out.trim_end().to_string()
}

fn render_session_events(out: &mut String, dataset: &ReplayDataset, timeline: &Timeline) {
    if !dataset.rounds.is_empty() {
        let _ = writeln!(out, "\nRound results:");
        for window in &timeline.windows {
            let Some(round) = window
                .round
                .and_then(|n| dataset.rounds.iter().find(|r| r.number == n))
            else {
                continue;
            };
            let winner = round.winner.as_deref().unwrap_or("?");
            let reason = round.reason.as_deref().unwrap_or("");
            let bomb = match (round.bomb_planted, round.bomb_site.as_deref()) {
                (Some(true), Some(site)) => format!(", bomb planted at {site}"),
                (Some(true), None) => ", bomb planted".to_string(),
                (Some(false), _) => ", no plant".to_string(),
                _ => String::new(),
            };
            let outcome = match window.outcome {
                Some(RoundOutcome::Win) => " (subject WON)",
                Some(RoundOutcome::Loss) => " (subject LOST)",
                None => "",
            };
            let _ = writeln!(
                out,
                "  Round {}: winner {} {}{bomb}{outcome}",
                round.number,
                esc_str(winner),
                esc_str(reason)
            );
        }
    }

    let kills: Vec<&ReplayEvent> = dataset
        .events
        .iter()
        .filter(|e| e.kind == EventKind::Kill && timeline.shows_event(e))
        .collect();
    if !kills.is_empty() {
        let _ = writeln!(out, "\nKill feed (video time):");
        for e in kills.iter().take(MAX_KILL_LINES) {
            let _ = writeln!(
                out,
                "  [{}] R{} {} killed {} with {}{}",
                video_time(timeline, e),
                e.round.unwrap_or(0),
                esc_str(e.actor.as_deref().unwrap_or("?")),
                esc_str(e.target.as_deref().unwrap_or("?")),
                esc_str(e.detail.as_deref().unwrap_or("?")),
                if e.headshot { " (headshot)" } else { "" }
            );
        }
        if kills.len() > MAX_KILL_LINES {
            let _ = writeln!(out, "  ... {} more kills", kills.len() - MAX_KILL_LINES);
        }
    }

    if dataset.subject.is_none() {
        return;
    }
    let _ = writeln!(
        out,
        "\nSubject actions by round (authoritative; anything not listed was done by someone else):"
    );
    for window in &timeline.windows {
        let Some(round) = window.round else {
            continue;
        };
        let actions: Vec<&ReplayEvent> = dataset
            .subject_events()
            .filter(|e| e.round == Some(round))
            .collect();
        let _ = writeln!(out, "  Round {round}:");
        if actions.is_empty() {
            let _ = writeln!(out, "    (no recorded actions)");
        }
        for e in actions {
            let _ = writeln!(out, "    [{}] {}", video_time(timeline, e), describe_event(dataset, e));
        }
    }
}

fn render_continuous_events(out: &mut String, dataset: &ReplayDataset, timeline: &Timeline) {
    let actions: Vec<&ReplayEvent> = if dataset.subject.is_some() {
        dataset.subject_events().collect()
    } else {
        dataset.events.iter().collect()
    };
    if actions.is_empty() {
        return;
    }
    let _ = writeln!(out, "\nSubject actions (video time / game time):");
    for e in actions.iter().take(MAX_ACTION_LINES) {
        let game = e
            .game_seconds
            .map(format_clock)
            .unwrap_or_else(|| "?:??".to_string());
        let _ = writeln!(
            out,
            "  [{} / {game}] {}",
            video_time(timeline, e),
            describe_event(dataset, e)
        );
    }
    if actions.len() > MAX_ACTION_LINES {
        let _ = writeln!(out, "  ... {} more actions", actions.len() - MAX_ACTION_LINES);
    }
}

fn esc_str(s: &str) -> String {
    escape_xml_chars(s)
}

fn describe_event(dataset: &ReplayDataset, e: &ReplayEvent) -> String {
    let detail = esc_str(e.detail.as_deref().unwrap_or(""));
    let actor = esc_str(e.actor.as_deref().unwrap_or("?"));
    let target = esc_str(e.target.as_deref().unwrap_or("?"));
    let subject_is_actor = dataset.is_subject(e.actor.as_deref());
    match e.kind {
        EventKind::Kill if subject_is_actor => format!(
            "KILL {target} with {detail}{}",
            if e.headshot { " (headshot)" } else { "" }
        ),
        EventKind::Kill => format!("DIED to {actor} ({detail})"),
        EventKind::Damage if subject_is_actor => format!(
            "dealt {} damage to {target}",
            e.amount.map(|a| a.to_string()).unwrap_or_else(|| "?".into())
        ),
        EventKind::Damage => format!(
            "took {} damage from {actor}",
            e.amount.map(|a| a.to_string()).unwrap_or_else(|| "?".into())
        ),
        kind => format!("{} {detail}", kind.as_str()).trim_end().to_string(),
    }
}

/// Render the observation windows, one per line.
pub fn render_windows(timeline: &Timeline) -> String {
    if timeline.is_empty() {
        return "No timeline available; judge observability from the video.".to_string();
    }
    timeline
        .windows
        .iter()
        .map(|w| w.describe())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render candidates for verification.
pub fn render_candidates(tips: &[CandidateTip]) -> String {
    if tips.is_empty() {
        return "No tips to verify.".to_string();
    }
    let mut out = String::new();
    for tip in tips {
        let (display, seconds) = match &tip.timestamp {
            Some(ts) => (ts.display.clone(), format!("{:.0}", ts.video_seconds)),
            None => ("general".to_string(), "n/a".to_string()),
        };
        let _ = writeln!(
            out,
            "### {} [{}] ({}) - {}",
            esc_str(&tip.id),
            esc_str(&display),
            esc_str(&tip.category),
            tip.severity.as_str()
        );
        let _ = writeln!(out, "- Observation: {}", esc_str(&tip.observation));
        let _ = writeln!(out, "- Why it matters: {}", esc_str(&tip.rationale));
        let _ = writeln!(out, "- Fix: {}", esc_str(&tip.fix));
        let _ = writeln!(
            out,
            "- Reasoning: {}",
            esc_str(tip.reasoning.as_deref().unwrap_or("Not provided"))
        );
        let _ = writeln!(out, "- Timestamp seconds: {seconds}");
        if !tip.recurring_timestamps.is_empty() {
            let _ = writeln!(
                out,
                "- Also seen at: {}",
                esc_str(&tip.recurring_timestamps.join(", "))
            );
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}
