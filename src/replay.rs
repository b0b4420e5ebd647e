//! Replay dataset produced by the external demo/replay parser.
//!
//! The dataset is read-only input; nothing in the pipeline mutates it apart
//! from [`ReplayDataset::restrict_to_rounds`], which returns a new value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// TYPES
// =============================================================================

/// How in-game time maps onto video time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GameClock {
    /// Round-based games recorded in server ticks.
    Ticks {
        #[serde(default = "default_tick_rate")]
        tick_rate: f64,
        /// Tick at which the video begins.
        #[serde(default)]
        video_start_tick: Option<i64>,
    },
    /// Continuous games whose clock runs faster than real time.
    GameSpeed {
        multiplier: f64,
        #[serde(default)]
        duration_game_seconds: Option<f64>,
    },
}

fn default_tick_rate() -> f64 {
    64.0
}

impl GameClock {
    pub fn is_session(&self) -> bool {
        matches!(self, GameClock::Ticks { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    /// Current side or team label.
    #[serde(default)]
    pub side: Option<String>,
    /// Side at round one, for games that swap at halftime.
    #[serde(default)]
    pub starting_side: Option<String>,
    /// Free-form per-player statistics (kills, deaths, eapm, ...).
    #[serde(default)]
    pub stats: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub winner: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub number: u32,
    pub start_tick: i64,
    #[serde(default)]
    pub freeze_end_tick: Option<i64>,
    pub end_tick: i64,
    /// Winning side label, e.g. "CT" or "T".
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub bomb_planted: Option<bool>,
    #[serde(default)]
    pub bomb_site: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Kill,
    Damage,
    Item,
    Objective,
    Build,
    Research,
    Train,
    Action,
    #[serde(other)]
    Other,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Kill => "kill",
            EventKind::Damage => "damage",
            EventKind::Item => "item",
            EventKind::Objective => "objective",
            EventKind::Build => "build",
            EventKind::Research => "research",
            EventKind::Train => "train",
            EventKind::Action => "action",
            EventKind::Other => "other",
        }
    }
}

/// A single timestamped occurrence in the match.
///
/// Session games populate `round` and `tick`; continuous games populate
/// `game_seconds`. For kills, `actor` is the killer and `target` the victim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEvent {
    pub kind: EventKind,
    #[serde(default)]
    pub round: Option<u32>,
    #[serde(default)]
    pub tick: Option<i64>,
    #[serde(default)]
    pub game_seconds: Option<f64>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    /// Weapon, item, building or objective name.
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub headshot: bool,
    #[serde(default)]
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRange {
    pub first: u32,
    pub last: u32,
}

impl RoundRange {
    pub fn contains(&self, round: u32) -> bool {
        self.first <= round && round <= self.last
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayDataset {
    pub game: String,
    #[serde(default)]
    pub map: Option<String>,
    /// The player whose perspective the video shows.
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default)]
    pub rounds: Vec<Round>,
    #[serde(default)]
    pub events: Vec<ReplayEvent>,
    pub clock: GameClock,
    /// Rounds visible in the video, when the recording is partial.
    #[serde(default)]
    pub video_rounds: Option<RoundRange>,
}

// =============================================================================
// QUERIES
// =============================================================================

fn same_name(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

impl ReplayDataset {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn is_subject(&self, name: Option<&str>) -> bool {
        match (self.subject.as_deref(), name) {
            (Some(subject), Some(name)) => same_name(subject, name),
            _ => false,
        }
    }

    pub fn subject_player(&self) -> Option<&Player> {
        let subject = self.subject.as_deref()?;
        self.players.iter().find(|p| same_name(&p.name, subject))
    }

    /// Events the subject performed or suffered.
    pub fn subject_events(&self) -> impl Iterator<Item = &ReplayEvent> {
        self.events.iter().filter(move |e| {
            self.is_subject(e.actor.as_deref()) || self.is_subject(e.target.as_deref())
        })
    }

    /// First tick at which the subject died in `round`, if any.
    pub fn subject_death(&self, round: u32) -> Option<&ReplayEvent> {
        self.events
            .iter()
            .filter(|e| {
                e.kind == EventKind::Kill
                    && e.round == Some(round)
                    && e.tick.is_some()
                    && self.is_subject(e.target.as_deref())
            })
            .min_by_key(|e| e.tick)
    }

    /// Keep only the rounds in `range` and the events that belong to them.
    ///
    /// When the clock has no explicit video origin, the first kept round's
    /// start tick becomes the origin.
    pub fn restrict_to_rounds(&self, range: RoundRange) -> ReplayDataset {
        let mut out = self.clone();
        out.rounds.retain(|r| range.contains(r.number));
        out.events
            .retain(|e| e.round.map_or(true, |round| range.contains(round)));
        out.rounds.sort_by_key(|r| r.number);

        if let GameClock::Ticks {
            video_start_tick, ..
        } = &mut out.clock
        {
            if video_start_tick.is_none() {
                *video_start_tick = out.rounds.first().map(|r| r.start_tick);
            }
        }
        out.video_rounds = Some(range);
        out
    }

    /// Apply the dataset's own `video_rounds` restriction, if it has one.
    pub fn visible_portion(&self) -> ReplayDataset {
        match self.video_rounds {
            Some(range) => self.restrict_to_rounds(range),
            None => self.clone(),
        }
    }
}
