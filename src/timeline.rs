//! Deterministic observation windows derived from replay data.
//!
//! A window is a span of video time during which on-screen action is
//! attributable to the subject. Everything here is a pure function of the
//! dataset; model output never feeds back into the timeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::replay::{GameClock, ReplayDataset, ReplayEvent};

/// Sides swap after this round in session games.
pub const HALFTIME_ROUND: u32 = 12;

#[derive(Debug, Error, PartialEq)]
pub enum TimelineError {
    #[error("tick rate must be positive, got {0}")]
    InvalidTickRate(f64),
    #[error("game speed multiplier must be positive, got {0}")]
    InvalidMultiplier(f64),
    #[error("round {round} ends before it starts")]
    InvertedRound { round: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundOutcome {
    Win,
    Loss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationWindow {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    pub start_seconds: f64,
    pub end_seconds: f64,
    /// When the subject stopped being observable (death); always inside the window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_exit_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RoundOutcome>,
}

impl ObservationWindow {
    /// Latest video second at which the subject is still observable.
    pub fn acceptance_bound(&self) -> f64 {
        self.subject_exit_seconds.unwrap_or(self.end_seconds)
    }

    /// Whether `t` falls in the observable part of the window.
    pub fn accepts(&self, t: f64) -> bool {
        self.start_seconds <= t && t <= self.acceptance_bound()
    }

    /// Whether `t` falls anywhere in the window, observable or not.
    pub fn spans(&self, t: f64) -> bool {
        self.start_seconds <= t && t <= self.end_seconds
    }

    /// One line for prompts, e.g. `Round 2: 1:05 - 1:50 (DIED - stop analyzing after 1:50)`.
    pub fn describe(&self) -> String {
        let start = format_clock(self.start_seconds);
        match self.subject_exit_seconds {
            Some(exit) => {
                let exit = format_clock(exit);
                format!(
                    "{}: {start} - {exit} (DIED - stop analyzing after {exit})",
                    self.label
                )
            }
            None if self.round.is_some() => format!(
                "{}: {start} - {} (SURVIVED)",
                self.label,
                format_clock(self.end_seconds)
            ),
            None => format!(
                "{}: {start} - {}",
                self.label,
                format_clock(self.end_seconds)
            ),
        }
    }
}

/// Video-time mapping that produced a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClockMapping {
    Ticks { tick_rate: f64, origin_tick: i64 },
    GameSpeed { multiplier: f64 },
}

impl ClockMapping {
    pub fn tick_to_video(&self, tick: i64) -> Option<f64> {
        match *self {
            ClockMapping::Ticks {
                tick_rate,
                origin_tick,
            } => Some((tick.saturating_sub(origin_tick) as f64 / tick_rate).max(0.0)),
            ClockMapping::GameSpeed { .. } => None,
        }
    }

    pub fn game_to_video(&self, game_seconds: f64) -> Option<f64> {
        match *self {
            ClockMapping::GameSpeed { multiplier } => Some((game_seconds / multiplier).max(0.0)),
            ClockMapping::Ticks { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub clock: ClockMapping,
    pub windows: Vec<ObservationWindow>,
}

impl Timeline {
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn is_session(&self) -> bool {
        matches!(self.clock, ClockMapping::Ticks { .. })
    }

    /// Video second at which `event` happened, if its clock field is present.
    pub fn event_video_seconds(&self, event: &ReplayEvent) -> Option<f64> {
        match self.clock {
            ClockMapping::Ticks { .. } => event.tick.and_then(|t| self.clock.tick_to_video(t)),
            ClockMapping::GameSpeed { .. } => event
                .game_seconds
                .and_then(|s| self.clock.game_to_video(s)),
        }
    }

    /// Whether `event` happened inside the recorded footage. Session events
    /// count when their round has a window; untagged ones when they are not
    /// before the video origin.
    pub fn shows_event(&self, event: &ReplayEvent) -> bool {
        match (self.clock, event.round) {
            (ClockMapping::Ticks { .. }, Some(round)) => {
                self.windows.iter().any(|w| w.round == Some(round))
            }
            (ClockMapping::Ticks { origin_tick, .. }, None) => {
                event.tick.map_or(true, |t| t >= origin_tick)
            }
            (ClockMapping::GameSpeed { .. }, _) => true,
        }
    }

    /// First window whose observable span contains `t`.
    pub fn accepting_window(&self, t: f64) -> Option<&ObservationWindow> {
        self.windows.iter().find(|w| w.accepts(t))
    }

    /// First window whose full span contains `t`, even past the subject's exit.
    pub fn spanning_window(&self, t: f64) -> Option<&ObservationWindow> {
        self.windows.iter().find(|w| w.spans(t))
    }

    pub fn video_duration_seconds(&self) -> f64 {
        self.windows
            .iter()
            .map(|w| w.end_seconds)
            .fold(0.0, f64::max)
    }
}

/// Build observation windows for `dataset`.
pub fn build_timeline(dataset: &ReplayDataset) -> Result<Timeline, TimelineError> {
    match dataset.clock {
        GameClock::Ticks {
            tick_rate,
            video_start_tick,
        } => build_session_timeline(dataset, tick_rate, video_start_tick),
        GameClock::GameSpeed {
            multiplier,
            duration_game_seconds,
        } => build_continuous_timeline(dataset, multiplier, duration_game_seconds),
    }
}

fn build_session_timeline(
    dataset: &ReplayDataset,
    tick_rate: f64,
    video_start_tick: Option<i64>,
) -> Result<Timeline, TimelineError> {
    if !(tick_rate.is_finite() && tick_rate > 0.0) {
        return Err(TimelineError::InvalidTickRate(tick_rate));
    }

    let mut rounds: Vec<_> = dataset.rounds.iter().collect();
    rounds.sort_by_key(|r| r.number);

    let origin_tick = video_start_tick
        .or_else(|| rounds.first().map(|r| r.start_tick))
        .unwrap_or(0);
    let clock = ClockMapping::Ticks {
        tick_rate,
        origin_tick,
    };

    let starting_side = dataset
        .subject_player()
        .and_then(|p| p.starting_side.as_deref().or(p.side.as_deref()))
        .map(|s| s.trim().to_ascii_uppercase());

    let mut windows = Vec::with_capacity(rounds.len());
    for round in rounds {
        if round.end_tick < round.start_tick {
            return Err(TimelineError::InvertedRound {
                round: round.number,
            });
        }
        // Over before recording started.
        if round.start_tick < origin_tick && round.end_tick <= origin_tick {
            continue;
        }
        let start_seconds = clock.tick_to_video(round.start_tick).unwrap_or(0.0);
        let end_seconds = clock.tick_to_video(round.end_tick).unwrap_or(0.0);

        let death = dataset.subject_death(round.number);
        let subject_exit_seconds = death
            .and_then(|e| e.tick)
            .and_then(|t| clock.tick_to_video(t))
            .map(|t| t.clamp(start_seconds, end_seconds));
        let exit_detail = death.map(|e| {
            let killer = e.actor.as_deref().unwrap_or("unknown");
            match e.detail.as_deref() {
                Some(weapon) => format!("killed by {killer} ({weapon})"),
                None => format!("killed by {killer}"),
            }
        });

        let outcome = match (&starting_side, round.winner.as_deref()) {
            (Some(side), Some(winner)) => Some(round_outcome(side, winner, round.number)),
            _ => None,
        };

        windows.push(ObservationWindow {
            label: format!("Round {}", round.number),
            round: Some(round.number),
            start_seconds,
            end_seconds,
            subject_exit_seconds,
            exit_detail,
            outcome,
        });
    }

    tracing::debug!(
        windows = windows.len(),
        origin_tick,
        deaths = windows
            .iter()
            .filter(|w| w.subject_exit_seconds.is_some())
            .count(),
        "built session timeline"
    );

    Ok(Timeline { clock, windows })
}

fn round_outcome(starting_side: &str, winner: &str, round: u32) -> RoundOutcome {
    let side = if round <= HALFTIME_ROUND {
        starting_side.to_string()
    } else {
        swap_side(starting_side)
    };
    if winner.trim().eq_ignore_ascii_case(&side) {
        RoundOutcome::Win
    } else {
        RoundOutcome::Loss
    }
}

fn swap_side(side: &str) -> String {
    match side {
        "CT" => "T".to_string(),
        "T" => "CT".to_string(),
        other => other.to_string(),
    }
}

fn build_continuous_timeline(
    dataset: &ReplayDataset,
    multiplier: f64,
    duration_game_seconds: Option<f64>,
) -> Result<Timeline, TimelineError> {
    if !(multiplier.is_finite() && multiplier > 0.0) {
        return Err(TimelineError::InvalidMultiplier(multiplier));
    }
    let clock = ClockMapping::GameSpeed { multiplier };

    let duration = duration_game_seconds.or_else(|| {
        dataset
            .events
            .iter()
            .filter_map(|e| e.game_seconds)
            .reduce(f64::max)
    });

    // Without any notion of match length there is nothing to bound against.
    let windows = match duration {
        Some(d) if d > 0.0 => vec![ObservationWindow {
            label: "Match".to_string(),
            round: None,
            start_seconds: 0.0,
            end_seconds: d / multiplier,
            subject_exit_seconds: None,
            exit_detail: None,
            outcome: None,
        }],
        _ => Vec::new(),
    };

    Ok(Timeline { clock, windows })
}

// =============================================================================
// CLOCK FORMATTING
// =============================================================================

/// Format seconds as `M:SS` (minutes are not wrapped into hours).
pub fn format_clock(seconds: f64) -> String {
    let total = if seconds.is_finite() {
        seconds.max(0.0).floor() as u64
    } else {
        0
    };
    format!("{}:{:02}", total / 60, total % 60)
}

/// Parse `M:SS`, `H:MM:SS` or a bare number of seconds.
pub fn parse_clock(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let mut total = 0.0;
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    for part in &parts {
        let value: f64 = part.trim().parse().ok()?;
        if value < 0.0 || !value.is_finite() {
            return None;
        }
        total = total * 60.0 + value;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::{EventKind, Player, Round};

    fn three_rounds_with_death_in_second() -> ReplayDataset {
        // 64 ticks/s, rounds of 60 s starting at tick 1000.
        let rounds = (1..=3)
            .map(|n| {
                let start = 1_000 + (n as i64 - 1) * 64 * 60;
                Round {
                    number: n,
                    start_tick: start,
                    end_tick: start + 64 * 60,
                    winner: Some(if n == 2 { "T".into() } else { "CT".into() }),
                    ..Default::default()
                }
            })
            .collect();
        ReplayDataset {
            game: "cs2".into(),
            map: None,
            subject: Some("hero".into()),
            players: vec![Player {
                name: "Hero".into(),
                starting_side: Some("ct".into()),
                ..Default::default()
            }],
            rounds,
            events: vec![ReplayEvent {
                kind: EventKind::Kill,
                round: Some(2),
                // 45 s into round 2 (which starts at video 60 s).
                tick: Some(1_000 + 64 * 60 + 64 * 45),
                game_seconds: None,
                actor: Some("villain".into()),
                target: Some("hero".into()),
                detail: Some("awp".into()),
                headshot: true,
                amount: None,
            }],
            clock: GameClock::Ticks {
                tick_rate: 64.0,
                video_start_tick: None,
            },
            video_rounds: None,
        }
    }

    #[test]
    fn session_windows_start_at_zero_and_record_death() {
        let tl = build_timeline(&three_rounds_with_death_in_second()).unwrap();
        assert_eq!(tl.windows.len(), 3);
        assert_eq!(tl.windows[0].start_seconds, 0.0);
        assert_eq!(tl.windows[1].start_seconds, 60.0);
        assert_eq!(tl.windows[1].subject_exit_seconds, Some(105.0));
        assert_eq!(
            tl.windows[1].exit_detail.as_deref(),
            Some("killed by villain (awp)")
        );
        assert!(tl.windows[0].subject_exit_seconds.is_none());
        assert_eq!(tl.windows[0].outcome, Some(RoundOutcome::Win));
        assert_eq!(tl.windows[1].outcome, Some(RoundOutcome::Loss));
        assert_eq!(tl.video_duration_seconds(), 180.0);
    }

    #[test]
    fn explicit_video_origin_is_subtracted() {
        let mut ds = three_rounds_with_death_in_second();
        ds.clock = GameClock::Ticks {
            tick_rate: 64.0,
            video_start_tick: Some(1_000 - 64 * 10),
        };
        let tl = build_timeline(&ds).unwrap();
        assert_eq!(tl.windows[0].start_seconds, 10.0);
        assert_eq!(tl.windows[1].subject_exit_seconds, Some(115.0));
    }

    #[test]
    fn rounds_finished_before_the_video_are_dropped() {
        let mut ds = three_rounds_with_death_in_second();
        let third_start = ds.rounds[2].start_tick;
        ds.clock = GameClock::Ticks {
            tick_rate: 64.0,
            video_start_tick: Some(third_start),
        };
        let tl = build_timeline(&ds).unwrap();

        assert_eq!(tl.windows.len(), 1);
        assert_eq!(tl.windows[0].round, Some(3));
        assert_eq!(tl.windows[0].start_seconds, 0.0);
        assert_eq!(tl.windows[0].end_seconds, 60.0);
        assert!(!tl.shows_event(&ds.events[0]));
    }

    #[test]
    fn extreme_ticks_do_not_overflow() {
        let clock = ClockMapping::Ticks {
            tick_rate: 64.0,
            origin_tick: i64::MAX,
        };
        assert_eq!(clock.tick_to_video(i64::MIN), Some(0.0));
    }

    #[test]
    fn death_outside_round_is_clamped_into_window() {
        let mut ds = three_rounds_with_death_in_second();
        ds.events[0].tick = Some(1_000 + 64 * 60 * 5);
        let tl = build_timeline(&ds).unwrap();
        let w = &tl.windows[1];
        assert_eq!(w.subject_exit_seconds, Some(w.end_seconds));
    }

    #[test]
    fn sides_swap_after_halftime() {
        assert_eq!(round_outcome("CT", "CT", 12), RoundOutcome::Win);
        assert_eq!(round_outcome("CT", "CT", 13), RoundOutcome::Loss);
        assert_eq!(round_outcome("CT", "t", 13), RoundOutcome::Win);
    }

    #[test]
    fn build_is_deterministic() {
        let ds = three_rounds_with_death_in_second();
        assert_eq!(build_timeline(&ds).unwrap(), build_timeline(&ds).unwrap());
    }

    #[test]
    fn continuous_game_maps_game_time_through_multiplier() {
        let ds = ReplayDataset {
            game: "aoe2".into(),
            map: None,
            subject: Some("p1".into()),
            players: vec![],
            rounds: vec![],
            events: vec![ReplayEvent {
                kind: EventKind::Build,
                round: None,
                tick: None,
                game_seconds: Some(90.0),
                actor: Some("p1".into()),
                target: None,
                detail: Some("house".into()),
                headshot: false,
                amount: None,
            }],
            clock: GameClock::GameSpeed {
                multiplier: 1.5,
                duration_game_seconds: Some(1_800.0),
            },
            video_rounds: None,
        };
        let tl = build_timeline(&ds).unwrap();
        assert_eq!(tl.windows.len(), 1);
        assert_eq!(tl.windows[0].end_seconds, 1_200.0);
        assert!(tl.windows[0].subject_exit_seconds.is_none());
        let t = tl.event_video_seconds(&ds.events[0]).unwrap();
        assert_eq!(t, 60.0);
        assert_eq!(format_clock(t), "1:00");
    }

    #[test]
    fn invalid_clock_parameters_are_rejected() {
        let mut ds = three_rounds_with_death_in_second();
        ds.clock = GameClock::Ticks {
            tick_rate: 0.0,
            video_start_tick: None,
        };
        assert_eq!(
            build_timeline(&ds).unwrap_err(),
            TimelineError::InvalidTickRate(0.0)
        );
        ds.clock = GameClock::GameSpeed {
            multiplier: -1.0,
            duration_game_seconds: None,
        };
        assert!(matches!(
            build_timeline(&ds),
            Err(TimelineError::InvalidMultiplier(_))
        ));
    }

    #[test]
    fn clock_round_trips_common_forms() {
        assert_eq!(format_clock(0.0), "0:00");
        assert_eq!(format_clock(65.9), "1:05");
        assert_eq!(format_clock(-3.0), "0:00");
        assert_eq!(format_clock(3_725.0), "62:05");
        assert_eq!(parse_clock("1:05"), Some(65.0));
        assert_eq!(parse_clock("1:02:05"), Some(3_725.0));
        assert_eq!(parse_clock("42"), Some(42.0));
        assert_eq!(parse_clock("a:10"), None);
        assert_eq!(parse_clock(""), None);
    }

    #[test]
    fn describe_marks_death_and_survival() {
        let tl = build_timeline(&three_rounds_with_death_in_second()).unwrap();
        assert_eq!(tl.windows[0].describe(), "Round 1: 0:00 - 1:00 (SURVIVED)");
        assert_eq!(
            tl.windows[1].describe(),
            "Round 2: 1:00 - 1:45 (DIED - stop analyzing after 1:45)"
        );
    }
}
