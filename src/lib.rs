#![forbid(unsafe_code)]

//! # replay-coach
//!
//! Turns a gameplay recording plus the match's replay data into a short list
//! of coaching tips that have been checked twice.
//!
//! A deterministic timeline says when the recorded player was actually on
//! screen. An observer model pass proposes candidate tips from the video, a
//! pre-filter drops any candidate that points at footage where the player
//! was dead or absent, and a validator model pass scores the rest against the
//! video and the replay's event log. Only tips scored at or above the
//! confidence threshold are returned.

pub mod extract;
pub mod gateway;
pub mod knowledge;
pub mod observer;
pub mod pipeline;
pub mod prefilter;
pub mod prompts;
pub mod replay;
pub mod timeline;
pub mod tips;
pub mod validator;

/// Model used by both passes unless configured otherwise.
pub const DEFAULT_MODEL: &str = "gemini-3-pro-preview";

pub use gateway::{
    Attribution, ModelGateway, ProviderError, ProviderGateway, ProviderPool, UsageSink,
    VideoReference,
};
pub use pipeline::{
    AnalysisStatus, CoachingPipeline, PipelineConfig, PipelineError, PipelineResult,
    SpawnedAnalysis, Stage,
};
pub use replay::ReplayDataset;
pub use timeline::{build_timeline, ObservationWindow, Timeline, TimelineError};
pub use tips::{CandidateTip, RejectedTip, VerifiedTip};
