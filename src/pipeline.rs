//! Two-stage coaching pipeline: timeline → observer → pre-filter → validator.
//!
//! Usage:
//! ```bash
//! coach analyze --replay replay.json --video-uri files/abc --video-id abc --out result.json
//! ```
//!
//! Every analysis ends in a [`PipelineResult`]. Failures are reported through
//! [`AnalysisStatus::Failed`] together with whatever metadata was collected
//! before the failing stage.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::gateway::{backoff_delay, Attribution, ModelGateway, ProviderError, VideoReference};
use crate::observer::{observe, ObserverConfig};
use crate::prefilter::prefilter;
use crate::replay::ReplayDataset;
use crate::timeline::{build_timeline, Timeline, TimelineError};
use crate::tips::{RejectedTip, VerifiedTip};
use crate::validator::{
    normalize_summary, validate, ValidatorConfig, VERIFICATION_FAILED_SUMMARY,
};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub observer: ObserverConfig,
    pub validator: ValidatorConfig,
    /// Extra attempts per stage for transient endpoint errors.
    pub stage_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Overall budget for one analysis; `None` means unbounded.
    pub deadline_seconds: Option<u64>,
    /// Trim the dataset to `video_rounds` before building the timeline.
    pub restrict_to_video_rounds: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            observer: ObserverConfig::default(),
            validator: ValidatorConfig::default(),
            stage_retries: 1,
            retry_base_delay_ms: 2_000,
            deadline_seconds: None,
            restrict_to_video_rounds: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GEMINI_MODEL` to both passes when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(model) = std::env::var("GEMINI_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
        {
            self.observer.model = model.trim().to_string();
            self.validator.model = model.trim().to_string();
        }
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let policy = &self.validator.policy;
        if !(1..=10).contains(&policy.min_confidence) {
            return Err(PipelineError::Config(format!(
                "min_confidence must be within 1..=10, got {}",
                policy.min_confidence
            )));
        }
        if policy.summary_min_chars > policy.summary_max_chars {
            return Err(PipelineError::Config(
                "summary_min_chars exceeds summary_max_chars".into(),
            ));
        }
        let tips = &self.observer.tip_policy;
        if tips.min_tips > tips.max_tips {
            return Err(PipelineError::Config("min_tips exceeds max_tips".into()));
        }
        Ok(())
    }

    fn deadline(&self) -> Option<Duration> {
        self.deadline_seconds.map(Duration::from_secs)
    }
}

// =============================================================================
// Result types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BuildingTimeline,
    Observing,
    Validating,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::BuildingTimeline => "building_timeline",
            Stage::Observing => "observing",
            Stage::Validating => "validating",
            Stage::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AnalysisStatus {
    Completed,
    Failed {
        stage: Stage,
        code: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMetadata {
    pub analysis_id: Uuid,
    pub total_time_seconds: f64,
    pub observer_time_seconds: f64,
    pub validator_time_seconds: f64,
    pub observer_tips_count: usize,
    /// Candidates removed by the pre-filter.
    pub prefiltered_count: usize,
    pub validator_removed_count: usize,
    pub final_tips_count: usize,
    pub removed_tips: Vec<RejectedTip>,
    pub observer_raw_output: String,
    pub timeline: Option<Timeline>,
    pub stage_reached: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer_prompt_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_prompt_fingerprint: Option<String>,
    pub validator_called: bool,
}

impl PipelineMetadata {
    fn new(analysis_id: Uuid) -> Self {
        Self {
            analysis_id,
            total_time_seconds: 0.0,
            observer_time_seconds: 0.0,
            validator_time_seconds: 0.0,
            observer_tips_count: 0,
            prefiltered_count: 0,
            validator_removed_count: 0,
            final_tips_count: 0,
            removed_tips: Vec::new(),
            observer_raw_output: String::new(),
            timeline: None,
            stage_reached: Stage::BuildingTimeline,
            observer_prompt_fingerprint: None,
            validator_prompt_fingerprint: None,
            validator_called: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Ordered by timestamp.
    pub verified_tips: Vec<VerifiedTip>,
    pub summary_text: String,
    pub status: AnalysisStatus,
    pub metadata: PipelineMetadata,
}

impl PipelineResult {
    pub fn is_completed(&self) -> bool {
        self.status == AnalysisStatus::Completed
    }
}

// =============================================================================
// Pipeline errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Timeline could not be built: {0}")]
    Timeline(#[from] TimelineError),
    #[error("{stage:?} failed: {source}")]
    Provider {
        stage: Stage,
        #[source]
        source: ProviderError,
    },
    #[error("Analysis cancelled before {0:?}")]
    Cancelled(Stage),
    #[error("Deadline of {deadline:?} exceeded during {stage:?}")]
    DeadlineExceeded { stage: Stage, deadline: Duration },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeline(_) => "timeline_error",
            Self::Provider { source, .. } => source.code(),
            Self::Cancelled(_) => "cancelled",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct CoachingPipeline {
    gateway: Arc<dyn ModelGateway>,
    config: PipelineConfig,
}

impl std::fmt::Debug for CoachingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoachingPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// An analysis running on its own task, with a cancel flag scoped to it.
pub struct SpawnedAnalysis {
    cancel_flag: Arc<AtomicBool>,
    handle: JoinHandle<PipelineResult>,
}

impl SpawnedAnalysis {
    /// Stop this analysis at its next stage boundary.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub async fn join(self) -> Result<PipelineResult, JoinError> {
        self.handle.await
    }
}

impl CoachingPipeline {
    /// Fails with [`PipelineError::Config`] when `config` does not validate.
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self { gateway, config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one analysis on its own task.
    pub fn spawn(self: &Arc<Self>, dataset: ReplayDataset, video: VideoReference) -> SpawnedAnalysis {
        let pipeline = Arc::clone(self);
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel_flag);
        let handle = tokio::spawn(async move {
            pipeline
                .analyze_with_cancel(&dataset, &video, Some(flag.as_ref()))
                .await
        });
        SpawnedAnalysis {
            cancel_flag,
            handle,
        }
    }

    /// Run many analyses with at most `concurrency` in flight. Results keep
    /// the input order. `cancel_flag` covers the whole batch.
    pub async fn analyze_batch(
        &self,
        jobs: &[(ReplayDataset, VideoReference)],
        concurrency: usize,
        cancel_flag: Option<&AtomicBool>,
    ) -> Vec<PipelineResult> {
        let mut results: Vec<(usize, PipelineResult)> = stream::iter(jobs.iter().enumerate())
            .map(|(idx, (dataset, video))| async move {
                (idx, self.analyze_with_cancel(dataset, video, cancel_flag).await)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, r)| r).collect()
    }

    pub async fn analyze(&self, dataset: &ReplayDataset, video: &VideoReference) -> PipelineResult {
        self.analyze_with_cancel(dataset, video, None).await
    }

    /// Like [`analyze`](Self::analyze), stopping at the next stage boundary
    /// once `cancel_flag` is set.
    pub async fn analyze_with_cancel(
        &self,
        dataset: &ReplayDataset,
        video: &VideoReference,
        cancel_flag: Option<&AtomicBool>,
    ) -> PipelineResult {
        let analysis_id = Uuid::new_v4();
        let span = info_span!("analysis", %analysis_id, game = %dataset.game);
        let mut run = AnalysisRun {
            pipeline: self,
            cancel_flag,
            started: Instant::now(),
            meta: PipelineMetadata::new(analysis_id),
        };
        async move {
            match run.execute(dataset, video).await {
                Ok((verified_tips, summary_text)) => run.finish(verified_tips, summary_text),
                Err(err) => run.fail(err),
            }
        }
        .instrument(span)
        .await
    }
}

/// State for one in-flight analysis.
struct AnalysisRun<'a> {
    pipeline: &'a CoachingPipeline,
    cancel_flag: Option<&'a AtomicBool>,
    started: Instant,
    meta: PipelineMetadata,
}

impl AnalysisRun<'_> {
    async fn execute(
        &mut self,
        dataset: &ReplayDataset,
        video: &VideoReference,
    ) -> Result<(Vec<VerifiedTip>, String), PipelineError> {
        let pipeline = self.pipeline;
        let config = &pipeline.config;
        let gateway = pipeline.gateway.as_ref();
        let analysis_id = self.meta.analysis_id;

        self.enter(Stage::BuildingTimeline)?;
        let dataset = if config.restrict_to_video_rounds {
            dataset.visible_portion()
        } else {
            dataset.clone()
        };
        let timeline = build_timeline(&dataset)?;
        info!(windows = timeline.windows.len(), "timeline built");
        self.meta.timeline = Some(timeline.clone());

        self.enter(Stage::Observing)?;
        let attribution = Attribution::new("observer").with_analysis(analysis_id);
        let stage_start = Instant::now();
        let observed = self
            .call_stage(Stage::Observing, || {
                observe(
                    gateway,
                    &dataset,
                    &timeline,
                    video,
                    &config.observer,
                    attribution.clone(),
                )
            })
            .await;
        self.meta.observer_time_seconds = stage_start.elapsed().as_secs_f64();
        let observed = observed?;
        self.meta.observer_tips_count = observed.tips.len();
        self.meta.observer_raw_output = observed.raw_text.clone();
        self.meta.observer_prompt_fingerprint = Some(observed.prompt_fingerprint.clone());

        let filtered = prefilter(observed.tips, &timeline);
        self.meta.prefiltered_count = filtered.rejected.len();
        self.meta.removed_tips.extend(filtered.rejected);

        self.enter(Stage::Validating)?;
        let validator_video = observed.video.as_ref().unwrap_or(video);
        let attribution = Attribution::new("validator").with_analysis(analysis_id);
        let stage_start = Instant::now();
        let validated = self
            .call_stage(Stage::Validating, || {
                validate(
                    gateway,
                    &dataset,
                    &timeline,
                    &filtered.accepted,
                    Some(validator_video),
                    observed.chain.clone(),
                    &config.validator,
                    attribution.clone(),
                )
            })
            .await;
        self.meta.validator_time_seconds = stage_start.elapsed().as_secs_f64();
        let validated = validated?;
        self.meta.validator_called = validated.called_model;
        self.meta.validator_prompt_fingerprint = validated.prompt_fingerprint;
        self.meta.validator_removed_count = validated.rejected.len();
        self.meta.removed_tips.extend(validated.rejected);

        self.meta.stage_reached = Stage::Done;
        Ok((validated.verified, validated.summary))
    }

    fn cancelled(&self) -> bool {
        self.cancel_flag
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn enter(&mut self, stage: Stage) -> Result<(), PipelineError> {
        if self.cancelled() {
            return Err(PipelineError::Cancelled(stage));
        }
        self.meta.stage_reached = stage;
        Ok(())
    }

    /// Run one gateway-backed stage with transient retries under the deadline.
    async fn call_stage<T, F, Fut>(&self, stage: Stage, mut call: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let config = &self.pipeline.config;
        let base = Duration::from_millis(config.retry_base_delay_ms);
        let mut attempt = 0u32;

        loop {
            // A deadline too far out to represent is the same as none.
            let bound = config
                .deadline()
                .and_then(|deadline| Some((self.started.checked_add(deadline)?, deadline)));
            let result = match bound {
                Some((at, deadline)) => {
                    match tokio::time::timeout_at(at, call()).await {
                        Ok(result) => result,
                        Err(_) => return Err(PipelineError::DeadlineExceeded { stage, deadline }),
                    }
                }
                None => call().await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < config.stage_retries => {
                    let delay = backoff_delay(base, attempt);
                    warn!(
                        stage = stage.as_str(),
                        attempt,
                        code = err.code(),
                        delay_ms = delay.as_millis() as u64,
                        "transient failure; retrying stage"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    if self.cancelled() {
                        return Err(PipelineError::Cancelled(stage));
                    }
                }
                Err(source) => return Err(PipelineError::Provider { stage, source }),
            }
        }
    }

    fn finish(mut self, verified_tips: Vec<VerifiedTip>, summary_text: String) -> PipelineResult {
        self.meta.final_tips_count = verified_tips.len();
        self.meta.total_time_seconds = self.started.elapsed().as_secs_f64();
        info!(
            final_tips = self.meta.final_tips_count,
            removed = self.meta.removed_tips.len(),
            total_secs = self.meta.total_time_seconds,
            "analysis completed"
        );
        PipelineResult {
            verified_tips,
            summary_text,
            status: AnalysisStatus::Completed,
            metadata: self.meta,
        }
    }

    fn fail(mut self, err: PipelineError) -> PipelineResult {
        let stage = self.meta.stage_reached;
        self.meta.total_time_seconds = self.started.elapsed().as_secs_f64();
        warn!(stage = stage.as_str(), code = err.code(), error = %err, "analysis failed");
        PipelineResult {
            verified_tips: Vec::new(),
            summary_text: normalize_summary(
                VERIFICATION_FAILED_SUMMARY,
                &self.pipeline.config.validator.policy,
            ),
            status: AnalysisStatus::Failed {
                stage,
                code: err.code().to_string(),
                reason: err.to_string(),
            },
            metadata: self.meta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"stage_retries": 3, "validator": {"policy": {"min_confidence": 7}}}"#)
                .unwrap();
        assert_eq!(config.stage_retries, 3);
        assert_eq!(config.validator.policy.min_confidence, 7);
        assert_eq!(config.validator.policy.summary_max_chars, 300);
        assert!(config.restrict_to_video_rounds);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_out_of_range_threshold() {
        let mut config = PipelineConfig::default();
        config.validator.policy.min_confidence = 11;
        assert_eq!(config.validate().unwrap_err().code(), "config_error");
    }

    #[test]
    fn pipeline_refuses_invalid_config() {
        struct Unreachable;

        #[async_trait::async_trait]
        impl ModelGateway for Unreachable {
            async fn invoke(
                &self,
                _req: crate::gateway::InvokeRequest,
            ) -> Result<crate::gateway::InvokeResponse, ProviderError> {
                Err(ProviderError::config("not used"))
            }
        }

        let mut config = PipelineConfig::default();
        config.validator.policy.min_confidence = 0;
        let err = CoachingPipeline::new(Arc::new(Unreachable), config).err().unwrap();
        assert_eq!(err.code(), "config_error");
        assert!(CoachingPipeline::new(Arc::new(Unreachable), PipelineConfig::default()).is_ok());
    }

    #[test]
    fn failed_status_serializes_with_stage_and_code() {
        let status = AnalysisStatus::Failed {
            stage: Stage::Observing,
            code: "all_providers_exhausted".into(),
            reason: "no credentials".into(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["stage"], "observing");
        assert_eq!(json["code"], "all_providers_exhausted");
    }
}
