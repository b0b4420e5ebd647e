//! Per-call usage reporting.
//!
//! The gateway hands one [`ProviderCallRecord`] per attempt to a [`UsageSink`],
//! including attempts that failed and were rotated away from. Sinks never
//! fail the call they describe.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::error::ProviderError;
use super::types::{Attribution, InvokeResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Error,
}

/// One attempt against the model endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderCallRecord {
    pub provider: &'static str,
    pub endpoint: &'static str,
    pub model: String,
    pub credential: usize,
    pub caller: &'static str,
    pub analysis_id: Option<Uuid>,
    /// False when the video was reused through a chained interaction.
    pub sent_video: bool,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<&'static str>,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn attempt(
        provider: &'static str,
        endpoint: &'static str,
        model: impl Into<String>,
        credential: usize,
        attribution: &Attribution,
    ) -> Self {
        Self {
            provider,
            endpoint,
            model: model.into(),
            credential,
            caller: attribution.caller,
            analysis_id: attribution.analysis_id,
            sent_video: false,
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn sent_video(mut self, sent: bool) -> Self {
        self.sent_video = sent;
        self
    }

    /// Fill in tokens and latency, or the error code, from the call outcome.
    pub fn outcome(mut self, result: &Result<InvokeResponse, ProviderError>) -> Self {
        match result {
            Ok(resp) => {
                self.input_tokens = resp.input_tokens;
                self.output_tokens = resp.output_tokens;
                self.latency_ms = resp.latency.as_millis() as u64;
            }
            Err(err) => {
                self.status = CallStatus::Error;
                self.error_code = Some(err.code());
                self.request_id = err.request_id().map(str::to_string);
            }
        }
        self
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Emits one structured `tracing` event per call under the `replay_coach::usage` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        tracing::info!(
            target: "replay_coach::usage",
            provider = record.provider,
            model = %record.model,
            credential = record.credential,
            caller = record.caller,
            analysis_id = ?record.analysis_id,
            sent_video = record.sent_video,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            latency_ms = record.latency_ms,
            status = ?record.status,
            error_code = record.error_code.unwrap_or(""),
            "model call"
        );
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct CollectingUsageSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

impl CollectingUsageSink {
    pub fn records(&self) -> Vec<ProviderCallRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl UsageSink for CollectingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}
