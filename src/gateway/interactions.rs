//! Adapter for a Gemini-style multimodal Interactions endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::pool::Credential;
use super::types::*;

// =============================================================================
// TRAIT
// =============================================================================

/// Trait for multimodal model providers.
///
/// The credential is supplied per call; adapters never hold keys themselves.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn invoke(
        &self,
        credential: &Credential,
        req: &InvokeRequest,
    ) -> Result<InvokeResponse, ProviderError>;
}

// =============================================================================
// INTERACTIONS ADAPTER
// =============================================================================

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Video analysis can take minutes server-side.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Maximum allowed response body length (4MB).
const MAX_RESPONSE_LEN: usize = 4 * 1_024 * 1_024;

/// Maximum allowed prompt characters.
const MAX_INPUT_CHARS: usize = 1_000_000;

/// Rate limits sometimes arrive with a non-429 status; match on the body.
const RATE_LIMIT_MARKERS: &[&str] = &["resource_exhausted", "rate limit", "quota"];

/// Markers for an attached file the credential cannot read.
const FILE_ACCESS_MARKERS: &[&str] = &["permission to access", "may not exist"];

/// Interactions API adapter.
#[derive(Debug, Clone)]
pub struct InteractionsAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    rate_limit_retry_after: Duration,
}

impl InteractionsAdapter {
    pub fn new() -> Result<Self, ProviderError> {
        Self::with_config(DEFAULT_BASE_URL, DEFAULT_TIMEOUT)
    }

    /// Create from `GEMINI_BASE_URL` and `GEMINI_TIMEOUT_SECONDS`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let base_url =
            std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

        let timeout = std::env::var("GEMINI_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self::with_config(base_url, timeout)
    }

    pub fn with_config(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            timeout,
            rate_limit_retry_after: Duration::from_secs(60),
        })
    }

    fn interactions_url(&self) -> String {
        format!("{}/interactions", self.base_url)
    }

    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn is_rate_limit_message(msg: &str) -> bool {
        let l = msg.to_lowercase();
        RATE_LIMIT_MARKERS.iter().any(|m| l.contains(m))
    }

    fn is_file_access_message(msg: &str) -> bool {
        let l = msg.to_lowercase();
        FILE_ACCESS_MARKERS.iter().any(|m| l.contains(m))
    }

    fn classify_error(
        &self,
        status: u16,
        message: String,
        ctx: ErrorContext,
        has_video: bool,
    ) -> ProviderError {
        let status_code = ctx.provider_code.clone().unwrap_or_default();
        if status == 429 || Self::is_rate_limit_message(&status_code) {
            return ProviderError::rate_limited(self.rate_limit_retry_after, ctx);
        }
        if has_video && (status == 403 || Self::is_file_access_message(&message)) {
            return ProviderError::video_unavailable(message, ctx);
        }
        if Self::is_rate_limit_message(&message) {
            return ProviderError::rate_limited(self.rate_limit_retry_after, ctx);
        }
        ProviderError::provider_with_context("gemini", message, status >= 500, ctx)
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct InteractionApiRequest<'a> {
    model: &'a str,
    input: Vec<InputPart<'a>>,
    system_instruction: &'a str,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_interaction_id: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum InputPart<'a> {
    Text {
        text: &'a str,
    },
    Video {
        uri: &'a str,
        mime_type: &'static str,
    },
}

#[derive(Serialize)]
struct GenerationConfig {
    thinking_level: &'static str,
}

#[derive(Deserialize)]
struct InteractionApiResponse {
    id: Option<String>,
    #[serde(default)]
    outputs: Vec<OutputPart>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct OutputPart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_input_tokens: Option<u32>,
    total_output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    status: Option<String>,
}

// =============================================================================
// MODEL PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ModelProvider for InteractionsAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn invoke(
        &self,
        credential: &Credential,
        req: &InvokeRequest,
    ) -> Result<InvokeResponse, ProviderError> {
        let total_chars = req.system.len() + req.prompt.len();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();

        let mut input = vec![InputPart::Text { text: &req.prompt }];
        let video = if req.sends_video() {
            req.video.as_ref()
        } else {
            None
        };
        if let Some(v) = video {
            input.push(InputPart::Video {
                uri: &v.uri,
                mime_type: "video/mp4",
            });
        }

        let api_req = InteractionApiRequest {
            model: &req.model,
            input,
            system_instruction: &req.system,
            generation_config: GenerationConfig {
                thinking_level: req.thinking.as_str(),
            },
            response_mime_type: req.json_mode.then_some("application/json"),
            previous_interaction_id: req.chain.as_ref().map(|c| c.interaction_id.as_str()),
        };

        let key = HeaderValue::from_str(credential.api_key())
            .map_err(|_| ProviderError::config("Invalid API key format"))?;

        let mut response = self
            .client
            .post(self.interactions_url())
            .header("x-goog-api-key", key)
            .json(&api_req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::timeout(self.timeout, credential.index)
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());

        // Stream so an oversized body is cut off early.
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider(
                    "gemini",
                    format!("Response too large: {new_len} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        let ctx = ErrorContext::http(status.as_u16(), credential.index).with_request_id(request_id);

        if !status.is_success() {
            let (message, ctx) = match serde_json::from_str::<ApiErrorEnvelope>(&body)
                .ok()
                .and_then(|e| e.error)
            {
                Some(error) => {
                    let ctx = match error.status {
                        Some(code) => ctx.with_code(code),
                        None => ctx,
                    };
                    (
                        error
                            .message
                            .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
                        ctx,
                    )
                }
                None => (format!("HTTP {}", status.as_u16()), ctx),
            };
            return Err(self.classify_error(status.as_u16(), message, ctx, video.is_some()));
        }

        let parsed: InteractionApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider_with_context(
                "gemini",
                format!("Invalid JSON: {e}"),
                false,
                ctx.clone(),
            )
        })?;

        if let Some(error) = parsed.error {
            let ctx = match error.status {
                Some(code) => ctx.with_code(code),
                None => ctx,
            };
            let message = error.message.unwrap_or_default();
            return Err(self.classify_error(status.as_u16(), message, ctx, video.is_some()));
        }

        // The final output carries the answer; earlier ones are thoughts.
        let text = parsed
            .outputs
            .iter()
            .rev()
            .find_map(|o| o.text.clone())
            .ok_or_else(|| {
                ProviderError::provider_with_context(
                    "gemini",
                    "No text output in response",
                    false,
                    ctx.clone(),
                )
            })?;

        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| {
                (
                    u.total_input_tokens.unwrap_or(0),
                    u.total_output_tokens.unwrap_or(0),
                )
            })
            .unwrap_or((0, 0));

        Ok(InvokeResponse {
            text,
            interaction_id: parsed.id,
            credential: credential.index,
            video: req.video.clone(),
            input_tokens,
            output_tokens,
            latency: start.elapsed(),
        })
    }
}
