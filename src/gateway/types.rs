//! Core types for the model gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Tags a request with the analysis and pipeline stage that issued it.
/// Copied onto every usage record the call produces.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    pub analysis_id: Option<Uuid>,
    /// Stage name, e.g. `"observer"` or `"validator"`.
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_analysis(mut self, analysis_id: Uuid) -> Self {
        self.analysis_id = Some(analysis_id);
        self
    }
}

// =============================================================================
// VIDEO
// =============================================================================

/// Opaque handle to an uploaded gameplay video.
///
/// Uploads are scoped to the credential that registered them. `registered_with`
/// is `None` when the caller does not know which credential owns the upload;
/// the gateway then assumes it belongs to whichever credential it tries first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoReference {
    pub uri: String,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_with: Option<usize>,
}

impl VideoReference {
    pub fn new(uri: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            identifier: identifier.into(),
            registered_with: None,
        }
    }

    pub fn registered_with(mut self, credential: usize) -> Self {
        self.registered_with = Some(credential);
        self
    }

    /// Whether the upload can be read with `credential` without re-registering.
    pub fn readable_by(&self, credential: usize) -> bool {
        self.registered_with.map_or(true, |owner| owner == credential)
    }
}

// =============================================================================
// REQUEST / RESPONSE
// =============================================================================

/// How much internal reasoning the model should spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Low,
    #[default]
    High,
}

impl ThinkingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkingLevel::Low => "low",
            ThinkingLevel::High => "high",
        }
    }
}

/// Prior interaction to continue from.
///
/// Chained context is only valid for the credential that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainContext {
    pub interaction_id: String,
    pub credential: usize,
}

/// A single multimodal model call.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub video: Option<VideoReference>,
    pub chain: Option<ChainContext>,
    pub thinking: ThinkingLevel,
    pub json_mode: bool,
    pub attribution: Attribution,
}

impl InvokeRequest {
    pub fn new(
        model: impl Into<String>,
        system: impl Into<String>,
        prompt: impl Into<String>,
        attribution: Attribution,
    ) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            prompt: prompt.into(),
            video: None,
            chain: None,
            thinking: ThinkingLevel::default(),
            json_mode: false,
            attribution,
        }
    }

    pub fn video(mut self, video: VideoReference) -> Self {
        self.video = Some(video);
        self
    }

    pub fn chain(mut self, chain: Option<ChainContext>) -> Self {
        self.chain = chain;
        self
    }

    pub fn thinking(mut self, level: ThinkingLevel) -> Self {
        self.thinking = level;
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    /// Whether the video must be sent inline. A chained call reuses the video
    /// already attached to the prior interaction.
    pub fn sends_video(&self) -> bool {
        self.video.is_some() && self.chain.is_none()
    }
}

/// Response from a model call.
#[derive(Debug, Clone)]
pub struct InvokeResponse {
    pub text: String,
    /// Provider interaction id, usable for chaining.
    pub interaction_id: Option<String>,
    /// Credential the successful call was made with.
    pub credential: usize,
    /// Video as registered for `credential`, if one was attached.
    pub video: Option<VideoReference>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency: Duration,
}

impl InvokeResponse {
    pub fn text(text: impl Into<String>, credential: usize) -> Self {
        Self {
            text: text.into(),
            interaction_id: None,
            credential,
            video: None,
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::ZERO,
        }
    }

    pub fn with_interaction(mut self, id: impl Into<String>) -> Self {
        self.interaction_id = Some(id.into());
        self
    }

    /// Context for a follow-up call that should see this interaction.
    pub fn chain_context(&self) -> Option<ChainContext> {
        self.interaction_id.as_ref().map(|id| ChainContext {
            interaction_id: id.clone(),
            credential: self.credential,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unowned_video_is_readable_by_any_credential() {
        let v = VideoReference::new("files/abc", "match-1");
        assert!(v.readable_by(0));
        assert!(v.readable_by(3));
        let owned = v.registered_with(1);
        assert!(owned.readable_by(1));
        assert!(!owned.readable_by(0));
    }

    #[test]
    fn chained_request_does_not_resend_video() {
        let req = InvokeRequest::new("m", "sys", "prompt", Attribution::new("test"))
            .video(VideoReference::new("files/abc", "match-1"));
        assert!(req.sends_video());
        let req = req.chain(Some(ChainContext {
            interaction_id: "int-1".into(),
            credential: 0,
        }));
        assert!(!req.sends_video());
    }

    #[test]
    fn chain_context_uses_response_credential() {
        let resp = InvokeResponse::text("{}", 2).with_interaction("int-9");
        let chain = resp.chain_context().unwrap();
        assert_eq!(chain.interaction_id, "int-9");
        assert_eq!(chain.credential, 2);
        assert!(InvokeResponse::text("{}", 0).chain_context().is_none());
    }
}
