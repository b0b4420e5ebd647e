//! Failures surfaced by the model gateway.

use std::time::Duration;
use thiserror::Error;

/// Diagnostic details attached to a failed call.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Status string from the error body, e.g. `RESOURCE_EXHAUSTED`.
    pub provider_code: Option<String>,
    /// Value of the `x-request-id` response header.
    pub request_id: Option<String>,
    /// Pool index of the credential that made the call.
    pub credential: Option<usize>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a response received on `credential`.
    pub fn http(status: u16, credential: usize) -> Self {
        Self {
            http_status: Some(status),
            credential: Some(credential),
            ..Self::default()
        }
    }

    pub fn for_credential(credential: usize) -> Self {
        Self {
            credential: Some(credential),
            ..Self::default()
        }
    }

    pub fn with_code(self, code: impl Into<String>) -> Self {
        Self {
            provider_code: Some(code.into()),
            ..self
        }
    }

    pub fn with_request_id(self, id: Option<String>) -> Self {
        Self {
            request_id: id.or(self.request_id),
            ..self
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Every pool credential is in cooldown; nothing was sent.
    #[error("all {credentials} provider credentials are cooling down")]
    AllProvidersExhausted {
        credentials: usize,
        /// Until the soonest cooldown ends.
        next_available_in: Option<Duration>,
    },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: Option<ErrorContext>,
    },

    /// The credential used cannot read the attached upload.
    #[error("video unavailable: {message}")]
    VideoUnavailable {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Rejected before or by the endpoint; resending will not help.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    #[error("no response within {after:?}")]
    Timeout {
        after: Duration,
        context: Option<ErrorContext>,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn exhausted(credentials: usize, next_available_in: Option<Duration>) -> Self {
        Self::AllProvidersExhausted {
            credentials,
            next_available_in,
        }
    }

    pub fn rate_limited(retry_after: Duration, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            context: Some(context),
        }
    }

    pub fn video_unavailable(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::VideoUnavailable {
            message: message.into(),
            context: Some(context),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: None,
        }
    }

    pub fn provider(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: None,
        }
    }

    pub fn provider_with_context(
        provider: &'static str,
        message: impl Into<String>,
        retryable: bool,
        context: ErrorContext,
    ) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: Some(context),
        }
    }

    pub fn timeout(after: Duration, credential: usize) -> Self {
        Self::Timeout {
            after,
            context: Some(ErrorContext::for_credential(credential)),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether resending the same call later may succeed: network errors,
    /// 5xx responses and timeouts.
    ///
    /// Rate limits are excluded. Rotation happens inside the gateway, so one
    /// that escapes it means the pool is spent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::AllProvidersExhausted { .. }
            | Self::RateLimited { .. }
            | Self::VideoUnavailable { .. }
            | Self::InvalidRequest { .. }
            | Self::Config(_) => false,
        }
    }

    /// Stable snake_case code for usage records and failure status.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AllProvidersExhausted { .. } => "all_providers_exhausted",
            Self::RateLimited { .. } => "rate_limited",
            Self::VideoUnavailable { .. } => "video_unavailable",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Provider { .. } => "provider_error",
            Self::Timeout { .. } => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::VideoUnavailable { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Provider { context, .. }
            | Self::Timeout { context, .. } => context.as_ref(),
            Self::AllProvidersExhausted { .. } | Self::Http(_) | Self::Config(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }

    /// Credential the failing call was made with, when known.
    pub fn credential(&self) -> Option<usize> {
        self.context().and_then(|c| c.credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_endpoint_hiccups_are_transient() {
        assert!(ProviderError::timeout(Duration::from_secs(1), 0).is_transient());
        assert!(ProviderError::provider("x", "502", true).is_transient());
        assert!(!ProviderError::provider("x", "bad json", false).is_transient());
        assert!(!ProviderError::exhausted(2, None).is_transient());
        assert!(!ProviderError::rate_limited(Duration::from_secs(1), ErrorContext::new())
            .is_transient());
        assert!(!ProviderError::video_unavailable("gone", ErrorContext::new()).is_transient());
        assert!(!ProviderError::invalid_request("too big").is_transient());
    }

    #[test]
    fn context_carries_credential_and_request_id() {
        let err = ProviderError::rate_limited(
            Duration::from_secs(60),
            ErrorContext::http(429, 2).with_request_id(Some("req-1".into())),
        );
        assert_eq!(err.code(), "rate_limited");
        assert_eq!(err.request_id(), Some("req-1"));
        assert_eq!(err.credential(), Some(2));
        assert_eq!(err.context().and_then(|c| c.http_status), Some(429));
    }

    #[test]
    fn missing_request_id_keeps_existing_one() {
        let ctx = ErrorContext::new()
            .with_request_id(Some("a".into()))
            .with_request_id(None);
        assert_eq!(ctx.request_id.as_deref(), Some("a"));
    }
}
