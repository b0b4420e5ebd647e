//! Model gateway: one multimodal call with credential rotation.

pub mod error;
pub mod interactions;
pub mod pool;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use interactions::{InteractionsAdapter, ModelProvider};
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use pool::{Credential, ProviderKeyState, ProviderPool};
pub use types::*;
pub use usage::{CollectingUsageSink, NoopUsageSink, TracingUsageSink, UsageSink};

#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn invoke(&self, req: InvokeRequest) -> Result<InvokeResponse, ProviderError>;
}

/// Re-uploads a video so that a given credential can read it.
#[async_trait]
pub trait VideoRegistrar: Send + Sync {
    async fn register(
        &self,
        video: &VideoReference,
        credential: &Credential,
    ) -> Result<VideoReference, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long a rate-limited credential stays out of rotation.
    pub rate_limit_cooldown: Duration,
    /// Extra attempts with a fresh credential after a rate limit.
    pub max_rotations: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rate_limit_cooldown: Duration::from_secs(24 * 60 * 60),
            max_rotations: 1,
        }
    }
}

impl GatewayConfig {
    /// Defaults overridden by `COACH_KEY_COOLDOWN_SECONDS` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = std::env::var("COACH_KEY_COOLDOWN_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.rate_limit_cooldown = Duration::from_secs(secs);
        }
        config
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    pool: Arc<ProviderPool>,
    provider: Arc<dyn ModelProvider>,
    registrar: Option<Arc<dyn VideoRegistrar>>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait]
impl<U: UsageSinkTrait> ModelGateway for ProviderGateway<U> {
    async fn invoke(&self, req: InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        ProviderGateway::invoke(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let pool = Arc::new(ProviderPool::from_env()?);
        let provider = Arc::new(InteractionsAdapter::from_env()?);
        Ok(Self::with_config(
            pool,
            provider,
            usage_sink,
            GatewayConfig::from_env(),
        ))
    }

    pub fn with_config(
        pool: Arc<ProviderPool>,
        provider: Arc<dyn ModelProvider>,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            pool,
            provider,
            registrar: None,
            usage_sink,
            config,
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn VideoRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn pool(&self) -> &Arc<ProviderPool> {
        &self.pool
    }

    pub async fn invoke(&self, req: InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        let mut req = req;
        let mut rotations = 0u32;
        let mut reregistered = false;
        let mut force_register = false;

        loop {
            // Fails without touching the network when every credential is cooling down.
            let credential = self.pool.acquire()?;
            self.bind_to_credential(&mut req, &credential, force_register)
                .await?;
            force_register = false;

            let result = self.provider.invoke(&credential, &req).await;
            self.record_usage(&req, &credential, &result).await;

            match result {
                Ok(mut resp) => {
                    resp.video = req
                        .video
                        .clone()
                        .map(|v| v.registered_with(credential.index));
                    return Ok(resp);
                }
                Err(ProviderError::RateLimited { retry_after, context })
                    if rotations < self.config.max_rotations =>
                {
                    let until = self
                        .pool
                        .mark_rate_limited(credential.index, self.config.rate_limit_cooldown);
                    warn!(
                        credential = credential.index,
                        caller = req.attribution.caller,
                        cooldown_secs = self.config.rate_limit_cooldown.as_secs(),
                        "credential rate limited; rotating"
                    );
                    debug!(?until, ?retry_after, ?context, "cooldown recorded");
                    rotations += 1;
                    // Whatever the next credential is, the video must be readable by it.
                    if let Some(video) = req.video.as_mut() {
                        video.registered_with.get_or_insert(credential.index);
                    }
                }
                Err(ProviderError::RateLimited { retry_after, context }) => {
                    self.pool
                        .mark_rate_limited(credential.index, self.config.rate_limit_cooldown);
                    return Err(ProviderError::RateLimited { retry_after, context });
                }
                Err(ProviderError::VideoUnavailable { message, context })
                    if !reregistered && self.registrar.is_some() && req.video.is_some() =>
                {
                    warn!(
                        credential = credential.index,
                        %message,
                        "video not readable with credential; re-registering"
                    );
                    debug!(?context, "video unavailable");
                    reregistered = true;
                    force_register = true;
                    req.chain = None;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Make `req` valid for `credential`: drop foreign chain context and
    /// re-register the video when it belongs to a different credential.
    async fn bind_to_credential(
        &self,
        req: &mut InvokeRequest,
        credential: &Credential,
        force_register: bool,
    ) -> Result<(), ProviderError> {
        let foreign_chain = req
            .chain
            .as_ref()
            .map(|c| c.credential)
            .filter(|&owner| owner != credential.index);
        if let Some(owner) = foreign_chain {
            info!(
                from = owner,
                to = credential.index,
                "dropping chained context minted by another credential"
            );
            req.chain = None;
        }

        let Some(video) = req.video.as_ref() else {
            return Ok(());
        };
        if !force_register && video.readable_by(credential.index) {
            return Ok(());
        }

        match &self.registrar {
            Some(registrar) => {
                let registered = registrar.register(video, credential).await?;
                info!(
                    credential = credential.index,
                    uri = %registered.uri,
                    "video re-registered"
                );
                req.video = Some(registered.registered_with(credential.index));
            }
            None => {
                warn!(
                    credential = credential.index,
                    "no video registrar configured; sending existing reference"
                );
                if let Some(video) = req.video.as_mut() {
                    video.registered_with = Some(credential.index);
                }
            }
        }
        Ok(())
    }

    async fn record_usage(
        &self,
        req: &InvokeRequest,
        credential: &Credential,
        result: &Result<InvokeResponse, ProviderError>,
    ) {
        let record = ProviderCallRecord::attempt(
            self.provider.name(),
            "interactions",
            req.model.clone(),
            credential.index,
            &req.attribution,
        )
        .sent_video(req.sends_video())
        .outcome(result);

        self.usage_sink.record(record).await;
    }
}

/// Exponential backoff capped at 32x the base delay.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1 << attempt.min(5))
}
