//! Credential pool with per-credential cooldowns.
//!
//! The pool is the only mutable state shared between concurrent analyses. It
//! lives behind a plain mutex that is never held across an await point, so a
//! cancelled call can never leave a half-written cooldown behind.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::error::ProviderError;

/// Longest cooldown a credential can be given, whatever the configuration says.
const MAX_COOLDOWN: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// One API credential in the pool.
#[derive(Clone)]
pub struct Credential {
    pub index: usize,
    api_key: String,
}

impl Credential {
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Cooldown state of a single credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderKeyState {
    pub cooldown_until: Option<Instant>,
}

impl ProviderKeyState {
    pub fn is_available_at(&self, now: Instant) -> bool {
        self.cooldown_until.map_or(true, |until| now >= until)
    }
}

/// Ordered set of credentials; selection prefers the lowest index available.
pub struct ProviderPool {
    credentials: Vec<Credential>,
    states: Mutex<Vec<ProviderKeyState>>,
}

impl fmt::Debug for ProviderPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderPool")
            .field("credentials", &self.credentials.len())
            .finish()
    }
}

impl ProviderPool {
    pub fn new<I, S>(keys: I) -> Result<Self, ProviderError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let credentials: Vec<Credential> = keys
            .into_iter()
            .map(|k| {
                let k: String = k.into();
                k.trim().to_string()
            })
            .filter(|k| !k.is_empty())
            .enumerate()
            .map(|(index, api_key)| Credential { index, api_key })
            .collect();

        if credentials.is_empty() {
            return Err(ProviderError::config("credential pool is empty"));
        }

        let states = vec![ProviderKeyState::default(); credentials.len()];
        Ok(Self {
            credentials,
            states: Mutex::new(states),
        })
    }

    /// Read `GEMINI_API_KEYS` (comma separated) or fall back to `GEMINI_API_KEY`.
    pub fn from_env() -> Result<Self, ProviderError> {
        if let Ok(keys) = std::env::var("GEMINI_API_KEYS") {
            if keys.split(',').any(|k| !k.trim().is_empty()) {
                return Self::new(keys.split(','));
            }
        }
        let key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| ProviderError::config("GEMINI_API_KEYS or GEMINI_API_KEY not set"))?;
        Self::new([key])
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProviderKeyState>> {
        // State is a plain vector of timestamps; a panic elsewhere cannot leave
        // it inconsistent, so a poisoned lock is still usable.
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// First credential that is not cooling down.
    pub fn acquire(&self) -> Result<Credential, ProviderError> {
        self.acquire_at(Instant::now())
    }

    pub fn acquire_at(&self, now: Instant) -> Result<Credential, ProviderError> {
        let states = self.lock();
        match states.iter().position(|s| s.is_available_at(now)) {
            Some(index) => Ok(self.credentials[index].clone()),
            None => {
                let next = states
                    .iter()
                    .filter_map(|s| s.cooldown_until)
                    .min()
                    .map(|until| until.saturating_duration_since(now));
                Err(ProviderError::exhausted(self.credentials.len(), next))
            }
        }
    }

    /// Put a credential into cooldown. An existing longer cooldown is kept.
    pub fn mark_rate_limited(&self, index: usize, cooldown: Duration) -> Option<Instant> {
        self.mark_rate_limited_at(index, cooldown, Instant::now())
    }

    pub fn mark_rate_limited_at(
        &self,
        index: usize,
        cooldown: Duration,
        now: Instant,
    ) -> Option<Instant> {
        let mut states = self.lock();
        let state = states.get_mut(index)?;
        let proposed = now
            .checked_add(cooldown.min(MAX_COOLDOWN))
            .unwrap_or(now);
        let until = match state.cooldown_until {
            Some(existing) if existing >= proposed => existing,
            _ => proposed,
        };
        state.cooldown_until = Some(until);
        Some(until)
    }

    pub fn state(&self, index: usize) -> Option<ProviderKeyState> {
        self.lock().get(index).copied()
    }

    pub fn available_count_at(&self, now: Instant) -> usize {
        self.lock().iter().filter(|s| s.is_available_at(now)).count()
    }
}
