//! Configuration for sync sessions.

use crate::error::SessionResult;
use objsync_auth::util::get_full_server_url;
use std::time::Duration;
use url::Url;

/// Configuration of one local/remote pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfiguration {
    /// Local resource path (unique per local replica).
    pub local_path: String,
    /// Fully resolved remote resource URL.
    pub server_url: Url,
    /// Whether the local resource is deleted when the user logs out.
    pub delete_on_logout: bool,
    /// Retry policy for authentication requests.
    pub retry: RetryConfig,
}

impl SyncConfiguration {
    /// Creates a configuration, resolving any `/~/` segment in `server_url`
    /// to `user_identity`.
    pub fn new(
        local_path: impl Into<String>,
        server_url: &str,
        user_identity: &str,
    ) -> SessionResult<Self> {
        Ok(Self {
            local_path: local_path.into(),
            server_url: get_full_server_url(server_url, user_identity)?,
            delete_on_logout: false,
            retry: RetryConfig::default(),
        })
    }

    /// Sets whether the local resource is deleted on logout.
    pub fn with_delete_on_logout(mut self, delete: bool) -> Self {
        self.delete_on_logout = delete;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Backoff schedule for authentication requests that failed transiently.
///
/// Attempt `n` waits `initial_delay * backoff_multiplier^(n - 1)`, capped at
/// `max_delay`. The first attempt is sent immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts made before the failure reaches the session.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single wait, before jitter.
    pub max_delay: Duration,
    /// Growth factor between consecutive waits.
    pub backoff_multiplier: f64,
    /// Spreads waits so sessions sharing a server do not retry in lockstep.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Retries up to `max_attempts` times, starting at half a second.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Reports the first failure without retrying.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Overrides the wait before the second attempt.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Overrides the cap on a single wait.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Overrides the growth factor.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Makes waits exact.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Returns how long to wait before sending `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(retry) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let capped = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());
        // Jitter only lengthens the wait, by at most a quarter.
        let spread = if self.add_jitter {
            capped * 0.25 * clock_fraction()
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + spread)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Fraction in `[0, 1)` taken from the sub-second part of the wall clock.
fn clock_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
