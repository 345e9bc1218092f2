//! Reconnect policy.
//!
//! Bounded exponential backoff with jitter. After `max_attempts` failed
//! reconnects the client gives up and fires its `on_give_up` hook.

use std::time::Duration;

use rand::Rng;

use super::error::WsError;

/// Default number of reconnect attempts after an unexpected close.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first reconnect attempt, in milliseconds.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 3_000;

/// Default ceiling for the reconnect delay, in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Reconnect behavior after an unexpected close.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Whether the client reconnects on its own.
    pub enabled: bool,

    /// Attempts before giving up.
    pub max_attempts: u32,

    /// Delay before the first attempt.
    pub initial_delay: Duration,

    /// Ceiling for any single delay.
    pub max_delay: Duration,

    /// Growth factor between attempts.
    pub multiplier: f64,

    /// Relative jitter in `[0.0, 1.0]`; 0.2 spreads a delay by ±20%.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects on its own.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Sets the attempt cap.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial and maximum delays.
    #[must_use]
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Sets the growth factor.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the relative jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy is invalid.
    pub fn validate(&self) -> Result<(), WsError> {
        if self.multiplier < 1.0 {
            return Err(WsError::InvalidConfig(
                "reconnect multiplier must be >= 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(WsError::InvalidConfig(
                "reconnect jitter must be within [0.0, 1.0]".to_string(),
            ));
        }

        if self.initial_delay > self.max_delay {
            return Err(WsError::InvalidConfig(
                "initial reconnect delay must be <= max delay".to_string(),
            ));
        }

        Ok(())
    }

    /// Backoff before the given attempt (1-based), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Spreads `base` by `sample` (in `[-1.0, 1.0]`) times the jitter, capped
    /// at `max_delay`.
    #[must_use]
    pub fn apply_jitter(&self, base: Duration, sample: f64) -> Duration {
        let factor = (1.0 + self.jitter * sample.clamp(-1.0, 1.0)).max(0.0);
        let millis = (base.as_millis() as f64 * factor).round() as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Backoff before the given attempt (1-based), with random jitter.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.apply_jitter(base, sample)
    }
}
