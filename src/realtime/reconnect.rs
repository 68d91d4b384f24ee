//! Redial strategies for the Speech-AI socket
//!
//! The call session counts every failed attempt; the strategy decides
//! whether (and when) another attempt is made.

use std::time::Duration;

/// Decides the delay before the next connection attempt
pub trait ReconnectStrategy: Send + Sync + 'static {
    /// `failed_attempts` is the number of attempts that have failed so far
    /// (1 after the first failure). `None` means give up.
    fn next_delay(&self, failed_attempts: u32) -> Option<Duration>;
}

/// Exponential backoff: base, 2×base, 4×base ... capped at `max_delay`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl ReconnectStrategy for ExponentialBackoff {
    fn next_delay(&self, failed_attempts: u32) -> Option<Duration> {
        if failed_attempts == 0 || failed_attempts >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(failed_attempts - 1);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// Single attempt, never retry
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReconnect;

impl ReconnectStrategy for NoReconnect {
    fn next_delay(&self, _failed_attempts: u32) -> Option<Duration> {
        None
    }
}
