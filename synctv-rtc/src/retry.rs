//! Reconnection backoff
//!
//! Delay before retry `n` (zero based) is `min(base * 2^n, max)` plus a
//! uniformly drawn jitter of up to `jitter_fraction` of that delay. The
//! attempt counter itself lives on the connection and never resets.

use backon::{BackoffBuilder, ExponentialBuilder};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;

/// Schedules reconnection attempts for one connection
#[derive(Debug)]
pub struct RetryController {
    config: RetryConfig,
    pending: Option<CancellationToken>,
    exhausted: bool,
}

impl RetryController {
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            pending: None,
            exhausted: false,
        }
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Backoff delay for a zero-based attempt, before jitter
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max = Duration::from_millis(self.config.max_delay_ms);
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.config.base_delay_ms))
            .with_max_delay(max)
            .with_factor(2.0)
            .with_max_times(attempt as usize + 1)
            .build()
            .nth(attempt as usize)
            .unwrap_or(max)
    }

    /// Backoff delay for a zero-based attempt with jitter applied
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let fraction = self.config.jitter_fraction.clamp(0.0, 1.0);
        let jitter = rand::rng().random_range(0.0..=fraction);
        Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + jitter)).unwrap_or(Duration::MAX)
    }

    /// Arm a new pending retry, cancelling any previous one.
    /// The returned token is cancelled when the retry is abandoned.
    pub fn arm(&mut self, parent: &CancellationToken) -> CancellationToken {
        self.cancel();
        let token = parent.child_token();
        self.pending = Some(token.clone());
        token
    }

    /// The pending retry fired; forget its token
    pub fn fired(&mut self) {
        self.pending = None;
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Mark the retry attempts as used up. Returns `true` only the first time,
    /// so exhaustion is reported once.
    pub fn exhaust(&mut self) -> bool {
        !std::mem::replace(&mut self.exhausted, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(jitter_fraction: f64) -> RetryController {
        RetryController::new(&RetryConfig {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_fraction,
        })
    }

    #[test]
    fn test_base_delay_doubles() {
        let retry = controller(0.0);
        assert_eq!(retry.base_delay(0), Duration::from_secs(1));
        assert_eq!(retry.base_delay(1), Duration::from_secs(2));
        assert_eq!(retry.base_delay(2), Duration::from_secs(4));
        assert_eq!(retry.base_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_base_delay_capped() {
        let retry = controller(0.0);
        assert_eq!(retry.base_delay(5), Duration::from_secs(30));
        assert_eq!(retry.base_delay(12), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let retry = controller(0.2);
        for attempt in 0..4 {
            let base = retry.base_delay(attempt);
            for _ in 0..50 {
                let delay = retry.delay(attempt);
                assert!(delay >= base);
                assert!(delay <= base.mul_f64(1.2));
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let retry = controller(0.0);
        assert_eq!(retry.delay(1), Duration::from_secs(2));
    }

    #[test]
    fn test_longest_allowed_delay_with_jitter() {
        let retry = RetryController::new(&RetryConfig {
            max_attempts: 20,
            base_delay_ms: 1000,
            max_delay_ms: crate::config::MAX_RETRY_DELAY_MS,
            jitter_fraction: 1.0,
        });
        let delay = retry.delay(15);
        assert!(delay >= Duration::from_secs(3_600));
        assert!(delay <= Duration::from_secs(7_200));
    }

    #[test]
    fn test_arm_cancels_previous() {
        let parent = CancellationToken::new();
        let mut retry = controller(0.2);

        let first = retry.arm(&parent);
        let second = retry.arm(&parent);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(retry.is_pending());

        retry.cancel();
        assert!(second.is_cancelled());
        assert!(!retry.is_pending());
    }

    #[test]
    fn test_parent_cancellation_reaches_pending_retry() {
        let parent = CancellationToken::new();
        let mut retry = controller(0.2);
        let token = retry.arm(&parent);
        parent.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_exhaustion_reported_once() {
        let mut retry = controller(0.2);
        assert!(retry.exhaust());
        assert!(!retry.exhaust());
    }
}
