//! Request pacing, retry policy and cancellation.
//!
//! Every network call in the engine is followed by a randomized pause
//! drawn from a `[min, max]` window. Pauses are the only points where a
//! session can be interrupted, which keeps cancellation between fetches.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::HarvestError;

/// Randomized inter-request delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacer {
    min: Duration,
    max: Duration,
}

impl Pacer {
    pub fn new(min: Duration, max: Duration) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self { min, max }
    }

    pub fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(min_ms), Duration::from_millis(max_ms))
    }

    /// No delay at all. Used by tests and dry runs.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn next_delay(&self) -> Duration {
        if self.max.is_zero() || self.min == self.max {
            return self.min;
        }
        rand::rng().random_range(self.min..=self.max)
    }
}

/// Bounded retry for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// External cancellation plus an optional session deadline.
#[derive(Debug, Clone)]
pub struct Interrupt {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Interrupt {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// An interrupt that never fires.
    pub fn never() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self) -> Result<(), HarvestError> {
        if self.is_interrupted() {
            Err(HarvestError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with `Cancelled` if interrupted.
    pub async fn sleep(&self, duration: Duration) -> Result<(), HarvestError> {
        self.check()?;
        if duration.is_zero() {
            return Ok(());
        }
        let wake = match self.deadline {
            Some(deadline) => deadline.min(Instant::now() + duration),
            None => Instant::now() + duration,
        };
        tokio::select! {
            _ = self.token.cancelled() => Err(HarvestError::Cancelled),
            _ = tokio::time::sleep_until(wake) => self.check(),
        }
    }

    /// Sleep for one randomized pacing interval.
    pub async fn pace(&self, pacer: &Pacer) -> Result<(), HarvestError> {
        self.sleep(pacer.next_delay()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacer_stays_in_window() {
        let pacer = Pacer::from_millis(10, 20);
        for _ in 0..200 {
            let d = pacer.next_delay();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_pacer_swaps_inverted_bounds() {
        let pacer = Pacer::from_millis(30, 10);
        let d = pacer.next_delay();
        assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(30));
    }

    #[test]
    fn test_retry_policy_at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_wakes_sleep() {
        let token = CancellationToken::new();
        let interrupt = Interrupt::new(token.clone());
        token.cancel();
        let result = interrupt.sleep(Duration::from_secs(60)).await;
        assert!(matches!(result, Err(HarvestError::Cancelled)));
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let interrupt = Interrupt::never().with_timeout(Duration::from_millis(5));
        let result = interrupt.sleep(Duration::from_secs(60)).await;
        assert!(matches!(result, Err(HarvestError::Cancelled)));
        assert!(interrupt.is_interrupted());
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let interrupt = Interrupt::never();
        assert!(interrupt.sleep(Duration::from_millis(1)).await.is_ok());
        assert!(interrupt.check().is_ok());
    }
}
