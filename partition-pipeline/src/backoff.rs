use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Interrupted;

/// Maps a retry attempt to how long to wait before it. Pure: no sleeping here, see [`wait`].
pub trait Backoff: Send + Sync {
    fn timeout(&self, retry_attempt: u32) -> Duration;
}

/// `base^n` units for attempt `n`, no wait for attempt 0.
///
/// - base: 10 unless given
/// - unit: one second unless given
/// - max: optional cap, results overflowing `Duration` saturate to it (or to `Duration::MAX`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: u32,
    unit: Duration,
    max: Option<Duration>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ExponentialBackoff {
    pub const fn new(base: u32) -> Self {
        Self {
            base,
            unit: Duration::from_secs(1),
            max: None,
        }
    }

    pub const fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    pub const fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    pub fn base(&self) -> u32 {
        self.base
    }
}

impl Backoff for ExponentialBackoff {
    fn timeout(&self, retry_attempt: u32) -> Duration {
        if retry_attempt == 0 {
            return Duration::ZERO;
        }

        let ceiling = self.max.unwrap_or(Duration::MAX);
        self.base
            .checked_pow(retry_attempt)
            .and_then(|factor| self.unit.checked_mul(factor))
            .map_or(ceiling, |delay| delay.min(ceiling))
    }
}

/// Wait out the backoff for `retry_attempt`.
///
/// Returns `Err(Interrupted)` as soon as `cancel` fires, including when it already has.
pub async fn wait<B: Backoff + ?Sized>(
    policy: &B,
    retry_attempt: u32,
    cancel: &CancellationToken,
) -> Result<(), Interrupted> {
    let delay = policy.timeout(retry_attempt);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 0; "no wait before the first attempt")]
    #[test_case(1, 10; "first retry")]
    #[test_case(2, 100; "second retry")]
    #[test_case(4, 10_000; "fourth retry")]
    fn test_default_policy(attempt: u32, expected_secs: u64) {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.timeout(attempt), Duration::from_secs(expected_secs));
    }

    #[test]
    fn test_custom_base_and_unit() {
        let policy = ExponentialBackoff::new(2).with_unit(Duration::from_millis(100));

        assert_eq!(policy.timeout(0), Duration::ZERO);
        assert_eq!(policy.timeout(1), Duration::from_millis(200));
        assert_eq!(policy.timeout(3), Duration::from_millis(800));
    }

    #[test]
    fn test_cap_and_overflow() {
        let capped = ExponentialBackoff::new(2)
            .with_unit(Duration::from_millis(100))
            .with_max(Duration::from_secs(1));
        assert_eq!(capped.timeout(3), Duration::from_millis(800));
        assert_eq!(capped.timeout(4), Duration::from_secs(1));
        assert_eq!(capped.timeout(200), Duration::from_secs(1));

        assert_eq!(ExponentialBackoff::default().timeout(100), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_timeout() {
        let policy = ExponentialBackoff::new(2);
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        wait(&policy, 2, &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_interrupted_by_cancellation() {
        let policy = ExponentialBackoff::default();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let start = tokio::time::Instant::now();
        assert_eq!(wait(&policy, 4, &cancel).await, Err(Interrupted));
        assert!(start.elapsed() < Duration::from_secs(2));

        // An already cancelled token interrupts immediately
        assert_eq!(wait(&policy, 1, &cancel).await, Err(Interrupted));
    }
}
