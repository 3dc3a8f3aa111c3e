use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("Maximum retry attempts exceeded")]
    MaxRetriesExceeded,

    #[error("Backoff cancelled")]
    Cancelled,
}

/// Exponential backoff with a delay cap, in milliseconds
///
/// `max_retries = None` retries forever (used by the change relay).
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: Option<u32>,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_ms: u64, max_ms: u64, retries: u32) -> Self {
        Self {
            initial_delay_ms: initial_ms.max(1),
            max_delay_ms: max_ms.max(initial_ms.max(1)),
            max_retries: Some(retries),
            current_attempt: 0,
        }
    }

    pub fn unbounded(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            max_retries: None,
            ..Self::new(initial_ms, max_ms, 0)
        }
    }

    /// Delay the next `sleep` would wait, without consuming an attempt
    pub fn next_delay(&self) -> Duration {
        let factor = 2_u64.checked_pow(self.current_attempt).unwrap_or(u64::MAX);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(std::cmp::min(delay, self.max_delay_ms))
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn exhausted(&self) -> bool {
        matches!(self.max_retries, Some(max) if self.current_attempt >= max)
    }

    pub async fn sleep(&mut self) -> Result<(), BackoffError> {
        self.sleep_or_cancel(&CancellationToken::new()).await
    }

    /// Wait for the next delay unless `cancel` fires first
    pub async fn sleep_or_cancel(&mut self, cancel: &CancellationToken) -> Result<(), BackoffError> {
        if self.exhausted() {
            return Err(BackoffError::MaxRetriesExceeded);
        }

        let delay = self.next_delay();
        match self.max_retries {
            Some(max) => log::warn!(
                "⏳ Retry attempt {} of {} in {}ms",
                self.current_attempt + 1,
                max,
                delay.as_millis()
            ),
            None => log::warn!(
                "⏳ Retry attempt {} in {}ms",
                self.current_attempt + 1,
                delay.as_millis()
            ),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(BackoffError::Cancelled),
            _ = sleep(delay) => {}
        }

        self.current_attempt = self.current_attempt.saturating_add(1);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let mut backoff = ExponentialBackoff::new(100, 1000, 10);
        let mut delays = Vec::new();
        for _ in 0..6 {
            delays.push(backoff.next_delay().as_millis());
            backoff.current_attempt += 1;
        }
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let mut backoff = ExponentialBackoff::unbounded(500, 30_000);
        backoff.current_attempt = 200;
        assert_eq!(backoff.next_delay(), Duration::from_millis(30_000));
        assert!(!backoff.exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_retries_exceeded() {
        let mut backoff = ExponentialBackoff::new(10, 50, 2);
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        assert_eq!(backoff.sleep().await, Err(BackoffError::MaxRetriesExceeded));

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.sleep().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let mut backoff = ExponentialBackoff::new(60_000, 60_000, 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = backoff.sleep_or_cancel(&cancel).await;
        assert_eq!(result, Err(BackoffError::Cancelled));
        assert_eq!(backoff.attempts(), 0);
    }
}
