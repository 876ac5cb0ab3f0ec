use std::time::Duration;

const MAX_DELAY: Duration = Duration::from_secs(30);

/// Bounded exponential backoff shared by every retried action: compensation
/// dispatch, lifecycle event delivery and accident notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (0-based), doubled per attempt and
    /// capped so an unreachable peer cannot park a worker for minutes.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);

        self.base_delay.saturating_mul(factor).min(MAX_DELAY)
    }

    pub async fn backoff(&self, attempt: u32) {
        tokio::time::sleep(self.delay(attempt)).await;
    }
}
