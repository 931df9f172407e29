use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Spreads one overall timeout across a sequence of waits.
#[derive(Debug, Clone)]
pub struct TimeLimiter {
    remaining: Duration,
}

impl TimeLimiter {
    pub fn new(budget: Duration) -> Self {
        Self { remaining: budget }
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    /// Run `wait` with what is left of the budget and charge the time it
    /// took. Returns `None` without calling `wait` once the budget is spent.
    pub async fn execute<F, Fut, T>(&mut self, wait: F) -> Option<T>
    where
        F: FnOnce(Duration) -> Fut,
        Fut: Future<Output = T>,
    {
        if self.remaining.is_zero() {
            return None;
        }
        let started = Instant::now();
        let out = wait(self.remaining).await;
        self.remaining = self.remaining.saturating_sub(started.elapsed());
        Some(out)
    }
}
