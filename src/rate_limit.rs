use std::time::Duration;
use tokio::time::Instant;

/// Lets at most one operation through per `min_interval`.
///
/// Owned by whichever sink needs throttling; there is no shared state
/// between limiters.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Returns `true` and records the attempt if the interval has elapsed
    /// since the last accepted one.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Time left until the next call to [`RateLimiter::try_acquire`] would succeed.
    pub fn remaining(&self) -> Duration {
        self.last
            .map(|last| self.min_interval.saturating_sub(last.elapsed()))
            .unwrap_or(Duration::ZERO)
    }
}
