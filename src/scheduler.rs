//! Self-re-arming poll timer.
//!
//! The timer is a single tokio task that sleeps for the interval, runs the
//! fire callback to completion and only then sleeps again. Cadence is
//! therefore `interval + time spent in the callback`, and two callbacks are
//! never in flight at once.

use crate::Error;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No timer armed.
    Idle,
    /// A timer is pending and will fire within one interval.
    Armed,
    /// Torn down; cannot be started again.
    Stopped,
}

#[derive(Debug)]
struct ArmedTimer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ArmedTimer {
    /// Stops re-arming. A callback that is already running finishes first,
    /// an in-flight transport write is never aborted.
    fn cancel(self) {
        self.token.cancel();
    }
}

#[derive(Debug)]
pub struct PollScheduler {
    timer: Option<ArmedTimer>,
    stopped: bool,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self {
            timer: None,
            stopped: false,
        }
    }

    pub fn state(&self) -> SchedulerState {
        match &self.timer {
            _ if self.stopped => SchedulerState::Stopped,
            Some(timer) if !timer.handle.is_finished() => SchedulerState::Armed,
            _ => SchedulerState::Idle,
        }
    }

    /// Arms the timer, replacing any timer that is already pending.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F, Fut>(&mut self, interval: Duration, mut on_fire: F) -> Result<(), Error>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.stopped {
            return Err(Error::SessionStopped);
        }
        if interval.is_zero() {
            return Err(Error::InvalidArgument("poll interval must be non-zero".into()));
        }
        if let Some(previous) = self.timer.take() {
            log::debug!("Replacing pending poll timer");
            previous.cancel();
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                log::trace!("Poll timer fired");
                on_fire().await;
            }
            log::trace!("Poll timer cancelled");
        });
        self.timer = Some(ArmedTimer { token, handle });
        log::debug!("Poll timer armed, interval={interval:?}");
        Ok(())
    }

    /// Cancels any pending timer. Idempotent.
    pub fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        if !self.stopped {
            log::debug!("Poll scheduler stopped");
        }
        self.stopped = true;
    }
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
