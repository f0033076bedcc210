//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::KvError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for signalling after a given timeout. Supports resetting with
/// a different deadline, which the request batcher uses to track the earliest
/// pending batch deadline.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Deadline of the last kick-off; `None` if the timer is idle.
    deadline: Option<Instant>,
}

impl Timer {
    /// Creates a new idle timer.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            deadline: None,
        }
    }

    /// Returns the pending deadline, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Restarts the timer with the given duration.
    pub fn restart(&mut self, dur: Duration) -> Result<(), KvError> {
        if dur.is_zero() {
            return Err(KvError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }
        self.reset_at(Instant::now() + dur);
        Ok(())
    }

    /// Re-arms the timer to fire at the given instant. Instants in the past
    /// fire immediately.
    pub fn reset_at(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
        self.sleep.as_mut().reset(deadline);
    }

    /// Disarms the timer; `timeout()` then never completes.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`. An idle timer pends forever.
    pub async fn timeout(&mut self) {
        if self.deadline.is_none() {
            futures::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.deadline = None;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;
    use tokio::time::{Duration, Instant};

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn timer_new() {
        let timer = Timer::new();
        assert!(timer.deadline().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_idle_pends() {
        let mut timer = Timer::new();
        let res =
            tokio::time::timeout(Duration::from_millis(50), timer.timeout())
                .await;
        assert!(res.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_restart() -> Result<(), KvError> {
        let mut timer = Timer::new();
        // round 1 with 200ms timeout
        let mut start = Instant::now();
        timer.restart(Duration::from_millis(200))?;
        timer.timeout().await;
        let mut finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(200));
        assert!(timer.deadline().is_none());
        // round 2 re-armed to an earlier deadline
        start = Instant::now();
        timer.restart(Duration::from_millis(300))?;
        timer.reset_at(start + Duration::from_millis(100));
        timer.timeout().await;
        finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(100));
        assert!(finish.duration_since(start) < Duration::from_millis(300));
        Ok(())
    }
}
