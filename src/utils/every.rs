//! Rate limiter for noisy log sites.

use std::sync::Mutex;

use crate::utils::MutexExt;

use tokio::time::{Duration, Instant};

/// Returns true from `should_log()` at most once per interval.
#[derive(Debug)]
pub struct LogEvery {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogEvery {
    pub fn new(interval: Duration) -> Self {
        LogEvery {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn should_log(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.locked();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod every_tests {
    use super::*;

    #[test]
    fn once_per_interval() {
        let every = LogEvery::new(Duration::from_secs(60));
        assert!(every.should_log());
        assert!(!every.should_log());
        assert!(!every.should_log());
    }
}
