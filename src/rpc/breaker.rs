//! Circuit breaker guarding connection attempts to a peer.

use std::fmt;
use std::sync::Mutex;

use crate::utils::{KvError, LogEvery, MutexExt};

use serde::Deserialize;

use tokio::time::{Duration, Instant};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures after which the breaker trips open.
    pub consecutive_failure_threshold: u32,

    /// Time an open breaker waits before letting a probe through, in
    /// millisecs.
    pub cooldown_ms: u64,

    /// Minimum interval between failure log lines per breaker, in secs.
    pub log_interval_secs: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            consecutive_failure_threshold: 5,
            cooldown_ms: 1000,
            log_interval_secs: 60,
        }
    }
}

/// State of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests pass.
    Closed,

    /// Requests fail immediately.
    Open,

    /// One probe request is in flight after cooldown.
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_error: Option<String>,
}

/// Consecutive-failure circuit breaker.
pub struct Breaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    log_every: LogEvery,
}

impl Breaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let log_every =
            LogEvery::new(Duration::from_secs(config.log_interval_secs));
        Breaker {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                last_error: None,
            }),
            log_every,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if a request may go through. An open breaker past its
    /// cooldown lets exactly one probe through and becomes half-open.
    pub fn ready(&self) -> bool {
        let mut inner = self.inner.locked();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner.opened_at.map_or(true, |t| {
                    t.elapsed() >= Duration::from_millis(self.config.cooldown_ms)
                });
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                }
                cooled
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful request; closes the breaker.
    pub fn success(&self) {
        let mut inner = self.inner.locked();
        if inner.state != BreakerState::Closed {
            pf_info!(self.name; "breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Records a failed request; trips the breaker at the threshold or when
    /// a half-open probe fails.
    pub fn fail(&self, err: &KvError) {
        let mut inner = self.inner.locked();
        inner.consecutive_failures += 1;
        inner.last_error = Some(err.to_string());
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            BreakerState::Closed
                if inner.consecutive_failures
                    >= self.config.consecutive_failure_threshold =>
            {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {}
        }
        if self.log_every.should_log() {
            pf_warn!(self.name; "failure #{} ({:?}): {}",
                     inner.consecutive_failures, inner.state, err);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.locked().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.locked().consecutive_failures
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.locked().last_error.clone()
    }

    /// Forces the breaker closed.
    pub fn reset(&self) {
        self.success();
    }
}

impl fmt::Debug for Breaker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Breaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
