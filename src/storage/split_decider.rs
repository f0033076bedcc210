//! Load-based split decisions: measures a range's request rate and, while
//! it stays above the zone's threshold, samples request spans to find a
//! key that divides the load evenly.

use std::sync::Mutex;

use crate::kvpb::{Key, Span};
use crate::utils::MutexExt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tokio::time::{Duration, Instant};

/// Number of candidate keys sampled by a finder.
const SAMPLE_SIZE: usize = 20;

/// Requests a candidate must have seen before it qualifies.
const MIN_COUNTER: u64 = 100;

/// Largest tolerated `|left - right| / (left + right)` of a split key.
const BALANCE_THRESHOLD: f64 = 0.25;

/// How long a finder samples before suggesting keys.
const RECORD_DURATION: Duration = Duration::from_secs(10);

const QPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
struct Sample {
    key: Key,
    left: u64,
    right: u64,
    contained: u64,
}

/// Reservoir of candidate split keys with left/right/contained counters.
struct Finder {
    start: Instant,
    count: u64,
    samples: Vec<Sample>,
    rng: StdRng,
}

impl Finder {
    fn new(start: Instant, rng: StdRng) -> Self {
        Finder {
            start,
            count: 0,
            samples: Vec::with_capacity(SAMPLE_SIZE),
            rng,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        now.duration_since(self.start) >= RECORD_DURATION
    }

    fn record(&mut self, span: &Span) {
        if self.samples.len() < SAMPLE_SIZE {
            self.samples.push(Sample {
                key: span.key.clone(),
                ..Default::default()
            });
        } else {
            let idx = self.rng.gen_range(0..self.count.max(1)) as usize;
            if idx < SAMPLE_SIZE {
                self.samples[idx] = Sample {
                    key: span.key.clone(),
                    ..Default::default()
                };
            }
        }
        self.count += 1;

        for s in self.samples.iter_mut() {
            if !span.is_point() && span.key < s.key && s.key < span.end_key {
                s.contained += 1;
            } else if span.key < s.key {
                s.left += 1;
            } else {
                s.right += 1;
            }
        }
    }

    /// Best balanced key, if any candidate qualifies.
    fn key(&self) -> Option<Key> {
        let mut best: Option<(f64, &Sample)> = None;
        for s in &self.samples {
            let total = s.left + s.right + s.contained;
            if total < MIN_COUNTER || s.left + s.right == 0 {
                continue;
            }
            let balance = (s.left as f64 - s.right as f64).abs() / (s.left + s.right) as f64;
            if balance >= BALANCE_THRESHOLD {
                continue;
            }
            let score = balance + s.contained as f64 / total as f64;
            if best.map_or(true, |(b, _)| score < b) {
                best = Some((score, s));
            }
        }
        best.map(|(_, s)| s.key.clone())
    }
}

struct DeciderState {
    last_rollover: Option<Instant>,
    count: u64,
    last_qps: f64,
    finder: Option<Finder>,
}

pub struct SplitDecider {
    mu: Mutex<DeciderState>,
}

impl SplitDecider {
    pub fn new() -> Self {
        SplitDecider {
            mu: Mutex::new(DeciderState {
                last_rollover: None,
                count: 0,
                last_qps: 0.0,
                finder: None,
            }),
        }
    }

    /// Records one request over `span`. Returns true once a split key is
    /// available, i.e. the range should be queued for a load split.
    pub fn record(&self, now: Instant, span: &Span, qps_threshold: f64) -> bool {
        let mut st = self.mu.locked();
        st.count += 1;
        let rollover = *st.last_rollover.get_or_insert(now);
        let elapsed = now.duration_since(rollover);
        if elapsed >= QPS_WINDOW {
            st.last_qps = st.count as f64 / elapsed.as_secs_f64();
            st.count = 0;
            st.last_rollover = Some(now);
            if qps_threshold > 0.0 && st.last_qps >= qps_threshold {
                if st.finder.is_none() {
                    st.finder = Some(Finder::new(now, StdRng::from_entropy()));
                }
            } else {
                st.finder = None;
            }
        }

        match st.finder.as_mut() {
            Some(finder) => {
                finder.record(span);
                finder.ready(now) && finder.key().is_some()
            }
            None => false,
        }
    }

    /// Requests per second over the last complete window.
    pub fn last_qps(&self, now: Instant) -> f64 {
        let st = self.mu.locked();
        match st.last_rollover {
            Some(rollover) if now.duration_since(rollover) >= QPS_WINDOW => {
                st.count as f64 / now.duration_since(rollover).as_secs_f64()
            }
            _ => st.last_qps,
        }
    }

    /// Split key suggested by the load, once sampling ran long enough.
    pub fn maybe_split_key(&self, now: Instant) -> Option<Key> {
        let st = self.mu.locked();
        st.finder
            .as_ref()
            .filter(|f| f.ready(now))
            .and_then(|f| f.key())
    }

    /// Forgets all measurements, e.g. after the range split.
    pub fn reset(&self) {
        let mut st = self.mu.locked();
        st.last_rollover = None;
        st.count = 0;
        st.last_qps = 0.0;
        st.finder = None;
    }
}

impl Default for SplitDecider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod split_decider_tests {
    use super::*;
    use bytes::Bytes;

    fn key(i: u32) -> Span {
        Span::point(Bytes::from(format!("k{:04}", i)))
    }

    #[test]
    fn finder_picks_balanced_key() {
        let mut finder = Finder::new(Instant::now(), StdRng::seed_from_u64(7));
        for i in 0..2000 {
            finder.record(&key(1 + i % 2));
        }
        // half of the load lies strictly left of k0002
        assert_eq!(finder.key(), Some(Bytes::from("k0002")));
    }

    #[test]
    fn finder_rejects_single_hot_key() {
        let mut finder = Finder::new(Instant::now(), StdRng::seed_from_u64(7));
        for _ in 0..1000 {
            finder.record(&key(5));
        }
        assert_eq!(finder.key(), None);
    }

    #[test]
    fn decider_measures_qps_and_suggests_key() {
        let decider = SplitDecider::new();
        let start = Instant::now();
        let mut ready = false;
        // 200 requests per second for 12 seconds
        for n in 0..2400u64 {
            let now = start + Duration::from_millis(5 * n);
            ready |= decider.record(now, &key(1 + (n % 2) as u32), 100.0);
        }
        let now = start + Duration::from_millis(12_000);
        assert!(decider.last_qps(now) > 150.0);
        assert!(ready);
        assert_eq!(decider.maybe_split_key(now), Some(Bytes::from("k0002")));

        decider.reset();
        assert_eq!(decider.maybe_split_key(now), None);
    }

    #[test]
    fn below_threshold_never_samples() {
        let decider = SplitDecider::new();
        let start = Instant::now();
        for ms in (0..5_000u64).step_by(100) {
            assert!(!decider.record(start + Duration::from_millis(ms), &key(1), 100.0));
        }
        assert_eq!(decider.maybe_split_key(start + Duration::from_secs(20)), None);
    }
}
