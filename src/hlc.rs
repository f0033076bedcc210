//! Hybrid-logical clock (HLC) and the timestamp type it hands out.
//!
//! A timestamp is a `(wall_time, logical)` pair ordered lexicographically.
//! Every node owns one `Clock`; timestamps it returns are strictly monotonic
//! and ratchet forward whenever a remote timestamp is observed.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::utils::{ErrorDetail, KvError, MutexExt};

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Hybrid-logical timestamp. The zero value means "unset".
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct Timestamp {
    /// Physical nanoseconds since the unix epoch.
    pub wall_time: i64,

    /// Logical counter breaking ties within the same wall time.
    pub logical: i32,
}

impl Timestamp {
    /// Largest representable timestamp.
    pub const MAX: Timestamp = Timestamp {
        wall_time: i64::MAX,
        logical: i32::MAX,
    };

    /// Smallest non-empty timestamp.
    pub const MIN: Timestamp = Timestamp {
        wall_time: 0,
        logical: 1,
    };

    pub const fn new(wall_time: i64, logical: i32) -> Self {
        Timestamp { wall_time, logical }
    }

    /// Shorthand for a timestamp with zero logical component.
    pub const fn from_wall(wall_time: i64) -> Self {
        Timestamp {
            wall_time,
            logical: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.wall_time == 0 && self.logical == 0
    }

    /// Returns the smallest timestamp strictly greater than `self`.
    pub fn next(&self) -> Self {
        if self.logical == i32::MAX {
            Timestamp::new(self.wall_time.saturating_add(1), 0)
        } else {
            Timestamp::new(self.wall_time, self.logical + 1)
        }
    }

    /// Returns the largest timestamp strictly smaller than `self`.
    pub fn prev(&self) -> Self {
        if self.logical > 0 {
            Timestamp::new(self.wall_time, self.logical - 1)
        } else if self.wall_time > 0 {
            Timestamp::new(self.wall_time - 1, i32::MAX)
        } else {
            Timestamp::default()
        }
    }

    /// Returns `self` shifted by the given amounts.
    pub fn add(&self, wall_nanos: i64, logical: i32) -> Self {
        Timestamp::new(
            self.wall_time.saturating_add(wall_nanos),
            self.logical.saturating_add(logical),
        )
    }

    /// Ratchets `self` up to `other` if `other` is larger. Returns true if
    /// `self` was moved.
    pub fn forward(&mut self, other: Timestamp) -> bool {
        if *self < other {
            *self = other;
            true
        } else {
            false
        }
    }

    /// Lowers `self` down to `other` if `other` is smaller.
    pub fn backward(&mut self, other: Timestamp) {
        if other < *self {
            *self = other;
        }
    }

    /// Returns the wall time as a duration since the epoch.
    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.wall_time.max(0) as u64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{:09},{}",
            self.wall_time / 1_000_000_000,
            (self.wall_time % 1_000_000_000).abs(),
            self.logical
        )
    }
}

// Implement `Debug` trait manually for compact trace printing.
impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Source of physical time in nanoseconds.
pub type PhysicalSource = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Reads the system wall clock in nanoseconds since the unix epoch.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Manually driven physical clock for tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(nanos: i64) -> Self {
        ManualClock(Arc::new(AtomicI64::new(nanos)))
    }

    pub fn set(&self, nanos: i64) {
        self.0.store(nanos, Ordering::SeqCst);
    }

    pub fn increment(&self, nanos: i64) {
        self.0.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn nanos(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns a physical source closure reading this manual clock.
    pub fn source(&self) -> PhysicalSource {
        let inner = self.0.clone();
        Arc::new(move || inner.load(Ordering::SeqCst))
    }
}

/// Hybrid-logical clock owned by a node.
pub struct Clock {
    /// Physical time source.
    physical: PhysicalSource,

    /// Maximum tolerated offset between any two nodes' clocks. Zero disables
    /// the out-of-bounds check on `update()`.
    max_offset: Duration,

    /// Latest timestamp handed out or observed.
    last: Mutex<Timestamp>,
}

impl Clock {
    /// Creates a new clock reading the given physical source.
    pub fn new(physical: PhysicalSource, max_offset: Duration) -> Self {
        Clock {
            physical,
            max_offset,
            last: Mutex::new(Timestamp::default()),
        }
    }

    /// Creates a new clock reading the system wall clock.
    pub fn system(max_offset: Duration) -> Self {
        Self::new(Arc::new(unix_nanos), max_offset)
    }

    #[inline]
    pub fn max_offset(&self) -> Duration {
        self.max_offset
    }

    #[inline]
    pub fn physical_now(&self) -> i64 {
        (self.physical)()
    }

    /// Returns a timestamp strictly greater than any previously returned or
    /// observed one.
    pub fn now(&self) -> Timestamp {
        let phys = self.physical_now();
        let mut last = self.last.locked();
        if phys > last.wall_time {
            *last = Timestamp::from_wall(phys);
        } else {
            *last = last.next();
        }
        *last
    }

    /// Peeks at the latest timestamp without advancing the clock.
    pub fn peek(&self) -> Timestamp {
        *self.last.locked()
    }

    /// Ratchets the clock to `max(local, remote)` and then ticks the logical
    /// counter. Fails if `remote` runs ahead of local physical time by more
    /// than the maximum offset.
    pub fn update(&self, remote: Timestamp) -> Result<Timestamp, KvError> {
        let phys = self.physical_now();
        let max_offset = self.max_offset.as_nanos() as i64;
        if max_offset > 0 && remote.wall_time - phys > max_offset {
            pf_error!("hlc"; "remote timestamp {} ahead of physical {} beyond max offset {:?}",
                      remote, phys, self.max_offset);
            return Err(KvError::new(ErrorDetail::ClockOutOfBounds {
                remote,
                physical_now: phys,
                max_offset_nanos: max_offset,
            }));
        }

        let mut last = self.last.locked();
        let mut next = (*last).max(remote);
        if phys > next.wall_time {
            next = Timestamp::from_wall(phys);
        } else {
            next = next.next();
        }
        *last = next;
        Ok(next)
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Clock")
            .field("max_offset", &self.max_offset)
            .field("last", &self.peek())
            .finish()
    }
}

#[cfg(test)]
mod hlc_tests {
    use super::*;
    use std::thread;

    #[test]
    fn timestamp_order() {
        let a = Timestamp::new(5, 3);
        assert!(a < Timestamp::new(5, 4));
        assert!(a < Timestamp::new(6, 0));
        assert!(Timestamp::new(4, 99) < a);
        assert_eq!(a.next(), Timestamp::new(5, 4));
        assert_eq!(Timestamp::new(5, 0).prev(), Timestamp::new(4, i32::MAX));
        assert!(Timestamp::default().is_empty());
    }

    #[test]
    fn forward_backward() {
        let mut ts = Timestamp::new(10, 0);
        assert!(!ts.forward(Timestamp::new(9, 9)));
        assert!(ts.forward(Timestamp::new(10, 1)));
        assert_eq!(ts, Timestamp::new(10, 1));
        ts.backward(Timestamp::new(3, 0));
        assert_eq!(ts, Timestamp::new(3, 0));
    }

    #[test]
    fn now_ticks_logical() {
        let manual = ManualClock::new(100);
        let clock = Clock::new(manual.source(), Duration::ZERO);
        assert_eq!(clock.now(), Timestamp::new(100, 0));
        assert_eq!(clock.now(), Timestamp::new(100, 1));
        manual.set(200);
        assert_eq!(clock.now(), Timestamp::new(200, 0));
        manual.set(150);
        assert_eq!(clock.now(), Timestamp::new(200, 1));
    }

    #[test]
    fn update_ratchets() -> Result<(), KvError> {
        let manual = ManualClock::new(100);
        let clock = Clock::new(manual.source(), Duration::from_nanos(1000));
        assert_eq!(clock.update(Timestamp::new(500, 7))?, Timestamp::new(500, 8));
        assert_eq!(clock.now(), Timestamp::new(500, 9));
        // an older remote still ticks logical
        assert_eq!(clock.update(Timestamp::new(50, 0))?, Timestamp::new(500, 10));
        manual.set(900);
        assert_eq!(clock.update(Timestamp::new(600, 0))?, Timestamp::new(900, 0));
        Ok(())
    }

    #[test]
    fn update_out_of_bounds() {
        let manual = ManualClock::new(100);
        let clock = Clock::new(manual.source(), Duration::from_nanos(50));
        let err = clock.update(Timestamp::new(151, 0)).unwrap_err();
        assert!(matches!(err.detail, ErrorDetail::ClockOutOfBounds { .. }));
        assert!(clock.update(Timestamp::new(150, 0)).is_ok());
    }

    #[test]
    fn concurrent_monotonic() {
        let clock = Arc::new(Clock::system(Duration::ZERO));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                thread::spawn(move || {
                    let mut prev = Timestamp::default();
                    for _ in 0..1000 {
                        let ts = clock.now();
                        assert!(ts > prev);
                        prev = ts;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
