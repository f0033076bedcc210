//! Timestamp cache: the highest timestamp each key span has been read at.
//! Writers consult it so they never land below a completed read.

use std::ops::Range;
use std::sync::Mutex;

use crate::hlc::Timestamp;
use crate::kvpb::{Span, TxnId};
use crate::utils::MutexExt;

use rangemap::RangeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheValue {
    ts: Timestamp,

    /// Reader of the entry; `None` if several readers share the timestamp.
    txn: Option<TxnId>,
}

struct CacheState {
    low_water: Timestamp,
    reads: RangeMap<Vec<u8>, CacheValue>,
}

pub struct TimestampCache {
    state: Mutex<CacheState>,
}

fn span_range(span: &Span) -> Range<Vec<u8>> {
    span.key.to_vec()..span.end_exclusive().to_vec()
}

impl TimestampCache {
    pub fn new(low_water: Timestamp) -> Self {
        TimestampCache {
            state: Mutex::new(CacheState {
                low_water,
                reads: RangeMap::new(),
            }),
        }
    }

    /// Records a read of `span` at `ts`.
    pub fn add(&self, span: &Span, ts: Timestamp, txn: Option<TxnId>) {
        let range = span_range(span);
        if range.start >= range.end {
            return;
        }
        let mut state = self.state.locked();
        if ts <= state.low_water {
            return;
        }
        let new = CacheValue { ts, txn };
        let mut updates: Vec<(Range<Vec<u8>>, CacheValue)> = state
            .reads
            .gaps(&range)
            .map(|gap| (gap, new))
            .collect();
        for (r, v) in state.reads.overlapping(&range) {
            let clipped = r.start.clone().max(range.start.clone())
                ..r.end.clone().min(range.end.clone());
            if v.ts < ts {
                updates.push((clipped, new));
            } else if v.ts == ts && v.txn != txn {
                updates.push((clipped, CacheValue { ts, txn: None }));
            }
        }
        for (r, v) in updates {
            state.reads.insert(r, v);
        }
    }

    /// Highest read timestamp over `span`, and the reader if unique.
    pub fn get_max(&self, span: &Span) -> (Timestamp, Option<TxnId>) {
        let range = span_range(span);
        let state = self.state.locked();
        let mut max = CacheValue {
            ts: state.low_water,
            txn: None,
        };
        if range.start < range.end {
            for (_, v) in state.reads.overlapping(&range) {
                if v.ts > max.ts {
                    max = *v;
                } else if v.ts == max.ts && v.txn != max.txn {
                    max.txn = None;
                }
            }
        }
        (max.ts, max.txn)
    }

    /// Raises the floor of the whole cache, e.g. to a new lease's start.
    pub fn set_low_water(&self, ts: Timestamp) {
        let mut state = self.state.locked();
        if state.low_water.forward(ts) {
            let low = state.low_water;
            let stale: Vec<Range<Vec<u8>>> = state
                .reads
                .iter()
                .filter(|(_, v)| v.ts <= low)
                .map(|(r, _)| r.clone())
                .collect();
            for r in stale {
                state.reads.remove(r);
            }
        }
    }

    pub fn low_water(&self) -> Timestamp {
        self.state.locked().low_water
    }
}
