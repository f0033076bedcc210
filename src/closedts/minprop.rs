//! Minimum proposal tracker: the per-node lower bound below which no
//! in-flight write may still land.
//!
//! ```text
//!     closed           next
//!       |   left bucket  |  right bucket
//!       v                v
//! ------+----------------+------------------> time
//! ```
//!
//! A new proposal is forced above `next` and counted in the right bucket.
//! `close()` may only advance `closed` to `next` once the left bucket has
//! drained; the right bucket then becomes the left one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::hlc::Timestamp;
use crate::kvpb::RangeId;
use crate::utils::MutexExt;

#[derive(Debug, Default)]
struct TrackerState {
    closed: Timestamp,
    next: Timestamp,

    left_ref: usize,
    left_mlai: HashMap<RangeId, u64>,

    right_ref: usize,
    right_mlai: HashMap<RangeId, u64>,
}

fn merge_lai(mlai: &mut HashMap<RangeId, u64>, range_id: RangeId, lai: u64) {
    let cur = mlai.entry(range_id).or_insert(lai);
    if *cur < lai {
        *cur = lai;
    }
}

#[derive(Debug, Default)]
pub struct Tracker {
    state: Mutex<TrackerState>,
}

impl Tracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an in-flight proposal. Its write timestamp must be forwarded
    /// to the returned minimum.
    pub fn track(self: &Arc<Self>) -> (Timestamp, TrackedProposal) {
        let min_prop = {
            let mut state = self.state.locked();
            state.right_ref += 1;
            state.next.next()
        };
        (
            min_prop,
            TrackedProposal {
                tracker: self.clone(),
                min_prop,
                released: false,
            },
        )
    }

    fn release(&self, min_prop: Timestamp, lai: Option<(RangeId, u64)>) {
        let mut state = self.state.locked();
        if min_prop == state.next.next() && state.right_ref > 0 {
            state.right_ref -= 1;
            if let Some((range_id, lai)) = lai {
                merge_lai(&mut state.right_mlai, range_id, lai);
            }
        } else if min_prop == state.closed.next() && state.left_ref > 0 {
            state.left_ref -= 1;
            if let Some((range_id, lai)) = lai {
                merge_lai(&mut state.left_mlai, range_id, lai);
            }
        } else {
            pf_error!("minprop"; "released proposal {} matches no bucket (closed {} next {})",
                                 min_prop, state.closed, state.next);
        }
    }

    /// Records a range's current lease applied index for the next close
    /// without a write; used when a follower asks for a missing range.
    pub fn emit_mlai(self: &Arc<Self>, range_id: RangeId, lai: u64) {
        let (_, tok) = self.track();
        tok.release(range_id, lai);
    }

    /// Attempts to close out `next` and start tracking towards `new_next`.
    /// Returns the closed timestamp, the applied indexes that go with it,
    /// and whether it advanced.
    pub fn close(
        &self,
        new_next: Timestamp,
    ) -> (Timestamp, HashMap<RangeId, u64>, bool) {
        let mut state = self.state.locked();
        if state.left_ref > 0 {
            return (state.closed, HashMap::new(), false);
        }
        state.closed = state.next;
        let mlai = std::mem::take(&mut state.left_mlai);
        state.left_ref = state.right_ref;
        state.left_mlai = std::mem::take(&mut state.right_mlai);
        state.right_ref = 0;
        if state.next < new_next {
            state.next = new_next;
        }
        (state.closed, mlai, true)
    }

    pub fn closed(&self) -> Timestamp {
        self.state.locked().closed
    }
}

/// Handle of a tracked proposal. Dropping it without `release()` counts as
/// a proposal that never made it to the log.
#[derive(Debug)]
pub struct TrackedProposal {
    tracker: Arc<Tracker>,
    min_prop: Timestamp,
    released: bool,
}

impl TrackedProposal {
    pub fn min_prop(&self) -> Timestamp {
        self.min_prop
    }

    /// Releases the proposal, recording the lease applied index it was
    /// proposed at.
    pub fn release(mut self, range_id: RangeId, lai: u64) {
        self.released = true;
        self.tracker.release(self.min_prop, Some((range_id, lai)));
    }
}

impl Drop for TrackedProposal {
    fn drop(&mut self) {
        if !self.released {
            self.tracker.release(self.min_prop, None);
        }
    }
}
