//! Cluster-wide meta directory: the authoritative descriptor of every
//! range, keyed by start key. Every update keeps the descriptors disjoint
//! and covering the whole keyspace.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

use crate::kvpb::keys::{key_max, key_min};
use crate::kvpb::{Key, RangeDescriptor, RangeId};
use crate::utils::{KvError, RwLockExt};

/// Outcome of a merge as recorded in the directory, keyed by the
/// subsumed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    InProgress { left: RangeId },
    Committed { left: RangeId },
    Aborted,
}

#[derive(Default)]
struct MetaState {
    descs: BTreeMap<Key, RangeDescriptor>,
    next_range_id: RangeId,
    merges: HashMap<RangeId, MergeStatus>,
}

impl MetaState {
    fn by_id(&self, range_id: RangeId) -> Option<&RangeDescriptor> {
        self.descs.values().find(|d| d.range_id == range_id)
    }

    /// Checks that the descriptors are contiguous and cover the keyspace.
    fn validate(&self) -> Result<(), KvError> {
        let mut expect = key_min();
        for (start, desc) in &self.descs {
            if *start != expect || desc.start_key != expect {
                return logged_err!("meta"; "descriptor {:?} does not start at {:?}",
                                           desc, expect);
            }
            if desc.end_key <= desc.start_key {
                return logged_err!("meta"; "descriptor {:?} is empty", desc);
            }
            expect = desc.end_key.clone();
        }
        if expect != key_max() {
            return logged_err!("meta"; "keyspace not covered beyond {:?}", expect);
        }
        Ok(())
    }

    /// Applies `f` to a copy of the state and installs it only if the
    /// result still validates.
    fn transact(
        &mut self,
        f: impl FnOnce(&mut BTreeMap<Key, RangeDescriptor>) -> Result<(), KvError>,
    ) -> Result<(), KvError> {
        let mut descs = self.descs.clone();
        f(&mut descs)?;
        let old = std::mem::replace(&mut self.descs, descs);
        if let Err(e) = self.validate() {
            self.descs = old;
            return Err(e);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MetaDirectory {
    state: RwLock<MetaState>,
}

impl MetaDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the initial descriptors.
    pub fn bootstrap(&self, descs: Vec<RangeDescriptor>) -> Result<(), KvError> {
        let mut state = self.state.write_locked();
        let max_id = descs.iter().map(|d| d.range_id).max().unwrap_or(0);
        state.transact(|m| {
            m.clear();
            for d in descs {
                m.insert(d.start_key.clone(), d);
            }
            Ok(())
        })?;
        state.next_range_id = max_id + 1;
        Ok(())
    }

    /// Descriptor of the range containing `key`.
    pub fn lookup(&self, key: &[u8]) -> Option<RangeDescriptor> {
        let state = self.state.read_locked();
        state
            .descs
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, d)| d)
            .filter(|d| d.contains_key(key))
            .cloned()
    }

    /// Descriptor of the range ending at or containing the key just before
    /// `key`; used by reverse scans.
    pub fn lookup_reverse(&self, key: &[u8]) -> Option<RangeDescriptor> {
        let state = self.state.read_locked();
        state
            .descs
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(_, d)| d.clone())
    }

    pub fn get(&self, range_id: RangeId) -> Option<RangeDescriptor> {
        self.state.read_locked().by_id(range_id).cloned()
    }

    /// Range starting where `desc` ends.
    pub fn right_neighbor(&self, desc: &RangeDescriptor) -> Option<RangeDescriptor> {
        self.state.read_locked().descs.get(&desc.end_key).cloned()
    }

    pub fn descriptors(&self) -> Vec<RangeDescriptor> {
        self.state.read_locked().descs.values().cloned().collect()
    }

    pub fn num_ranges(&self) -> usize {
        self.state.read_locked().descs.len()
    }

    pub fn allocate_range_id(&self) -> RangeId {
        let mut state = self.state.write_locked();
        let id = state.next_range_id.max(1);
        state.next_range_id = id + 1;
        id
    }

    /// Replaces the descriptor of a split range by its two halves.
    pub fn split(
        &self,
        left: &RangeDescriptor,
        right: &RangeDescriptor,
    ) -> Result<(), KvError> {
        let mut state = self.state.write_locked();
        let old = match state.descs.get(&left.start_key) {
            Some(d) => d.clone(),
            None => {
                return logged_err!("meta"; "split of unknown range {:?}", left);
            }
        };
        if old.range_id != left.range_id
            || old.end_key != right.end_key
            || left.end_key != right.start_key
        {
            return logged_err!("meta"; "split {:?} + {:?} does not match {:?}",
                                       left, right, old);
        }
        state.transact(|m| {
            m.insert(left.start_key.clone(), left.clone());
            m.insert(right.start_key.clone(), right.clone());
            Ok(())
        })
    }

    /// Replaces a descriptor by a newer one with the same bounds.
    pub fn update(&self, desc: &RangeDescriptor) -> Result<(), KvError> {
        let mut state = self.state.write_locked();
        match state.descs.get(&desc.start_key) {
            Some(old)
                if old.range_id == desc.range_id
                    && old.end_key == desc.end_key
                    && old.generation <= desc.generation => {}
            other => {
                return logged_err!("meta"; "update {:?} conflicts with {:?}",
                                           desc, other);
            }
        }
        state.transact(|m| {
            m.insert(desc.start_key.clone(), desc.clone());
            Ok(())
        })
    }

    /// Records the start of a merge of `right` into `left`.
    pub fn begin_merge(
        &self,
        left: &RangeDescriptor,
        right: &RangeDescriptor,
    ) -> Result<(), KvError> {
        let mut state = self.state.write_locked();
        let cur_left = state.descs.get(&left.start_key);
        let cur_right = state.descs.get(&right.start_key);
        match (cur_left, cur_right) {
            (Some(l), Some(r)) if l == left && r == right && l.end_key == r.start_key => {}
            _ => {
                return Err(KvError::msg(format!(
                    "merge of {:?} and {:?} does not match the directory",
                    left, right
                )));
            }
        }
        if let Some(MergeStatus::InProgress { .. }) = state.merges.get(&right.range_id) {
            return Err(KvError::msg(format!("r{} already being merged", right.range_id)));
        }
        state
            .merges
            .insert(right.range_id, MergeStatus::InProgress { left: left.range_id });
        Ok(())
    }

    /// Commits a merge: `merged` covers both halves and `right_id` is gone.
    pub fn commit_merge(
        &self,
        merged: &RangeDescriptor,
        right_id: RangeId,
    ) -> Result<(), KvError> {
        let mut state = self.state.write_locked();
        let right = match state.by_id(right_id) {
            Some(r) => r.clone(),
            None => return logged_err!("meta"; "merge of unknown r{}", right_id),
        };
        if right.end_key != merged.end_key {
            return logged_err!("meta"; "merged {:?} does not absorb {:?}", merged, right);
        }
        state.transact(|m| {
            m.remove(&right.start_key);
            m.insert(merged.start_key.clone(), merged.clone());
            Ok(())
        })?;
        state
            .merges
            .insert(right_id, MergeStatus::Committed { left: merged.range_id });
        Ok(())
    }

    pub fn abort_merge(&self, right_id: RangeId) {
        let mut state = self.state.write_locked();
        if let Some(MergeStatus::InProgress { .. }) = state.merges.get(&right_id) {
            state.merges.insert(right_id, MergeStatus::Aborted);
        }
    }

    pub fn merge_status(&self, right_id: RangeId) -> Option<MergeStatus> {
        self.state.read_locked().merges.get(&right_id).copied()
    }
}
