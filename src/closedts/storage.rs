//! Per-peer history of closed timestamp entries.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::closedts::ctpb::Entry;
use crate::kvpb::NodeId;
use crate::utils::RwLockExt;

/// Bucketed entries of one publishing node; bucket 0 is the newest.
#[derive(Debug, Clone)]
struct SingleStorage {
    scale_nanos: i64,
    buckets: Vec<Entry>,
}

impl SingleStorage {
    fn new(scale_nanos: i64, num_buckets: usize) -> Self {
        SingleStorage {
            scale_nanos,
            buckets: vec![Entry::default(); num_buckets.max(1)],
        }
    }

    fn is_empty_bucket(e: &Entry) -> bool {
        e.epoch == 0 && e.closed_timestamp.is_empty()
    }

    fn add(&mut self, e: Entry) {
        let head = &self.buckets[0];
        if !Self::is_empty_bucket(head) && e.epoch < head.epoch {
            pf_debug!("ctstorage"; "dropping stale {} (head epoch {})", e, head.epoch);
            return;
        }

        // increments fold into the head of the same epoch
        let merged = if !e.full && !Self::is_empty_bucket(head) && e.epoch == head.epoch {
            let mut merged = head.clone();
            merged.closed_timestamp.forward(e.closed_timestamp);
            for (range_id, lai) in e.mlai {
                let cur = merged.mlai.entry(range_id).or_insert(lai);
                if *cur < lai {
                    *cur = lai;
                }
            }
            merged
        } else {
            e
        };

        if !Self::is_empty_bucket(head) {
            // shift older buckets once the new head is a full scale ahead
            for i in (1..self.buckets.len()).rev() {
                let older = &self.buckets[i];
                let ahead = merged.closed_timestamp.wall_time
                    - older.closed_timestamp.wall_time;
                if Self::is_empty_bucket(older) || ahead >= self.scale_nanos * i as i64
                {
                    self.buckets[i] = self.buckets[i - 1].clone();
                }
            }
        }
        self.buckets[0] = merged;
    }
}

/// Closed timestamp storage of a node: one bucketed history per peer.
#[derive(Debug)]
pub struct Storage {
    scale_nanos: i64,
    num_buckets: usize,
    nodes: RwLock<HashMap<NodeId, SingleStorage>>,
}

impl Storage {
    pub fn new(scale_ms: u64, num_buckets: usize) -> Self {
        Storage {
            scale_nanos: scale_ms as i64 * 1_000_000,
            num_buckets,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, node_id: NodeId, entry: Entry) {
        let mut nodes = self.nodes.write_locked();
        nodes
            .entry(node_id)
            .or_insert_with(|| SingleStorage::new(self.scale_nanos, self.num_buckets))
            .add(entry);
    }

    /// Walks the node's entries newest first until `f` returns true.
    pub fn visit_descending(&self, node_id: NodeId, mut f: impl FnMut(&Entry) -> bool) {
        let nodes = self.nodes.read_locked();
        if let Some(single) = nodes.get(&node_id) {
            for e in &single.buckets {
                if SingleStorage::is_empty_bucket(e) {
                    continue;
                }
                if f(e) {
                    return;
                }
            }
        }
    }

    /// Newest entry published by the node, if any.
    pub fn newest(&self, node_id: NodeId) -> Option<Entry> {
        let mut found = None;
        self.visit_descending(node_id, |e| {
            found = Some(e.clone());
            true
        });
        found
    }

    /// Drops everything known about a node, e.g. after its stream broke.
    pub fn clear(&self, node_id: NodeId) {
        self.nodes.write_locked().remove(&node_id);
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;
    use crate::hlc::Timestamp;

    const SEC: i64 = 1_000_000_000;

    fn entry(epoch: i64, secs: i64, mlai: &[(u64, u64)], full: bool) -> Entry {
        Entry {
            epoch,
            closed_timestamp: Timestamp::new(secs * SEC, 0),
            mlai: mlai.iter().copied().collect(),
            full,
        }
    }

    fn closed_seq(s: &Storage, node: NodeId) -> Vec<i64> {
        let mut seen = Vec::new();
        s.visit_descending(node, |e| {
            seen.push(e.closed_timestamp.wall_time / SEC);
            false
        });
        seen
    }

    #[test]
    fn increments_merge_into_head() {
        let s = Storage::new(10_000, 2);
        s.add(1, entry(1, 1, &[(5, 3)], true));
        s.add(1, entry(1, 2, &[(6, 1), (5, 4)], false));
        let head = s.newest(1).unwrap();
        assert_eq!(head.epoch, 1);
        assert_eq!(head.mlai.get(&5), Some(&4));
        assert_eq!(head.mlai.get(&6), Some(&1));
        assert_eq!(head.closed_timestamp.wall_time, 2 * SEC);
        assert!(s.newest(2).is_none());
    }

    #[test]
    fn buckets_rotate_by_scale() {
        let s = Storage::new(10_000, 2);
        s.add(1, entry(1, 1, &[], true));
        s.add(1, entry(1, 2, &[], false));
        // second bucket got filled with the first head, then stays put
        assert_eq!(closed_seq(&s, 1), vec![2, 1]);
        s.add(1, entry(1, 5, &[], false));
        assert_eq!(closed_seq(&s, 1), vec![5, 1]);
        s.add(1, entry(1, 12, &[], false));
        assert_eq!(closed_seq(&s, 1), vec![12, 5]);
    }

    #[test]
    fn stale_epoch_dropped() {
        let s = Storage::new(10_000, 2);
        s.add(1, entry(2, 1, &[(1, 1)], true));
        s.add(1, entry(1, 9, &[(1, 9)], true));
        assert_eq!(s.newest(1).unwrap().epoch, 2);
        // new epoch replaces the head wholesale
        s.add(1, entry(3, 2, &[], false));
        assert!(s.newest(1).unwrap().mlai.is_empty());
        s.clear(1);
        assert!(s.newest(1).is_none());
    }
}
