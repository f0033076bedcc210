//! Node liveness: per-node `(epoch, expiration)` records heartbeated by
//! their owners. Epoch-based leases are valid while the holder's record
//! carries the lease's epoch and has not expired.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::hlc::{Clock, Timestamp};
use crate::kvpb::NodeId;
use crate::utils::{KvError, MutexExt, Stopper};

use serde::Deserialize;

use tokio::time::{self, Duration, MissedTickBehavior};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    /// Validity of one heartbeat.
    pub liveness_duration_ms: u64,

    /// Heartbeat period; well below the validity.
    pub heartbeat_interval_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for LivenessConfig {
    fn default() -> Self {
        LivenessConfig {
            liveness_duration_ms: 3000,
            heartbeat_interval_ms: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessRecord {
    pub node_id: NodeId,
    pub epoch: i64,
    pub expiration: Timestamp,
}

impl LivenessRecord {
    #[inline]
    pub fn is_live(&self, now: Timestamp) -> bool {
        now < self.expiration
    }
}

/// Cluster-wide liveness table, shared by every node of the cluster.
pub struct NodeLiveness {
    config: LivenessConfig,
    records: Mutex<HashMap<NodeId, LivenessRecord>>,

    /// Nodes whose heartbeat loop is paused.
    paused: Mutex<HashSet<NodeId>>,
}

impl NodeLiveness {
    pub fn new(config: LivenessConfig) -> Arc<Self> {
        Arc::new(NodeLiveness {
            config,
            records: Mutex::new(HashMap::new()),
            paused: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Extends the node's record from `now`; creates it at epoch 1.
    pub fn heartbeat(&self, node_id: NodeId, now: Timestamp) -> LivenessRecord {
        let nanos = self.config.liveness_duration_ms as i64 * 1_000_000;
        let mut records = self.records.locked();
        let record = records.entry(node_id).or_insert(LivenessRecord {
            node_id,
            epoch: 1,
            expiration: Timestamp::default(),
        });
        record.expiration.forward(now.add(nanos, 0));
        *record
    }

    pub fn get(&self, node_id: NodeId) -> Option<LivenessRecord> {
        self.records.locked().get(&node_id).copied()
    }

    pub fn is_live(&self, node_id: NodeId, now: Timestamp) -> bool {
        self.get(node_id).map_or(false, |r| r.is_live(now))
    }

    /// Bumps the epoch of a node whose record has expired, invalidating
    /// its epoch-based leases. Fails while the record is still live.
    pub fn increment_epoch(
        &self,
        node_id: NodeId,
        now: Timestamp,
    ) -> Result<LivenessRecord, KvError> {
        let mut records = self.records.locked();
        let record = records.entry(node_id).or_insert(LivenessRecord {
            node_id,
            epoch: 1,
            expiration: Timestamp::default(),
        });
        if record.is_live(now) {
            return Err(KvError::msg(format!(
                "cannot increment epoch of live n{} (expires {})",
                node_id, record.expiration
            )));
        }
        record.epoch += 1;
        pf_info!("liveness"; "incremented epoch of n{} to {}", node_id, record.epoch);
        Ok(*record)
    }

    /// Pauses or resumes a node's heartbeat loop.
    pub fn set_heartbeat_paused(&self, node_id: NodeId, paused: bool) {
        let mut set = self.paused.locked();
        if paused {
            set.insert(node_id);
        } else {
            set.remove(&node_id);
        }
    }

    fn heartbeat_paused(&self, node_id: NodeId) -> bool {
        self.paused.locked().contains(&node_id)
    }

    /// Spawns the node's heartbeat loop.
    pub fn start_heartbeat(
        self: &Arc<Self>,
        node_id: NodeId,
        clock: Arc<Clock>,
        stopper: &Stopper,
    ) -> Result<(), KvError> {
        self.heartbeat(node_id, clock.now());
        let me = self.clone();
        let mut rx_quiesce = stopper.subscribe();
        stopper.run_worker(&format!("liveness-heartbeat-n{}", node_id), async move {
            let mut interval =
                time::interval(Duration::from_millis(me.config.heartbeat_interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !me.heartbeat_paused(node_id) {
                            me.heartbeat(node_id, clock.now());
                        }
                    },
                    _ = rx_quiesce.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod liveness_tests {
    use super::*;

    fn ts(ms: i64) -> Timestamp {
        Timestamp::new(ms * 1_000_000, 0)
    }

    #[test]
    fn heartbeat_extends() {
        let nl = NodeLiveness::new(LivenessConfig::default());
        let r = nl.heartbeat(1, ts(0));
        assert_eq!(r.epoch, 1);
        assert!(nl.is_live(1, ts(2999)));
        assert!(!nl.is_live(1, ts(3000)));
        nl.heartbeat(1, ts(2000));
        assert!(nl.is_live(1, ts(4000)));
        assert!(!nl.is_live(2, ts(0)));
    }

    #[test]
    fn increment_only_when_expired() -> Result<(), KvError> {
        let nl = NodeLiveness::new(LivenessConfig::default());
        nl.heartbeat(3, ts(0));
        assert!(nl.increment_epoch(3, ts(100)).is_err());
        let r = nl.increment_epoch(3, ts(5000))?;
        assert_eq!(r.epoch, 2);
        // the owner keeps heartbeating at its new epoch
        assert_eq!(nl.heartbeat(3, ts(5000)).epoch, 2);
        Ok(())
    }
}
