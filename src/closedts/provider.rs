//! Closed timestamp provider: periodically closes out the local tracker and
//! publishes the result to local storage and to stream subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::closedts::ctpb::Entry;
use crate::closedts::minprop::Tracker;
use crate::closedts::storage::Storage;
use crate::hlc::{Clock, Timestamp};
use crate::kvpb::{NodeId, RangeId};
use crate::storage::NodeLiveness;
use crate::utils::{KvError, MutexExt, Stopper};

use tokio::sync::broadcast;
use tokio::time::{self, Duration, MissedTickBehavior};

/// What has been published in the current liveness epoch.
#[derive(Debug, Default)]
struct EpochState {
    epoch: i64,
    closed: Timestamp,
    mlai: HashMap<RangeId, u64>,
}

pub struct Provider {
    node_id: NodeId,
    clock: Arc<Clock>,
    liveness: Arc<NodeLiveness>,
    tracker: Arc<Tracker>,
    storage: Arc<Storage>,

    target_nanos: i64,

    published: Mutex<Option<EpochState>>,

    tx_entry: broadcast::Sender<Entry>,
}

impl Provider {
    pub fn new(
        node_id: NodeId,
        clock: Arc<Clock>,
        liveness: Arc<NodeLiveness>,
        tracker: Arc<Tracker>,
        storage: Arc<Storage>,
        target_duration_ms: u64,
    ) -> Arc<Self> {
        let (tx_entry, _) = broadcast::channel(64);
        Arc::new(Provider {
            node_id,
            clock,
            liveness,
            tracker,
            storage,
            target_nanos: target_duration_ms as i64 * 1_000_000,
            published: Mutex::new(None),
            tx_entry,
        })
    }

    /// Runs one close round; returns the published entry if any.
    pub fn close_once(&self) -> Option<Entry> {
        let now = self.clock.now();
        let record = match self.liveness.get(self.node_id) {
            Some(r) if r.is_live(now) => r,
            _ => {
                pf_debug!("ctprovider"; "n{} not live, skipping close", self.node_id);
                return None;
            }
        };
        let candidate = now.add(-self.target_nanos, 0);
        let (closed, mlai, ok) = self.tracker.close(candidate);
        if !ok {
            pf_trace!("ctprovider"; "close to {} blocked by in-flight proposals", candidate);
            return None;
        }

        let full = {
            let mut published = self.published.locked();
            let fresh = published
                .as_ref()
                .map_or(true, |state| state.epoch != record.epoch);
            if fresh {
                *published = Some(EpochState {
                    epoch: record.epoch,
                    ..Default::default()
                });
            }
            if let Some(state) = published.as_mut() {
                state.closed.forward(closed);
                for (&range_id, &lai) in &mlai {
                    let cur = state.mlai.entry(range_id).or_default();
                    *cur = (*cur).max(lai);
                }
            }
            fresh
        };
        let entry = Entry {
            epoch: record.epoch,
            closed_timestamp: closed,
            mlai,
            full,
        };
        self.storage.add(self.node_id, entry.clone());
        // no subscribers is fine
        let _ = self.tx_entry.send(entry.clone());
        Some(entry)
    }

    /// Subscribes to newly published entries.
    pub fn subscribe(&self) -> broadcast::Receiver<Entry> {
        self.tx_entry.subscribe()
    }

    /// Everything published so far in the current epoch, as a full entry;
    /// sent first on every new stream.
    pub fn full_entry(&self) -> Option<Entry> {
        self.published.locked().as_ref().map(|state| Entry {
            epoch: state.epoch,
            closed_timestamp: state.closed,
            mlai: state.mlai.clone(),
            full: true,
        })
    }

    /// Sink for entries received from a peer.
    pub fn notify(&self, from: NodeId, entry: Entry) {
        pf_trace!("ctprovider"; "n{} received {} from n{}", self.node_id, entry, from);
        self.storage.add(from, entry);
    }

    pub fn start(
        self: &Arc<Self>,
        close_interval_ms: u64,
        stopper: &Stopper,
    ) -> Result<(), KvError> {
        let me = self.clone();
        let mut rx_quiesce = stopper.subscribe();
        stopper.run_worker(&format!("ct-provider-n{}", self.node_id), async move {
            let mut interval = time::interval(Duration::from_millis(close_interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        me.close_once();
                    },
                    _ = rx_quiesce.changed() => break,
                }
            }
        })
    }
}
