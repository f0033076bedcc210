//! Wiring of a node's closed timestamp subsystem.

use std::sync::Arc;

use crate::closedts::minprop::Tracker;
use crate::closedts::provider::Provider;
use crate::closedts::storage::Storage;
use crate::closedts::transport::{Clients, RefreshFn, Server};
use crate::hlc::{Clock, Timestamp};
use crate::kvpb::{NodeId, RangeId};
use crate::rpc::NodeDialer;
use crate::storage::NodeLiveness;
use crate::utils::{KvError, Stopper};

use serde::Deserialize;

use tokio::io::DuplexStream;
use tokio::time::Duration;

/// Buckets kept per peer: a recent one and one lagging followers can
/// still read from.
const STORAGE_BUCKET_NUM: usize = 2;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ClosedTsConfig {
    /// How far behind present time timestamps are closed.
    pub target_duration_ms: u64,

    pub close_interval_ms: u64,

    /// Spacing of the storage buckets.
    pub bucket_scale_ms: u64,

    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ClosedTsConfig {
    fn default() -> Self {
        ClosedTsConfig {
            target_duration_ms: 3000,
            close_interval_ms: 200,
            bucket_scale_ms: 10_000,
            initial_backoff_ms: 50,
            max_backoff_ms: 2000,
        }
    }
}

/// Decides a follower read against one entry: the read must be at or below
/// the closed timestamp and the replica must have applied through the
/// range's MLAI. A range missing from the entry cannot be served.
pub fn can_serve_follower_read(
    read_ts: Timestamp,
    closed_ts: Timestamp,
    mlai: Option<u64>,
    applied_lai: u64,
) -> bool {
    match mlai {
        Some(mlai) => read_ts <= closed_ts && applied_lai >= mlai,
        None => false,
    }
}

/// Outcome of checking the stored entries of a leaseholder's node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerReadCheck {
    CanServe,

    /// Some entry closes the timestamp but lacks the range.
    MissingRange,

    Cannot,
}

pub struct Container {
    node_id: NodeId,
    config: ClosedTsConfig,

    pub tracker: Arc<Tracker>,
    pub storage: Arc<Storage>,
    pub provider: Arc<Provider>,
    pub server: Arc<Server>,
    pub clients: Arc<Clients>,

    stopper: Stopper,
}

impl Container {
    pub fn new(
        config: ClosedTsConfig,
        node_id: NodeId,
        clock: Arc<Clock>,
        liveness: Arc<NodeLiveness>,
        dialer: Arc<NodeDialer>,
        stopper: Stopper,
    ) -> Arc<Self> {
        let tracker = Tracker::new();
        let storage = Arc::new(Storage::new(config.bucket_scale_ms, STORAGE_BUCKET_NUM));
        let provider = Provider::new(
            node_id,
            clock,
            liveness,
            tracker.clone(),
            storage.clone(),
            config.target_duration_ms,
        );
        let server = Server::new(node_id, provider.clone(), stopper.clone());
        let clients = Clients::new(
            node_id,
            dialer,
            provider.clone(),
            stopper.clone(),
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        );
        Arc::new(Container {
            node_id,
            config,
            tracker,
            storage,
            provider,
            server,
            clients,
            stopper,
        })
    }

    pub fn start(&self, refresh: RefreshFn) -> Result<(), KvError> {
        self.server.set_refresh(refresh);
        self.provider.start(self.config.close_interval_ms, &self.stopper)?;
        pf_debug!("ctcontainer"; "n{} closed timestamps started", self.node_id);
        Ok(())
    }

    pub fn open_stream(&self) -> Result<DuplexStream, KvError> {
        self.server.open_stream()
    }

    /// Checks whether a follower at `applied_lai` may serve a read at
    /// `read_ts` under the entries published by `holder` for `epoch`. Asks
    /// the holder for the range when it is missing.
    pub fn check_follower_read(
        &self,
        holder: NodeId,
        epoch: i64,
        range_id: RangeId,
        read_ts: Timestamp,
        applied_lai: u64,
    ) -> FollowerReadCheck {
        let mut result = FollowerReadCheck::Cannot;
        self.storage.visit_descending(holder, |e| {
            if e.epoch != epoch || read_ts > e.closed_timestamp {
                return false;
            }
            let mlai = e.mlai.get(&range_id).copied();
            if can_serve_follower_read(read_ts, e.closed_timestamp, mlai, applied_lai) {
                result = FollowerReadCheck::CanServe;
                return true;
            }
            if mlai.is_none() && result == FollowerReadCheck::Cannot {
                result = FollowerReadCheck::MissingRange;
            }
            false
        });
        if result != FollowerReadCheck::CanServe {
            // also starts the stream on first use
            self.clients.request(holder, range_id);
        }
        result
    }
}

#[cfg(test)]
mod container_tests {
    use super::*;
    use crate::closedts::ctpb::Entry;
    use std::collections::HashMap;

    #[test]
    fn follower_read_rule() {
        let closed = Timestamp::new(100, 0);
        let ts = Timestamp::new(95, 0);
        assert!(can_serve_follower_read(ts, closed, Some(42), 45));
        assert!(!can_serve_follower_read(ts, closed, Some(42), 40));
        assert!(!can_serve_follower_read(Timestamp::new(101, 0), closed, Some(42), 45));
        assert!(!can_serve_follower_read(ts, closed, None, 45));
    }

    #[test]
    fn older_bucket_serves_lagging_follower() {
        let storage = Storage::new(10, 2);
        let sec = 1_000_000_000;
        storage.add(2, Entry {
            epoch: 1,
            closed_timestamp: Timestamp::new(sec, 0),
            mlai: HashMap::from([(5, 10)]),
            full: true,
        });
        storage.add(2, Entry {
            epoch: 1,
            closed_timestamp: Timestamp::new(2 * sec, 0),
            mlai: HashMap::from([(5, 20)]),
            full: false,
        });
        // a follower at 15 can read below the older closed timestamp only
        let mut served = Vec::new();
        storage.visit_descending(2, |e| {
            let ok = can_serve_follower_read(
                Timestamp::new(sec / 2, 0),
                e.closed_timestamp,
                e.mlai.get(&5).copied(),
                15,
            );
            served.push(ok);
            ok
        });
        assert_eq!(served, vec![false, true]);
    }
}
