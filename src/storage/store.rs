//! The store: owner of a node's replicas, its engine, the raft schedulers
//! and the background queues. Replicas point back at it weakly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::closedts::{ClosedTsConfig, Container};
use crate::hlc::Clock;
use crate::kv::DB;
use crate::kvpb::keys::transaction_key_bound;
use crate::kvpb::{
    BatchRequest, BatchResponse, Lease, LeaseType, Method, NodeId, RangeDescriptor,
    RangeId, ReplicaId, StoreId,
};
use crate::requestbatcher::BatcherConfig;
use crate::rpc::{NodeDialer, NodeService};
use crate::storage::intent_resolver::IntentResolver;
use crate::storage::liveness::NodeLiveness;
use crate::storage::merge_queue::MergeQueue;
use crate::storage::meta::MetaDirectory;
use crate::storage::queue::QueueConfig;
use crate::storage::raft::{INITIAL_LOG_INDEX, INITIAL_LOG_TERM};
use crate::storage::raft_transport::{RaftMessageRequest, RaftTransport};
use crate::storage::replica::{DestroyStatus, Replica, StoreAction};
use crate::storage::scheduler::{RaftProcessor, RaftScheduler, SchedulerType};
use crate::storage::split_queue::SplitQueue;
use crate::storage::stateloader::{RangeAppliedState, StateLoader, TruncatedState};
use crate::storage::zone::SystemConfig;
use crate::storage::Engine;
use crate::utils::{Ctx, ErrorDetail, KvError, MutexExt, Stopper};

use async_trait::async_trait;

use serde::Deserialize;

use tokio::io::DuplexStream;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Identity of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StoreIdent {
    pub node_id: NodeId,
    pub store_id: StoreId,
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Period of a raft tick.
    pub raft_tick_ms: u64,

    /// Ticks between leader heartbeats.
    pub raft_heartbeat_ticks: u32,

    pub raft_ready_workers: usize,
    pub raft_tick_workers: usize,

    /// In-flight proposal bytes allowed per range leader.
    pub proposal_quota_bytes: u64,

    /// Log entries kept beyond the slowest follower before truncating.
    pub raft_log_truncation_threshold: u64,

    /// Writes to a range larger than this multiple of its max size wait for
    /// the range to be split. Zero disables backpressure.
    pub backpressure_multiplier: f64,

    /// Attempts and spacing of waiting for lagging followers before a
    /// split.
    pub split_delay_attempts: u32,
    pub split_delay_interval_ms: u64,

    /// Duration of expiration-based leases.
    pub expiration_lease_ms: u64,

    pub lease_request_timeout_ms: u64,

    /// How far in the past replication-table reads are served.
    pub replication_table_offset_ms: u64,

    /// Transaction records not heartbeated for this long may be aborted.
    pub txn_liveness_threshold_ms: u64,

    /// Wait on a conflicting lock this long before pushing its holder.
    pub push_delay_ms: u64,

    /// Batching of asynchronous intent resolution.
    pub intent_resolver_batcher: BatcherConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            raft_tick_ms: 100,
            raft_heartbeat_ticks: 2,
            raft_ready_workers: 4,
            raft_tick_workers: 2,
            proposal_quota_bytes: 1 << 20,
            raft_log_truncation_threshold: 1000,
            backpressure_multiplier: 2.0,
            split_delay_attempts: 5,
            split_delay_interval_ms: 1000,
            expiration_lease_ms: 9000,
            lease_request_timeout_ms: 5000,
            replication_table_offset_ms: 48_000,
            txn_liveness_threshold_ms: 5000,
            push_delay_ms: 50,
            intent_resolver_batcher: BatcherConfig {
                max_idle_ms: 5,
                max_wait_ms: 10,
                max_msgs_per_batch: 100,
                in_flight_backpressure_limit: 0,
            },
        }
    }
}

/// Everything a store is built from.
pub struct StoreParams {
    pub ident: StoreIdent,
    pub config: StoreConfig,
    pub queue_config: QueueConfig,
    pub closedts_config: ClosedTsConfig,
    pub clock: Arc<Clock>,
    pub liveness: Arc<NodeLiveness>,
    pub meta: Arc<MetaDirectory>,
    pub system_config: Arc<SystemConfig>,
    pub dialer: Arc<NodeDialer>,
    pub stopper: Stopper,
}

#[derive(Default)]
struct ReplicaMap {
    alive: HashMap<RangeId, Arc<Replica>>,

    /// Merged-away replicas, kept to answer late `Subsume` retries.
    tombstones: HashMap<RangeId, Arc<Replica>>,

    /// Replica ids removed from this store; their traffic is dropped.
    removed: HashMap<RangeId, ReplicaId>,
}

pub struct Store {
    ident: StoreIdent,
    tag: String,
    config: StoreConfig,
    queue_config: QueueConfig,

    me: Weak<Store>,
    engine: Arc<Engine>,
    clock: Arc<Clock>,
    liveness: Arc<NodeLiveness>,
    meta: Arc<MetaDirectory>,
    system_config: Arc<SystemConfig>,
    closedts: Arc<Container>,
    transport: Arc<RaftTransport>,
    ready_scheduler: Arc<RaftScheduler>,
    tick_scheduler: Arc<RaftScheduler>,
    stopper: Stopper,

    replicas: Mutex<ReplicaMap>,

    /// Incoming consensus messages awaiting the ready/request workers.
    raft_requests: Mutex<HashMap<RangeId, Vec<RaftMessageRequest>>>,

    split_queue: Arc<SplitQueue>,
    merge_queue: Arc<MergeQueue>,

    db: OnceLock<Arc<DB>>,
    intent_resolver: OnceLock<Arc<IntentResolver>>,
}

impl Store {
    pub fn new(params: StoreParams) -> Arc<Self> {
        let StoreParams {
            ident,
            config,
            queue_config,
            closedts_config,
            clock,
            liveness,
            meta,
            system_config,
            dialer,
            stopper,
        } = params;
        let tag = format!("n{},s{}", ident.node_id, ident.store_id);
        Arc::new_cyclic(|me: &Weak<Store>| Store {
            closedts: Container::new(
                closedts_config,
                ident.node_id,
                clock.clone(),
                liveness.clone(),
                dialer.clone(),
                stopper.clone(),
            ),
            transport: RaftTransport::new(ident.node_id, dialer, stopper.clone()),
            ready_scheduler: RaftScheduler::new(
                SchedulerType::ReadyRequest,
                config.raft_ready_workers,
            ),
            tick_scheduler: RaftScheduler::new(SchedulerType::Tick, config.raft_tick_workers),
            split_queue: Arc::new(SplitQueue::new(queue_config.clone(), me.clone(), &tag)),
            merge_queue: Arc::new(MergeQueue::new(queue_config.clone(), me.clone(), &tag)),
            ident,
            tag,
            config,
            queue_config,
            me: me.clone(),
            engine: Engine::new(),
            clock,
            liveness,
            meta,
            system_config,
            stopper,
            replicas: Mutex::new(ReplicaMap::default()),
            raft_requests: Mutex::new(HashMap::new()),
            db: OnceLock::new(),
            intent_resolver: OnceLock::new(),
        })
    }

    #[inline]
    pub fn ident(&self) -> StoreIdent {
        self.ident
    }

    #[inline]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[inline]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[inline]
    pub fn weak(&self) -> Weak<Store> {
        self.me.clone()
    }

    #[inline]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    #[inline]
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    #[inline]
    pub fn liveness(&self) -> &Arc<NodeLiveness> {
        &self.liveness
    }

    #[inline]
    pub fn meta(&self) -> &Arc<MetaDirectory> {
        &self.meta
    }

    #[inline]
    pub fn system_config(&self) -> &Arc<SystemConfig> {
        &self.system_config
    }

    #[inline]
    pub fn closedts(&self) -> &Arc<Container> {
        &self.closedts
    }

    #[inline]
    pub fn transport(&self) -> &Arc<RaftTransport> {
        &self.transport
    }

    #[inline]
    pub fn ready_scheduler(&self) -> &Arc<RaftScheduler> {
        &self.ready_scheduler
    }

    #[inline]
    pub fn stopper(&self) -> &Stopper {
        &self.stopper
    }

    pub fn split_queue(&self) -> Result<Arc<SplitQueue>, KvError> {
        Ok(self.split_queue.clone())
    }

    pub fn merge_queue(&self) -> Arc<MergeQueue> {
        self.merge_queue.clone()
    }

    /// Client handle of the cluster; set when the store starts.
    pub fn db(&self) -> Result<Arc<DB>, KvError> {
        self.db
            .get()
            .cloned()
            .ok_or_else(|| KvError::unavailable(format!("{}: store not started", self.tag)))
    }

    pub fn intent_resolver(&self) -> Result<Arc<IntentResolver>, KvError> {
        self.intent_resolver
            .get()
            .cloned()
            .ok_or_else(|| KvError::unavailable(format!("{}: store not started", self.tag)))
    }

    /// Live replica of a range.
    pub fn get_replica(&self, range_id: RangeId) -> Option<Arc<Replica>> {
        self.replicas.locked().alive.get(&range_id).cloned()
    }

    /// Initialized live replica whose range holds `key`.
    pub fn replica_for_key(&self, key: &[u8]) -> Option<Arc<Replica>> {
        let replicas: Vec<Arc<Replica>> =
            self.replicas.locked().alive.values().cloned().collect();
        replicas
            .into_iter()
            .find(|r| r.desc().map_or(false, |d| d.contains_key(key)))
    }

    /// All live replicas.
    pub fn replicas(&self) -> Vec<Arc<Replica>> {
        self.replicas.locked().alive.values().cloned().collect()
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.locked().alive.len()
    }

    fn add_replica(&self, repl: Arc<Replica>) {
        if let Some(ir) = self.intent_resolver.get() {
            repl.concurrency.set_pusher(ir.clone());
        }
        self.replicas.locked().alive.insert(repl.range_id(), repl);
    }

    /// Writes the initial state of a range this store holds a replica of
    /// and loads the replica.
    pub fn bootstrap_range(&self, desc: &RangeDescriptor) -> Result<Arc<Replica>, KvError> {
        let rd = desc.replica_for_store(self.ident.store_id).ok_or_else(|| {
            KvError::msg(format!("{}: not a replica of {:?}", self.tag, desc))
        })?;
        StateLoader::set_descriptor(&self.engine, desc)?;
        self.write_initial_state(desc, &Lease::default())?;
        let repl = Replica::load(self, desc.range_id, rd.replica_id, Some(desc.clone()))?;
        self.add_replica(repl.clone());
        pf_info!(self.tag; "bootstrapped r{} [{:?}, {:?})", desc.range_id, desc.start_key, desc.end_key);
        Ok(repl)
    }

    /// State of a range created by bootstrap or split: log truncated at the
    /// initial index, nothing applied beyond it.
    fn write_initial_state(&self, desc: &RangeDescriptor, lease: &Lease) -> Result<(), KvError> {
        let loader = StateLoader::new(desc.range_id);
        if !lease.is_empty() {
            loader.set_lease(&self.engine, lease)?;
        }
        loader.set_applied_state(
            &self.engine,
            &RangeAppliedState {
                applied_index: INITIAL_LOG_INDEX,
                lease_applied_index: 0,
                stats: self.engine.compute_stats(&desc.start_key, &desc.end_key),
            },
        )?;
        loader.set_truncated_state(
            &self.engine,
            &TruncatedState {
                index: INITIAL_LOG_INDEX,
                term: INITIAL_LOG_TERM,
            },
        )?;
        loader.set_hard_state(&self.engine, &Replica::initial_hard_state())
    }

    /// Starts the store's background work.
    pub fn start(self: &Arc<Self>, db: Arc<DB>) -> Result<(), KvError> {
        let ir = IntentResolver::new(
            &self.tag,
            db.clone(),
            self.meta.clone(),
            self.config.intent_resolver_batcher.clone(),
            self.stopper.clone(),
        )?;
        if self.db.set(db).is_err() || self.intent_resolver.set(ir.clone()).is_err() {
            return logged_err!(self.tag; "store started twice");
        }
        for repl in self.replicas() {
            repl.concurrency.set_pusher(ir.clone());
        }

        let processor: Arc<dyn RaftProcessor> = self.clone();
        self.ready_scheduler.start(processor.clone(), &self.stopper)?;
        self.tick_scheduler.start(processor, &self.stopper)?;
        self.start_tick_loop()?;

        let store_id = self.ident.store_id;
        let weak = self.weak();
        self.closedts.start(Arc::new(move |range_ids: &[RangeId]| {
            let store = match weak.upgrade() {
                Some(store) => store,
                None => return,
            };
            for range_id in range_ids {
                if let Some(repl) = store.get_replica(*range_id) {
                    let lease = repl.lease();
                    if lease.owned_by(store_id) && lease.typ() == LeaseType::Epoch {
                        store
                            .closedts
                            .tracker
                            .emit_mlai(*range_id, repl.lease_applied_index());
                    }
                }
            }
        }))?;

        self.split_queue.start(&self.stopper)?;
        self.merge_queue.start(&self.stopper)?;
        self.start_scanner()?;
        pf_info!(self.tag; "store started with {} replica(s)", self.num_replicas());
        Ok(())
    }

    fn start_tick_loop(self: &Arc<Self>) -> Result<(), KvError> {
        let me = self.weak();
        let period = Duration::from_millis(self.config.raft_tick_ms);
        let mut rx_quiesce = self.stopper.subscribe();
        self.stopper.run_worker(&format!("{}-raft-ticker", self.tag), async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let store = match me.upgrade() {
                            Some(store) => store,
                            None => break,
                        };
                        let ids: Vec<RangeId> =
                            store.replicas.locked().alive.keys().copied().collect();
                        store.tick_scheduler.enqueue_raft_ticks(&ids);
                    },
                    _ = rx_quiesce.changed() => break,
                }
            }
        })
    }

    /// Periodically offers every replica to the queues.
    fn start_scanner(self: &Arc<Self>) -> Result<(), KvError> {
        if !self.queue_config.split_enabled && !self.queue_config.merge_enabled {
            return Ok(());
        }
        let me = self.weak();
        let period = Duration::from_millis(self.queue_config.scan_interval_ms);
        let mut rx_quiesce = self.stopper.subscribe();
        self.stopper.run_worker(&format!("{}-scanner", self.tag), async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let store = match me.upgrade() {
                            Some(store) => store,
                            None => break,
                        };
                        let now = store.clock.now();
                        for repl in store.replicas() {
                            if !repl.is_initialized() {
                                continue;
                            }
                            store.split_queue.maybe_add(&repl, now);
                            store.merge_queue.maybe_add(&repl, now);
                        }
                    },
                    _ = rx_quiesce.changed() => break,
                }
            }
        })
    }

    /// Queues the replica for a load-based split.
    pub(super) fn maybe_add_to_split_queue(&self, repl: &Replica) {
        self.split_queue.maybe_add(repl, self.clock.now());
    }

    /// Hands a consensus message to its replica, creating an uninitialized
    /// replica on first contact.
    pub fn handle_raft_message(&self, req: RaftMessageRequest) -> Result<(), KvError> {
        if req.to.store_id != self.ident.store_id {
            return logged_err!(self.tag; "message for s{} delivered here", req.to.store_id);
        }
        let existing = {
            let replicas = self.replicas.locked();
            if replicas.tombstones.contains_key(&req.range_id) {
                return Ok(());
            }
            if let Some(removed) = replicas.removed.get(&req.range_id) {
                if req.to.replica_id <= *removed {
                    return Ok(());
                }
            }
            replicas.alive.get(&req.range_id).cloned()
        };
        let stale = match &existing {
            Some(repl) => repl.replica_id() < req.to.replica_id,
            None => true,
        };
        if stale {
            if let Some(old) = existing {
                // this store was re-added under a new replica id
                pf_warn!(self.tag; "r{} replica {} replaced by {}",
                                   req.range_id, old.replica_id(), req.to.replica_id);
                old.mark_destroyed(DestroyStatus::Removed);
            }
            let repl = Replica::load(self, req.range_id, req.to.replica_id, None)?;
            pf_debug!(self.tag; "created uninitialized replica r{}/{}",
                                req.range_id, req.to.replica_id);
            self.add_replica(repl);
        }
        let range_id = req.range_id;
        self.raft_requests
            .locked()
            .entry(range_id)
            .or_default()
            .push(req);
        self.ready_scheduler.enqueue_raft_request(range_id);
        Ok(())
    }

    /// Performs follow-up work of commands applied by `repl`.
    pub(super) fn handle_store_actions(&self, repl: &Replica, actions: Vec<StoreAction>) {
        for action in actions {
            self.apply_store_action(repl, action);
        }
    }

    pub(super) fn apply_store_action(&self, repl: &Replica, action: StoreAction) {
        match action {
            StoreAction::Split { right, lease } => {
                if let Err(e) = self.split_post_apply(&right, &lease) {
                    pf_error!(self.tag; "error creating r{} after split: {}", right.range_id, e);
                }
            }
            StoreAction::MergedAway { right_id } => {
                let rhs = {
                    let mut replicas = self.replicas.locked();
                    let rhs = replicas.alive.remove(&right_id);
                    if let Some(rhs) = &rhs {
                        replicas.tombstones.insert(right_id, rhs.clone());
                    }
                    rhs
                };
                if let Some(rhs) = rhs {
                    rhs.mark_destroyed(DestroyStatus::Merged);
                }
                pf_info!(self.tag; "r{} merged into r{}", right_id, repl.range_id());
            }
            StoreAction::Removed => {
                let desc = repl.desc().ok();
                let replica_id = repl.replica_id();
                {
                    let mut replicas = self.replicas.locked();
                    let current = replicas
                        .alive
                        .get(&repl.range_id())
                        .map_or(false, |cur| std::ptr::eq(Arc::as_ptr(cur), repl));
                    if current {
                        replicas.alive.remove(&repl.range_id());
                    }
                    replicas.removed.insert(repl.range_id(), replica_id);
                }
                repl.mark_destroyed(DestroyStatus::Removed);
                if let Some(desc) = desc {
                    self.engine.ingest(&desc.start_key, &desc.end_key, Vec::new());
                    self.engine.clear_local_range(
                        &transaction_key_bound(&desc.start_key),
                        &transaction_key_bound(&desc.end_key),
                    );
                }
                pf_info!(self.tag; "replica of r{} removed", repl.range_id());
            }
        }
    }

    /// Creates the right-hand replica of an applied split. Its descriptor
    /// was written by the split batch.
    fn split_post_apply(&self, right: &RangeDescriptor, lease: &Lease) -> Result<(), KvError> {
        let rd = match right.replica_for_store(self.ident.store_id) {
            Some(rd) => rd,
            None => return Ok(()),
        };
        let old = self.get_replica(right.range_id);
        if let Some(old) = old {
            if old.is_initialized() {
                // already caught up through a snapshot
                return Ok(());
            }
            self.replicas.locked().alive.remove(&right.range_id);
            old.mark_destroyed(DestroyStatus::Removed);
        }
        self.write_initial_state(right, lease)?;
        let repl = Replica::load(self, right.range_id, rd.replica_id, Some(right.clone()))?;
        self.add_replica(repl);
        pf_debug!(self.tag; "created r{} by split", right.range_id);
        Ok(())
    }

    fn take_raft_requests(&self, range_id: RangeId) -> Vec<RaftMessageRequest> {
        self.raft_requests
            .locked()
            .remove(&range_id)
            .unwrap_or_default()
    }

    /// Serves a batch addressed to a range on this store.
    pub async fn send(&self, ctx: &Ctx, ba: BatchRequest) -> Result<BatchResponse, KvError> {
        if ba.is_empty() {
            return logged_err!(self.tag; "empty batch");
        }
        let range_id = ba.header.range_id;
        let repl = if range_id != 0 {
            let replicas = self.replicas.locked();
            match replicas.alive.get(&range_id) {
                Some(repl) => Some(repl.clone()),
                None if ba.is_single(Method::Subsume) => {
                    replicas.tombstones.get(&range_id).cloned()
                }
                None => None,
            }
        } else {
            self.replica_for_key(&ba.requests[0].header.key)
        };
        let repl = repl.ok_or_else(|| {
            KvError::new(ErrorDetail::RangeNotFound {
                range_id,
                store_id: self.ident.store_id,
            })
        })?;
        let mut br = repl.send(ctx, ba).await?;
        br.header.now.forward(self.clock.now());
        Ok(br)
    }
}

impl RaftProcessor for Store {
    fn process_ready(&self, range_id: RangeId) {
        if let Some(repl) = self.get_replica(range_id) {
            let actions = repl.handle_raft_ready();
            if !actions.is_empty() {
                self.handle_store_actions(&repl, actions);
            }
        }
    }

    fn process_request_queue(&self, range_id: RangeId) -> bool {
        let reqs = self.take_raft_requests(range_id);
        let repl = match self.get_replica(range_id) {
            Some(repl) => repl,
            None => return false,
        };
        let mut stepped = false;
        for req in reqs {
            match repl.step_raft_message(req) {
                Ok(()) => stepped = true,
                Err(e) => pf_trace!(self.tag; "r{} dropped message: {}", range_id, e),
            }
        }
        stepped
    }

    fn process_tick(&self, range_id: RangeId) -> bool {
        self.get_replica(range_id).map_or(false, |r| r.tick())
    }
}

#[async_trait]
impl NodeService for Store {
    fn node_id(&self) -> NodeId {
        self.ident.node_id
    }

    async fn batch(&self, ctx: &Ctx, ba: BatchRequest) -> Result<BatchResponse, KvError> {
        self.send(ctx, ba).await
    }

    fn closed_ts_stream(&self) -> Result<DuplexStream, KvError> {
        self.closedts.open_stream()
    }

    fn raft_message(&self, req: RaftMessageRequest) -> Result<(), KvError> {
        self.handle_raft_message(req)
    }
}

#[cfg(test)]
pub(crate) mod store_tests {
    use super::*;
    use crate::kv::{DistSender, TxnConfig, TxnCoordSenderFactory};
    use crate::kvpb::keys::{key_max, key_min, SYSTEM_MAX};
    use crate::kvpb::{ReplicaDescriptor, Request, Response};
    use crate::rpc::{AddressResolver, BreakerConfig, LocalNetwork};
    use crate::storage::{LivenessConfig, ZoneConfig};
    use bytes::Bytes;

    fn bootstrap_desc(range_id: RangeId, start: Bytes, end: Bytes) -> RangeDescriptor {
        RangeDescriptor {
            range_id,
            start_key: start,
            end_key: end,
            replicas: vec![ReplicaDescriptor {
                node_id: 1,
                store_id: 1,
                replica_id: 1,
            }],
            next_replica_id: 2,
            generation: 0,
        }
    }

    /// One node with one store holding a system range and a user range;
    /// queues disabled.
    pub(crate) async fn single_store() -> Result<(Arc<Store>, Stopper), KvError> {
        let stopper = Stopper::new();
        let clock = Arc::new(Clock::system(Duration::from_millis(500)));
        let liveness = NodeLiveness::new(LivenessConfig::default());
        let meta = Arc::new(MetaDirectory::new());
        let descs = vec![
            bootstrap_desc(1, key_min(), Bytes::from_static(SYSTEM_MAX)),
            bootstrap_desc(2, Bytes::from_static(SYSTEM_MAX), key_max()),
        ];
        meta.bootstrap(descs.clone())?;

        let network = LocalNetwork::new();
        let resolver: AddressResolver = Arc::new(|node_id| Ok(format!("local:{}", node_id)));
        let dialer = Arc::new(NodeDialer::new(resolver, network.clone(), BreakerConfig::default()));
        let store = Store::new(StoreParams {
            ident: StoreIdent {
                node_id: 1,
                store_id: 1,
            },
            config: StoreConfig::default(),
            queue_config: QueueConfig {
                split_enabled: false,
                merge_enabled: false,
                ..Default::default()
            },
            closedts_config: ClosedTsConfig::default(),
            clock: clock.clone(),
            liveness: liveness.clone(),
            meta: meta.clone(),
            system_config: Arc::new(SystemConfig::new(ZoneConfig::default())),
            dialer: dialer.clone(),
            stopper: stopper.clone(),
        });
        network.register("local:1", store.clone());
        dialer.set_local("local:1", store.clone());
        for desc in &descs {
            store.bootstrap_range(desc)?;
        }
        liveness.start_heartbeat(1, clock.clone(), &stopper)?;

        let dist_sender = DistSender::new(1, clock.clone(), meta, dialer);
        let factory =
            TxnCoordSenderFactory::new(TxnConfig::default(), clock, dist_sender, stopper.clone());
        store.start(DB::new(factory))?;
        Ok((store, stopper))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn routes_by_key_and_range_id() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let ctx = Ctx::background();
        store.send(&ctx, BatchRequest::single(Request::put("k", "v"))).await?;

        let mut ba = BatchRequest::single(Request::get("k"));
        ba.header.range_id = 2;
        let br = store.send(&ctx, ba).await?;
        assert_eq!(br.responses[0], Response::Get { value: Some(Bytes::from("v")) });

        let mut ba = BatchRequest::single(Request::get("k"));
        ba.header.range_id = 42;
        let err = store.send(&ctx, ba).await.expect_err("no such range");
        assert!(matches!(err.detail, ErrorDetail::RangeNotFound { range_id: 42, .. }));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn empty_batch_rejected() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        assert!(store.send(&Ctx::background(), BatchRequest::default()).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn split_creates_right_hand_replica() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let ctx = Ctx::background();
        store.send(&ctx, BatchRequest::single(Request::put("a", "1"))).await?;
        store.send(&ctx, BatchRequest::single(Request::put("m", "2"))).await?;
        let left = store.replica_for_key(b"a").expect("user range");
        left.admin_split(&ctx, Bytes::from("h"), "test", false).await?;

        assert_eq!(store.num_replicas(), 3);
        let right = store.replica_for_key(b"m").expect("right-hand range");
        assert_ne!(right.range_id(), left.range_id());
        assert_eq!(right.desc()?.start_key, Bytes::from("h"));
        assert_eq!(store.meta().num_ranges(), 3);

        let br = store.send(&ctx, BatchRequest::single(Request::get("m"))).await?;
        assert_eq!(br.responses[0], Response::Get { value: Some(Bytes::from("2")) });
        Ok(())
    }

    #[test]
    fn config_from_toml() -> Result<(), KvError> {
        let config = parsed_config!(Some("raft_tick_ms = 20\nbackpressure_multiplier = 0.0")
                                    => StoreConfig;
                                    raft_tick_ms, backpressure_multiplier)?;
        assert_eq!(config.raft_tick_ms, 20);
        assert_eq!(config.backpressure_multiplier, 0.0);
        assert_eq!(config.push_delay_ms, 50);
        Ok(())
    }
}
