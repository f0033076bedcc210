//! One replica of a range: its in-memory state, the request send path and
//! the application of committed commands.
//!
//! Two mutexes guard the state; `raft_mu` (consensus group and in-flight
//! proposals) is always taken before `mu` (descriptor, lease, applied
//! state). Neither is held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::closedts::{Container, FollowerReadCheck};
use crate::concurrency::{
    ConcurrencyManager, ConcurrencyRequest, Guard, LockWaitConfig,
};
use crate::hlc::{Clock, Timestamp};
use crate::kvpb::keys::transaction_key_bound;
use crate::kvpb::{
    BatchRequest, BatchResponse, Key, Lease, LeaseType, Method, MvccStats,
    RangeDescriptor, RangeId, RangeInfo, ReadConsistency, ReplicaDescriptor,
    ReplicaId, Response,
};
use crate::quotapool::QuotaPool;
use crate::storage::batcheval::{collect_spans, evaluate_batch, EvalContext, LocalResult};
use crate::storage::engine::{Engine, EvalBatch, KeyHistory, Reader, WriteBatch};
use crate::storage::liveness::NodeLiveness;
use crate::storage::meta::MetaDirectory;
use crate::storage::raft::{HardState, MessageBody, RaftGroup, Snapshot};
use crate::storage::raft_transport::{RaftMessageRequest, RaftTransport};
use crate::storage::replica_proposal::{
    ProposalData, ProposalResult, RaftCommand, ReplicatedResult,
};
use crate::storage::scheduler::RaftScheduler;
use crate::storage::split_decider::SplitDecider;
use crate::storage::stateloader::{
    decode, encode, RangeAppliedState, StateLoader, TruncatedState,
};
use crate::storage::store::{Store, StoreConfig, StoreIdent};
use crate::storage::tscache::TimestampCache;
use crate::storage::zone::SystemConfig;
use crate::utils::{Ctx, ErrorDetail, KvError, LogEvery, MutexExt, Stopper};

use futures::future::{BoxFuture, Shared};

use get_size::GetSize;

use serde::{Deserialize, Serialize};

use tokio::sync::{oneshot, watch};
use tokio::time::{Duration, Instant};

/// Why a replica stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyStatus {
    Alive,

    /// Subsumed by its left-hand neighbor; still answers `Subsume`.
    Merged,

    /// Removed from the range by a replica change.
    Removed,
}

/// State guarded by `Replica::mu`.
pub(super) struct ReplicaState {
    /// `None` until the replica received its initial state.
    pub desc: Option<RangeDescriptor>,
    pub replica_id: ReplicaId,

    pub lease: Lease,
    pub applied_index: u64,
    pub lease_applied_index: u64,
    pub stats: MvccStats,
    pub truncated: TruncatedState,

    /// Highest lease applied index handed to a proposal.
    pub max_proposed_lai: u64,

    pub destroy_status: DestroyStatus,

    /// Freeze start while subsumed by an in-flight merge.
    pub merge_freeze: Option<Timestamp>,

    /// Set while this replica transfers its lease away.
    pub transferring_lease: bool,

    /// Peers learned from incoming messages; used before the descriptor is
    /// known.
    pub peers: HashMap<ReplicaId, ReplicaDescriptor>,
}

/// State guarded by `Replica::raft_mu`.
pub(super) struct RaftState {
    pub group: RaftGroup,
    pub proposals: HashMap<u64, ProposalData>,
    pub next_proposal_id: u64,
    pub was_leader: bool,
}

/// Work the store performs after a replica applied a command.
#[derive(Debug)]
pub(super) enum StoreAction {
    /// A split applied; the store creates the right-hand replica.
    Split {
        right: RangeDescriptor,
        lease: Lease,
    },

    /// The right-hand neighbor was merged into this replica.
    MergedAway { right_id: RangeId },

    /// This replica was removed from its range.
    Removed,
}

/// Leader-generated image of a replica's state.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotData {
    desc: RangeDescriptor,
    lease: Lease,
    applied: RangeAppliedState,
    rows: Vec<(Key, KeyHistory)>,
    txn_records: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Fixed per-command charge against the proposal quota.
const PROPOSAL_OVERHEAD: usize = 64;

pub(super) type LeaseFuture = Shared<BoxFuture<'static, Result<Lease, KvError>>>;

pub struct Replica {
    pub(super) range_id: RangeId,
    pub(super) ident: StoreIdent,
    pub(super) tag: String,
    pub(super) config: StoreConfig,

    pub(super) store: Weak<Store>,
    pub(super) engine: Arc<Engine>,
    pub(super) clock: Arc<Clock>,
    pub(super) liveness: Arc<NodeLiveness>,
    pub(super) meta: Arc<MetaDirectory>,
    pub(super) system_config: Arc<SystemConfig>,
    pub(super) closedts: Arc<Container>,
    pub(super) transport: Arc<RaftTransport>,
    pub(super) ready_scheduler: Arc<RaftScheduler>,
    pub(super) stopper: Stopper,
    pub(super) loader: StateLoader,

    /// `None` once the replica is destroyed.
    pub(super) raft_mu: Mutex<Option<RaftState>>,
    pub(super) mu: Mutex<ReplicaState>,

    pub(super) concurrency: ConcurrencyManager,
    pub(super) tscache: TimestampCache,
    pub(super) split_decider: SplitDecider,

    /// Proposal quota; only present on the raft leader.
    pub(super) quota: Mutex<Option<Arc<QuotaPool>>>,

    /// In-flight lease request every caller joins.
    pub(super) pending_lease: Mutex<Option<LeaseFuture>>,

    /// True while frozen by a merge.
    pub(super) merge_tx: watch::Sender<bool>,

    pub(super) log_every: LogEvery,
}

impl Replica {
    /// Creates a replica from the state persisted in the engine; an
    /// uninitialized replica (no descriptor) waits for a snapshot.
    pub(super) fn load(
        store: &Store,
        range_id: RangeId,
        replica_id: ReplicaId,
        desc: Option<RangeDescriptor>,
    ) -> Result<Arc<Self>, KvError> {
        let engine = store.engine().clone();
        let loader = StateLoader::new(range_id);
        let lease = loader.load_lease(&*engine)?;
        let applied = loader.load_applied_state(&*engine)?;
        let truncated = loader.load_truncated_state(&*engine)?;
        let hard_state = loader.load_hard_state(&*engine)?;
        let entries = loader.load_entries(&*engine, truncated.index + 1, u64::MAX)?;
        let peers: Vec<ReplicaId> = desc
            .as_ref()
            .map(|d| d.replicas.iter().map(|r| r.replica_id).collect())
            .unwrap_or_default();
        let config = store.config().clone();
        let group = RaftGroup::new(
            replica_id,
            peers,
            config.raft_heartbeat_ticks,
            hard_state,
            truncated.index,
            truncated.term,
            entries,
        );

        let ident = store.ident();
        let tag = format!("n{},s{},r{}/{}", ident.node_id, ident.store_id, range_id, replica_id);
        let (merge_tx, _) = watch::channel(false);
        let now = store.clock().now();
        let replica = Arc::new(Replica {
            range_id,
            ident,
            tag: tag.clone(),
            concurrency: ConcurrencyManager::new(
                range_id,
                LockWaitConfig {
                    push_delay_ms: config.push_delay_ms,
                },
            ),
            config,
            store: store.weak(),
            engine,
            clock: store.clock().clone(),
            liveness: store.liveness().clone(),
            meta: store.meta().clone(),
            system_config: store.system_config().clone(),
            closedts: store.closedts().clone(),
            transport: store.transport().clone(),
            ready_scheduler: store.ready_scheduler().clone(),
            stopper: store.stopper().clone(),
            loader,
            raft_mu: Mutex::new(Some(RaftState {
                group,
                proposals: HashMap::new(),
                next_proposal_id: 1,
                was_leader: false,
            })),
            mu: Mutex::new(ReplicaState {
                desc,
                replica_id,
                lease,
                applied_index: applied.applied_index.max(truncated.index),
                lease_applied_index: applied.lease_applied_index,
                stats: applied.stats,
                truncated,
                max_proposed_lai: applied.lease_applied_index,
                destroy_status: DestroyStatus::Alive,
                merge_freeze: None,
                transferring_lease: false,
                peers: HashMap::new(),
            }),
            tscache: TimestampCache::new(now),
            split_decider: SplitDecider::new(),
            quota: Mutex::new(None),
            pending_lease: Mutex::new(None),
            merge_tx,
            log_every: LogEvery::new(Duration::from_secs(1)),
        });
        pf_debug!(tag; "loaded replica {:?}", replica.desc());
        Ok(replica)
    }

    #[inline]
    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    #[inline]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Current descriptor; fails for uninitialized or destroyed replicas.
    pub fn desc(&self) -> Result<RangeDescriptor, KvError> {
        let mu = self.mu.locked();
        self.check_alive(&mu)?;
        mu.desc.clone().ok_or_else(|| self.range_not_found())
    }

    pub fn is_initialized(&self) -> bool {
        self.mu.locked().desc.is_some()
    }

    pub fn destroy_status(&self) -> DestroyStatus {
        self.mu.locked().destroy_status
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.mu.locked().replica_id
    }

    pub fn replica_descriptor(&self) -> ReplicaDescriptor {
        ReplicaDescriptor {
            node_id: self.ident.node_id,
            store_id: self.ident.store_id,
            replica_id: self.replica_id(),
        }
    }

    pub fn lease(&self) -> Lease {
        self.mu.locked().lease.clone()
    }

    pub fn stats(&self) -> MvccStats {
        self.mu.locked().stats
    }

    pub fn applied_index(&self) -> u64 {
        self.mu.locked().applied_index
    }

    pub fn lease_applied_index(&self) -> u64 {
        self.mu.locked().lease_applied_index
    }

    /// Requests per second over the last full measurement window.
    pub fn qps(&self) -> f64 {
        self.split_decider.last_qps(Instant::now())
    }

    pub fn is_raft_leader(&self) -> bool {
        self.raft_mu
            .locked()
            .as_ref()
            .map_or(false, |r| r.group.is_leader())
    }

    /// True if this replica holds a currently valid lease.
    pub fn owns_valid_lease(&self, now: Timestamp) -> bool {
        let lease = self.lease();
        lease.owned_by(self.ident.store_id) && self.lease_valid(&lease, now)
    }

    pub fn is_frozen(&self) -> bool {
        *self.merge_tx.borrow()
    }

    pub(super) fn store(&self) -> Result<Arc<Store>, KvError> {
        self.store
            .upgrade()
            .ok_or_else(|| KvError::unavailable(format!("{}: store is shut down", self.tag)))
    }

    pub(super) fn range_not_found(&self) -> KvError {
        KvError::new(ErrorDetail::RangeNotFound {
            range_id: self.range_id,
            store_id: self.ident.store_id,
        })
    }

    fn check_alive(&self, mu: &ReplicaState) -> Result<(), KvError> {
        match mu.destroy_status {
            DestroyStatus::Alive => Ok(()),
            _ => Err(self.range_not_found()),
        }
    }

    pub(super) fn not_lease_holder(&self, lease: Option<Lease>) -> KvError {
        KvError::new(ErrorDetail::NotLeaseHolder {
            range_id: self.range_id,
            replica: Some(self.replica_descriptor()),
            lease_holder: lease.as_ref().filter(|l| !l.is_empty()).map(|l| l.replica),
            lease,
        })
    }

    /// Serves a batch addressed to this replica.
    pub async fn send(self: &Arc<Self>, ctx: &Ctx, mut ba: BatchRequest) -> Result<BatchResponse, KvError> {
        if ba.is_empty() {
            return logged_err!(self.tag; "empty batch");
        }
        if !ba.header.timestamp.is_empty() {
            self.clock.update(ba.header.timestamp)?;
        }
        if let Some(txn) = &ba.header.txn {
            self.clock.update(txn.write_timestamp())?;
        }

        if let Some(br) = self.maybe_serve_from_tombstone(&ba) {
            return br;
        }
        let desc = self.desc()?;
        self.check_bounds(&desc, &ba)?;
        if let Some(span) = ba.rspan() {
            let zone = self.system_config.zone_for_key(&desc.start_key);
            if self.split_decider.record(Instant::now(), &span, zone.qps_split_threshold) {
                if let Ok(store) = self.store() {
                    store.maybe_add_to_split_queue(self);
                }
            }
        }

        if ba.is_admin() {
            return self.execute_admin(ctx, ba).await;
        }
        if ba.is_single(Method::Subsume) {
            return self.execute_subsume(ctx, ba).await;
        }

        if ba.header.txn.is_none() && ba.header.timestamp.is_empty() {
            ba.header.timestamp = self.clock.now();
        }
        if ba.header.replication_table && ba.header.txn.is_none() && ba.is_read_only() {
            let offset = self.config.replication_table_offset_ms as i64 * 1_000_000;
            ba.header.timestamp = ba.header.timestamp.add(-offset, 0);
        }
        if let Some(txn) = ba.header.txn.as_mut() {
            // a value written after our first observation of this node's
            // clock cannot be in the causal past of the transaction
            if let Some(observed) = txn.observed_timestamp(self.ident.node_id) {
                let mut limit = observed;
                limit.forward(txn.read_timestamp);
                if limit < txn.max_timestamp {
                    txn.max_timestamp = limit;
                }
            }
        }

        loop {
            self.wait_for_merge(ctx).await?;
            let res = if ba.is_read_only() {
                self.execute_read_only(ctx, &ba).await
            } else {
                self.execute_write(ctx, ba.clone()).await
            };
            match res {
                Err(KvError {
                    detail: ErrorDetail::MergeInProgress,
                    ..
                }) => continue,
                res => return res,
            }
        }
    }

    fn check_bounds(&self, desc: &RangeDescriptor, ba: &BatchRequest) -> Result<(), KvError> {
        for req in &ba.requests {
            let span = req.span();
            let ok = if req.method() == Method::Subsume || req.method().is_admin() {
                desc.contains_key(&span.key)
            } else {
                desc.contains_key_range(&span.key, &span.end_key)
            };
            if !ok {
                return Err(KvError::new(ErrorDetail::RangeKeyMismatch {
                    key: span.key.clone(),
                    end_key: span.end_key.clone(),
                    mismatched: Some(desc.clone()),
                }));
            }
        }
        Ok(())
    }

    /// A merged-away replica still answers `Subsume` from its last state.
    fn maybe_serve_from_tombstone(&self, ba: &BatchRequest) -> Option<Result<BatchResponse, KvError>> {
        let mu = self.mu.locked();
        if mu.destroy_status != DestroyStatus::Merged
            || !ba.requests.iter().all(|r| r.method().skips_lease_check())
        {
            return None;
        }
        let desc = mu.desc.clone()?;
        Some(Ok(BatchResponse {
            header: crate::kvpb::BatchResponseHeader {
                now: self.clock.now(),
                ..Default::default()
            },
            responses: vec![Response::Subsume {
                desc,
                stats: mu.stats,
                lease_applied_index: mu.lease_applied_index,
                applied_index: mu.applied_index,
                freeze_start: mu.merge_freeze.unwrap_or_default(),
            }],
        }))
    }

    /// Blocks while a merge has frozen the range.
    pub(super) async fn wait_for_merge(&self, ctx: &Ctx) -> Result<(), KvError> {
        let mut rx = self.merge_tx.subscribe();
        ctx.run(async {
            while *rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            Ok(())
        })
        .await?;
        self.check_alive(&self.mu.locked())
    }

    fn concurrency_request(&self, desc: &RangeDescriptor, ba: &BatchRequest) -> ConcurrencyRequest {
        let (latch_spans, lock_spans) = collect_spans(desc, ba);
        ConcurrencyRequest {
            txn: ba.header.txn.clone(),
            timestamp: if ba.is_read_only() {
                ba.read_timestamp()
            } else {
                ba.write_timestamp()
            },
            wait_policy: ba.header.wait_policy,
            latch_spans,
            lock_spans,
        }
    }

    pub(super) fn eval_context(&self) -> Result<EvalContext, KvError> {
        let mu = self.mu.locked();
        self.check_alive(&mu)?;
        Ok(EvalContext {
            desc: mu.desc.clone().ok_or_else(|| self.range_not_found())?,
            lease: mu.lease.clone(),
            now: self.clock.now(),
            txn_liveness_threshold_nanos: self.config.txn_liveness_threshold_ms as i64 * 1_000_000,
            stats: mu.stats,
            qps: self.split_decider.last_qps(Instant::now()),
        })
    }

    /// Checks whether a follower read of `ba` under `lease` is allowed.
    pub(super) fn can_serve_follower_read(&self, ba: &BatchRequest, lease: &Lease) -> bool {
        if lease.is_empty()
            || lease.typ() != LeaseType::Epoch
            || !ba.is_read_only()
            || ba.header.read_consistency != ReadConsistency::Consistent
        {
            return false;
        }
        let (lai, system) = {
            let mu = self.mu.locked();
            (
                mu.lease_applied_index,
                mu.desc.as_ref().map_or(true, |d| d.is_system()),
            )
        };
        if system {
            return false;
        }
        let mut ts = ba.read_timestamp();
        if let Some(txn) = &ba.header.txn {
            ts.forward(txn.max_timestamp);
        }
        let check = self.closedts.check_follower_read(
            lease.replica.node_id,
            lease.epoch,
            self.range_id,
            ts,
            lai,
        );
        if check == FollowerReadCheck::CanServe {
            pf_trace!(self.tag; "serving follower read at {}", ts);
            return true;
        }
        false
    }

    async fn execute_read_only(self: &Arc<Self>, ctx: &Ctx, ba: &BatchRequest) -> Result<BatchResponse, KvError> {
        let consistent = ba.header.read_consistency == ReadConsistency::Consistent;
        if consistent {
            let lease = self.lease();
            let now = self.clock.now();
            let held = lease.owned_by(self.ident.store_id) && self.lease_valid(&lease, now);
            if !held && !self.can_serve_follower_read(ba, &lease) {
                if let Err(e) = self.redirect_or_acquire_lease(ctx).await {
                    // the lease may be elsewhere while the read is closed
                    if !self.can_serve_follower_read(ba, &self.lease()) {
                        return Err(e);
                    }
                }
            }
        } else {
            return self.evaluate_read(ba);
        }

        let desc = self.desc()?;
        let mut req = self.concurrency_request(&desc, ba);
        loop {
            let guard = self.concurrency.sequence_req(ctx, None, req).await?;
            if self.is_frozen() {
                return Err(KvError::new(ErrorDetail::MergeInProgress));
            }
            match self.evaluate_read(ba) {
                Ok(br) => {
                    self.update_ts_cache(ba, ba.read_timestamp());
                    self.concurrency.finish_req(guard);
                    return Ok(br);
                }
                Err(KvError {
                    detail: ErrorDetail::WriteIntent { intents },
                    ..
                }) => {
                    req = self.concurrency.handle_writer_intent_error(guard, &intents);
                }
                Err(e) => {
                    self.concurrency.finish_req(guard);
                    return Err(e);
                }
            }
        }
    }

    fn evaluate_read(&self, ba: &BatchRequest) -> Result<BatchResponse, KvError> {
        let ec = self.eval_context()?;
        let mut batch = EvalBatch::new(&self.engine);
        let (mut br, _) = evaluate_batch(&ec, &mut batch, ba)?;
        self.fill_response_header(ba, &ec, &mut br);
        Ok(br)
    }

    fn fill_response_header(&self, ba: &BatchRequest, ec: &EvalContext, br: &mut BatchResponse) {
        br.header.now = self.clock.now();
        if ba.header.return_range_info {
            br.header.range_infos = vec![RangeInfo {
                desc: ec.desc.clone(),
                lease: ec.lease.clone(),
            }];
        }
    }

    /// Records the reads of a batch so later writes land above them.
    fn update_ts_cache(&self, ba: &BatchRequest, ts: Timestamp) {
        let txn_id = ba.header.txn.as_ref().map(|t| t.id());
        for req in &ba.requests {
            if req.method().updates_ts_cache() {
                self.tscache.add(&req.span(), ts, txn_id);
            }
        }
    }

    /// Forwards the write timestamp of a batch above conflicting reads and
    /// above the closed timestamp.
    fn apply_ts_cache(&self, ba: &mut BatchRequest, min_prop: Timestamp) {
        let txn_id = ba.header.txn.as_ref().map(|t| t.id());
        let mut bump = min_prop;
        for req in &ba.requests {
            let m = req.method();
            if !(m.is_txn_write() || m == Method::EndTxn) {
                continue;
            }
            if m.is_txn_write() {
                let (ts, owner) = self.tscache.get_max(&req.span());
                if owner.is_none() || owner != txn_id {
                    bump.forward(ts.next());
                }
            }
        }
        match ba.header.txn.as_mut() {
            Some(txn) => {
                if txn.meta.write_timestamp < bump {
                    pf_trace!(self.tag; "txn {} pushed to {} by reads or closed ts",
                                        txn.short_id(), bump);
                    txn.meta.write_timestamp = bump;
                }
            }
            None => {
                ba.header.timestamp.forward(bump);
            }
        }
    }

    /// Whether this range publishes closed timestamps.
    fn tracks_closed_ts(&self) -> bool {
        let mu = self.mu.locked();
        mu.lease.typ() == LeaseType::Epoch && mu.desc.as_ref().map_or(false, |d| !d.is_system())
    }

    async fn execute_write(self: &Arc<Self>, ctx: &Ctx, mut ba: BatchRequest) -> Result<BatchResponse, KvError> {
        self.redirect_or_acquire_lease(ctx).await?;
        self.maybe_backpressure_batch(ctx, &ba).await?;

        // the range may have split while held back
        let desc = self.desc()?;
        self.check_bounds(&desc, &ba)?;
        let req = self.concurrency_request(&desc, &ba);
        let mut guard = self.concurrency.sequence_req(ctx, None, req).await?;
        loop {
            if self.is_frozen() {
                return Err(KvError::new(ErrorDetail::MergeInProgress));
            }
            self.redirect_or_acquire_lease(ctx).await?;

            let tracked = if self.tracks_closed_ts() {
                let (min_prop, tracked) = self.closedts.tracker.track();
                self.apply_ts_cache(&mut ba, min_prop);
                Some(tracked)
            } else {
                self.apply_ts_cache(&mut ba, Timestamp::default());
                None
            };

            let ec = self.eval_context()?;
            let mut batch = EvalBatch::new(&self.engine);
            let (mut br, local) = match evaluate_batch(&ec, &mut batch, &ba) {
                Ok(res) => res,
                Err(KvError {
                    detail: ErrorDetail::WriteIntent { intents },
                    ..
                }) => {
                    drop(tracked);
                    let req = self.concurrency.handle_writer_intent_error(guard, &intents);
                    guard = self.concurrency.sequence_req(ctx, None, req).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.fill_response_header(&ba, &ec, &mut br);
            let write_batch = batch.into_write_batch();
            if write_batch.is_empty() {
                drop(tracked);
                self.handle_local_result(local);
                self.concurrency.finish_req(guard);
                return Ok(br);
            }

            self.ensure_leadership(ctx).await?;
            let (rx, lai) = self
                .propose(ctx, ReplicatedResult::None, write_batch, ba.write_timestamp(), br, local)
                .await?;
            if let Some(tracked) = tracked {
                tracked.release(self.range_id, lai);
            }
            let (res, returned) = self.wait_for_proposal(ctx, rx, Some(guard)).await;
            let res = res?;
            guard = match returned {
                Some(g) => g,
                None => return Err(self.range_not_found()),
            };
            match res.reply {
                Err(KvError {
                    detail: ErrorDetail::ProposalIllegalLeaseIndex,
                    ..
                }) => {
                    pf_debug!(self.tag; "re-evaluating {} after illegal lease index", ba);
                    continue;
                }
                Err(e) => return Err(e),
                Ok(br) => {
                    self.update_ts_cache(&ba, ba.write_timestamp());
                    self.handle_local_result(res.local);
                    self.concurrency.finish_req(guard);
                    return Ok(br);
                }
            }
        }
    }

    /// Applies the side effects of a command on its proposer.
    fn handle_local_result(&self, local: LocalResult) {
        for (key, txn) in &local.acquired_locks {
            self.concurrency.on_lock_acquired(key.clone(), txn);
        }
        for update in &local.resolved_locks {
            self.concurrency.on_lock_updated(update);
        }
        if !local.external_locks.is_empty() {
            match self.store().and_then(|s| s.intent_resolver()) {
                Ok(ir) => ir.resolve_intents_async(local.external_locks),
                Err(e) => pf_warn!(self.tag; "cannot resolve external intents: {}", e),
            }
        }
    }

    /// Proposes a command; returns the completion receiver and the lease
    /// applied index the command was assigned.
    pub(super) async fn propose(
        self: &Arc<Self>,
        ctx: &Ctx,
        replicated: ReplicatedResult,
        write_batch: WriteBatch,
        timestamp: Timestamp,
        response: BatchResponse,
        local: LocalResult,
    ) -> Result<(oneshot::Receiver<ProposalResult>, u64), KvError> {
        let is_lease = matches!(replicated, ReplicatedResult::Lease { .. });
        let pool = self.quota.locked().clone();
        let quota = match pool {
            Some(pool) if !is_lease => {
                let size = (write_batch.get_heap_size() + PROPOSAL_OVERHEAD) as u64;
                let n = pool.acquire(ctx, size).await?;
                Some((pool, n))
            }
            _ => None,
        };
        let give_back = |quota: Option<(Arc<QuotaPool>, u64)>| {
            if let Some((pool, n)) = quota {
                pool.add(n);
            }
        };

        let mut raft_guard = self.raft_mu.locked();
        let raft = match raft_guard.as_mut() {
            Some(raft) => raft,
            None => {
                give_back(quota);
                return Err(self.range_not_found());
            }
        };
        let cmd = {
            let mut mu = self.mu.locked();
            if let Err(e) = self.check_alive(&mu) {
                give_back(quota);
                return Err(e);
            }
            let max_lease_index = if is_lease {
                0
            } else {
                mu.max_proposed_lai = mu.max_proposed_lai.max(mu.lease_applied_index) + 1;
                mu.max_proposed_lai
            };
            let id = raft.next_proposal_id;
            raft.next_proposal_id += 1;
            RaftCommand {
                proposal_id: id,
                proposer: ReplicaDescriptor {
                    node_id: self.ident.node_id,
                    store_id: self.ident.store_id,
                    replica_id: mu.replica_id,
                },
                proposer_lease_seq: mu.lease.sequence,
                max_lease_index,
                timestamp,
                write_batch,
                replicated,
            }
        };
        let proposed = cmd.encode().and_then(|data| raft.group.propose(data));
        let (index, _) = match proposed {
            Ok(res) => res,
            Err(e) => {
                pf_debug!(self.tag; "proposal refused: {}", e);
                drop(raft_guard);
                give_back(quota);
                return Err(self.not_lease_holder(Some(self.lease())));
            }
        };
        let (tx, rx) = oneshot::channel();
        let lai = cmd.max_lease_index;
        raft.proposals.insert(
            cmd.proposal_id,
            ProposalData {
                command: cmd,
                response,
                local,
                quota,
                index,
                tx_done: Some(tx),
            },
        );
        drop(raft_guard);
        self.ready_scheduler.enqueue_raft_ready(self.range_id);
        Ok((rx, lai))
    }

    /// Waits for a proposal to apply. The latch guard, if any, is handed
    /// back once the command applied; on cancellation it stays held in the
    /// background until then and the outcome is ambiguous.
    pub(super) async fn wait_for_proposal(
        &self,
        ctx: &Ctx,
        mut rx: oneshot::Receiver<ProposalResult>,
        guard: Option<Guard>,
    ) -> (Result<ProposalResult, KvError>, Option<Guard>) {
        enum Outcome {
            Applied(Result<ProposalResult, oneshot::error::RecvError>),
            Canceled(KvError),
            Stopping,
        }
        let outcome = tokio::select! {
            res = &mut rx => Outcome::Applied(res),
            err = ctx.done() => Outcome::Canceled(err),
            _ = self.stopper.quiesced() => Outcome::Stopping,
        };
        match outcome {
            Outcome::Applied(Ok(res)) => (Ok(res), guard),
            Outcome::Applied(Err(_)) => (Err(self.range_not_found()), guard),
            Outcome::Canceled(err) => {
                tokio::spawn(async move {
                    let _ = rx.await;
                    drop(guard);
                });
                let err = KvError::new(ErrorDetail::AmbiguousResult {
                    message: format!("{}: {}", self.tag, err),
                });
                (Err(err), None)
            }
            Outcome::Stopping => (
                Err(KvError::unavailable(format!("{}: node is stopping", self.tag))),
                guard,
            ),
        }
    }

    /// Proposes a command outside of the request path and waits for it.
    pub(super) async fn propose_and_wait(
        self: &Arc<Self>,
        ctx: &Ctx,
        replicated: ReplicatedResult,
        write_batch: WriteBatch,
    ) -> Result<(), KvError> {
        loop {
            if !matches!(replicated, ReplicatedResult::Lease { .. }) {
                self.redirect_or_acquire_lease(ctx).await?;
            }
            self.ensure_leadership(ctx).await?;
            let (rx, _) = self
                .propose(
                    ctx,
                    replicated.clone(),
                    write_batch.clone(),
                    self.clock.now(),
                    BatchResponse::default(),
                    LocalResult::default(),
                )
                .await?;
            let (res, _) = self.wait_for_proposal(ctx, rx, None).await;
            match res?.reply {
                Err(KvError {
                    detail: ErrorDetail::ProposalIllegalLeaseIndex,
                    ..
                }) => continue,
                Err(e) => return Err(e),
                Ok(_) => return Ok(()),
            }
        }
    }

    /// Campaigns until this replica leads its consensus group.
    pub(super) async fn ensure_leadership(self: &Arc<Self>, ctx: &Ctx) -> Result<(), KvError> {
        let tick = Duration::from_millis(self.config.raft_tick_ms);
        let deadline = Instant::now() + Duration::from_millis(self.config.lease_request_timeout_ms);
        let mut next_campaign = Instant::now();
        loop {
            let campaigned = {
                let mut raft_guard = self.raft_mu.locked();
                let raft = raft_guard.as_mut().ok_or_else(|| self.range_not_found())?;
                if raft.group.is_leader() {
                    return Ok(());
                }
                if Instant::now() >= next_campaign {
                    raft.group.campaign()?;
                    true
                } else {
                    false
                }
            };
            if campaigned {
                self.ready_scheduler.enqueue_raft_ready(self.range_id);
                let backoff = rand::random::<u32>() % 5 + 5;
                next_campaign = Instant::now() + tick * backoff;
            }
            if Instant::now() >= deadline {
                return Err(KvError::unavailable(format!(
                    "{}: could not become raft leader",
                    self.tag
                )));
            }
            ctx.run(async {
                tokio::time::sleep(tick).await;
                Ok(())
            })
            .await?;
        }
    }

    /// Steps an incoming consensus message.
    pub(super) fn step_raft_message(&self, req: RaftMessageRequest) -> Result<(), KvError> {
        let mut raft_guard = self.raft_mu.locked();
        let raft = raft_guard.as_mut().ok_or_else(|| self.range_not_found())?;
        self.mu.locked().peers.insert(req.from.replica_id, req.from);
        let vote_allowed = match &req.message.body {
            MessageBody::Vote { .. } => self.vote_allowed(req.from.replica_id),
            _ => true,
        };
        raft.group.step(req.message, vote_allowed)
    }

    /// A voter refuses candidates while it knows of a valid lease held by
    /// another replica.
    fn vote_allowed(&self, candidate: ReplicaId) -> bool {
        let lease = self.mu.locked().lease.clone();
        lease.is_empty()
            || lease.replica.replica_id == candidate
            || !self.lease_valid(&lease, self.clock.now())
    }

    /// Ticks the consensus group; returns true if ready work is pending.
    pub(super) fn tick(&self) -> bool {
        let mut raft_guard = self.raft_mu.locked();
        match raft_guard.as_mut() {
            Some(raft) => {
                raft.group.tick();
                raft.group.has_ready()
            }
            None => false,
        }
    }

    /// Persists, sends and applies the pending output of the consensus
    /// group. Returns the follow-up work for the store.
    pub(super) fn handle_raft_ready(&self) -> Vec<StoreAction> {
        let mut actions = Vec::new();
        let mut raft_guard = self.raft_mu.locked();
        let raft = match raft_guard.as_mut() {
            Some(raft) => raft,
            None => return actions,
        };
        if !raft.group.has_ready() {
            return actions;
        }
        let rd = raft.group.ready();

        if let Some(snap) = rd.snapshot {
            if let Err(e) = self.apply_snapshot(raft, snap) {
                pf_error!(self.tag; "error applying snapshot: {}", e);
            }
        }
        if !rd.entries.is_empty() {
            if let Err(e) = self.loader.append_entries(&self.engine, &rd.entries) {
                pf_error!(self.tag; "error appending entries: {}", e);
            }
        }
        if let Some(hs) = rd.hard_state {
            if let Err(e) = self.loader.set_hard_state(&self.engine, &hs) {
                pf_error!(self.tag; "error saving hard state: {}", e);
            }
        }
        self.send_messages(rd.messages);

        for entry in rd.committed {
            if let Some(action) = self.apply_entry(raft, entry.index, &entry.data) {
                actions.push(action);
            }
        }
        for to in rd.needs_snapshot {
            self.send_snapshot(raft, to);
        }
        self.maybe_truncate_log(raft);
        self.update_leadership(raft);

        let more = raft.group.has_ready();
        drop(raft_guard);
        if more {
            self.ready_scheduler.enqueue_raft_ready(self.range_id);
        }
        actions
    }

    fn send_messages(&self, msgs: Vec<crate::storage::raft::Message>) {
        if msgs.is_empty() {
            return;
        }
        let mu = self.mu.locked();
        let from = ReplicaDescriptor {
            node_id: self.ident.node_id,
            store_id: self.ident.store_id,
            replica_id: mu.replica_id,
        };
        for m in msgs {
            let to = mu
                .desc
                .as_ref()
                .and_then(|d| d.replica_by_id(m.to))
                .or_else(|| mu.peers.get(&m.to).copied());
            let to = match to {
                Some(to) => to,
                None => {
                    if self.log_every.should_log() {
                        pf_warn!(self.tag; "no address of replica {}", m.to);
                    }
                    continue;
                }
            };
            self.transport.send(RaftMessageRequest {
                range_id: self.range_id,
                from,
                to,
                message: m,
            });
        }
    }

    /// Applies one committed entry. Commands failing the lease checks leave
    /// no trace beyond the applied index.
    fn apply_entry(&self, raft: &mut RaftState, index: u64, data: &[u8]) -> Option<StoreAction> {
        if data.is_empty() {
            let mut mu = self.mu.locked();
            if index > mu.applied_index {
                mu.applied_index = index;
                self.save_applied_state(&mu);
            }
            drop(mu);
            self.finish_superseded(raft, index);
            return None;
        }
        let cmd = match RaftCommand::decode(data) {
            Ok(cmd) => cmd,
            Err(e) => {
                pf_error!(self.tag; "undecodable command at {}: {}", index, e);
                return None;
            }
        };
        if let ReplicatedResult::Merge {
            right_desc,
            right_applied_index,
            ..
        } = &cmd.replicated
        {
            // the subsumed replica on this store must be caught up before
            // its data is absorbed
            if let Ok(store) = self.store() {
                if let Some(rhs) = store.get_replica(right_desc.range_id) {
                    if !rhs.catch_up_to(*right_applied_index) {
                        pf_warn!(self.tag; "r{} could not catch up to {} before merge",
                                           right_desc.range_id, right_applied_index);
                    }
                }
            }
        }

        let mut mu = self.mu.locked();
        if index <= mu.applied_index {
            return None;
        }
        mu.applied_index = index;
        let mut action = None;
        let reply = match check_forced_error(self.range_id, &mu, &cmd) {
            Err(e) => {
                pf_debug!(self.tag; "command at {} rejected: {}", index, e);
                Err(e)
            }
            Ok(()) => {
                let delta = self.engine.apply(&cmd.write_batch);
                mu.stats.add(&delta);
                if !cmd.is_lease_request() {
                    mu.lease_applied_index = cmd.max_lease_index;
                }
                action = self.apply_replicated_result(raft, &mut mu, &cmd);
                Ok(())
            }
        };
        self.save_applied_state(&mu);
        let local = cmd.proposer.store_id == self.ident.store_id
            && cmd.proposer.replica_id == mu.replica_id;
        drop(mu);

        // splits and merges reach the store before their proposer returns;
        // a removal waits until the ready round released this replica
        let action = match action {
            Some(StoreAction::Removed) => Some(StoreAction::Removed),
            Some(action) => {
                match self.store() {
                    Ok(store) => store.apply_store_action(self, action),
                    Err(e) => pf_warn!(self.tag; "cannot apply {:?}: {}", action, e),
                }
                None
            }
            None => None,
        };

        if local {
            if let Some(mut p) = raft.proposals.remove(&cmd.proposal_id) {
                let response = std::mem::take(&mut p.response);
                p.finish(reply.map(|_| response));
            }
        }
        self.finish_superseded(raft, index);
        action
    }

    /// Proposals appended at or below `index` that are still pending were
    /// overwritten in the log; their proposers re-evaluate.
    fn finish_superseded(&self, raft: &mut RaftState, index: u64) {
        let dropped: Vec<u64> = raft
            .proposals
            .iter()
            .filter(|(_, p)| p.index <= index)
            .map(|(id, _)| *id)
            .collect();
        for id in dropped {
            if let Some(mut p) = raft.proposals.remove(&id) {
                p.finish(Err(KvError::new(ErrorDetail::ProposalIllegalLeaseIndex)));
            }
        }
    }

    fn apply_replicated_result(
        &self,
        raft: &mut RaftState,
        mu: &mut ReplicaState,
        cmd: &RaftCommand,
    ) -> Option<StoreAction> {
        match &cmd.replicated {
            ReplicatedResult::None => None,
            ReplicatedResult::Lease { lease, .. } => {
                let prev = std::mem::replace(&mut mu.lease, lease.clone());
                if let Err(e) = self.loader.set_lease(&self.engine, lease) {
                    pf_error!(self.tag; "error saving lease: {}", e);
                }
                mu.transferring_lease = false;
                if prev.replica != lease.replica {
                    if lease.owned_by(self.ident.store_id) {
                        self.tscache.set_low_water(lease.start);
                    }
                    self.concurrency.on_lease_updated();
                    pf_debug!(self.tag; "lease now {:?}", lease);
                }
                None
            }
            ReplicatedResult::Split { left, right } => {
                mu.desc = Some(left.clone());
                mu.stats = self.engine.compute_stats(&left.start_key, &left.end_key);
                self.concurrency.on_range_split();
                Some(StoreAction::Split {
                    right: right.clone(),
                    lease: mu.lease.clone(),
                })
            }
            ReplicatedResult::Merge {
                right_desc,
                merged,
                freeze_start,
                ..
            } => {
                mu.desc = Some(merged.clone());
                mu.stats = self.engine.compute_stats(&merged.start_key, &merged.end_key);
                self.tscache.add(&right_desc.span(), *freeze_start, None);
                self.concurrency.on_range_merge();
                Some(StoreAction::MergedAway {
                    right_id: right_desc.range_id,
                })
            }
            ReplicatedResult::ChangeReplicas { desc } => {
                mu.desc = Some(desc.clone());
                raft.group
                    .set_peers(desc.replicas.iter().map(|r| r.replica_id).collect());
                if desc.replica_for_store(self.ident.store_id).is_none() {
                    Some(StoreAction::Removed)
                } else {
                    None
                }
            }
        }
    }

    fn save_applied_state(&self, mu: &ReplicaState) {
        let state = RangeAppliedState {
            applied_index: mu.applied_index,
            lease_applied_index: mu.lease_applied_index,
            stats: mu.stats,
        };
        if let Err(e) = self.loader.set_applied_state(&self.engine, &state) {
            pf_error!(self.tag; "error saving applied state: {}", e);
        }
    }

    fn txn_record_bounds(desc: &RangeDescriptor) -> (Vec<u8>, Vec<u8>) {
        (
            transaction_key_bound(&desc.start_key),
            transaction_key_bound(&desc.end_key),
        )
    }

    fn send_snapshot(&self, raft: &mut RaftState, to: ReplicaId) {
        let data = {
            let mu = self.mu.locked();
            let desc = match &mu.desc {
                Some(d) => d.clone(),
                None => return,
            };
            let (lo, hi) = Self::txn_record_bounds(&desc);
            SnapshotData {
                rows: self.engine.histories(&desc.start_key, &desc.end_key),
                txn_records: self.engine.local_range(&lo, &hi),
                lease: mu.lease.clone(),
                applied: RangeAppliedState {
                    applied_index: mu.applied_index,
                    lease_applied_index: mu.lease_applied_index,
                    stats: mu.stats,
                },
                desc,
            }
        };
        let index = data.applied.applied_index;
        let res = encode(&data).and_then(|bytes| raft.group.send_snapshot(to, index, bytes));
        match res {
            Ok(()) => pf_info!(self.tag; "sending snapshot at {} to replica {}", index, to),
            Err(e) => pf_error!(self.tag; "error sending snapshot to {}: {}", to, e),
        }
    }

    fn apply_snapshot(&self, raft: &mut RaftState, snap: Snapshot) -> Result<(), KvError> {
        let data: SnapshotData = decode(&snap.data)?;
        let desc = data.desc;
        self.engine.ingest(&desc.start_key, &desc.end_key, data.rows);
        let (lo, hi) = Self::txn_record_bounds(&desc);
        self.engine.clear_local_range(&lo, &hi);
        for (k, v) in data.txn_records {
            self.engine.set_local(k, Some(v));
        }
        StateLoader::set_descriptor(&self.engine, &desc)?;
        self.loader.set_lease(&self.engine, &data.lease)?;
        self.loader.truncate_log(&self.engine, snap.index, snap.term)?;
        let stats = self.engine.compute_stats(&desc.start_key, &desc.end_key);
        let applied = RangeAppliedState {
            applied_index: snap.index,
            lease_applied_index: data.applied.lease_applied_index,
            stats,
        };
        self.loader.set_applied_state(&self.engine, &applied)?;

        raft.group
            .set_peers(desc.replicas.iter().map(|r| r.replica_id).collect());
        let mut mu = self.mu.locked();
        pf_info!(self.tag; "applied snapshot at {} for {:?}", snap.index, desc);
        mu.desc = Some(desc);
        mu.lease = data.lease;
        mu.applied_index = snap.index;
        mu.lease_applied_index = applied.lease_applied_index;
        mu.max_proposed_lai = mu.max_proposed_lai.max(applied.lease_applied_index);
        mu.stats = stats;
        mu.truncated = TruncatedState {
            index: snap.index,
            term: snap.term,
        };
        self.tscache.set_low_water(self.clock.now());
        self.concurrency.on_lease_updated();
        Ok(())
    }

    fn maybe_truncate_log(&self, raft: &mut RaftState) {
        let applied = raft.group.applied_index();
        if applied < raft.group.first_index() + self.config.raft_log_truncation_threshold {
            return;
        }
        if let Some(term) = raft.group.compact(applied) {
            if let Err(e) = self.loader.truncate_log(&self.engine, applied, term) {
                pf_error!(self.tag; "error truncating log: {}", e);
                return;
            }
            self.mu.locked().truncated = TruncatedState {
                index: applied,
                term,
            };
            pf_trace!(self.tag; "truncated log through {}", applied);
        }
    }

    /// Creates or drops the proposal quota pool as leadership changes.
    fn update_leadership(&self, raft: &mut RaftState) {
        let leader = raft.group.is_leader();
        if leader == raft.was_leader {
            return;
        }
        raft.was_leader = leader;
        let mut quota = self.quota.locked();
        if leader {
            pf_debug!(self.tag; "became raft leader at term {}", raft.group.term());
            *quota = Some(Arc::new(QuotaPool::new(
                format!("{}-quota", self.tag),
                self.config.proposal_quota_bytes,
            )));
        } else if let Some(pool) = quota.take() {
            pool.close("raft leadership lost");
        }
    }

    /// Applies committed entries up to `index` right away, if they are in
    /// the local log.
    pub(super) fn catch_up_to(self: &Arc<Self>, index: u64) -> bool {
        if self.applied_index() >= index {
            return true;
        }
        {
            let mut raft_guard = self.raft_mu.locked();
            match raft_guard.as_mut() {
                Some(raft) => {
                    if !raft.group.commit_to(index) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        let actions = self.handle_raft_ready();
        if !actions.is_empty() {
            if let Ok(store) = self.store() {
                store.handle_store_actions(self, actions);
            }
        }
        self.applied_index() >= index
    }

    /// Stops the replica for good, failing all pending proposals.
    pub(super) fn mark_destroyed(&self, status: DestroyStatus) {
        let raft = self.raft_mu.locked().take();
        if let Some(mut raft) = raft {
            for (_, mut p) in raft.proposals.drain() {
                p.finish(Err(self.range_not_found()));
            }
        }
        {
            let mut mu = self.mu.locked();
            mu.destroy_status = status;
        }
        if let Some(pool) = self.quota.locked().take() {
            pool.close("replica destroyed");
        }
        self.loader.destroy(&self.engine);
        self.merge_tx.send_replace(false);
        pf_info!(self.tag; "replica destroyed: {:?}", status);
    }

    /// Hard state for a range created by a split or bootstrap.
    pub(super) fn initial_hard_state() -> HardState {
        HardState {
            term: crate::storage::raft::INITIAL_LOG_TERM,
            vote: None,
            commit: crate::storage::raft::INITIAL_LOG_INDEX,
        }
    }
}

/// Apply-time checks every replica performs identically: commands must have
/// been evaluated under the current lease and within their lease index.
fn check_forced_error(
    range_id: RangeId,
    mu: &ReplicaState,
    cmd: &RaftCommand,
) -> Result<(), KvError> {
    if let ReplicatedResult::Lease { lease, prev_seq } = &cmd.replicated {
        if *prev_seq != mu.lease.sequence {
            return Err(KvError::new(ErrorDetail::LeaseRejected {
                message: format!(
                    "lease sequence {} changed to {}",
                    prev_seq, mu.lease.sequence
                ),
                requested: Box::new(lease.clone()),
                existing: Box::new(mu.lease.clone()),
            }));
        }
        return Ok(());
    }
    if cmd.proposer_lease_seq != mu.lease.sequence {
        return Err(KvError::new(ErrorDetail::NotLeaseHolder {
            range_id,
            replica: Some(cmd.proposer),
            lease_holder: Some(mu.lease.replica),
            lease: Some(mu.lease.clone()),
        }));
    }
    if cmd.max_lease_index <= mu.lease_applied_index {
        return Err(KvError::new(ErrorDetail::ProposalIllegalLeaseIndex));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod replica_tests {
    use super::*;
    use crate::kvpb::{Request, Transaction};
    use crate::storage::store::store_tests::single_store;
    use bytes::Bytes;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn put_then_get() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let repl = store.replica_for_key(b"a").expect("range");
        let ctx = Ctx::background();
        repl.send(&ctx, BatchRequest::single(Request::put("a", "1"))).await?;
        let br = repl.send(&ctx, BatchRequest::single(Request::get("a"))).await?;
        assert_eq!(br.responses[0], Response::Get { value: Some(Bytes::from("1")) });
        assert!(repl.owns_valid_lease(store.clock().now()));
        assert!(repl.is_raft_leader());
        assert!(repl.stats().total() > 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn writes_land_above_reads() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let repl = store.replica_for_key(b"k").expect("range");
        let ctx = Ctx::background();
        let txn = Transaction::new("w", Bytes::from("k"), 1, store.clock().now(), 0);
        let read_ts = store.clock().now();
        let mut read = BatchRequest::single(Request::get("k"));
        read.header.timestamp = read_ts;
        repl.send(&ctx, read).await?;

        let mut ba = BatchRequest::single(Request::put("k", "v"));
        ba.header.txn = Some(txn);
        ba.requests[0].header.sequence = 1;
        let br = repl.send(&ctx, ba).await?;
        let txn = br.header.txn.expect("txn");
        assert!(txn.write_timestamp() > read_ts);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn out_of_bounds_is_mismatch() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let repl = store.replica_for_key(b"a").expect("range");
        let ctx = Ctx::background();
        let err = repl
            .send(&ctx, BatchRequest::single(Request::get(Bytes::from_static(b"\x01sys"))))
            .await
            .expect_err("system key lives elsewhere");
        assert!(matches!(err.detail, ErrorDetail::RangeKeyMismatch { .. }));
        Ok(())
    }

    #[test]
    fn forced_errors() {
        let mut lease = Lease::default();
        lease.sequence = 3;
        let mu = ReplicaState {
            desc: None,
            replica_id: 1,
            lease: lease.clone(),
            applied_index: 20,
            lease_applied_index: 7,
            stats: MvccStats::default(),
            truncated: TruncatedState::default(),
            max_proposed_lai: 7,
            destroy_status: DestroyStatus::Alive,
            merge_freeze: None,
            transferring_lease: false,
            peers: HashMap::new(),
        };
        let cmd = |seq, mli, replicated| RaftCommand {
            proposal_id: 1,
            proposer: ReplicaDescriptor::default(),
            proposer_lease_seq: seq,
            max_lease_index: mli,
            timestamp: Timestamp::default(),
            write_batch: WriteBatch::default(),
            replicated,
        };
        let check = |c: &RaftCommand| check_forced_error(7, &mu, c);
        assert!(check(&cmd(3, 8, ReplicatedResult::None)).is_ok());
        assert!(matches!(
            check(&cmd(3, 7, ReplicatedResult::None)).map_err(|e| e.detail),
            Err(ErrorDetail::ProposalIllegalLeaseIndex)
        ));
        assert!(matches!(
            check(&cmd(2, 9, ReplicatedResult::None)).map_err(|e| e.detail),
            Err(ErrorDetail::NotLeaseHolder { .. })
        ));
        let mut next = lease.clone();
        next.sequence = 4;
        assert!(check(&cmd(0, 0, ReplicatedResult::Lease { lease: next.clone(), prev_seq: 3 })).is_ok());
        assert!(matches!(
            check(&cmd(0, 0, ReplicatedResult::Lease { lease: next, prev_seq: 2 })).map_err(|e| e.detail),
            Err(ErrorDetail::LeaseRejected { .. })
        ));
    }
}
