//! Transaction coordinator: the per-transaction sender at the gateway.
//!
//! Requests pass through a fixed pipeline of interceptors under the
//! coordinator's lock (heartbeater, sequence numbers, lock footprint, read
//! footprint), go out through the wrapped sender without the lock held, and
//! come back to be folded into the coordinator's transaction proto. Root
//! coordinators turn retryable errors into an epoch bump (or a fresh
//! transaction after an abort) and hand the caller a
//! `TransactionRetryWithProtoRefresh`.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::hlc::{Clock, Timestamp};
use crate::kv::sender::{Sender, SenderKind, TxnSender, TxnType};
use crate::kv::txn_interceptor_committer::TxnCommitter;
use crate::kv::txn_interceptor_heartbeater::{spawn_heartbeat_loop, TxnHeartbeater};
use crate::kv::txn_interceptor_seq_num_allocator::TxnSeqNumAllocator;
use crate::kv::txn_interceptor_span_refresher::TxnSpanRefresher;
use crate::kvpb::{
    BatchRequest, BatchResponse, BatchResponseHeader, Header, IgnoredSeqRange, Key,
    Request, RequestArgs, Response, Span, Transaction, TransactionStatus, TxnId,
    UserPriority,
};
use crate::utils::{Ctx, ErrorDetail, KvError, MutexExt, Stopper};

use async_trait::async_trait;

use serde::Deserialize;

use tokio::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct TxnConfig {
    /// Interval between heartbeats of a writing root transaction.
    pub heartbeat_interval_ms: u64,

    /// A heartbeat still unanswered after this long is abandoned; by then
    /// pushers consider the record expired anyway.
    pub liveness_threshold_ms: u64,

    /// Retries of a `DB::txn()` closure before giving up.
    pub max_auto_retries: u32,
}

#[allow(clippy::derivable_impls)]
impl Default for TxnConfig {
    fn default() -> Self {
        TxnConfig {
            heartbeat_interval_ms: 1000,
            liveness_threshold_ms: 5000,
            max_auto_retries: 100,
        }
    }
}

/// Snapshot of a coordinator's state, shipped from a root to its leaves and
/// back.
#[derive(Debug, Clone, PartialEq)]
pub struct TxnCoordMeta {
    pub txn: Transaction,
    pub lock_spans: Vec<Span>,
    pub refresh_spans: Vec<Span>,
}

impl TxnCoordMeta {
    pub fn new(txn: Transaction) -> Self {
        TxnCoordMeta {
            txn,
            lock_spans: Vec::new(),
            refresh_spans: Vec::new(),
        }
    }
}

/// Handle to a savepoint; reusable until released or rolled over by an
/// enclosing savepoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavepointToken {
    pub txn_id: TxnId,
    pub epoch: i32,

    /// Write sequence at creation; later writes get rolled back.
    pub seq_num: i32,

    id: u64,
}

impl SavepointToken {
    /// Savepoint taken before the transaction wrote anything; it stays
    /// valid across epochs.
    pub fn is_initial(&self) -> bool {
        self.seq_num == 0
    }
}

/// Stage of the coordinator's request pipeline. Hooks run under the
/// coordinator's lock.
pub(super) trait TxnInterceptor {
    /// Adjusts an outgoing batch and the transaction it is sent with.
    fn prepare(&mut self, txn: &mut Transaction, ba: &mut BatchRequest) -> Result<(), KvError>;

    fn populate_meta(&self, meta: &mut TxnCoordMeta);

    fn augment_meta(&mut self, meta: &TxnCoordMeta);

    fn epoch_bumped(&mut self);

    fn create_savepoint(&self, _sp: &mut SavepointToken) {}

    fn rollback_to_savepoint(&mut self, _sp: &SavepointToken) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Pending,
    Finalized(TransactionStatus),
}

struct TxnCoordState {
    txn: Transaction,
    user_priority: UserPriority,
    state: TxnState,

    /// Error discovered in the background; returned by the next request.
    stored_err: Option<KvError>,

    heartbeater: TxnHeartbeater,
    seq: TxnSeqNumAllocator,
    committer: TxnCommitter,
    refresher: TxnSpanRefresher,

    /// Ids of live savepoints, innermost last.
    savepoints: Vec<u64>,
    next_savepoint_id: u64,
}

impl TxnCoordState {
    fn new(typ: TxnType, txn: Transaction, user_priority: UserPriority) -> Self {
        TxnCoordState {
            txn,
            user_priority,
            state: TxnState::Pending,
            stored_err: None,
            heartbeater: TxnHeartbeater::new(typ == TxnType::Root),
            seq: TxnSeqNumAllocator::default(),
            committer: TxnCommitter::default(),
            refresher: TxnSpanRefresher::default(),
            savepoints: Vec::new(),
            next_savepoint_id: 1,
        }
    }

    fn interceptors(&self) -> [&dyn TxnInterceptor; 4] {
        [&self.heartbeater, &self.seq, &self.committer, &self.refresher]
    }

    fn interceptors_mut(&mut self) -> [&mut dyn TxnInterceptor; 4] {
        [
            &mut self.heartbeater,
            &mut self.seq,
            &mut self.committer,
            &mut self.refresher,
        ]
    }

    fn prepare(&mut self, ba: &mut BatchRequest) -> Result<(), KvError> {
        let TxnCoordState {
            txn,
            heartbeater,
            seq,
            committer,
            refresher,
            ..
        } = self;
        let stages: [&mut dyn TxnInterceptor; 4] = [heartbeater, seq, committer, refresher];
        for stage in stages {
            stage.prepare(txn, ba)?;
        }
        Ok(())
    }

    fn populate_meta(&self) -> TxnCoordMeta {
        let mut meta = TxnCoordMeta::new(self.txn.clone());
        for stage in self.interceptors() {
            stage.populate_meta(&mut meta);
        }
        meta
    }
}

fn status_name(status: TransactionStatus) -> String {
    match status {
        TransactionStatus::Pending => "PENDING",
        TransactionStatus::Staging => "STAGING",
        TransactionStatus::Committed => "COMMITTED",
        TransactionStatus::Aborted => "ABORTED",
    }
    .into()
}

fn end_txn_commit(ba: &BatchRequest) -> Option<bool> {
    match ba.requests.last().map(|r| &r.args) {
        Some(RequestArgs::EndTxn { commit, .. }) => Some(*commit),
        _ => None,
    }
}

/// Coordinator of one transaction.
pub struct TxnCoordSender {
    typ: TxnType,
    config: TxnConfig,
    clock: Arc<Clock>,
    wrapped: Arc<dyn Sender>,
    stopper: Stopper,
    me: Weak<TxnCoordSender>,

    mu: Mutex<TxnCoordState>,
}

impl TxnCoordSender {
    fn new(
        typ: TxnType,
        factory: &TxnCoordSenderFactory,
        state: TxnCoordState,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| TxnCoordSender {
            typ,
            config: factory.config.clone(),
            clock: factory.clock.clone(),
            wrapped: factory.wrapped.clone(),
            stopper: factory.stopper.clone(),
            me: me.clone(),
            mu: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TxnCoordState> {
        self.mu.locked()
    }

    #[inline]
    pub fn typ(&self) -> TxnType {
        self.typ
    }

    /// Copy of the current transaction proto.
    pub fn txn(&self) -> Transaction {
        self.lock().txn.clone()
    }

    pub fn id(&self) -> TxnId {
        self.lock().txn.id()
    }

    pub fn epoch(&self) -> i32 {
        self.lock().txn.epoch()
    }

    pub fn user_priority(&self) -> UserPriority {
        self.lock().user_priority
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.lock().state, TxnState::Finalized(_))
    }

    /// Sequence number of the latest write.
    pub fn write_seq(&self) -> i32 {
        self.lock().seq.write_seq
    }

    pub fn ignored_seq_ranges(&self) -> Vec<IgnoredSeqRange> {
        self.lock().txn.ignored_seq_ranges.clone()
    }

    /// Lets subsequent reads see every write issued so far. Requires
    /// stepping to be enabled.
    pub fn step(&self) -> Result<(), KvError> {
        self.lock().seq.step()
    }

    /// Turns stepping on or off; returns the previous mode.
    pub fn configure_stepping(&self, enabled: bool) -> bool {
        self.lock().seq.configure_stepping(enabled)
    }

    /// Commit must happen strictly below `deadline`; keeps the earliest
    /// deadline seen.
    pub fn update_deadline(&self, deadline: Timestamp) {
        let mut mu = self.lock();
        match mu.committer.deadline {
            Some(cur) if cur <= deadline => {}
            _ => mu.committer.deadline = Some(deadline),
        }
    }

    fn check_root(&self, what: &str) -> Result<(), KvError> {
        if self.typ != TxnType::Root {
            return logged_err!("txn"; "{} is only valid on root transactions", what);
        }
        Ok(())
    }

    fn check_pending_locked(&self, mu: &TxnCoordState) -> Result<(), KvError> {
        match mu.state {
            TxnState::Pending => Ok(()),
            TxnState::Finalized(status) => Err(KvError::new(ErrorDetail::TxnFinalized {
                status: status_name(status),
            })),
        }
    }

    pub fn create_savepoint(&self) -> Result<SavepointToken, KvError> {
        self.check_root("CreateSavepoint")?;
        let mut mu = self.lock();
        self.check_pending_locked(&mu)?;
        let id = mu.next_savepoint_id;
        mu.next_savepoint_id += 1;
        let mut sp = SavepointToken {
            txn_id: mu.txn.id(),
            epoch: mu.txn.epoch(),
            seq_num: 0,
            id,
        };
        for stage in mu.interceptors() {
            stage.create_savepoint(&mut sp);
        }
        mu.savepoints.push(id);
        Ok(sp)
    }

    /// Position of a live savepoint in the stack.
    fn check_savepoint_locked(
        &self,
        mu: &TxnCoordState,
        sp: &SavepointToken,
    ) -> Result<usize, KvError> {
        if sp.txn_id != mu.txn.id() {
            return Err(KvError::msg(format!(
                "savepoint of txn {} used on txn {}",
                sp.txn_id,
                mu.txn.short_id()
            )));
        }
        let pos = mu
            .savepoints
            .iter()
            .position(|id| *id == sp.id)
            .ok_or_else(|| KvError::msg("savepoint is no longer valid"))?;
        if sp.epoch != mu.txn.epoch() && !sp.is_initial() {
            return Err(KvError::msg(format!(
                "savepoint from epoch {} cannot be used at epoch {}",
                sp.epoch,
                mu.txn.epoch()
            )));
        }
        Ok(pos)
    }

    /// Undoes every write issued after the savepoint. The savepoint stays
    /// usable; savepoints nested inside it are dropped.
    pub fn rollback_to_savepoint(&self, sp: &SavepointToken) -> Result<(), KvError> {
        self.check_root("RollbackToSavepoint")?;
        let mut mu = self.lock();
        self.check_pending_locked(&mu)?;
        let pos = self.check_savepoint_locked(&mu, sp)?;
        mu.savepoints.truncate(pos + 1);
        let cur = mu.seq.write_seq;
        if cur > sp.seq_num {
            mu.txn.add_ignored_seq_range(IgnoredSeqRange {
                start: sp.seq_num + 1,
                end: cur,
            });
        }
        for stage in mu.interceptors_mut() {
            stage.rollback_to_savepoint(sp);
        }
        pf_debug!("txn"; "txn {} rolled back to seq {}, ignoring {:?}",
                         mu.txn.short_id(), sp.seq_num, mu.txn.ignored_seq_ranges);
        Ok(())
    }

    /// Forgets the savepoint and the savepoints nested inside it.
    pub fn release_savepoint(&self, sp: &SavepointToken) -> Result<(), KvError> {
        self.check_root("ReleaseSavepoint")?;
        let mut mu = self.lock();
        self.check_pending_locked(&mu)?;
        let pos = self.check_savepoint_locked(&mu, sp)?;
        mu.savepoints.truncate(pos);
        Ok(())
    }

    /// Snapshot for a leaf coordinator.
    pub fn get_meta(&self) -> Result<TxnCoordMeta, KvError> {
        let mu = self.lock();
        self.check_pending_locked(&mu)?;
        Ok(mu.populate_meta())
    }

    /// Folds a leaf's state back in. Metas of other transactions (or of an
    /// aborted incarnation) are ignored.
    pub fn augment_meta(&self, meta: &TxnCoordMeta) -> Result<(), KvError> {
        let mut mu = self.lock();
        self.check_pending_locked(&mu)?;
        if meta.txn.id() != mu.txn.id() {
            return Ok(());
        }
        mu.txn.update(&meta.txn);
        for stage in mu.interceptors_mut() {
            stage.augment_meta(meta);
        }
        Ok(())
    }

    /// Pins the transaction at `ts` for historical reads; it can no longer
    /// be pushed.
    pub fn set_fixed_timestamp(&self, ts: Timestamp) -> Result<(), KvError> {
        let mut mu = self.lock();
        self.check_pending_locked(&mu)?;
        if mu.seq.write_seq > 0 || !mu.refresher.refresh_spans.is_empty() {
            return logged_err!("txn"; "cannot fix the timestamp of txn {} after it performed operations",
                                      mu.txn.short_id());
        }
        mu.txn.set_fixed_timestamp(ts);
        Ok(())
    }

    /// Per-statement read timestamp for read-committed isolation. Only
    /// serializable transactions are coordinated here, so every call is
    /// refused.
    pub fn set_time_for_rc(&self, ts: Timestamp) -> Result<(), KvError> {
        let mu = self.lock();
        self.check_pending_locked(&mu)?;
        logged_err!("txn"; "txn {} cannot step its read timestamp to {}: read committed unsupported",
                           mu.txn.short_id(), ts)
    }

    /// Restarts at a new epoch after a retryable error.
    fn bump_epoch_locked(&self, mu: &mut TxnCoordState, e: KvError) -> KvError {
        let mut txn = mu.txn.clone();
        if let Some(t) = e.txn.as_deref() {
            txn.update(t);
        }
        let ts = match &e.detail {
            ErrorDetail::WriteTooOld {
                actual_timestamp, ..
            } => *actual_timestamp,
            ErrorDetail::ReadWithinUncertaintyInterval {
                existing_timestamp,
                ..
            } => existing_timestamp.next(),
            _ => txn.write_timestamp(),
        };
        let priority = txn.meta.priority;
        txn.restart(priority, ts);
        pf_debug!("txn"; "txn {} restarting at epoch {} ts {}: {}",
                         txn.short_id(), txn.epoch(), txn.read_timestamp, e);
        mu.txn = txn;
        for stage in mu.interceptors_mut() {
            stage.epoch_bumped();
        }
        KvError::new(ErrorDetail::TransactionRetryWithProtoRefresh {
            msg: e.detail.to_string(),
            txn_id: mu.txn.id(),
            next_txn: Box::new(mu.txn.clone()),
            cause: Box::new(e.detail),
        })
    }

    /// Replaces an aborted transaction with a fresh one and cleans up the
    /// old one's intents in the background.
    fn replace_aborted_locked(&self, mu: &mut TxnCoordState, e: KvError) -> KvError {
        let old = mu.txn.clone();
        let lock_spans = mu.committer.lock_spans.clone();
        let stepping = mu.seq.stepping;

        let max_offset = self.clock.max_offset().as_nanos() as i64;
        let mut next = Transaction::new(
            old.name.clone(),
            Key::new(),
            old.meta.priority,
            self.clock.now(),
            max_offset,
        );
        next.meta.priority = next.meta.priority.max(old.meta.priority);
        let user_priority = mu.user_priority;
        *mu = TxnCoordState::new(self.typ, next, user_priority);
        mu.seq.configure_stepping(stepping);
        pf_debug!("txn"; "txn {} aborted, continuing as {}: {}",
                         old.short_id(), mu.txn.short_id(), e);

        if !lock_spans.is_empty() {
            self.cleanup_abandoned(old.clone(), lock_spans);
        }
        KvError::new(ErrorDetail::TransactionRetryWithProtoRefresh {
            msg: e.detail.to_string(),
            txn_id: old.id(),
            next_txn: Box::new(mu.txn.clone()),
            cause: Box::new(e.detail),
        })
    }

    /// Rolls back an abandoned incarnation so its intents get resolved.
    fn cleanup_abandoned(&self, txn: Transaction, lock_spans: Vec<Span>) {
        let wrapped = self.wrapped.clone();
        let res = self.stopper.run_worker("txn-cleanup", async move {
            let anchor = txn.meta.key.clone();
            let short_id = txn.short_id();
            let ba = BatchRequest::new(
                Header {
                    txn: Some(txn),
                    ..Default::default()
                },
                vec![Request::end_txn(anchor, false, lock_spans)],
            );
            if let Err(e) = wrapped.send(&Ctx::background(), ba).await {
                pf_debug!("txn"; "cleanup of txn {} failed: {}", short_id, e);
            }
        });
        if let Err(e) = res {
            pf_debug!("txn"; "skipped txn cleanup: {}", e);
        }
    }

    fn handle_error_locked(&self, mu: &mut TxnCoordState, epoch: i32, e: KvError) -> KvError {
        if e.is_ctx_err() || mu.txn.epoch() != epoch || mu.state != TxnState::Pending {
            return e;
        }
        match &e.detail {
            ErrorDetail::TxnFinalized { status } => {
                let status = if status == "COMMITTED" {
                    TransactionStatus::Committed
                } else {
                    TransactionStatus::Aborted
                };
                mu.state = TxnState::Finalized(status);
                e
            }
            ErrorDetail::TransactionAborted { .. } if self.typ == TxnType::Root => {
                self.replace_aborted_locked(mu, e)
            }
            _ if e.is_txn_retryable() && self.typ == TxnType::Root => {
                self.bump_epoch_locked(mu, e)
            }
            _ => {
                if let Some(t) = e.txn.as_deref() {
                    mu.txn.update(t);
                }
                e
            }
        }
    }

    /// Heartbeats the record of `txn_id`; false once the loop should stop.
    pub(super) async fn heartbeat_once(&self, txn_id: TxnId) -> bool {
        let ba = {
            let mu = self.lock();
            if mu.txn.id() != txn_id || mu.state != TxnState::Pending {
                return false;
            }
            let anchor = mu.txn.meta.key.clone();
            BatchRequest::new(
                Header {
                    txn: Some(mu.txn.clone()),
                    ..Default::default()
                },
                vec![Request::heartbeat_txn(anchor, self.clock.now())],
            )
        };
        let ctx = Ctx::background()
            .with_timeout(Duration::from_millis(self.config.liveness_threshold_ms));
        match self.wrapped.send(&ctx, ba).await {
            Ok(_) => true,
            Err(e) if matches!(e.detail, ErrorDetail::TransactionAborted { .. }) => {
                let mut mu = self.lock();
                if mu.txn.id() == txn_id && mu.state == TxnState::Pending {
                    pf_debug!("txn"; "heartbeat found txn {} aborted", mu.txn.short_id());
                    let txn = mu.txn.clone();
                    mu.stored_err = Some(e.with_txn(Some(txn)));
                }
                false
            }
            Err(e) => {
                pf_debug!("txn"; "heartbeat failed: {}", e);
                true
            }
        }
    }
}

#[async_trait]
impl Sender for TxnCoordSender {
    async fn send(&self, ctx: &Ctx, mut ba: BatchRequest) -> Result<BatchResponse, KvError> {
        ctx.check()?;
        if ba.is_empty() {
            return logged_err!("txn"; "empty batch");
        }

        let mut elided_end_txn = None;
        let (epoch, heartbeat) = {
            let mut mu = self.lock();
            self.check_pending_locked(&mu)?;
            if let Some(e) = mu.stored_err.take() {
                let epoch = mu.txn.epoch();
                return Err(self.handle_error_locked(&mut mu, epoch, e));
            }
            if self.typ == TxnType::Leaf && (ba.is_locking() || ba.has_end_txn()) {
                return logged_err!("txn"; "leaf txn {} cannot write or commit: {}",
                                          mu.txn.short_id(), ba);
            }

            // a transaction that never wrote has no record to finalize
            if ba.has_end_txn()
                && !ba.is_locking()
                && mu.committer.lock_spans.is_empty()
                && !mu.heartbeater.started()
            {
                elided_end_txn = end_txn_commit(&ba);
                ba.requests.pop();
            }

            if !ba.requests.is_empty() {
                mu.prepare(&mut ba)?;
            }
            ba.header.txn = Some(mu.txn.clone());
            let heartbeat = if mu.heartbeater.take_start() {
                Some(mu.txn.id())
            } else {
                None
            };
            (mu.txn.epoch(), heartbeat)
        };

        if let Some(txn_id) = heartbeat {
            let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
            let me = self.me.clone();
            if let Err(e) = spawn_heartbeat_loop(me, interval, &self.stopper, txn_id) {
                pf_debug!("txn"; "heartbeat loop not started: {}", e);
            }
        }

        let res = if ba.requests.is_empty() {
            Ok(BatchResponse {
                header: BatchResponseHeader {
                    now: self.clock.now(),
                    ..Default::default()
                },
                responses: Vec::new(),
            })
        } else {
            ctx.run(self.wrapped.send(ctx, ba.clone())).await
        };

        let mut mu = self.lock();
        match res {
            Ok(mut br) => {
                if mu.txn.epoch() == epoch {
                    if let Some(t) = br.header.txn.as_ref() {
                        mu.txn.update(t);
                    }
                }
                let finished = end_txn_commit(&ba).or(elided_end_txn);
                if let Some(commit) = finished {
                    let status = if commit {
                        TransactionStatus::Committed
                    } else {
                        TransactionStatus::Aborted
                    };
                    mu.txn.status = status;
                    mu.state = TxnState::Finalized(status);
                    if elided_end_txn.is_some() {
                        br.responses.push(Response::EndTxn);
                    }
                }
                br.header.txn = Some(mu.txn.clone());
                Ok(br)
            }
            Err(e) => Err(self.handle_error_locked(&mut mu, epoch, e)),
        }
    }
}

/// Hands out senders; one per process or per node.
pub struct TxnCoordSenderFactory {
    config: TxnConfig,
    clock: Arc<Clock>,
    wrapped: Arc<dyn Sender>,
    stopper: Stopper,
}

impl TxnCoordSenderFactory {
    pub fn new(
        config: TxnConfig,
        clock: Arc<Clock>,
        wrapped: Arc<dyn Sender>,
        stopper: Stopper,
    ) -> Arc<Self> {
        Arc::new(TxnCoordSenderFactory {
            config,
            clock,
            wrapped,
            stopper,
        })
    }

    #[inline]
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    #[inline]
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn sender(&self, kind: SenderKind) -> TxnSender {
        match kind {
            SenderKind::Root { txn, user_priority } => {
                TxnSender::Txn(self.root_txn_sender(txn, user_priority))
            }
            SenderKind::Leaf { meta } => TxnSender::Txn(self.leaf_txn_sender(meta)),
            SenderKind::NonTxn => TxnSender::NonTxn(self.non_txn_sender()),
        }
    }

    pub fn root_txn_sender(
        &self,
        txn: Transaction,
        user_priority: UserPriority,
    ) -> Arc<TxnCoordSender> {
        TxnCoordSender::new(
            TxnType::Root,
            self,
            TxnCoordState::new(TxnType::Root, txn, user_priority),
        )
    }

    /// Root coordinator of a brand new transaction.
    pub fn new_root(&self, name: &str, user_priority: UserPriority) -> Arc<TxnCoordSender> {
        let txn = Transaction::new(
            name,
            Key::new(),
            user_priority.make_priority(),
            self.clock.now(),
            self.clock.max_offset().as_nanos() as i64,
        );
        self.root_txn_sender(txn, user_priority)
    }

    pub fn leaf_txn_sender(&self, meta: TxnCoordMeta) -> Arc<TxnCoordSender> {
        let mut state =
            TxnCoordState::new(TxnType::Leaf, meta.txn.clone(), UserPriority::default());
        for stage in state.interceptors_mut() {
            stage.augment_meta(&meta);
        }
        TxnCoordSender::new(TxnType::Leaf, self, state)
    }

    pub fn non_txn_sender(&self) -> Arc<dyn Sender> {
        self.wrapped.clone()
    }
}
