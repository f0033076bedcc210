//! Base replica queue: a prioritized set of ranges processed one at a time
//! by a background worker, with a purgatory for ranges whose processing
//! failed for a reason that only time can fix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::hlc::Timestamp;
use crate::kvpb::RangeId;
use crate::storage::replica::Replica;
use crate::storage::stateloader::set_queue_last_processed;
use crate::storage::store::Store;
use crate::utils::{Ctx, ErrorDetail, KvError, MutexExt, Stopper};

use async_trait::async_trait;

use serde::Deserialize;

use tokio::sync::Notify;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Invoked once with the outcome of processing the range.
pub type ProcessCallback = Box<dyn FnOnce(Result<(), KvError>) + Send>;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Period of the store's replica scanner.
    pub scan_interval_ms: u64,

    /// Retry period of ranges in purgatory.
    pub purgatory_interval_ms: u64,

    /// Timeout of processing a single range.
    pub process_timeout_ms: u64,

    /// Ranges beyond this many are not queued.
    pub max_size: usize,

    pub split_enabled: bool,
    pub merge_enabled: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            scan_interval_ms: 1000,
            purgatory_interval_ms: 60_000,
            process_timeout_ms: 60_000,
            max_size: 10_000,
            split_enabled: true,
            merge_enabled: true,
        }
    }
}

/// What a concrete queue decides and does.
#[async_trait]
pub trait QueueImpl: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the replica should be queued, and at which priority.
    fn should_queue(&self, now: Timestamp, repl: &Replica) -> (bool, f64);

    /// Processes the replica; returns true if it did any work.
    async fn process(&self, ctx: &Ctx, repl: &Arc<Replica>) -> Result<bool, KvError>;

    /// Failures that send the replica to purgatory instead of dropping it.
    fn is_purgatory_error(&self, _err: &KvError) -> bool {
        false
    }
}

struct QueueItem {
    priority: f64,
    seq: u64,
    processing: bool,

    /// Added again while being processed.
    requeue: bool,
    callbacks: Vec<ProcessCallback>,
}

#[derive(Default)]
struct QueueState {
    items: HashMap<RangeId, QueueItem>,
    purgatory: HashMap<RangeId, String>,
    next_seq: u64,
}

impl QueueState {
    /// Highest priority idle item; ties go to the oldest.
    fn pop(&mut self) -> Option<RangeId> {
        let range_id = self
            .items
            .iter()
            .filter(|(_, it)| !it.processing)
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .total_cmp(&b.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(id, _)| *id)?;
        if let Some(item) = self.items.get_mut(&range_id) {
            item.processing = true;
        }
        Some(range_id)
    }
}

pub struct BaseQueue {
    imp: Arc<dyn QueueImpl>,
    tag: String,
    config: QueueConfig,
    enabled: bool,
    store: Weak<Store>,

    mu: Mutex<QueueState>,
    notify: Notify,
}

impl BaseQueue {
    pub fn new(
        imp: Arc<dyn QueueImpl>,
        config: QueueConfig,
        enabled: bool,
        store: Weak<Store>,
        store_tag: &str,
    ) -> Arc<Self> {
        Arc::new(BaseQueue {
            tag: format!("{},{}q", store_tag, imp.name()),
            imp,
            config,
            enabled,
            store,
            mu: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.imp.name()
    }

    /// Number of queued or in-process ranges.
    pub fn len(&self) -> usize {
        self.mu.locked().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_purgatory(&self, range_id: RangeId) -> bool {
        self.mu.locked().purgatory.contains_key(&range_id)
    }

    pub fn purgatory_len(&self) -> usize {
        self.mu.locked().purgatory.len()
    }

    /// Whether the queue wants the replica, and at which priority.
    pub fn should_queue(&self, repl: &Replica, now: Timestamp) -> (bool, f64) {
        self.imp.should_queue(now, repl)
    }

    /// Processes the replica right away, bypassing the queue and its
    /// enablement. Unless `skip_should_queue`, a replica the queue does not
    /// want is left alone. Returns true if any work was done.
    pub async fn manually_process(
        &self,
        ctx: &Ctx,
        repl: &Arc<Replica>,
        skip_should_queue: bool,
    ) -> Result<bool, KvError> {
        if !skip_should_queue {
            let now = repl.store()?.clock().now();
            if !self.imp.should_queue(now, repl).0 {
                pf_debug!(self.tag; "r{} not wanted", repl.range_id());
                return Ok(false);
            }
        }
        self.imp.process(ctx, repl).await
    }

    /// Queues the replica if the queue wants it.
    pub fn maybe_add(&self, repl: &Replica, now: Timestamp) {
        if !self.enabled || self.in_purgatory(repl.range_id()) {
            return;
        }
        let (should, priority) = self.imp.should_queue(now, repl);
        if should {
            self.add(repl.range_id(), priority);
        }
    }

    /// Queues a range at `priority`, raising the priority of an already
    /// queued one. Returns false if the queue is full or disabled.
    pub fn add(&self, range_id: RangeId, priority: f64) -> bool {
        if !self.enabled {
            return false;
        }
        let mut mu = self.mu.locked();
        if let Some(item) = mu.items.get_mut(&range_id) {
            if item.processing {
                item.requeue = true;
            }
            if priority > item.priority {
                item.priority = priority;
            }
            return true;
        }
        if mu.items.len() >= self.config.max_size {
            return false;
        }
        let seq = mu.next_seq;
        mu.next_seq += 1;
        mu.items.insert(
            range_id,
            QueueItem {
                priority,
                seq,
                processing: false,
                requeue: false,
                callbacks: Vec::new(),
            },
        );
        drop(mu);
        pf_trace!(self.tag; "queued r{} at priority {:.2}", range_id, priority);
        self.notify.notify_one();
        true
    }

    /// Registers `cb` to run when the queued or in-process range finishes.
    /// Returns false, dropping `cb`, if the range is not in the queue or
    /// sits in purgatory.
    pub fn maybe_add_callback(&self, range_id: RangeId, cb: ProcessCallback) -> bool {
        let mut mu = self.mu.locked();
        if mu.purgatory.contains_key(&range_id) {
            return false;
        }
        match mu.items.get_mut(&range_id) {
            Some(item) => {
                item.callbacks.push(cb);
                true
            }
            None => false,
        }
    }

    /// Spawns the processing worker and the purgatory loop.
    pub fn start(self: &Arc<Self>, stopper: &Stopper) -> Result<(), KvError> {
        if !self.enabled {
            pf_debug!(self.tag; "queue disabled");
            return Ok(());
        }
        let me = self.clone();
        let mut rx_quiesce = stopper.subscribe();
        stopper.run_worker(&format!("{}-worker", self.tag), async move {
            loop {
                loop {
                    let next = me.mu.locked().pop();
                    match next {
                        Some(range_id) => me.process_range(range_id).await,
                        None => break,
                    }
                }
                tokio::select! {
                    _ = me.notify.notified() => {},
                    _ = rx_quiesce.changed() => break,
                }
            }
            pf_debug!(me.tag; "queue worker exited");
        })?;

        let me = self.clone();
        let mut rx_quiesce = stopper.subscribe();
        stopper.run_worker(&format!("{}-purgatory", self.tag), async move {
            let period = Duration::from_millis(me.config.purgatory_interval_ms);
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => me.process_purgatory().await,
                    _ = rx_quiesce.changed() => break,
                }
            }
        })
    }

    /// Retries every range in purgatory once.
    async fn process_purgatory(&self) {
        let ids: Vec<RangeId> = {
            let mut mu = self.mu.locked();
            let ids: Vec<RangeId> = mu.purgatory.drain().map(|(id, _)| id).collect();
            for id in &ids {
                let seq = mu.next_seq;
                mu.next_seq += 1;
                mu.items.entry(*id).or_insert(QueueItem {
                    priority: 0.0,
                    seq,
                    processing: true,
                    requeue: false,
                    callbacks: Vec::new(),
                });
            }
            ids
        };
        if !ids.is_empty() {
            pf_debug!(self.tag; "retrying {} range(s) from purgatory", ids.len());
        }
        for id in ids {
            self.process_range(id).await;
        }
    }

    /// Processes one range popped from the queue and settles its item.
    async fn process_range(&self, range_id: RangeId) {
        let res = self.process_replica(range_id).await;

        let (callbacks, requeue) = {
            let mut mu = self.mu.locked();
            let item = match mu.items.remove(&range_id) {
                Some(item) => item,
                None => return,
            };
            if let Err(e) = &res {
                if self.imp.is_purgatory_error(e) {
                    pf_info!(self.tag; "r{} entered purgatory: {}", range_id, e);
                    mu.purgatory.insert(range_id, e.to_string());
                }
            }
            (item.callbacks, item.requeue.then_some(item.priority))
        };
        for cb in callbacks {
            cb(res.clone());
        }
        if let Some(priority) = requeue {
            if !self.in_purgatory(range_id) {
                self.add(range_id, priority);
            }
        }
    }

    async fn process_replica(&self, range_id: RangeId) -> Result<(), KvError> {
        let store = self
            .store
            .upgrade()
            .ok_or_else(|| KvError::unavailable("store is shut down"))?;
        let repl = store.get_replica(range_id).ok_or_else(|| {
            KvError::new(ErrorDetail::RangeNotFound {
                range_id,
                store_id: store.ident().store_id,
            })
        })?;
        let ctx = Ctx::background()
            .with_tag(repl.tag())
            .with_timeout(Duration::from_millis(self.config.process_timeout_ms));

        // only the leaseholder processes a range
        match repl.redirect_or_acquire_lease(&ctx).await {
            Ok(_) => {}
            Err(KvError {
                detail: ErrorDetail::NotLeaseHolder { .. },
                ..
            }) => {
                pf_trace!(self.tag; "r{} skipped, not leaseholder", range_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let start_key = repl.desc()?.start_key;
        let now = store.clock().now();
        match self.imp.process(&ctx, &repl).await {
            Ok(true) => {
                if let Err(e) = set_queue_last_processed(store.engine(), self.name(), &start_key, now) {
                    pf_warn!(self.tag; "error saving last processed of r{}: {}", range_id, e);
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                if !self.imp.is_purgatory_error(&e) {
                    pf_warn!(self.tag; "error processing r{}: {}", range_id, e);
                }
                Err(e)
            }
        }
    }
}
