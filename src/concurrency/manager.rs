//! Concurrency manager: sequences requests through latches and the lock
//! table.

use std::sync::Arc;

use crate::concurrency::latch::{LatchGuard, LatchManager};
use crate::concurrency::lock_table::LockTable;
use crate::concurrency::lock_table_waiter::{
    IntentPusher, LockTableWaiter, LockWaitConfig, WaitingRequest,
};
use crate::concurrency::spanset::SpanSet;
use crate::hlc::Timestamp;
use crate::kvpb::{Intent, Key, LockUpdate, RangeId, Transaction, TxnMeta, WaitPolicy};
use crate::utils::{Ctx, KvError};

/// A request as seen by the concurrency manager.
#[derive(Debug, Clone)]
pub struct ConcurrencyRequest {
    pub txn: Option<Transaction>,
    pub timestamp: Timestamp,
    pub wait_policy: WaitPolicy,
    pub latch_spans: SpanSet,
    pub lock_spans: SpanSet,
}

impl ConcurrencyRequest {
    fn waiting(&self) -> WaitingRequest {
        WaitingRequest {
            txn: self.txn.clone(),
            read_ts: self.timestamp,
            wait_policy: self.wait_policy,
        }
    }
}

/// Sequenced request. Holds its latches until finished or dropped.
pub struct Guard {
    pub req: ConcurrencyRequest,
    latches: Option<LatchGuard>,
}

impl Guard {
    /// Releases latches early, e.g. once a read has finished evaluating.
    pub fn release_latches(&mut self) {
        self.latches = None;
    }

    pub fn holds_latches(&self) -> bool {
        self.latches.is_some()
    }
}

/// Per-range concurrency manager. Knows only its range id; the replica
/// owning it drives every transition.
pub struct ConcurrencyManager {
    range_id: RangeId,
    latches: LatchManager,
    lock_table: LockTable,
    waiter: LockTableWaiter,
}

impl ConcurrencyManager {
    pub fn new(range_id: RangeId, config: LockWaitConfig) -> Self {
        ConcurrencyManager {
            range_id,
            latches: LatchManager::new(),
            lock_table: LockTable::new(),
            waiter: LockTableWaiter::new(config),
        }
    }

    pub fn set_pusher(&self, pusher: Arc<dyn IntentPusher>) {
        self.waiter.set_pusher(pusher);
    }

    /// Sequences a request: acquires its latches, then checks the lock
    /// table. On a conflicting lock the latches are dropped while waiting
    /// and the request is sequenced again.
    pub async fn sequence_req(
        &self,
        ctx: &Ctx,
        prev: Option<Guard>,
        req: ConcurrencyRequest,
    ) -> Result<Guard, KvError> {
        drop(prev);
        loop {
            let latches = self.latches.acquire(ctx, req.latch_spans.clone()).await?;
            if req.lock_spans.is_empty() || req.wait_policy == WaitPolicy::SkipLocked {
                return Ok(Guard {
                    req,
                    latches: Some(latches),
                });
            }

            let txn_id = req.txn.as_ref().map(|t| t.id());
            let mut conflicts =
                self.lock_table
                    .scan_conflicts(txn_id, req.timestamp, &req.lock_spans);
            if conflicts.is_empty() {
                return Ok(Guard {
                    req,
                    latches: Some(latches),
                });
            }
            drop(latches);

            let keys: Vec<Key> =
                conflicts.iter().map(|c| c.intent.key.clone()).collect();
            pf_debug!(ctx.tag(); "r{} waiting on {} lock(s), first {:?} held by {}",
                                 self.range_id, keys.len(), keys[0],
                                 conflicts[0].intent.txn.id);
            let res = self
                .waiter
                .wait_on(ctx, &req.waiting(), &self.lock_table, conflicts.remove(0))
                .await;
            self.lock_table.dequeue(txn_id, &keys);
            res?;
        }
    }

    /// Finishes a request, releasing whatever it still holds.
    pub fn finish_req(&self, guard: Guard) {
        drop(guard);
    }

    /// Handles intents discovered during evaluation: the request drops its
    /// latches and the locks become visible to the next sequencing.
    pub fn handle_writer_intent_error(&self, guard: Guard, intents: &[Intent]) -> ConcurrencyRequest {
        self.lock_table.add_discovered(intents);
        guard.req
    }

    pub fn on_lock_acquired(&self, key: Key, txn: &TxnMeta) {
        self.lock_table.acquire_lock(key, txn);
    }

    pub fn on_lock_updated(&self, update: &LockUpdate) {
        self.lock_table.update_locks(update);
    }

    /// Lease acquired or lost; lock knowledge from a previous term is
    /// unreliable either way.
    pub fn on_lease_updated(&self) {
        self.lock_table.clear();
    }

    pub fn on_range_split(&self) {
        self.lock_table.clear();
    }

    pub fn on_range_merge(&self) {
        self.lock_table.clear();
    }

    /// Keys in `span` locked by someone else; used to skip them under the
    /// skip-locked wait policy.
    pub fn locked_keys(&self, txn_id: Option<crate::kvpb::TxnId>, span: &crate::kvpb::Span) -> Vec<Key> {
        self.lock_table.locked_keys(txn_id, span)
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    pub fn latch_manager(&self) -> &LatchManager {
        &self.latches
    }
}

#[cfg(test)]
mod manager_tests {
    use super::*;
    use crate::concurrency::spanset::SpanAccess;
    use crate::kvpb::{Span, TransactionStatus};
    use bytes::Bytes;
    use tokio::time::{self, Duration};

    fn write_req(txn: Option<Transaction>, key: &'static str) -> ConcurrencyRequest {
        let mut spans = SpanSet::new();
        spans.add_global(SpanAccess::ReadWrite, Span::point(key));
        ConcurrencyRequest {
            txn,
            timestamp: Timestamp::new(10, 0),
            wait_policy: WaitPolicy::Block,
            latch_spans: spans.clone(),
            lock_spans: spans,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn guards_exclude_conflicting_latches() -> Result<(), KvError> {
        let cm = Arc::new(ConcurrencyManager::new(1, LockWaitConfig::default()));
        let ctx = Ctx::background();
        let g = cm.sequence_req(&ctx, None, write_req(None, "a")).await?;
        assert!(g.holds_latches());
        let cm2 = cm.clone();
        let second = tokio::spawn(async move {
            cm2.sequence_req(&Ctx::background(), None, write_req(None, "a"))
                .await
                .map(|_| ())
        });
        time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        cm.finish_req(g);
        second.await??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn discovered_lock_blocks_until_resolved() -> Result<(), KvError> {
        let cm = Arc::new(ConcurrencyManager::new(1, LockWaitConfig { push_delay_ms: 60_000 }));
        let ctx = Ctx::background();
        let holder = Transaction::new("h", Bytes::from("a"), 1, Timestamp::new(5, 0), 0);
        let g = cm.sequence_req(&ctx, None, write_req(None, "a")).await?;
        let req = cm.handle_writer_intent_error(
            g,
            &[Intent {
                key: Bytes::from("a"),
                txn: holder.meta.clone(),
            }],
        );
        let cm2 = cm.clone();
        let retry = tokio::spawn(async move {
            cm2.sequence_req(&Ctx::background(), None, req).await.map(|_| ())
        });
        time::sleep(Duration::from_millis(20)).await;
        assert!(!retry.is_finished());
        cm.on_lock_updated(&LockUpdate {
            span: Span::point("a"),
            txn: holder.meta.clone(),
            status: TransactionStatus::Aborted,
            ignored_seq_ranges: vec![],
        });
        retry.await??;
        // the holder's own requests never wait on its locks
        cm.on_lock_acquired(Bytes::from("a"), &holder.meta);
        let own = cm.sequence_req(&ctx, None, write_req(Some(holder), "a")).await?;
        cm.finish_req(own);
        Ok(())
    }
}
