//! Waits on conflicting locks, pushing their holders when the wait drags on.

use std::sync::{Arc, OnceLock};

use crate::concurrency::lock_table::{LockConflict, LockTable};
use crate::hlc::Timestamp;
use crate::kvpb::{
    LockUpdate, PushTxnType, Span, Transaction, TransactionStatus, TxnMeta,
    WaitPolicy,
};
use crate::utils::{Ctx, ErrorDetail, KvError};

use async_trait::async_trait;

use serde::Deserialize;

use tokio::time::{self, Duration};

/// Pushes transactions and resolves their intents; implemented by the
/// store's intent resolver.
#[async_trait]
pub trait IntentPusher: Send + Sync {
    async fn push_txn(
        &self,
        ctx: &Ctx,
        pusher: Option<&Transaction>,
        pushee: &TxnMeta,
        push_to: Timestamp,
        push_type: PushTxnType,
    ) -> Result<Transaction, KvError>;

    async fn resolve_intent(
        &self,
        ctx: &Ctx,
        update: LockUpdate,
    ) -> Result<(), KvError>;
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct LockWaitConfig {
    /// Wait this long on a lock before pushing its holder.
    pub push_delay_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for LockWaitConfig {
    fn default() -> Self {
        LockWaitConfig { push_delay_ms: 50 }
    }
}

/// What the waiting request looks like to a pusher.
#[derive(Debug, Clone)]
pub struct WaitingRequest {
    pub txn: Option<Transaction>,
    pub read_ts: Timestamp,
    pub wait_policy: WaitPolicy,
}

pub struct LockTableWaiter {
    config: LockWaitConfig,
    pusher: OnceLock<Arc<dyn IntentPusher>>,
}

impl LockTableWaiter {
    pub fn new(config: LockWaitConfig) -> Self {
        LockTableWaiter {
            config,
            pusher: OnceLock::new(),
        }
    }

    /// Installs the pusher; done once when the store starts.
    pub fn set_pusher(&self, pusher: Arc<dyn IntentPusher>) {
        let _ = self.pusher.set(pusher);
    }

    /// Waits until the conflicting lock is released, updated, or cleared
    /// by pushing its holder. `Ok(())` means the caller should re-sequence.
    pub async fn wait_on(
        &self,
        ctx: &Ctx,
        req: &WaitingRequest,
        lock_table: &LockTable,
        conflict: LockConflict,
    ) -> Result<(), KvError> {
        let LockConflict {
            intent,
            is_write,
            mut changed,
        } = conflict;

        if req.wait_policy == WaitPolicy::Error {
            // only proceed if the holder is already gone
            return match self
                .push(ctx, req, &intent.txn, PushTxnType::PushTouch)
                .await
            {
                Ok(pushee) => self.resolve(ctx, lock_table, &intent.key, pushee).await,
                Err(e) if matches!(e.detail, ErrorDetail::TransactionPush { .. }) => {
                    Err(KvError::new(ErrorDetail::LockConflict {
                        intents: vec![intent],
                    }))
                }
                Err(e) => Err(e),
            };
        }

        let push_type = if is_write {
            PushTxnType::PushAbort
        } else {
            PushTxnType::PushTimestamp
        };
        let delay = Duration::from_millis(self.config.push_delay_ms);
        loop {
            tokio::select! {
                res = changed.changed() => {
                    // released, updated, or the lock state went away
                    let _ = res;
                    return Ok(());
                }
                _ = time::sleep(delay) => {
                    match self.push(ctx, req, &intent.txn, push_type).await {
                        Ok(pushee) => {
                            return self
                                .resolve(ctx, lock_table, &intent.key, pushee)
                                .await;
                        }
                        Err(e) if matches!(e.detail, ErrorDetail::TransactionPush { .. }) => {
                            pf_trace!(ctx.tag(); "push of {} failed, keep waiting on {:?}",
                                                 intent.txn.id, intent.key);
                        }
                        Err(e) => return Err(e),
                    }
                }
                err = ctx.done() => return Err(err),
            }
        }
    }

    async fn push(
        &self,
        ctx: &Ctx,
        req: &WaitingRequest,
        pushee: &TxnMeta,
        push_type: PushTxnType,
    ) -> Result<Transaction, KvError> {
        let pusher = self
            .pusher
            .get()
            .ok_or_else(|| KvError::msg("lock table waiter has no pusher"))?;
        pusher
            .push_txn(ctx, req.txn.as_ref(), pushee, req.read_ts.next(), push_type)
            .await
    }

    /// Resolves the intent of a successfully pushed transaction and
    /// reflects the outcome in the lock table.
    async fn resolve(
        &self,
        ctx: &Ctx,
        lock_table: &LockTable,
        key: &crate::kvpb::Key,
        pushee: Transaction,
    ) -> Result<(), KvError> {
        let status = if pushee.status == TransactionStatus::Staging {
            TransactionStatus::Pending
        } else {
            pushee.status
        };
        let update = LockUpdate {
            span: Span::point(key.clone()),
            txn: pushee.meta.clone(),
            status,
            ignored_seq_ranges: pushee.ignored_seq_ranges.clone(),
        };
        if let Some(pusher) = self.pusher.get() {
            pusher.resolve_intent(ctx, update.clone()).await?;
        }
        lock_table.update_locks(&update);
        Ok(())
    }
}

#[cfg(test)]
mod lock_table_waiter_tests {
    use super::*;
    use crate::concurrency::spanset::{SpanAccess, SpanSet};
    use crate::kvpb::Intent;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Pusher that fails `fail_pushes` times, then aborts the pushee.
    struct TestPusher {
        fail_pushes: usize,
        pushes: AtomicUsize,
        resolved: AtomicUsize,
    }

    #[async_trait]
    impl IntentPusher for TestPusher {
        async fn push_txn(
            &self,
            _ctx: &Ctx,
            _pusher: Option<&Transaction>,
            pushee: &TxnMeta,
            _push_to: Timestamp,
            _push_type: PushTxnType,
        ) -> Result<Transaction, KvError> {
            let mut txn = Transaction::new("pushee", pushee.key.clone(), 1, pushee.write_timestamp, 0);
            txn.meta = pushee.clone();
            if self.pushes.fetch_add(1, Ordering::SeqCst) < self.fail_pushes {
                return Err(KvError::new(ErrorDetail::TransactionPush {
                    pushee: Box::new(txn),
                }));
            }
            txn.status = TransactionStatus::Aborted;
            Ok(txn)
        }

        async fn resolve_intent(&self, _ctx: &Ctx, _update: LockUpdate) -> Result<(), KvError> {
            self.resolved.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(fail_pushes: usize) -> (LockTable, LockTableWaiter, Arc<TestPusher>, TxnMeta) {
        let lt = LockTable::new();
        let holder = Transaction::new("h", Bytes::from("k"), 1, Timestamp::new(10, 0), 0).meta;
        lt.add_discovered(&[Intent {
            key: Bytes::from("k"),
            txn: holder.clone(),
        }]);
        let waiter = LockTableWaiter::new(LockWaitConfig { push_delay_ms: 5 });
        let pusher = Arc::new(TestPusher {
            fail_pushes,
            pushes: AtomicUsize::new(0),
            resolved: AtomicUsize::new(0),
        });
        waiter.set_pusher(pusher.clone());
        (lt, waiter, pusher, holder)
    }

    fn conflict(lt: &LockTable) -> LockConflict {
        let mut spans = SpanSet::new();
        spans.add_global(SpanAccess::ReadWrite, Span::point("k"));
        lt.scan_conflicts(None, Timestamp::new(20, 0), &spans).remove(0)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn push_after_delay() -> Result<(), KvError> {
        let (lt, waiter, pusher, _) = setup(2);
        let req = WaitingRequest {
            txn: None,
            read_ts: Timestamp::new(20, 0),
            wait_policy: WaitPolicy::Block,
        };
        let c = conflict(&lt);
        waiter.wait_on(&Ctx::background(), &req, &lt, c).await?;
        assert_eq!(pusher.pushes.load(Ordering::SeqCst), 3);
        assert_eq!(pusher.resolved.load(Ordering::SeqCst), 1);
        assert_eq!(lt.num_locks(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn error_policy_fails_fast() {
        let (lt, waiter, _, _) = setup(usize::MAX);
        let req = WaitingRequest {
            txn: None,
            read_ts: Timestamp::new(20, 0),
            wait_policy: WaitPolicy::Error,
        };
        let c = conflict(&lt);
        let err = waiter.wait_on(&Ctx::background(), &req, &lt, c).await.unwrap_err();
        assert!(matches!(err.detail, ErrorDetail::LockConflict { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn release_wakes_waiter() -> Result<(), KvError> {
        let (lt, waiter, pusher, holder) = setup(usize::MAX);
        let lt = Arc::new(lt);
        let req = WaitingRequest {
            txn: None,
            read_ts: Timestamp::new(20, 0),
            wait_policy: WaitPolicy::Block,
        };
        let c = conflict(&lt);
        let lt2 = lt.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(30)).await;
            lt2.update_locks(&LockUpdate {
                span: Span::point("k"),
                txn: holder,
                status: TransactionStatus::Committed,
                ignored_seq_ranges: vec![],
            });
        });
        waiter.wait_on(&Ctx::background(), &req, &lt, c).await?;
        assert_eq!(pusher.resolved.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
