//! Latch manager: key-range read/write latches serializing overlapping
//! requests for the duration of evaluation (and replication, for writes).
//!
//! Each acquisition is assigned a sequence number under the manager mutex
//! and waits for every earlier, still-held acquisition whose spans conflict
//! with its own. Latches are in-memory only and never outlive a request.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::concurrency::spanset::SpanSet;
use crate::utils::{Ctx, KvError, MutexExt};

use tokio::sync::watch;

struct LatchEntry {
    spans: SpanSet,
    done: watch::Sender<bool>,
}

#[derive(Default)]
struct LatchState {
    next_seq: u64,
    held: BTreeMap<u64, LatchEntry>,
}

/// Latch manager of a replica. Cheap to clone.
#[derive(Clone, Default)]
pub struct LatchManager {
    state: Arc<Mutex<LatchState>>,
}

/// Held latches; released on drop.
pub struct LatchGuard {
    state: Arc<Mutex<LatchState>>,
    seq: u64,
}

impl LatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the request's latches and returns the receivers of every
    /// earlier conflicting acquisition.
    fn sequence(&self, spans: SpanSet) -> (LatchGuard, Vec<watch::Receiver<bool>>) {
        let mut state = self.state.locked();
        let seq = state.next_seq;
        state.next_seq += 1;
        let prereqs = state
            .held
            .values()
            .filter(|e| e.spans.conflicts_with(&spans))
            .map(|e| e.done.subscribe())
            .collect();
        let (done, _) = watch::channel(false);
        state.held.insert(seq, LatchEntry { spans, done });
        (
            LatchGuard {
                state: self.state.clone(),
                seq,
            },
            prereqs,
        )
    }

    /// Acquires latches over `spans`, waiting for conflicting earlier
    /// holders. On cancellation the partially-sequenced latches are
    /// released so later requests are not held up.
    pub async fn acquire(
        &self,
        ctx: &Ctx,
        spans: SpanSet,
    ) -> Result<LatchGuard, KvError> {
        ctx.check()?;
        let (guard, prereqs) = self.sequence(spans);
        for mut rx in prereqs {
            // dropping `guard` on the error path releases our entry
            ctx.run(async {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                Ok(())
            })
            .await?;
        }
        Ok(guard)
    }

    /// Acquires without waiting; returns `None` on conflict.
    pub fn try_acquire(&self, spans: SpanSet) -> Option<LatchGuard> {
        let (guard, prereqs) = self.sequence(spans);
        if prereqs.iter().all(|rx| *rx.borrow()) {
            Some(guard)
        } else {
            None
        }
    }

    /// Number of held (or waiting) latch acquisitions.
    pub fn num_held(&self) -> usize {
        self.state.locked().held.len()
    }
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.state.locked().held.remove(&self.seq) {
            let _ = entry.done.send(true);
        }
    }
}

#[cfg(test)]
mod latch_tests {
    use super::*;
    use crate::concurrency::spanset::SpanAccess;
    use crate::kvpb::Span;
    use tokio::time::{self, Duration};

    fn spans(access: SpanAccess, span: Span) -> SpanSet {
        let mut s = SpanSet::new();
        s.add_global(access, span);
        s
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_share() -> Result<(), KvError> {
        let lm = LatchManager::new();
        let ctx = Ctx::background();
        let _g1 = lm.acquire(&ctx, spans(SpanAccess::ReadOnly, Span::range("a", "c"))).await?;
        let _g2 = lm.acquire(&ctx, spans(SpanAccess::ReadOnly, Span::point("b"))).await?;
        assert_eq!(lm.num_held(), 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writer_waits_for_reader() -> Result<(), KvError> {
        let lm = LatchManager::new();
        let ctx = Ctx::background();
        let g1 = lm.acquire(&ctx, spans(SpanAccess::ReadOnly, Span::point("k"))).await?;
        let lm2 = lm.clone();
        let waiter = tokio::spawn(async move {
            let ctx = Ctx::background();
            lm2.acquire(&ctx, spans(SpanAccess::ReadWrite, Span::point("k")))
                .await
                .map(|_| ())
        });
        time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        drop(g1);
        waiter.await??;
        assert_eq!(lm.num_held(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_releases_queue_slot() -> Result<(), KvError> {
        let lm = LatchManager::new();
        let ctx = Ctx::background();
        let g1 = lm.acquire(&ctx, spans(SpanAccess::ReadWrite, Span::point("k"))).await?;
        let short = ctx.with_timeout(Duration::from_millis(20));
        let err = lm
            .acquire(&short, spans(SpanAccess::ReadWrite, Span::point("k")))
            .await
            .err()
            .map(|e| e.is_ctx_err());
        assert_eq!(err, Some(true));
        assert_eq!(lm.num_held(), 1);
        drop(g1);
        assert!(lm
            .try_acquire(spans(SpanAccess::ReadWrite, Span::point("k")))
            .is_some());
        Ok(())
    }

    #[test]
    fn disjoint_writers() {
        let lm = LatchManager::new();
        let g1 = lm.try_acquire(spans(SpanAccess::ReadWrite, Span::point("a")));
        let g2 = lm.try_acquire(spans(SpanAccess::ReadWrite, Span::point("b")));
        assert!(g1.is_some() && g2.is_some());
        assert!(lm
            .try_acquire(spans(SpanAccess::ReadWrite, Span::range("a", "z")))
            .is_none());
    }
}
