//! Bounded token pool with FIFO waiters.
//!
//! The leaseholder of a range acquires quota for the byte size of every
//! proposal and returns it once the command applies, bounding the data in
//! flight through consensus.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::utils::{Ctx, KvError, MutexExt};

use tokio::sync::oneshot;

/// A queued acquisition.
struct Waiter {
    id: u64,
    need: u64,
    tx: oneshot::Sender<Result<(), KvError>>,
}

struct PoolState {
    /// Tokens currently available.
    available: u64,

    /// Capacity; `available` never exceeds it.
    max: u64,

    /// Set by `close()`; all later acquisitions fail.
    closed: bool,

    /// FIFO queue of blocked acquisitions.
    waiters: VecDeque<Waiter>,

    next_waiter_id: u64,
}

/// Grants queued waiters in order while the head one fits.
fn wake_waiters(state: &mut PoolState) {
    while let Some(front) = state.waiters.front() {
        if front.need > state.available {
            break;
        }
        let waiter = match state.waiters.pop_front() {
            Some(w) => w,
            None => break,
        };
        state.available -= waiter.need;
        if waiter.tx.send(Ok(())).is_err() {
            // receiver gone; return its share
            state.available += waiter.need;
        }
    }
}

/// Bounded counting pool. Acquisitions larger than the capacity are clamped
/// to it so they can eventually succeed.
pub struct QuotaPool {
    name: String,
    state: Mutex<PoolState>,
}

impl QuotaPool {
    pub fn new(name: impl Into<String>, max: u64) -> Self {
        QuotaPool {
            name: name.into(),
            state: Mutex::new(PoolState {
                available: max,
                max,
                closed: false,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
        }
    }

    /// Blocks until `n` tokens (clamped to capacity) are available, the pool
    /// is closed, or the context is done. Returns the amount acquired, which
    /// the caller must eventually `add()` back.
    pub async fn acquire(&self, ctx: &Ctx, n: u64) -> Result<u64, KvError> {
        ctx.check()?;
        let (id, need, rx) = {
            let mut state = self.state.locked();
            if state.closed {
                return Err(self.closed_err());
            }
            let need = n.min(state.max);
            if state.waiters.is_empty() && state.available >= need {
                state.available -= need;
                return Ok(need);
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, need, tx });
            (id, need, rx)
        };

        tokio::select! {
            res = rx => match res {
                Ok(Ok(())) => Ok(need),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(self.closed_err()),
            },
            err = ctx.done() => {
                let mut state = self.state.locked();
                let before = state.waiters.len();
                state.waiters.retain(|w| w.id != id);
                if state.waiters.len() == before {
                    // granted concurrently with cancellation; give it back
                    state.available = (state.available + need).min(state.max);
                }
                // waiters queued behind us may fit now
                wake_waiters(&mut state);
                Err(err)
            }
        }
    }

    /// Acquires without blocking; returns false if it would block.
    pub fn try_acquire(&self, n: u64) -> bool {
        let mut state = self.state.locked();
        let need = n.min(state.max);
        if state.closed || !state.waiters.is_empty() || state.available < need
        {
            return false;
        }
        state.available -= need;
        true
    }

    /// Returns tokens to the pool, capped at capacity, and wakes as many
    /// queued waiters (in order) as now fit.
    pub fn add(&self, n: u64) {
        let mut state = self.state.locked();
        state.available = (state.available + n).min(state.max);
        wake_waiters(&mut state);
    }

    /// Closes the pool, failing every current and future waiter.
    pub fn close(&self, reason: &str) {
        let mut state = self.state.locked();
        if state.closed {
            return;
        }
        state.closed = true;
        pf_debug!(self.name; "quota pool closed: {}", reason);
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(KvError::unavailable(format!(
                "quota pool {} closed: {}",
                self.name, reason
            ))));
        }
    }

    /// Tokens currently available, for introspection.
    pub fn approximate_quota(&self) -> u64 {
        self.state.locked().available
    }

    pub fn capacity(&self) -> u64 {
        self.state.locked().max
    }

    pub fn num_waiters(&self) -> usize {
        self.state.locked().waiters.len()
    }

    fn closed_err(&self) -> KvError {
        KvError::unavailable(format!("quota pool {} closed", self.name))
    }
}

#[cfg(test)]
mod quotapool_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{self, Duration};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn acquire_release() -> Result<(), KvError> {
        let pool = QuotaPool::new("test", 100);
        let ctx = Ctx::background();
        assert_eq!(pool.acquire(&ctx, 60).await?, 60);
        assert_eq!(pool.approximate_quota(), 40);
        pool.add(60);
        assert_eq!(pool.approximate_quota(), 100);
        pool.add(50);
        assert_eq!(pool.approximate_quota(), 100);
        // oversized requests are clamped
        assert_eq!(pool.acquire(&ctx, 500).await?, 100);
        assert_eq!(pool.approximate_quota(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocks_until_released() -> Result<(), KvError> {
        let pool = Arc::new(QuotaPool::new("test", 10));
        let ctx = Ctx::background();
        pool.acquire(&ctx, 10).await?;
        let p = pool.clone();
        let waiter =
            tokio::spawn(async move { p.acquire(&Ctx::background(), 4).await });
        time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        pool.add(4);
        assert_eq!(waiter.await.unwrap()?, 4);
        assert_eq!(pool.approximate_quota(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn coalesces_small_waiters_fifo() -> Result<(), KvError> {
        let pool = Arc::new(QuotaPool::new("test", 10));
        pool.acquire(&Ctx::background(), 10).await?;
        let mut handles = Vec::new();
        for need in [3u64, 3, 6] {
            let p = pool.clone();
            handles.push(tokio::spawn(async move {
                p.acquire(&Ctx::background(), need).await
            }));
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.num_waiters(), 3);
        pool.add(7);
        time::sleep(Duration::from_millis(20)).await;
        // the two 3-token waiters fit, the 6-token one keeps waiting
        assert!(handles[0].is_finished());
        assert!(handles[1].is_finished());
        assert!(!handles[2].is_finished());
        assert_eq!(pool.approximate_quota(), 1);
        pool.add(6);
        let last = handles.pop().unwrap();
        assert_eq!(last.await.unwrap()?, 6);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_unblocks_waiters() -> Result<(), KvError> {
        let pool = Arc::new(QuotaPool::new("test", 1));
        pool.acquire(&Ctx::background(), 1).await?;
        let p = pool.clone();
        let waiter =
            tokio::spawn(async move { p.acquire(&Ctx::background(), 1).await });
        time::sleep(Duration::from_millis(10)).await;
        pool.close("shutdown");
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_unavailable());
        assert!(pool.acquire(&Ctx::background(), 1).await.unwrap_err().is_unavailable());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_leaves_queue() -> Result<(), KvError> {
        let pool = Arc::new(QuotaPool::new("test", 1));
        pool.acquire(&Ctx::background(), 1).await?;
        let (ctx, handle) = Ctx::background().with_cancel();
        let p = pool.clone();
        let waiter = tokio::spawn(async move { p.acquire(&ctx, 1).await });
        time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        assert!(waiter.await.unwrap().unwrap_err().is_ctx_err());
        assert_eq!(pool.num_waiters(), 0);
        pool.add(1);
        assert_eq!(pool.approximate_quota(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_head_wakes_next() -> Result<(), KvError> {
        let pool = Arc::new(QuotaPool::new("test", 10));
        pool.acquire(&Ctx::background(), 10).await?;
        let (ctx, handle) = Ctx::background().with_cancel();
        let p = pool.clone();
        let big = tokio::spawn(async move { p.acquire(&ctx, 8).await });
        time::sleep(Duration::from_millis(10)).await;
        let p = pool.clone();
        let small =
            tokio::spawn(async move { p.acquire(&Ctx::background(), 2).await });
        time::sleep(Duration::from_millis(10)).await;

        // 3 tokens: not enough for the head, which blocks the small one
        pool.add(3);
        time::sleep(Duration::from_millis(20)).await;
        assert!(!small.is_finished());

        handle.cancel();
        assert!(big.await.unwrap().unwrap_err().is_ctx_err());
        let got = time::timeout(Duration::from_secs(1), small).await;
        assert_eq!(got.unwrap().unwrap()?, 2);
        assert_eq!(pool.approximate_quota(), 1);
        assert_eq!(pool.num_waiters(), 0);
        Ok(())
    }
}
