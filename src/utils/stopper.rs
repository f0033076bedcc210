//! Lifecycle controller for long-running background tasks.

use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::utils::{KvError, MutexExt};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Stopper shared by all tasks of a node. Cheap to clone.
#[derive(Clone)]
pub struct Stopper {
    inner: Arc<StopperInner>,
}

struct StopperInner {
    /// Quiesce signal; flips to true exactly once.
    tx_quiesce: watch::Sender<bool>,

    /// Receiver side kept so new subscribers can be cloned from it.
    rx_quiesce: watch::Receiver<bool>,

    /// Join handles of spawned workers.
    workers: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Stopper {
    pub fn new() -> Self {
        let (tx_quiesce, rx_quiesce) = watch::channel(false);
        Stopper {
            inner: Arc::new(StopperInner {
                tx_quiesce,
                rx_quiesce,
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    pub fn is_quiescing(&self) -> bool {
        *self.inner.rx_quiesce.borrow()
    }

    /// Returns a receiver to `select!` on; it flips to true on quiesce.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.rx_quiesce.clone()
    }

    /// Waits until the stopper starts quiescing.
    pub async fn quiesced(&self) {
        let mut rx = self.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Spawns a named worker task tracked by the stopper. Refuses new
    /// workers once quiescing has started.
    pub fn run_worker<F>(&self, name: &str, fut: F) -> Result<(), KvError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_quiescing() {
            return Err(KvError::unavailable(format!(
                "node stopping, refused worker '{}'",
                name
            )));
        }
        let handle = tokio::spawn(fut);
        let mut workers = self.inner.workers.locked();
        workers.retain(|(_, h)| !h.is_finished());
        workers.push((name.into(), handle));
        Ok(())
    }

    /// Signals quiesce and waits (bounded) for workers to wind down; the
    /// stragglers are aborted.
    pub async fn stop(&self) {
        let _ = self.inner.tx_quiesce.send(true);
        let workers: Vec<_> = self.inner.workers.locked().drain(..).collect();
        for (name, mut handle) in workers {
            if time::timeout(Duration::from_secs(2), &mut handle)
                .await
                .is_err()
            {
                pf_warn!("stopper"; "worker '{}' did not quiesce, aborting", name);
                handle.abort();
            }
        }
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod stopper_tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_sees_quiesce() -> Result<(), KvError> {
        let stopper = Stopper::new();
        let flag = Arc::new(AtomicBool::new(false));
        let (s, f) = (stopper.clone(), flag.clone());
        stopper.run_worker("test", async move {
            s.quiesced().await;
            f.store(true, Ordering::SeqCst);
        })?;
        assert!(!stopper.is_quiescing());
        stopper.stop().await;
        assert!(flag.load(Ordering::SeqCst));
        assert!(stopper.run_worker("late", async {}).is_err());
        Ok(())
    }
}
