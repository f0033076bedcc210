//! Request context carrying cancellation, an optional deadline, and tags.
//!
//! Cancellation is a `watch` flag. A derived context keeps every ancestor's
//! flag so cancelling any of them cancels the child as well.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::utils::{ErrorDetail, KvError};

use futures::future::{self, FutureExt};

use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

/// Request context. Cheap to clone.
#[derive(Clone)]
pub struct Ctx {
    /// Cancel flags of this context and all its ancestors.
    cancels: Arc<Vec<watch::Receiver<bool>>>,

    /// Earliest deadline along the ancestor chain.
    deadline: Option<Instant>,

    /// True if the request entered through the loopback connection.
    local_request: bool,

    /// Log tag, e.g. "n1,r7".
    tag: Arc<str>,
}

/// Handle cancelling the context it was created with.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl Ctx {
    /// Root context that is never cancelled.
    pub fn background() -> Self {
        Ctx {
            cancels: Arc::new(Vec::new()),
            deadline: None,
            local_request: false,
            tag: Arc::from(""),
        }
    }

    /// Derives a cancellable child context.
    pub fn with_cancel(&self) -> (Ctx, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut cancels = (*self.cancels).clone();
        cancels.push(rx);
        let child = Ctx {
            cancels: Arc::new(cancels),
            ..self.clone()
        };
        (child, CancelHandle(tx))
    }

    /// Derives a child context expiring at the given instant.
    pub fn with_deadline(&self, deadline: Instant) -> Ctx {
        let mut child = self.clone();
        child.deadline = Some(match self.deadline {
            Some(d) if d < deadline => d,
            _ => deadline,
        });
        child
    }

    pub fn with_timeout(&self, dur: Duration) -> Ctx {
        self.with_deadline(Instant::now() + dur)
    }

    /// Marks the context as having arrived over the loopback connection.
    pub fn with_local_request(&self) -> Ctx {
        let mut child = self.clone();
        child.local_request = true;
        child
    }

    /// Appends a log tag.
    pub fn with_tag(&self, tag: impl fmt::Display) -> Ctx {
        let mut child = self.clone();
        child.tag = if self.tag.is_empty() {
            Arc::from(tag.to_string())
        } else {
            Arc::from(format!("{},{}", self.tag, tag))
        };
        child
    }

    #[inline]
    pub fn is_local_request(&self) -> bool {
        self.local_request
    }

    #[inline]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// False for contexts that can never be done, such as the background one.
    pub fn can_finish(&self) -> bool {
        !self.cancels.is_empty() || self.deadline.is_some()
    }

    /// Returns the cancellation error if the context is done.
    pub fn err(&self) -> Option<KvError> {
        if self.cancels.iter().any(|rx| *rx.borrow()) {
            return Some(KvError::new(ErrorDetail::Canceled));
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => {
                Some(KvError::new(ErrorDetail::DeadlineExceeded))
            }
            _ => None,
        }
    }

    /// `Ok(())` unless the context is done.
    pub fn check(&self) -> Result<(), KvError> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Waits until the context is cancelled or its deadline passes, then
    /// returns the corresponding error.
    pub async fn done(&self) -> KvError {
        let mut waits: Vec<future::BoxFuture<'static, KvError>> = self
            .cancels
            .iter()
            .cloned()
            .map(|mut rx| {
                async move {
                    loop {
                        if *rx.borrow() {
                            return KvError::new(ErrorDetail::Canceled);
                        }
                        if rx.changed().await.is_err() {
                            // handle dropped without cancelling
                            future::pending::<()>().await;
                        }
                    }
                }
                .boxed()
            })
            .collect();
        if let Some(d) = self.deadline {
            waits.push(
                async move {
                    time::sleep_until(d).await;
                    KvError::new(ErrorDetail::DeadlineExceeded)
                }
                .boxed(),
            );
        }
        if waits.is_empty() {
            future::pending::<()>().await;
        }
        future::select_all(waits).await.0
    }

    /// Runs the future to completion unless the context finishes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, KvError>
    where
        F: Future<Output = Result<T, KvError>>,
    {
        self.check()?;
        tokio::select! {
            res = fut => res,
            err = self.done() => Err(err),
        }
    }
}

impl fmt::Debug for Ctx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("tag", &self.tag)
            .field("deadline", &self.deadline)
            .field("local_request", &self.local_request)
            .finish()
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod context_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_propagates_to_child() {
        let (parent, handle) = Ctx::background().with_cancel();
        let (child, _child_handle) = parent.with_cancel();
        assert!(child.err().is_none());
        handle.cancel();
        assert_eq!(child.err(), Some(KvError::new(ErrorDetail::Canceled)));
        assert_eq!(child.done().await, KvError::new(ErrorDetail::Canceled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_fires() {
        let ctx = Ctx::background().with_timeout(Duration::from_millis(30));
        let err = ctx.done().await;
        assert!(matches!(err.detail, ErrorDetail::DeadlineExceeded));
        assert!(ctx.check().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_interrupted() {
        let (ctx, handle) = Ctx::background().with_cancel();
        let waiter = tokio::spawn(async move {
            ctx.run(async {
                time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
        });
        time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let res = waiter.await.unwrap();
        assert!(res.unwrap_err().is_ctx_err());
    }

    #[test]
    fn tags_and_local() {
        let ctx = Ctx::background().with_tag("n1").with_tag("r7");
        assert_eq!(ctx.tag(), "n1,r7");
        assert!(!ctx.is_local_request());
        assert!(ctx.with_local_request().is_local_request());
    }
}
