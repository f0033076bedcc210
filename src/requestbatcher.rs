//! Request batcher: coalesces single requests bound for the same range into
//! batches. A batch is sent when it is full, when it sat idle for too long,
//! when its oldest request waited for too long, or when the batcher stops.
//!
//! All batching decisions are made by one run-loop task; batches are sent
//! by short-lived tasks so that a slow range never holds up the others.

use std::collections::HashMap;
use std::sync::Arc;

use crate::kv::Sender;
use crate::kvpb::{BatchRequest, Header, RangeId, Request, Response};
use crate::utils::{Ctx, ErrorDetail, KvError, Stopper, Timer};

use serde::Deserialize;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};

/// Outcome of one batched request.
pub type BatchedResult = Result<Response, KvError>;

/// Clock used for batch deadlines.
pub type NowFn = Arc<dyn Fn() -> Instant + Send + Sync>;

/// Limit on in-flight batches used when none is configured.
const DEFAULT_IN_FLIGHT_BACKPRESSURE_LIMIT: usize = 1000;

/// Fraction of the in-flight limit below which blocked senders resume.
const BACKPRESSURE_RECOVERY_FRACTION: f64 = 0.8;

/// Configuration parameters struct.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatcherConfig {
    /// Longest time a partial batch may sit without receiving a request.
    /// Zero disables the idle trigger.
    pub max_idle_ms: u64,

    /// Longest time any request may wait in a batch. Zero disables the
    /// wait trigger.
    pub max_wait_ms: u64,

    /// Batch size that triggers an immediate send. Zero means unlimited.
    pub max_msgs_per_batch: usize,

    /// Number of in-flight batches at which new requests block. Zero picks
    /// the default.
    pub in_flight_backpressure_limit: usize,
}

impl BatcherConfig {
    fn backpressure_limit(&self) -> usize {
        if self.in_flight_backpressure_limit == 0 {
            DEFAULT_IN_FLIGHT_BACKPRESSURE_LIMIT
        } else {
            self.in_flight_backpressure_limit
        }
    }

    /// In-flight count below which a backpressured batcher accepts
    /// requests again.
    fn backpressure_recovery(&self) -> usize {
        (self.backpressure_limit() as f64 * BACKPRESSURE_RECOVERY_FRACTION) as usize
    }
}

/// Everything a batcher is built from.
pub struct BatcherOptions {
    pub name: String,
    pub config: BatcherConfig,
    pub sender: Option<Arc<dyn Sender>>,
    pub stopper: Option<Stopper>,

    /// Defaults to `Instant::now`.
    pub now_fn: Option<NowFn>,
}

/// A request waiting in a batch.
struct PendingRequest {
    ctx: Ctx,
    range_id: RangeId,
    req: Request,
    tx_resp: mpsc::Sender<BatchedResult>,

    /// Assigned by the run loop on arrival.
    id: u64,
    added: Instant,

    /// Task reporting the context's cancellation to the run loop.
    watcher: Option<AbortHandle>,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Hands `res` to the waiter without blocking the run loop; a full
/// response channel is waited on by a separate task.
fn deliver(tx_resp: &mpsc::Sender<BatchedResult>, res: BatchedResult) {
    if let Err(mpsc::error::TrySendError::Full(res)) = tx_resp.try_send(res) {
        let tx_resp = tx_resp.clone();
        tokio::spawn(async move {
            let _ = tx_resp.send(res).await;
        });
    }
}

struct Batch {
    reqs: Vec<PendingRequest>,
    start: Instant,
    last_updated: Instant,
    deadline: Option<Instant>,
}

impl Batch {
    fn new(now: Instant) -> Self {
        Batch {
            reqs: Vec::new(),
            start: now,
            last_updated: now,
            deadline: None,
        }
    }

    /// Drops the request with the given id; returns it if it was here.
    fn remove(&mut self, id: u64, config: &BatcherConfig) -> Option<PendingRequest> {
        let pos = self.reqs.iter().position(|p| p.id == id)?;
        let removed = self.reqs.remove(pos);
        if let Some(first) = self.reqs.first() {
            self.start = first.added;
        }
        self.update_deadline(config);
        Some(removed)
    }

    fn update_deadline(&mut self, config: &BatcherConfig) {
        let idle = (config.max_idle_ms > 0)
            .then(|| self.last_updated + Duration::from_millis(config.max_idle_ms));
        let wait = (config.max_wait_ms > 0)
            .then(|| self.start + Duration::from_millis(config.max_wait_ms));
        self.deadline = match (idle, wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Coalesces requests per range and sends them through the inner sender.
pub struct RequestBatcher {
    name: String,
    stopper: Stopper,
    tx_req: mpsc::Sender<PendingRequest>,
}

impl RequestBatcher {
    /// Creates the batcher and spawns its run loop. A missing sender or
    /// stopper is a programmer error.
    pub fn new(opts: BatcherOptions) -> Result<Arc<Self>, KvError> {
        let sender = match opts.sender {
            Some(sender) => sender,
            None => return logged_err!(opts.name; "request batcher requires a sender"),
        };
        let stopper = match opts.stopper {
            Some(stopper) => stopper,
            None => return logged_err!(opts.name; "request batcher requires a stopper"),
        };
        let now_fn = opts.now_fn.unwrap_or_else(|| Arc::new(Instant::now));

        let (tx_req, rx_req) = mpsc::channel(1);
        let run_loop = RunLoop {
            name: opts.name.clone(),
            config: opts.config,
            sender,
            stopper: stopper.clone(),
            now_fn,
            batches: HashMap::new(),
            in_flight: 0,
            next_id: 0,
        };
        stopper.run_worker(&format!("{}-batcher", opts.name), run_loop.run(rx_req))?;

        Ok(Arc::new(RequestBatcher {
            name: opts.name,
            stopper,
            tx_req,
        }))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds `req` to the batch of `range_id` and waits for its response.
    pub async fn send(
        &self,
        ctx: &Ctx,
        range_id: RangeId,
        req: Request,
    ) -> Result<Response, KvError> {
        let (tx_resp, mut rx_resp) = mpsc::channel(1);
        self.send_with_chan(ctx, tx_resp, range_id, req).await?;
        tokio::select! {
            resp = rx_resp.recv() => match resp {
                Some(res) => res,
                None => Err(self.stopped_err()),
            },
            err = ctx.done() => Err(err),
            _ = self.stopper.quiesced() => Err(self.stopped_err()),
        }
    }

    /// Adds `req` to the batch of `range_id`; its response is delivered on
    /// `tx_resp`. Only blocks while the batcher applies backpressure.
    pub async fn send_with_chan(
        &self,
        ctx: &Ctx,
        tx_resp: mpsc::Sender<BatchedResult>,
        range_id: RangeId,
        req: Request,
    ) -> Result<(), KvError> {
        ctx.check()?;
        if self.stopper.is_quiescing() {
            return Err(self.stopped_err());
        }
        let pending = PendingRequest {
            ctx: ctx.clone(),
            range_id,
            req,
            tx_resp,
            id: 0,
            added: Instant::now(),
            watcher: None,
        };
        tokio::select! {
            res = self.tx_req.send(pending) => {
                res.map_err(|_| self.stopped_err())
            }
            err = ctx.done() => Err(err),
            _ = self.stopper.quiesced() => Err(self.stopped_err()),
        }
    }

    fn stopped_err(&self) -> KvError {
        KvError::unavailable(format!("request batcher {} is stopped", self.name))
    }
}

/// State owned by the run-loop task.
struct RunLoop {
    name: String,
    config: BatcherConfig,
    sender: Arc<dyn Sender>,
    stopper: Stopper,
    now_fn: NowFn,
    batches: HashMap<RangeId, Batch>,
    in_flight: usize,
    next_id: u64,
}

impl RunLoop {
    async fn run(mut self, mut rx_req: mpsc::Receiver<PendingRequest>) {
        let (tx_done, mut rx_done) = mpsc::unbounded_channel::<()>();
        let (tx_cancel, mut rx_cancel) = mpsc::unbounded_channel::<(RangeId, u64)>();
        let mut rx_quiesce = self.stopper.subscribe();
        let limit = self.config.backpressure_limit();
        let recovery = self.config.backpressure_recovery();
        let mut backpressured = false;
        let mut timer = Timer::new();

        loop {
            let next_deadline = self.batches.values().filter_map(|b| b.deadline).min();
            match next_deadline {
                Some(d) if timer.deadline() != Some(d) => timer.reset_at(d),
                Some(_) => {}
                None => timer.stop(),
            }

            tokio::select! {
                pending = rx_req.recv(), if !backpressured => {
                    match pending {
                        Some(pending) => self.add_request(pending, &tx_done, &tx_cancel),
                        None => break,
                    }
                },

                _ = rx_done.recv() => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                },

                cancelled = rx_cancel.recv() => {
                    if let Some((range_id, id)) = cancelled {
                        self.remove_cancelled(range_id, id);
                    }
                },

                _ = timer.timeout() => {
                    // every batch due by this deadline fires, including
                    // batches that share it
                    if let Some(deadline) = next_deadline {
                        self.send_due(deadline.max((self.now_fn)()), &tx_done);
                    }
                },

                _ = rx_quiesce.changed() => break,
            }

            if !backpressured && self.in_flight >= limit {
                pf_debug!(self.name; "backpressure on with {} batches in flight", self.in_flight);
                backpressured = true;
            } else if backpressured && self.in_flight < recovery {
                pf_debug!(self.name; "backpressure off with {} batches in flight", self.in_flight);
                backpressured = false;
            }
        }

        let stopped = KvError::unavailable(format!("request batcher {} is stopped", self.name));
        for (_, batch) in self.batches.drain() {
            for p in batch.reqs {
                deliver(&p.tx_resp, Err(stopped.clone()));
            }
        }
        // accepted by senders but never picked up
        rx_req.close();
        while let Ok(p) = rx_req.try_recv() {
            deliver(&p.tx_resp, Err(stopped.clone()));
        }
        pf_debug!(self.name; "batcher run loop exited");
    }

    fn add_request(
        &mut self,
        mut pending: PendingRequest,
        tx_done: &mpsc::UnboundedSender<()>,
        tx_cancel: &mpsc::UnboundedSender<(RangeId, u64)>,
    ) {
        let now = (self.now_fn)();
        let range_id = pending.range_id;
        pending.id = self.next_id;
        self.next_id += 1;
        pending.added = now;
        if pending.ctx.can_finish() {
            let ctx = pending.ctx.clone();
            let id = pending.id;
            let tx_cancel = tx_cancel.clone();
            let watcher = tokio::spawn(async move {
                ctx.done().await;
                let _ = tx_cancel.send((range_id, id));
            });
            pending.watcher = Some(watcher.abort_handle());
        }

        let batch = self
            .batches
            .entry(range_id)
            .or_insert_with(|| Batch::new(now));
        batch.reqs.push(pending);
        batch.last_updated = now;
        batch.update_deadline(&self.config);

        let full = self.config.max_msgs_per_batch > 0
            && batch.reqs.len() >= self.config.max_msgs_per_batch;
        if full {
            if let Some(batch) = self.batches.remove(&range_id) {
                self.send_batch(range_id, batch, tx_done);
            }
        }
    }

    /// Takes a cancelled request out of its batch so that it no longer
    /// counts toward the batch's size or deadline.
    fn remove_cancelled(&mut self, range_id: RangeId, id: u64) {
        let batch = match self.batches.get_mut(&range_id) {
            Some(batch) => batch,
            None => return,
        };
        let removed = match batch.remove(id, &self.config) {
            Some(removed) => removed,
            None => return,
        };
        if batch.reqs.is_empty() {
            self.batches.remove(&range_id);
        }
        pf_trace!(self.name; "dropped cancelled request {} from r{}", id, range_id);
        let err = removed
            .ctx
            .err()
            .unwrap_or_else(|| KvError::new(ErrorDetail::Canceled));
        deliver(&removed.tx_resp, Err(err));
    }

    fn send_due(&mut self, now: Instant, tx_done: &mpsc::UnboundedSender<()>) {
        let due: Vec<RangeId> = self
            .batches
            .iter()
            .filter(|(_, b)| b.deadline.map_or(false, |d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for range_id in due {
            if let Some(batch) = self.batches.remove(&range_id) {
                self.send_batch(range_id, batch, tx_done);
            }
        }
    }

    /// Spawns the task sending one batch. Requests cancelled while they
    /// waited are answered with their context error and left out.
    fn send_batch(&mut self, range_id: RangeId, batch: Batch, tx_done: &mpsc::UnboundedSender<()>) {
        let mut reqs = Vec::with_capacity(batch.reqs.len());
        for p in batch.reqs {
            match p.ctx.err() {
                Some(err) => deliver(&p.tx_resp, Err(err)),
                None => reqs.push(p),
            }
        }
        if reqs.is_empty() {
            return;
        }

        pf_trace!(self.name; "sending batch of {} to r{}", reqs.len(), range_id);
        self.in_flight += 1;
        let sender = self.sender.clone();
        let tx_done = tx_done.clone();
        let ba = BatchRequest::new(
            Header {
                range_id,
                ..Default::default()
            },
            reqs.iter().map(|p| p.req.clone()).collect(),
        );
        let ctx = Ctx::background().with_tag(format!("{},r{}", self.name, range_id));
        tokio::spawn(async move {
            match sender.send(&ctx, ba).await {
                Ok(br) => {
                    if br.responses.len() != reqs.len() {
                        let err = KvError::new(ErrorDetail::Internal(format!(
                            "batch of {} got {} responses",
                            reqs.len(),
                            br.responses.len()
                        )));
                        for p in reqs {
                            let _ = p.tx_resp.send(Err(err.clone())).await;
                        }
                    } else {
                        for (p, resp) in reqs.into_iter().zip(br.responses) {
                            let _ = p.tx_resp.send(Ok(resp)).await;
                        }
                    }
                }
                Err(err) => {
                    for p in reqs {
                        let _ = p.tx_resp.send(Err(err.clone())).await;
                    }
                }
            }
            let _ = tx_done.send(());
        });
    }
}

#[cfg(test)]
mod requestbatcher_tests {
    use super::*;
    use crate::kvpb::BatchResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::{oneshot, Semaphore};
    use tokio::time;

    /// Records every batch it is handed; replies once released.
    struct ChanSender {
        tx: mpsc::UnboundedSender<(BatchRequest, oneshot::Sender<Result<BatchResponse, KvError>>)>,
    }

    #[async_trait]
    impl Sender for ChanSender {
        async fn send(&self, _ctx: &Ctx, ba: BatchRequest) -> Result<BatchResponse, KvError> {
            let (tx, rx) = oneshot::channel();
            self.tx
                .send((ba, tx))
                .map_err(|_| KvError::msg("test sender closed"))?;
            rx.await?
        }
    }

    fn chan_sender() -> (
        Arc<dyn Sender>,
        mpsc::UnboundedReceiver<(BatchRequest, oneshot::Sender<Result<BatchResponse, KvError>>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChanSender { tx }), rx)
    }

    /// Answers every get with its own key.
    struct EchoSender {
        batches: Mutex<Vec<usize>>,
        gate: Semaphore,
    }

    #[async_trait]
    impl Sender for EchoSender {
        async fn send(&self, _ctx: &Ctx, ba: BatchRequest) -> Result<BatchResponse, KvError> {
            let _permit = self.gate.acquire().await.map_err(|e| KvError::msg(e))?;
            self.batches.lock().unwrap().push(ba.requests.len());
            Ok(BatchResponse {
                responses: ba
                    .requests
                    .iter()
                    .map(|r| Response::Get {
                        value: Some(r.header.key.clone()),
                    })
                    .collect(),
                ..Default::default()
            })
        }
    }

    fn options(config: BatcherConfig, sender: Arc<dyn Sender>, stopper: &Stopper) -> BatcherOptions {
        BatcherOptions {
            name: "test".into(),
            config,
            sender: Some(sender),
            stopper: Some(stopper.clone()),
            now_fn: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn full_batch_flushes_before_timed_one() -> Result<(), KvError> {
        let stopper = Stopper::new();
        let (sender, mut rx) = chan_sender();
        let config = BatcherConfig {
            max_idle_ms: 50,
            max_wait_ms: 50,
            max_msgs_per_batch: 3,
            in_flight_backpressure_limit: 0,
        };
        let b = RequestBatcher::new(options(config, sender, &stopper))?;
        let ctx = Ctx::background();

        let (tx_resp, mut rx_resp) = mpsc::channel(5);
        let start = Instant::now();
        for (range_id, key) in [(2, "r2a"), (1, "r1a"), (2, "r2b"), (1, "r1b"), (2, "r2c")] {
            b.send_with_chan(&ctx, tx_resp.clone(), range_id, Request::get(key))
                .await?;
        }

        let (first, reply) = rx.recv().await.expect("first batch");
        assert_eq!(first.header.range_id, 2);
        assert_eq!(first.requests.len(), 3);
        assert!(start.elapsed() < Duration::from_millis(50));
        let _ = reply.send(Ok(BatchResponse {
            responses: vec![Response::Put; 3],
            ..Default::default()
        }));

        let (second, reply) = rx.recv().await.expect("second batch");
        assert_eq!(second.header.range_id, 1);
        assert_eq!(second.requests.len(), 2);
        assert!(start.elapsed() >= Duration::from_millis(45));
        let _ = reply.send(Ok(BatchResponse {
            responses: vec![Response::Delete; 2],
            ..Default::default()
        }));

        for _ in 0..5 {
            assert!(rx_resp.recv().await.expect("response").is_ok());
        }
        stopper.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batches_sharing_a_deadline_all_fire() -> Result<(), KvError> {
        let stopper = Stopper::new();
        let then = Instant::now() + Duration::from_millis(10);
        let config = BatcherConfig {
            max_idle_ms: 20,
            max_wait_ms: 20,
            ..Default::default()
        };
        let sender = Arc::new(EchoSender {
            batches: Mutex::new(Vec::new()),
            gate: Semaphore::new(100),
        });
        let b = RequestBatcher::new(BatcherOptions {
            now_fn: Some(Arc::new(move || then)),
            ..options(config, sender.clone(), &stopper)
        })?;

        let ctx = Ctx::background();
        let mut handles = Vec::new();
        for range_id in 1..=3 {
            let b = b.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                b.send(&ctx, range_id, Request::get(format!("k{}", range_id))).await
            }));
        }
        for (i, h) in handles.into_iter().enumerate() {
            let resp = time::timeout(Duration::from_secs(2), h)
                .await
                .map_err(|_| KvError::msg("batch never fired"))??;
            assert_eq!(
                resp?,
                Response::Get {
                    value: Some(bytes::Bytes::from(format!("k{}", i + 1)))
                }
            );
        }
        assert_eq!(sender.batches.lock().unwrap().len(), 3);
        stopper.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn disabled_timeouts_wait_for_size() -> Result<(), KvError> {
        let stopper = Stopper::new();
        let (sender, mut rx) = chan_sender();
        let config = BatcherConfig {
            max_msgs_per_batch: 2,
            ..Default::default()
        };
        let b = RequestBatcher::new(options(config, sender, &stopper))?;
        let ctx = Ctx::background();
        let (tx_resp, _rx_resp) = mpsc::channel(2);

        b.send_with_chan(&ctx, tx_resp.clone(), 1, Request::get("a")).await?;
        assert!(time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        b.send_with_chan(&ctx, tx_resp, 1, Request::get("b")).await?;
        let (ba, _reply) = rx.recv().await.expect("batch");
        assert_eq!(ba.requests.len(), 2);
        stopper.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_batches_stay_under_limit() -> Result<(), KvError> {
        let stopper = Stopper::new();
        let (sender, mut rx) = chan_sender();
        let config = BatcherConfig {
            max_msgs_per_batch: 1,
            in_flight_backpressure_limit: 3,
            ..Default::default()
        };
        let b = RequestBatcher::new(options(config, sender, &stopper))?;
        let ctx = Ctx::background();
        let (tx_resp, mut rx_resp) = mpsc::channel(8);

        let b2 = b.clone();
        let ctx2 = ctx.clone();
        let producer = tokio::spawn(async move {
            for i in 0..6u64 {
                b2.send_with_chan(&ctx2, tx_resp.clone(), i, Request::get(format!("k{}", i)))
                    .await?;
            }
            Ok::<(), KvError>(())
        });

        let mut replies = Vec::new();
        for _ in 0..3 {
            replies.push(rx.recv().await.expect("batch").1);
        }
        // the limit is reached; nothing more flies
        assert!(time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        // one reply leaves 2 in flight, still not below 80% of 3
        let ok = || Ok(BatchResponse {
            responses: vec![Response::Put],
            ..Default::default()
        });
        let _ = replies.remove(0).send(ok());
        assert!(rx_resp.recv().await.expect("response").is_ok());
        assert!(time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        // a second reply lets the rest through
        let _ = replies.remove(0).send(ok());
        let more = time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(more.is_ok());
        let _ = replies.remove(0).send(ok());
        drop(more);

        stopper.stop().await;
        let _ = producer.await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_after_stop_or_cancel() -> Result<(), KvError> {
        let stopper = Stopper::new();
        let (sender, _rx) = chan_sender();
        let b = RequestBatcher::new(options(BatcherConfig::default(), sender, &stopper))?;

        let (ctx, cancel) = Ctx::background().with_cancel();
        cancel.cancel();
        let err = b.send(&ctx, 1, Request::get("a")).await.expect_err("canceled");
        assert!(err.is_ctx_err());

        stopper.stop().await;
        let err = b
            .send(&Ctx::background(), 1, Request::get("a"))
            .await
            .expect_err("stopped");
        assert!(err.is_unavailable());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_during_send_is_unavailable() -> Result<(), KvError> {
        let stopper = Stopper::new();
        let (sender, mut rx) = chan_sender();
        let config = BatcherConfig {
            max_msgs_per_batch: 1,
            ..Default::default()
        };
        let b = RequestBatcher::new(options(config, sender, &stopper))?;

        let b2 = b.clone();
        let waiter = tokio::spawn(async move { b2.send(&Ctx::background(), 1, Request::get("a")).await });
        let (_ba, _reply) = rx.recv().await.expect("batch");
        stopper.stop().await;
        let err = waiter.await?.expect_err("stopped while in flight");
        assert!(err.is_unavailable());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_request_leaves_its_batch() -> Result<(), KvError> {
        let stopper = Stopper::new();
        let (sender, mut rx) = chan_sender();
        let config = BatcherConfig {
            max_msgs_per_batch: 2,
            ..Default::default()
        };
        let b = RequestBatcher::new(options(config, sender, &stopper))?;
        let (tx_resp, mut rx_resp) = mpsc::channel(4);

        let (ctx, cancel) = Ctx::background().with_cancel();
        b.send_with_chan(&ctx, tx_resp.clone(), 1, Request::get("gone")).await?;
        cancel.cancel();
        let err = time::timeout(Duration::from_secs(2), rx_resp.recv())
            .await
            .map_err(|_| KvError::msg("cancellation never reported"))?
            .expect("response");
        assert!(err.expect_err("cancelled").is_ctx_err());

        // the cancelled request no longer fills the batch
        let live = Ctx::background();
        b.send_with_chan(&live, tx_resp.clone(), 1, Request::get("a")).await?;
        assert!(time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        b.send_with_chan(&live, tx_resp, 1, Request::get("b")).await?;
        let (ba, _reply) = rx.recv().await.expect("batch");
        assert_eq!(ba.requests.len(), 2);
        assert_eq!(ba.requests[0], Request::get("a"));
        stopper.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_oldest_resets_wait() -> Result<(), KvError> {
        let stopper = Stopper::new();
        let (sender, mut rx) = chan_sender();
        let config = BatcherConfig {
            max_wait_ms: 200,
            ..Default::default()
        };
        let b = RequestBatcher::new(options(config, sender, &stopper))?;
        let (tx_resp, mut rx_resp) = mpsc::channel(4);

        let (ctx, cancel) = Ctx::background().with_cancel();
        b.send_with_chan(&ctx, tx_resp.clone(), 1, Request::get("gone")).await?;
        time::sleep(Duration::from_millis(150)).await;
        let start = Instant::now();
        b.send_with_chan(&Ctx::background(), tx_resp, 1, Request::get("a")).await?;
        cancel.cancel();
        assert!(rx_resp.recv().await.expect("response").is_err());

        // the batch now waits on behalf of "a" alone
        let (ba, _reply) = time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .map_err(|_| KvError::msg("batch never fired"))?
            .expect("batch");
        assert_eq!(ba.requests.len(), 1);
        assert!(start.elapsed() >= Duration::from_millis(150));
        stopper.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_reaches_busy_response_channel() -> Result<(), KvError> {
        let stopper = Stopper::new();
        let (sender, _rx) = chan_sender();
        let b = RequestBatcher::new(options(BatcherConfig::default(), sender, &stopper))?;

        // the caller has not drained an earlier response yet
        let (tx_resp, mut rx_resp) = mpsc::channel(1);
        tx_resp.try_send(Ok(Response::Put)).expect("room for one");
        b.send_with_chan(&Ctx::background(), tx_resp, 1, Request::get("a")).await?;
        stopper.stop().await;

        let first = time::timeout(Duration::from_secs(2), rx_resp.recv()).await;
        assert!(matches!(first, Ok(Some(Ok(Response::Put)))));
        let second = time::timeout(Duration::from_secs(2), rx_resp.recv())
            .await
            .map_err(|_| KvError::msg("stop error was lost"))?
            .expect("response");
        assert!(second.expect_err("stopped").is_unavailable());
        Ok(())
    }

    #[tokio::test]
    async fn missing_sender_or_stopper() {
        let stopper = Stopper::new();
        let (sender, _rx) = chan_sender();
        let no_sender = RequestBatcher::new(BatcherOptions {
            sender: None,
            ..options(BatcherConfig::default(), sender.clone(), &stopper)
        });
        assert!(matches!(
            no_sender.err().map(|e| e.detail),
            Some(ErrorDetail::Internal(_))
        ));
        let no_stopper = RequestBatcher::new(BatcherOptions {
            stopper: None,
            ..options(BatcherConfig::default(), sender, &stopper)
        });
        assert!(no_stopper.is_err());
    }
}
