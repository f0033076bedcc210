//! Split queue: splits ranges at zone boundaries, when they outgrow their
//! zone's maximum size, and when their load is high enough for the load
//! split decider to suggest a key.

use std::sync::{Arc, Weak};

use crate::hlc::Timestamp;
use crate::kvpb::RangeId;
use crate::storage::queue::{BaseQueue, ProcessCallback, QueueConfig, QueueImpl};
use crate::storage::replica::Replica;
use crate::storage::store::Store;
use crate::utils::{Ctx, ErrorDetail, KvError, Stopper};

use async_trait::async_trait;

use tokio::time::Instant;

/// Queue priority of a range; zero means it needs no split.
pub(super) fn split_priority(
    size: i64,
    max_bytes: i64,
    needs_zone_split: bool,
    has_load_key: bool,
) -> f64 {
    let mut priority = 0.0;
    if needs_zone_split {
        priority += 1.0;
    }
    if max_bytes > 0 {
        let ratio = size as f64 / max_bytes as f64;
        if ratio > 1.0 {
            priority += ratio;
        }
    }
    if has_load_key {
        priority += 1.0;
    }
    priority
}

struct SplitQueueImpl;

#[async_trait]
impl QueueImpl for SplitQueueImpl {
    fn name(&self) -> &'static str {
        "split"
    }

    fn should_queue(&self, _now: Timestamp, repl: &Replica) -> (bool, f64) {
        let desc = match repl.desc() {
            Ok(desc) => desc,
            Err(_) => return (false, 0.0),
        };
        let zone = repl.system_config.zone_for_key(&desc.start_key);
        let priority = split_priority(
            repl.stats().total(),
            zone.range_max_bytes,
            repl.system_config.needs_split(&desc.start_key, &desc.end_key),
            repl.split_decider.maybe_split_key(Instant::now()).is_some(),
        );
        (priority > 0.0, priority)
    }

    async fn process(&self, ctx: &Ctx, repl: &Arc<Replica>) -> Result<bool, KvError> {
        let desc = repl.desc()?;

        if let Some(key) = repl
            .system_config
            .compute_split_key(&desc.start_key, &desc.end_key)
        {
            repl.admin_split(ctx, key, "zone config", false).await?;
            return Ok(true);
        }

        let zone = repl.system_config.zone_for_key(&desc.start_key);
        let size = repl.stats().total();
        if zone.range_max_bytes > 0 && size > zone.range_max_bytes {
            let key = repl
                .engine
                .median_key(&desc.start_key, &desc.end_key)
                .filter(|k| *k > desc.start_key && desc.contains_key(k))
                .ok_or_else(|| {
                    KvError::new(ErrorDetail::UnsplittableRange {
                        range_id: desc.range_id,
                    })
                })?;
            let reason = format!("{} above max size {}", size, zone.range_max_bytes);
            repl.admin_split(ctx, key, &reason, false).await?;
            return Ok(true);
        }

        let now = Instant::now();
        if let Some(key) = repl.split_decider.maybe_split_key(now) {
            let qps = repl.split_decider.last_qps(now);
            repl.split_decider.reset();
            if key > desc.start_key && desc.contains_key(&key) {
                let reason = format!("load at {:.0} qps", qps);
                repl.admin_split(ctx, key, &reason, false).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn is_purgatory_error(&self, err: &KvError) -> bool {
        matches!(err.detail, ErrorDetail::UnsplittableRange { .. })
    }
}

/// Queue of ranges to split.
pub struct SplitQueue {
    base: Arc<BaseQueue>,
}

impl SplitQueue {
    pub fn new(config: QueueConfig, store: Weak<Store>, store_tag: &str) -> Self {
        let enabled = config.split_enabled;
        SplitQueue {
            base: BaseQueue::new(Arc::new(SplitQueueImpl), config, enabled, store, store_tag),
        }
    }

    #[inline]
    pub fn base(&self) -> &Arc<BaseQueue> {
        &self.base
    }

    pub fn maybe_add(&self, repl: &Replica, now: Timestamp) {
        self.base.maybe_add(repl, now);
    }

    /// See `BaseQueue::maybe_add_callback()`.
    pub fn maybe_add_callback(&self, range_id: RangeId, cb: ProcessCallback) -> bool {
        self.base.maybe_add_callback(range_id, cb)
    }

    pub fn start(&self, stopper: &Stopper) -> Result<(), KvError> {
        self.base.start(stopper)
    }
}

#[cfg(test)]
mod split_queue_tests {
    use super::*;
    use crate::kvpb::{BatchRequest, Request};
    use crate::storage::store::store_tests::single_store;

    #[test]
    fn priority_signals() {
        assert_eq!(split_priority(100, 200, false, false), 0.0);
        assert_eq!(split_priority(400, 200, false, false), 2.0);
        assert_eq!(split_priority(100, 200, true, false), 1.0);
        assert_eq!(split_priority(400, 200, true, true), 4.0);
        assert_eq!(split_priority(400, 0, false, false), 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn splits_oversized_range_at_median() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let ctx = Ctx::background();
        let repl = store.replica_for_key(b"k00").expect("user range");
        for i in 0..20 {
            let key = format!("k{:02}", i);
            repl.send(&ctx, BatchRequest::single(Request::put(key, vec![b'x'; 100])))
                .await?;
        }
        let desc = repl.desc()?;
        store
            .system_config()
            .set_zone(desc.span(), crate::storage::zone_with_bounds(0, 1000));

        let imp = SplitQueueImpl;
        let (should, priority) = imp.should_queue(store.clock().now(), &repl);
        assert!(should);
        assert!(priority > 1.0);
        assert!(imp.process(&ctx, &repl).await?);

        let left = repl.desc()?;
        assert!(left.end_key > desc.start_key && left.end_key < desc.end_key);
        let right = store.replica_for_key(&left.end_key).expect("right-hand range");
        assert_ne!(right.range_id(), repl.range_id());
        assert_eq!(right.desc()?.end_key, desc.end_key);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_row_range_is_unsplittable() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let ctx = Ctx::background();
        let repl = store.replica_for_key(b"big").expect("user range");
        repl.send(&ctx, BatchRequest::single(Request::put("big", vec![b'x'; 2000])))
            .await?;
        let desc = repl.desc()?;
        store
            .system_config()
            .set_zone(desc.span(), crate::storage::zone_with_bounds(0, 1000));

        let imp = SplitQueueImpl;
        let err = imp.process(&ctx, &repl).await.expect_err("one row cannot split");
        assert!(imp.is_purgatory_error(&err));
        Ok(())
    }
}
