//! Merge queue: merges ranges that shrank below their zone's minimum size
//! into their left-hand neighbor, unless the merged range would be split
//! again right away.

use std::sync::{Arc, Weak};

use crate::hlc::Timestamp;
use crate::kvpb::keys::{key_max, next_key};
use crate::kvpb::{
    BatchRequest, ChangeReplicasKind, MvccStats, RangeDescriptor, ReplicaChange,
    ReplicationTarget, Request, Response,
};
use crate::storage::queue::{BaseQueue, QueueConfig, QueueImpl};
use crate::storage::replica::Replica;
use crate::storage::split_queue::split_priority;
use crate::storage::store::Store;
use crate::utils::{Ctx, KvError, Stopper};

use async_trait::async_trait;

/// Queue priority of a range of `size` bytes; smaller ranges merge first.
/// `None` if the range is not below `min_bytes`.
pub(super) fn merge_priority(size: i64, min_bytes: i64) -> Option<f64> {
    if min_bytes <= 0 {
        return None;
    }
    let ratio = size as f64 / min_bytes as f64;
    if ratio >= 1.0 {
        return None;
    }
    Some(1.0 - ratio)
}

/// True if the merged range would likely be split again: by size, or by a
/// load that could reach the split threshold with a small increase.
pub(super) fn merged_would_split(
    merged_size: i64,
    max_bytes: i64,
    merged_qps: f64,
    qps_threshold: f64,
) -> bool {
    split_priority(merged_size, max_bytes, false, false) > 0.0
        || (qps_threshold > 0.0 && qps_threshold < 2.0 * merged_qps)
}

struct MergeQueueImpl {
    store: Weak<Store>,
}

impl MergeQueueImpl {
    /// Stats, load and current descriptor of the range holding `key`.
    async fn range_stats(
        &self,
        ctx: &Ctx,
        store: &Store,
        key: &[u8],
    ) -> Result<(RangeDescriptor, MvccStats, f64), KvError> {
        let mut ba = BatchRequest::single(Request::range_stats(key.to_vec()));
        ba.header.return_range_info = true;
        let br = store.db()?.send(ctx, ba).await?;
        let desc = match br.header.range_infos.as_slice() {
            [info] => info.desc.clone(),
            infos => {
                return Err(KvError::msg(format!(
                    "range stats returned {} range infos, expected one",
                    infos.len()
                )))
            }
        };
        match br.responses.into_iter().next() {
            Some(Response::RangeStats { stats, qps }) => Ok((desc, stats, qps)),
            other => Err(KvError::msg(format!("unexpected range stats response {:?}", other))),
        }
    }

    /// Moves the replicas of `rhs` onto the stores of `lhs`, with its lease
    /// on this store.
    async fn relocate(
        &self,
        ctx: &Ctx,
        store: &Store,
        lhs: &RangeDescriptor,
        rhs: &RangeDescriptor,
    ) -> Result<(), KvError> {
        let db = store.db()?;
        let adds: Vec<ReplicaChange> = lhs
            .replicas
            .iter()
            .filter(|r| rhs.replica_for_store(r.store_id).is_none())
            .map(|r| ReplicaChange {
                kind: ChangeReplicasKind::Add,
                target: ReplicationTarget {
                    node_id: r.node_id,
                    store_id: r.store_id,
                },
            })
            .collect();
        if !adds.is_empty() {
            db.send(ctx, BatchRequest::single(Request::admin_change_replicas(
                rhs.start_key.clone(),
                adds,
            )))
            .await?;
        }

        let removes: Vec<ReplicaChange> = rhs
            .replicas
            .iter()
            .filter(|r| lhs.replica_for_store(r.store_id).is_none())
            .map(|r| ReplicaChange {
                kind: ChangeReplicasKind::Remove,
                target: ReplicationTarget {
                    node_id: r.node_id,
                    store_id: r.store_id,
                },
            })
            .collect();
        // the leaseholder may be among the removed ones
        db.send(ctx, BatchRequest::single(Request::admin_transfer_lease(
            rhs.start_key.clone(),
            store.ident().store_id,
        )))
        .await?;
        if !removes.is_empty() {
            db.send(ctx, BatchRequest::single(Request::admin_change_replicas(
                rhs.start_key.clone(),
                removes,
            )))
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueueImpl for MergeQueueImpl {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn should_queue(&self, _now: Timestamp, repl: &Replica) -> (bool, f64) {
        let desc = match repl.desc() {
            Ok(desc) => desc,
            Err(_) => return (false, 0.0),
        };
        // the last range has no neighbor, and the system keyspace is never
        // merged across
        if desc.end_key == key_max() || desc.is_system() {
            return (false, 0.0);
        }
        if repl
            .system_config
            .needs_split(&desc.start_key, &next_key(&desc.end_key))
        {
            return (false, 0.0);
        }
        let zone = repl.system_config.zone_for_key(&desc.start_key);
        match merge_priority(repl.stats().total(), zone.range_min_bytes) {
            Some(priority) => (true, priority),
            None => (false, 0.0),
        }
    }

    async fn process(&self, ctx: &Ctx, repl: &Arc<Replica>) -> Result<bool, KvError> {
        let store = self
            .store
            .upgrade()
            .ok_or_else(|| KvError::unavailable("store is shut down"))?;
        let lhs = repl.desc()?;
        if lhs.end_key == key_max() || lhs.is_system() {
            return Ok(false);
        }
        let zone = repl.system_config.zone_for_key(&lhs.start_key);
        let lhs_stats = repl.stats();
        if merge_priority(lhs_stats.total(), zone.range_min_bytes).is_none() {
            pf_trace!(repl.tag(); "skipping merge: {} bytes meets minimum {}",
                                  lhs_stats.total(), zone.range_min_bytes);
            return Ok(false);
        }

        let lhs_qps = repl.qps();
        let (rhs, rhs_stats, rhs_qps) = self.range_stats(ctx, &store, &lhs.end_key).await?;
        if rhs.start_key != lhs.end_key {
            return Err(KvError::msg(format!(
                "right-hand neighbor {:?} does not abut {:?}",
                rhs, lhs
            )));
        }
        if rhs_stats.total() >= zone.range_min_bytes {
            pf_trace!(repl.tag(); "skipping merge: right-hand side has {} bytes",
                                  rhs_stats.total());
            return Ok(false);
        }
        if repl.system_config.needs_split(&lhs.start_key, &rhs.end_key) {
            return Ok(false);
        }

        let mut merged_stats = lhs_stats;
        merged_stats.add(&rhs_stats);
        let merged_qps = if zone.qps_split_threshold > 0.0 {
            lhs_qps + rhs_qps
        } else {
            0.0
        };
        if merged_would_split(
            merged_stats.total(),
            zone.range_max_bytes,
            merged_qps,
            zone.qps_split_threshold,
        ) {
            pf_debug!(repl.tag(); "skipping merge to avoid thrashing: merged size {} qps {:.2}",
                                  merged_stats.total(), merged_qps);
            return Ok(false);
        }

        if !lhs.same_placement(&rhs) {
            self.relocate(ctx, &store, &lhs, &rhs).await?;
        }
        let reason = format!(
            "lhs+rhs has size={}+{} qps={:.2}+{:.2} below threshold size={}",
            lhs_stats.total(),
            rhs_stats.total(),
            lhs_qps,
            rhs_qps,
            zone.range_min_bytes
        );
        repl.admin_merge(ctx, &reason).await?;
        Ok(true)
    }

    fn is_purgatory_error(&self, _err: &KvError) -> bool {
        // merges race with other descriptor changes; retry later
        true
    }
}

/// Queue of ranges to merge with their right-hand neighbor.
pub struct MergeQueue {
    base: Arc<BaseQueue>,
}

impl MergeQueue {
    pub fn new(config: QueueConfig, store: Weak<Store>, store_tag: &str) -> Self {
        let enabled = config.merge_enabled;
        let imp = Arc::new(MergeQueueImpl {
            store: store.clone(),
        });
        MergeQueue {
            base: BaseQueue::new(imp, config, enabled, store, store_tag),
        }
    }

    #[inline]
    pub fn base(&self) -> &Arc<BaseQueue> {
        &self.base
    }

    pub fn maybe_add(&self, repl: &Replica, now: Timestamp) {
        self.base.maybe_add(repl, now);
    }

    pub fn start(&self, stopper: &Stopper) -> Result<(), KvError> {
        self.base.start(stopper)
    }
}

#[cfg(test)]
mod merge_queue_tests {
    use super::*;
    use crate::storage::store::store_tests::single_store;
    use crate::storage::zone_with_bounds;
    use bytes::Bytes;

    #[test]
    fn priority_favors_small_ranges() {
        assert_eq!(merge_priority(0, 100), Some(1.0));
        assert_eq!(merge_priority(25, 100), Some(0.75));
        assert_eq!(merge_priority(100, 100), None);
        assert_eq!(merge_priority(10, 0), None);
    }

    #[test]
    fn thrashing_guard() {
        assert!(!merged_would_split(100, 200, 0.0, 0.0));
        assert!(merged_would_split(300, 200, 0.0, 0.0));
        assert!(!merged_would_split(100, 200, 400.0, 1000.0));
        assert!(merged_would_split(100, 200, 600.0, 1000.0));
        assert!(!merged_would_split(100, 200, 600.0, 0.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn merges_small_neighbors() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let ctx = Ctx::background();
        let left = store.replica_for_key(b"a").expect("user range");
        store.send(&ctx, BatchRequest::single(Request::put("a", "1"))).await?;
        store.send(&ctx, BatchRequest::single(Request::put("q", "2"))).await?;
        left.admin_split(&ctx, Bytes::from("m"), "test", false).await?;
        assert_eq!(store.num_replicas(), 3);

        let imp = MergeQueueImpl {
            store: store.weak(),
        };
        let (should, priority) = imp.should_queue(store.clock().now(), &left);
        assert!(should);
        assert!(priority > 0.9);
        assert!(imp.process(&ctx, &left).await?);

        assert_eq!(store.num_replicas(), 2);
        assert_eq!(store.meta().num_ranges(), 2);
        assert_eq!(left.desc()?.end_key, key_max());
        let br = store.send(&ctx, BatchRequest::single(Request::get("q"))).await?;
        assert_eq!(br.responses[0], Response::Get { value: Some(Bytes::from("2")) });
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn skips_when_merged_range_would_split() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let ctx = Ctx::background();
        let left = store.replica_for_key(b"a").expect("user range");
        for i in 0..10 {
            let key = format!("z{}", i);
            store
                .send(&ctx, BatchRequest::single(Request::put(key, vec![b'x'; 100])))
                .await?;
        }
        left.admin_split(&ctx, Bytes::from("m"), "test", false).await?;
        let desc = left.desc()?;
        store
            .system_config()
            .set_default_zone(zone_with_bounds(2000, 1000));

        let imp = MergeQueueImpl {
            store: store.weak(),
        };
        assert!(!imp.process(&ctx, &left).await?);
        assert_eq!(left.desc()?, desc);
        Ok(())
    }
}
