//! Gateway routing: splits a batch by range, sends each part to the
//! replicas of its range starting with the leaseholder, and stitches the
//! responses back together in request order.

use std::sync::Arc;

use crate::hlc::Clock;
use crate::kv::range_cache::{RangeCache, RangeCacheEntry};
use crate::kv::sender::Sender;
use crate::kvpb::{
    BatchRequest, BatchResponse, BatchResponseHeader, Key, Method, NodeId,
    Request, RequestArgs, Response, Span,
};
use crate::rpc::{ConnectionClass, NodeDialer};
use crate::storage::MetaDirectory;
use crate::utils::{Ctx, ErrorDetail, KvError};

use async_trait::async_trait;

use serde::Deserialize;

use tokio::time::{self, Duration};

/// Routing policy of the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct DialerConfig {
    /// Attempts at one part of a batch after routing errors before giving
    /// up.
    pub max_routing_retries: u32,

    /// Initial backoff between such attempts; doubles up to the max.
    pub routing_backoff_ms: u64,
    pub routing_max_backoff_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for DialerConfig {
    fn default() -> Self {
        DialerConfig {
            max_routing_retries: 30,
            routing_backoff_ms: 5,
            routing_max_backoff_ms: 200,
        }
    }
}

/// Routes batches to ranges.
pub struct DistSender {
    tag: String,
    node_id: NodeId,
    clock: Arc<Clock>,
    range_cache: RangeCache,
    dialer: Arc<NodeDialer>,
    config: DialerConfig,
}

impl DistSender {
    pub fn new(
        node_id: NodeId,
        clock: Arc<Clock>,
        meta: Arc<MetaDirectory>,
        dialer: Arc<NodeDialer>,
    ) -> Arc<Self> {
        Self::with_config(node_id, clock, meta, dialer, DialerConfig::default())
    }

    pub fn with_config(
        node_id: NodeId,
        clock: Arc<Clock>,
        meta: Arc<MetaDirectory>,
        dialer: Arc<NodeDialer>,
        config: DialerConfig,
    ) -> Arc<Self> {
        Arc::new(DistSender {
            tag: format!("n{},ds", node_id),
            node_id,
            clock,
            range_cache: RangeCache::new(meta),
            dialer,
            config,
        })
    }

    #[inline]
    pub fn range_cache(&self) -> &RangeCache {
        &self.range_cache
    }

    /// Sends a batch whose trailing `EndTxn` must wait for the rest when the
    /// batch spans several ranges.
    async fn send_with_end_txn(
        &self,
        ctx: &Ctx,
        mut ba: BatchRequest,
    ) -> Result<BatchResponse, KvError> {
        let rspan = ba.rspan().ok_or_else(|| KvError::msg("batch without span"))?;
        let first = self.range_cache.lookup(&rspan.key, false)?;
        if ba.requests.len() == 1
            || first.desc.contains_key_range(&rspan.key, &rspan.end_key)
        {
            return self.divide_and_send(ctx, ba).await;
        }

        let end_txn = match ba.requests.pop() {
            Some(req) => req,
            None => return logged_err!(self.tag; "empty batch"),
        };
        let end_index = ba.requests.len();
        let mut br = self.divide_and_send(ctx, ba.clone()).await?;

        let mut last = BatchRequest::new(ba.header.clone(), vec![end_txn]);
        if let (Some(txn), Some(updated)) = (last.header.txn.as_mut(), br.header.txn.as_ref()) {
            txn.update(updated);
        }
        let end_br = self
            .divide_and_send(ctx, last)
            .await
            .map_err(|e| match e.index {
                Some(_) => e.with_index(end_index),
                None => e,
            })?;
        br.responses.extend(end_br.responses);
        br.header.now.forward(end_br.header.now);
        br.header.range_infos.extend(end_br.header.range_infos);
        if end_br.header.txn.is_some() {
            br.header.txn = end_br.header.txn;
        }
        Ok(br)
    }

    /// Sends the parts of a batch range by range, in key order (reverse key
    /// order if the batch holds a reverse scan).
    async fn divide_and_send(
        &self,
        ctx: &Ctx,
        ba: BatchRequest,
    ) -> Result<BatchResponse, KvError> {
        let rspan = ba.rspan().ok_or_else(|| KvError::msg("batch without span"))?;
        let rspan_end = rspan.end_exclusive();
        let reverse = ba.requests.iter().any(|r| r.method() == Method::ReverseScan);

        let mut responses: Vec<Option<Response>> = vec![None; ba.requests.len()];
        let mut limits: Vec<Option<usize>> = ba.requests.iter().map(scan_limit).collect();
        let mut header = BatchResponseHeader::default();
        let mut txn = ba.header.txn.clone();

        let mut seek = if reverse { rspan_end.clone() } else { rspan.key.clone() };
        let mut attempt = 0;
        let mut backoff = Duration::from_millis(self.config.routing_backoff_ms);
        loop {
            ctx.check()?;
            let entry = self.range_cache.lookup(&seek, reverse)?;
            let (lo, hi) = if reverse {
                let hi = if entry.desc.end_key < seek {
                    entry.desc.end_key.clone()
                } else {
                    seek.clone()
                };
                (entry.desc.start_key.clone(), hi)
            } else {
                (seek.clone(), entry.desc.end_key.clone())
            };

            let (mut part, positions) = truncate(&ba, &lo, &hi, &limits);
            if !part.requests.is_empty() {
                part.header.txn = txn.clone();
                match self.send_to_replicas(ctx, &entry, part).await {
                    Ok(br) => {
                        attempt = 0;
                        backoff = Duration::from_millis(self.config.routing_backoff_ms);
                        for (resp, &i) in br.responses.into_iter().zip(positions.iter()) {
                            if let Some(limit) = limits[i].as_mut() {
                                *limit = limit.saturating_sub(resp.num_rows());
                            }
                            match responses[i].as_mut() {
                                Some(prev) => prev.combine(resp),
                                None => responses[i] = Some(resp),
                            }
                        }
                        if let (Some(txn), Some(updated)) = (txn.as_mut(), br.header.txn.as_ref()) {
                            txn.update(updated);
                        }
                        header.now.forward(br.header.now);
                        header.range_infos.extend(br.header.range_infos);
                    }
                    Err(e) if e.is_routing_retry() => {
                        attempt += 1;
                        if attempt > self.config.max_routing_retries {
                            return Err(e);
                        }
                        pf_debug!(self.tag; "routing retry {} for r{}: {}",
                                            attempt, entry.desc.range_id, e);
                        self.range_cache.evict(&entry.desc);
                        if let ErrorDetail::RangeKeyMismatch {
                            mismatched: Some(desc),
                            ..
                        } = &e.detail
                        {
                            self.range_cache.insert(desc.clone());
                        }
                        ctx.run(async {
                            time::sleep(backoff).await;
                            Ok(())
                        })
                        .await?;
                        backoff = (backoff * 2)
                            .min(Duration::from_millis(self.config.routing_max_backoff_ms));
                        continue;
                    }
                    Err(mut e) => {
                        e.index = e.index.and_then(|j| positions.get(j).copied());
                        return Err(e);
                    }
                }
            }

            let done = if reverse {
                entry.desc.start_key <= rspan.key
            } else {
                entry.desc.end_key >= rspan_end
            };
            if done {
                break;
            }
            seek = if reverse {
                entry.desc.start_key.clone()
            } else {
                entry.desc.end_key.clone()
            };
        }

        let mut out = Vec::with_capacity(responses.len());
        for (i, resp) in responses.into_iter().enumerate() {
            match resp {
                Some(resp) => out.push(resp),
                None => {
                    return logged_err!(self.tag; "request {} of {} got no response",
                                                 i, ba);
                }
            }
        }
        header.txn = txn;
        Ok(BatchResponse {
            header,
            responses: out,
        })
    }

    /// Sends a part to the replicas of its range, leaseholder first, then
    /// the local node, following leaseholder hints.
    async fn send_to_replicas(
        &self,
        ctx: &Ctx,
        entry: &RangeCacheEntry,
        mut ba: BatchRequest,
    ) -> Result<BatchResponse, KvError> {
        let desc = &entry.desc;
        let mut order = desc.replicas.clone();
        let holder = entry.lease_holder.map(|r| r.replica_id);
        order.sort_by_key(|r| (Some(r.replica_id) != holder, r.node_id != self.node_id));

        let mut last_err = None;
        let mut i = 0;
        while i < order.len() {
            let replica = order[i];
            i += 1;
            ba.header.range_id = desc.range_id;
            ba.header.replica = replica;

            let conn = match self
                .dialer
                .dial_internal_client(ctx, replica.node_id, ConnectionClass::Default)
                .await
            {
                Ok(conn) => conn,
                Err(e) if e.is_ctx_err() => return Err(e),
                Err(e) => {
                    pf_debug!(self.tag; "failed to dial n{}: {}", replica.node_id, e);
                    last_err = Some(e);
                    continue;
                }
            };

            match conn.batch(ctx, ba.clone()).await {
                Ok(mut br) => {
                    if let Err(e) = self.clock.update(br.header.now) {
                        pf_warn!(self.tag; "clock update from n{} rejected: {}",
                                           replica.node_id, e);
                    }
                    if let Some(txn) = br.header.txn.as_mut() {
                        txn.update_observed_timestamp(replica.node_id, br.header.now);
                    }
                    if !ba.is_admin() {
                        self.range_cache.update_lease_holder(desc, replica);
                    }
                    return Ok(br);
                }
                Err(e) => match &e.detail {
                    ErrorDetail::NotLeaseHolder {
                        lease_holder: Some(lh),
                        ..
                    } => {
                        if desc.replica_by_id(lh.replica_id).is_none() {
                            // our descriptor predates the leaseholder
                            return Err(e);
                        }
                        self.range_cache.update_lease_holder(desc, *lh);
                        if let Some(pos) =
                            order[i..].iter().position(|r| r.replica_id == lh.replica_id)
                        {
                            order.swap(i, i + pos);
                        }
                        last_err = Some(e);
                    }
                    ErrorDetail::NotLeaseHolder { .. }
                    | ErrorDetail::RangeNotFound { .. }
                    | ErrorDetail::BreakerOpen { .. }
                    | ErrorDetail::Unavailable { .. } => {
                        last_err = Some(e);
                    }
                    _ => return Err(e),
                },
            }
        }

        let err = last_err.unwrap_or_else(|| {
            KvError::msg(format!("r{} has no replicas", desc.range_id))
        });
        if err.is_routing_retry() {
            return Err(err);
        }
        // every replica unreachable; look the range up again
        Err(KvError::new(ErrorDetail::RangeNotFound {
            range_id: desc.range_id,
            store_id: 0,
        }))
    }
}

#[async_trait]
impl Sender for DistSender {
    async fn send(&self, ctx: &Ctx, mut ba: BatchRequest) -> Result<BatchResponse, KvError> {
        if ba.is_empty() {
            return logged_err!(self.tag; "empty batch");
        }
        ba.header.gateway_node_id = self.node_id;
        if ba.header.txn.is_none() && ba.header.timestamp.is_empty() && !ba.is_admin() {
            // every part of a non-transactional batch reads at one timestamp
            ba.header.timestamp = self.clock.now();
        }
        if ba.has_end_txn() {
            self.send_with_end_txn(ctx, ba).await
        } else {
            self.divide_and_send(ctx, ba).await
        }
    }
}

fn scan_limit(req: &Request) -> Option<usize> {
    match req.args {
        RequestArgs::Scan { max_keys } | RequestArgs::ReverseScan { max_keys }
            if max_keys > 0 =>
        {
            Some(max_keys)
        }
        _ => None,
    }
}

/// Requests of `ba` restricted to `[lo, hi)`, with their positions in
/// `ba`. Scans whose row limit is used up are left out.
fn truncate(
    ba: &BatchRequest,
    lo: &Key,
    hi: &Key,
    limits: &[Option<usize>],
) -> (BatchRequest, Vec<usize>) {
    let mut requests = Vec::new();
    let mut positions = Vec::new();
    for (i, req) in ba.requests.iter().enumerate() {
        if limits[i] == Some(0) {
            continue;
        }
        let span: Span = req.span();
        let inside = match span.intersect(lo, hi) {
            Some(inside) => inside,
            None => continue,
        };
        let mut req = req.clone();
        if !span.is_point() {
            req.header.key = inside.key;
            req.header.end_key = inside.end_key;
        }
        match &mut req.args {
            RequestArgs::Scan { max_keys } | RequestArgs::ReverseScan { max_keys } => {
                if let Some(limit) = limits[i] {
                    *max_keys = limit;
                }
            }
            _ => {}
        }
        requests.push(req);
        positions.push(i);
    }
    (BatchRequest::new(ba.header.clone(), requests), positions)
}

#[cfg(test)]
mod dist_sender_tests {
    use super::*;
    use crate::storage::store_tests::single_store;
    use bytes::Bytes;

    #[test]
    fn truncate_by_range() {
        let ba = BatchRequest::new(
            Default::default(),
            vec![
                Request::get("a"),
                Request::scan("b", "x"),
                Request::put("q", "v"),
            ],
        );
        let limits = vec![None; 3];
        let (part, positions) = truncate(&ba, &Bytes::from("m"), &Bytes::from("z"), &limits);
        assert_eq!(positions, vec![1, 2]);
        assert_eq!(part.requests[0].span(), Span::range("m", "x"));
        assert_eq!(part.requests[1].span(), Span::point("q"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scan_across_split() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let ctx = Ctx::background();
        let db = store.db()?;
        for key in ["a", "f", "n", "t"] {
            db.put(&ctx, key, key).await?;
        }
        db.admin_split(&ctx, "m").await?;
        assert_eq!(store.meta().num_ranges(), 3);

        let rows = db.scan(&ctx, "a", "z").await?;
        let keys: Vec<&[u8]> = rows.iter().map(|kv| kv.key.as_ref()).collect();
        assert_eq!(keys, vec![&b"a"[..], b"f", b"n", b"t"]);

        let rows = db.reverse_scan(&ctx, "a", "z").await?;
        let keys: Vec<&[u8]> = rows.iter().map(|kv| kv.key.as_ref()).collect();
        assert_eq!(keys, vec![&b"t"[..], b"n", b"f", b"a"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stale_cache_is_refreshed() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let ctx = Ctx::background();
        let db = store.db()?;
        db.put(&ctx, "b", "1").await?;
        db.put(&ctx, "y", "2").await?;

        // split behind the gateway's back; the cached descriptor is stale
        let repl = store.replica_for_key(b"b").expect("user range");
        repl.admin_split(&ctx, Bytes::from("k"), "test", false).await?;
        assert_eq!(db.get(&ctx, "y").await?, Some(Bytes::from("2")));
        assert_eq!(db.get(&ctx, "b").await?, Some(Bytes::from("1")));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn error_index_maps_to_batch() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let ctx = Ctx::background();
        let db = store.db()?;
        db.admin_split(&ctx, "m").await?;
        db.put(&ctx, "x", "old").await?;
        let ba = BatchRequest::new(
            Default::default(),
            vec![
                Request::put("a", "1"),
                Request::conditional_put("x", "new", Some(Bytes::from("nope"))),
            ],
        );
        let err = db.send(&ctx, ba).await.unwrap_err();
        assert!(matches!(err.detail, ErrorDetail::ConditionFailed { .. }));
        assert_eq!(err.index, Some(1));
        Ok(())
    }
}
