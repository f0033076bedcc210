//! Client handle to the store: single-request helpers for non-transactional
//! access and a retry loop for transactional closures.

use std::future::Future;
use std::sync::Arc;

use crate::hlc::Clock;
use crate::kv::sender::Sender;
use crate::kv::txn::Txn;
use crate::kv::txn_coord_sender::TxnCoordSenderFactory;
use crate::kvpb::{
    BatchRequest, BatchResponse, Key, KeyValue, RangeDescriptor, ReplicaChange, Request,
    RequestArgs, Response, StoreId, UserPriority,
};
use crate::utils::{Ctx, KvError};

use bytes::Bytes;

/// The response of a batch holding exactly one request.
pub(super) fn single_response(br: BatchResponse) -> Result<Response, KvError> {
    let mut responses = br.responses.into_iter();
    match (responses.next(), responses.next()) {
        (Some(resp), None) => Ok(resp),
        _ => logged_err!("db"; "expected exactly one response"),
    }
}

pub(super) fn expect_value(resp: Response) -> Result<Option<Bytes>, KvError> {
    match resp {
        Response::Get { value } => Ok(value),
        other => logged_err!("db"; "unexpected response {:?} to Get", other),
    }
}

pub(super) fn expect_rows(resp: Response) -> Result<Vec<KeyValue>, KvError> {
    match resp {
        Response::Scan { rows } | Response::ReverseScan { rows } => Ok(rows),
        other => logged_err!("db"; "unexpected response {:?} to scan", other),
    }
}

pub(super) fn expect_counter(resp: Response) -> Result<i64, KvError> {
    match resp {
        Response::Increment { new_value } => Ok(new_value),
        other => logged_err!("db"; "unexpected response {:?} to Increment", other),
    }
}

pub(super) fn expect_keys(resp: Response) -> Result<Vec<Key>, KvError> {
    match resp {
        Response::DeleteRange { keys } => Ok(keys),
        other => logged_err!("db"; "unexpected response {:?} to DeleteRange", other),
    }
}

pub(super) fn delete_range_returning_keys(start: Key, end: Key) -> Request {
    let mut req = Request::delete_range(start, end);
    if let RequestArgs::DeleteRange { return_keys } = &mut req.args {
        *return_keys = true;
    }
    req
}

/// Database handle. Cheap to share behind an `Arc`.
pub struct DB {
    factory: Arc<TxnCoordSenderFactory>,
    non_txn: Arc<dyn Sender>,
}

impl DB {
    pub fn new(factory: Arc<TxnCoordSenderFactory>) -> Arc<Self> {
        let non_txn = factory.non_txn_sender();
        Arc::new(DB { factory, non_txn })
    }

    /// Sender for non-transactional batches.
    pub fn sender(&self) -> Arc<dyn Sender> {
        self.non_txn.clone()
    }

    #[inline]
    pub fn factory(&self) -> &Arc<TxnCoordSenderFactory> {
        &self.factory
    }

    #[inline]
    pub fn clock(&self) -> &Arc<Clock> {
        self.factory.clock()
    }

    /// Sends a non-transactional batch.
    pub async fn send(&self, ctx: &Ctx, ba: BatchRequest) -> Result<BatchResponse, KvError> {
        self.non_txn.send(ctx, ba).await
    }

    async fn run(&self, ctx: &Ctx, req: Request) -> Result<Response, KvError> {
        single_response(self.send(ctx, BatchRequest::single(req)).await?)
    }

    pub async fn get(&self, ctx: &Ctx, key: impl Into<Key>) -> Result<Option<Bytes>, KvError> {
        expect_value(self.run(ctx, Request::get(key)).await?)
    }

    pub async fn put(
        &self,
        ctx: &Ctx,
        key: impl Into<Key>,
        value: impl Into<Bytes>,
    ) -> Result<(), KvError> {
        self.run(ctx, Request::put(key, value)).await.map(|_| ())
    }

    /// Writes `value` if the current value equals `expected` (`None` for
    /// absent).
    pub async fn cput(
        &self,
        ctx: &Ctx,
        key: impl Into<Key>,
        value: impl Into<Bytes>,
        expected: Option<Bytes>,
    ) -> Result<(), KvError> {
        self.run(ctx, Request::conditional_put(key, value, expected))
            .await
            .map(|_| ())
    }

    pub async fn init_put(
        &self,
        ctx: &Ctx,
        key: impl Into<Key>,
        value: impl Into<Bytes>,
    ) -> Result<(), KvError> {
        self.run(ctx, Request::init_put(key, value)).await.map(|_| ())
    }

    pub async fn inc(&self, ctx: &Ctx, key: impl Into<Key>, delta: i64) -> Result<i64, KvError> {
        expect_counter(self.run(ctx, Request::increment(key, delta)).await?)
    }

    pub async fn del(&self, ctx: &Ctx, key: impl Into<Key>) -> Result<(), KvError> {
        self.run(ctx, Request::delete(key)).await.map(|_| ())
    }

    /// Deletes `[start, end)`; returns the deleted keys.
    pub async fn del_range(
        &self,
        ctx: &Ctx,
        start: impl Into<Key>,
        end: impl Into<Key>,
    ) -> Result<Vec<Key>, KvError> {
        let req = delete_range_returning_keys(start.into(), end.into());
        expect_keys(self.run(ctx, req).await?)
    }

    pub async fn scan(
        &self,
        ctx: &Ctx,
        start: impl Into<Key>,
        end: impl Into<Key>,
    ) -> Result<Vec<KeyValue>, KvError> {
        expect_rows(self.run(ctx, Request::scan(start, end)).await?)
    }

    pub async fn reverse_scan(
        &self,
        ctx: &Ctx,
        start: impl Into<Key>,
        end: impl Into<Key>,
    ) -> Result<Vec<KeyValue>, KvError> {
        expect_rows(self.run(ctx, Request::reverse_scan(start, end)).await?)
    }

    /// Splits the range containing `split_key` at that key.
    pub async fn admin_split(&self, ctx: &Ctx, split_key: impl Into<Key>) -> Result<(), KvError> {
        let split_key = split_key.into();
        self.run(ctx, Request::admin_split(split_key.clone(), split_key))
            .await
            .map(|_| ())
    }

    /// Merges the range starting at or containing `key` with its right
    /// neighbor.
    pub async fn admin_merge(&self, ctx: &Ctx, key: impl Into<Key>) -> Result<(), KvError> {
        self.run(ctx, Request::admin_merge(key, "manual"))
            .await
            .map(|_| ())
    }

    pub async fn admin_transfer_lease(
        &self,
        ctx: &Ctx,
        key: impl Into<Key>,
        target: StoreId,
    ) -> Result<(), KvError> {
        self.run(ctx, Request::admin_transfer_lease(key, target))
            .await
            .map(|_| ())
    }

    pub async fn admin_change_replicas(
        &self,
        ctx: &Ctx,
        key: impl Into<Key>,
        changes: Vec<ReplicaChange>,
    ) -> Result<RangeDescriptor, KvError> {
        match self.run(ctx, Request::admin_change_replicas(key, changes)).await? {
            Response::AdminChangeReplicas { desc } => Ok(desc),
            other => logged_err!("db"; "unexpected response {:?} to AdminChangeReplicas", other),
        }
    }

    /// Starts a transaction at normal priority.
    pub fn new_txn(&self, name: &str) -> Txn {
        self.new_txn_with_priority(name, UserPriority::Normal)
    }

    pub fn new_txn_with_priority(&self, name: &str, user_priority: UserPriority) -> Txn {
        Txn::new(self.factory.new_root(name, user_priority))
    }

    /// Runs `f` in a transaction and commits it, rerunning `f` after every
    /// retryable error. Any other error rolls the transaction back.
    pub async fn txn<T, F, Fut>(&self, ctx: &Ctx, mut f: F) -> Result<T, KvError>
    where
        F: FnMut(Txn) -> Fut,
        Fut: Future<Output = Result<T, KvError>>,
    {
        let txn = self.new_txn("unnamed");
        let max_retries = self.factory.config().max_auto_retries;
        let mut retries = 0;
        loop {
            let res = match f(txn.clone()).await {
                Ok(v) if txn.is_finalized() => Ok(v),
                Ok(v) => txn.commit(ctx).await.map(|_| v),
                Err(e) => Err(e),
            };
            match res {
                Ok(v) => return Ok(v),
                Err(e) if e.is_client_retryable() && retries < max_retries => {
                    retries += 1;
                    pf_debug!("db"; "retrying txn {} (attempt {}): {}",
                                    txn.proto().short_id(), retries + 1, e);
                }
                Err(e) => {
                    if !txn.is_finalized() {
                        if let Err(re) = txn.rollback(ctx).await {
                            pf_debug!("db"; "rollback after error failed: {}", re);
                        }
                    }
                    return Err(e);
                }
            }
        }
    }
}
