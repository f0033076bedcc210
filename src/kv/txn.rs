//! Client-side transaction handle.

use std::sync::Arc;

use crate::hlc::Timestamp;
use crate::kv::db::{
    delete_range_returning_keys, expect_counter, expect_keys, expect_rows, expect_value,
    single_response,
};
use crate::kv::sender::Sender;
use crate::kv::txn_coord_sender::{SavepointToken, TxnCoordMeta, TxnCoordSender};
use crate::kvpb::{
    BatchRequest, BatchResponse, Header, Key, KeyValue, Request, Response, Transaction, TxnId,
};
use crate::utils::{Ctx, ErrorDetail, KvError};

use bytes::Bytes;

/// A transaction in progress. Clones share the same coordinator.
#[derive(Clone)]
pub struct Txn {
    tcs: Arc<TxnCoordSender>,
}

impl Txn {
    pub fn new(tcs: Arc<TxnCoordSender>) -> Self {
        Txn { tcs }
    }

    #[inline]
    pub fn sender(&self) -> &Arc<TxnCoordSender> {
        &self.tcs
    }

    pub fn id(&self) -> TxnId {
        self.tcs.id()
    }

    pub fn epoch(&self) -> i32 {
        self.tcs.epoch()
    }

    /// Copy of the current transaction proto.
    pub fn proto(&self) -> Transaction {
        self.tcs.txn()
    }

    pub fn is_finalized(&self) -> bool {
        self.tcs.is_finalized()
    }

    /// Sends the requests as one batch of this transaction.
    pub async fn send(&self, ctx: &Ctx, reqs: Vec<Request>) -> Result<BatchResponse, KvError> {
        self.tcs.send(ctx, BatchRequest::new(Header::default(), reqs)).await
    }

    async fn run(&self, ctx: &Ctx, req: Request) -> Result<Response, KvError> {
        single_response(self.send(ctx, vec![req]).await?)
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

    pub async fn commit(&self, ctx: &Ctx) -> Result<(), KvError> {
        self.send(ctx, vec![Request::end_txn(Key::new(), true, Vec::new())])
            .await
            .map(|_| ())
    }

    /// Aborts the transaction; a no-op once it is finalized.
    pub async fn rollback(&self, ctx: &Ctx) -> Result<(), KvError> {
        if self.is_finalized() {
            return Ok(());
        }
        match self
            .send(ctx, vec![Request::end_txn(Key::new(), false, Vec::new())])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.detail, ErrorDetail::TxnFinalized { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Commits; if the commit fails without finalizing the transaction,
    /// rolls it back and returns the commit error.
    pub async fn commit_or_cleanup(&self, ctx: &Ctx) -> Result<(), KvError> {
        let res = self.commit(ctx).await;
        if let Err(e) = &res {
            if !self.is_finalized() {
                if let Err(re) = self.rollback(&Ctx::background()).await {
                    pf_debug!("txn"; "cleanup after failed commit ({}) failed: {}", e, re);
                }
            }
        }
        res
    }

    pub fn create_savepoint(&self) -> Result<SavepointToken, KvError> {
        self.tcs.create_savepoint()
    }

    pub fn rollback_to_savepoint(&self, sp: &SavepointToken) -> Result<(), KvError> {
        self.tcs.rollback_to_savepoint(sp)
    }

    pub fn release_savepoint(&self, sp: &SavepointToken) -> Result<(), KvError> {
        self.tcs.release_savepoint(sp)
    }

    pub fn step(&self) -> Result<(), KvError> {
        self.tcs.step()
    }

    pub fn configure_stepping(&self, enabled: bool) -> bool {
        self.tcs.configure_stepping(enabled)
    }

    pub fn get_meta(&self) -> Result<TxnCoordMeta, KvError> {
        self.tcs.get_meta()
    }

    pub fn augment_meta(&self, meta: &TxnCoordMeta) -> Result<(), KvError> {
        self.tcs.augment_meta(meta)
    }

    pub fn set_fixed_timestamp(&self, ts: Timestamp) -> Result<(), KvError> {
        self.tcs.set_fixed_timestamp(ts)
    }

    pub fn update_deadline(&self, deadline: Timestamp) {
        self.tcs.update_deadline(deadline)
    }
}
