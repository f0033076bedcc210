//! Resolution of intents and pushes of their transactions on behalf of the
//! lock table and of finished transactions.

use std::sync::Arc;

use crate::hlc::Timestamp;
use crate::kv::DB;
use crate::kvpb::{
    BatchRequest, LockUpdate, PushTxnType, Request, Response, Transaction, TxnMeta,
};
use crate::concurrency::IntentPusher;
use crate::requestbatcher::{BatcherConfig, BatcherOptions, RequestBatcher};
use crate::storage::meta::MetaDirectory;
use crate::utils::{Ctx, KvError, Stopper};

use async_trait::async_trait;

use futures::future;

pub struct IntentResolver {
    tag: String,
    db: Arc<DB>,
    meta: Arc<MetaDirectory>,

    /// Coalesces `ResolveIntent` requests per range.
    batcher: Arc<RequestBatcher>,
    stopper: Stopper,
}

impl IntentResolver {
    pub fn new(
        store_tag: &str,
        db: Arc<DB>,
        meta: Arc<MetaDirectory>,
        config: BatcherConfig,
        stopper: Stopper,
    ) -> Result<Arc<Self>, KvError> {
        let batcher = RequestBatcher::new(BatcherOptions {
            name: format!("{},intent-resolver", store_tag),
            config,
            sender: Some(db.sender()),
            stopper: Some(stopper.clone()),
            now_fn: None,
        })?;
        Ok(Arc::new(IntentResolver {
            tag: format!("{},ir", store_tag),
            db,
            meta,
            batcher,
            stopper,
        }))
    }

    /// Resolves the intents in the background.
    pub fn resolve_intents_async(self: &Arc<Self>, updates: Vec<LockUpdate>) {
        if updates.is_empty() {
            return;
        }
        let me = self.clone();
        let res = self.stopper.run_worker("resolve-intents", async move {
            let ctx = Ctx::background().with_tag(&me.tag);
            if let Err(e) = me.resolve_intents(&ctx, updates).await {
                pf_debug!(me.tag; "async intent resolution failed: {}", e);
            }
        });
        if let Err(e) = res {
            pf_debug!(self.tag; "skipped intent resolution: {}", e);
        }
    }

    /// Resolves the intents, batching requests bound for the same range.
    pub async fn resolve_intents(&self, ctx: &Ctx, updates: Vec<LockUpdate>) -> Result<(), KvError> {
        let sends = updates.into_iter().map(|update| async move {
            let range_id = self
                .meta
                .lookup(&update.span.key)
                .map_or(0, |d| d.range_id);
            let req = Request::resolve_intent(
                update.span,
                update.txn,
                update.status,
                update.ignored_seq_ranges,
            );
            self.batcher.send(ctx, range_id, req).await
        });
        for res in future::join_all(sends).await {
            res?;
        }
        Ok(())
    }
}

#[async_trait]
impl IntentPusher for IntentResolver {
    async fn push_txn(
        &self,
        ctx: &Ctx,
        pusher: Option<&Transaction>,
        pushee: &TxnMeta,
        push_to: Timestamp,
        push_type: PushTxnType,
    ) -> Result<Transaction, KvError> {
        let req = Request::push_txn(pusher.cloned(), pushee.clone(), push_to, push_type);
        let br = self.db.send(ctx, BatchRequest::single(req)).await?;
        match br.responses.into_iter().next() {
            Some(Response::PushTxn { pushee }) => {
                pf_trace!(self.tag; "pushed txn {} to {:?}", pushee.short_id(), pushee.status);
                Ok(pushee)
            }
            other => logged_err!(self.tag; "unexpected push response {:?}", other),
        }
    }

    async fn resolve_intent(&self, ctx: &Ctx, update: LockUpdate) -> Result<(), KvError> {
        self.resolve_intents(ctx, vec![update]).await
    }
}
