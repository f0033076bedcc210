//! The single capability every layer of the gateway implements.

use std::sync::Arc;

use crate::kv::txn_coord_sender::{TxnCoordMeta, TxnCoordSender};
use crate::kvpb::{BatchRequest, BatchResponse, Transaction, UserPriority};
use crate::utils::{Ctx, KvError};

use async_trait::async_trait;

/// Sends a batch and returns its response.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, ctx: &Ctx, ba: BatchRequest) -> Result<BatchResponse, KvError>;
}

/// Role of a transaction coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnType {
    /// Owns the transaction: heartbeats it, commits it, handles retries and
    /// savepoints.
    Root,

    /// Read-only helper fed from a root's meta; used by distributed
    /// execution and merged back into the root afterwards.
    Leaf,
}

/// What to build in `TxnCoordSenderFactory::sender()`.
#[derive(Debug, Clone)]
pub enum SenderKind {
    Root {
        txn: Transaction,
        user_priority: UserPriority,
    },
    Leaf {
        meta: TxnCoordMeta,
    },
    NonTxn,
}

/// Sender handed out by the factory.
#[derive(Clone)]
pub enum TxnSender {
    Txn(Arc<TxnCoordSender>),
    NonTxn(Arc<dyn Sender>),
}

impl TxnSender {
    /// The transaction coordinator, unless this is the non-transactional
    /// sender.
    pub fn coordinator(&self) -> Option<&Arc<TxnCoordSender>> {
        match self {
            TxnSender::Txn(tcs) => Some(tcs),
            TxnSender::NonTxn(_) => None,
        }
    }
}

#[async_trait]
impl Sender for TxnSender {
    async fn send(&self, ctx: &Ctx, ba: BatchRequest) -> Result<BatchResponse, KvError> {
        match self {
            TxnSender::Txn(tcs) => tcs.send(ctx, ba).await,
            TxnSender::NonTxn(sender) => sender.send(ctx, ba).await,
        }
    }
}
