//! Data model shared by every layer: keys, transactions, descriptors, leases,
//! and the batch request/response envelope.

mod api;
mod data;
pub mod keys;

pub use api::{
    BatchRequest, BatchResponse, BatchResponseHeader, Header, Method,
    PushTxnType, ReadConsistency, Request, RequestArgs, RequestHeader,
    Response, UserPriority, WaitPolicy,
};
pub use data::{
    is_seq_ignored, ChangeReplicasKind, IgnoredSeqRange, Intent, KeyValue, Lease, LeaseType,
    LockUpdate, MvccStats, ObservedTimestamp, RangeDescriptor, RangeInfo,
    ReplicaChange, ReplicaDescriptor, ReplicationTarget, Transaction,
    TransactionStatus, TxnMeta,
};
pub use keys::{Key, Span};

/// Node identifier, unique in the cluster.
pub type NodeId = u32;

/// Store identifier, unique in the cluster.
pub type StoreId = u32;

/// Range identifier; stable across splits for the left-hand side.
pub type RangeId = u64;

/// Replica identifier, unique within its range.
pub type ReplicaId = u32;

/// Transaction identifier.
pub type TxnId = uuid::Uuid;

/// Lease sequence number.
pub type LeaseSequence = u64;

/// Per-range lease-scoped apply counter.
pub type LeaseAppliedIndex = u64;
