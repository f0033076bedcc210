//! Customized unified error type.
//!
//! Every error carries the `(detail, txn?, index?)` envelope: `detail` names
//! the semantic kind, `txn` is the updated transaction the client must merge,
//! and `index` points at the offending request inside a batch.

use std::error;
use std::fmt;
use std::io;
use std::num;
use std::string;

use crate::hlc::Timestamp;
use crate::kvpb::{
    Intent, Key, Lease, NodeId, RangeDescriptor, RangeId, ReplicaDescriptor,
    StoreId, Transaction, TxnId,
};

use bytes::Bytes;

/// Why a transaction was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Unknown,
    AbortedRecordFound,
    PusherAborted,
    ClientReject,
    TimestampCacheRejected,
    AbandonedByHeartbeat,
}

/// Why a transaction must retry at a new epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Unknown,
    WriteTooOld,
    Serializable,
    AsyncWriteFailure,
    CommitDeadlineExceeded,
}

/// Tagged error detail, one variant per semantic kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDetail {
    /// This replica isn't the leaseholder; `lease_holder` hints the probable
    /// one.
    NotLeaseHolder {
        range_id: RangeId,
        replica: Option<ReplicaDescriptor>,
        lease_holder: Option<ReplicaDescriptor>,
        lease: Option<Lease>,
    },

    /// Request key falls outside this range.
    RangeKeyMismatch {
        key: Key,
        end_key: Key,
        mismatched: Option<RangeDescriptor>,
    },

    /// Range absent on this store.
    RangeNotFound { range_id: RangeId, store_id: StoreId },

    /// Conflicting locks discovered during evaluation.
    WriteIntent { intents: Vec<Intent> },

    /// Conflicting lock met by a request with the error wait policy.
    LockConflict { intents: Vec<Intent> },

    /// Push failed because the pushee is still live.
    TransactionPush { pushee: Box<Transaction> },

    /// Staging record whose outcome is not yet known.
    IndeterminateCommit { staging_txn: Box<Transaction> },

    /// Range is frozen as the right-hand side of a merge.
    MergeInProgress,

    /// Write at a timestamp below an existing committed version.
    WriteTooOld {
        timestamp: Timestamp,
        actual_timestamp: Timestamp,
    },

    /// A value exists in the reader's uncertainty interval.
    ReadWithinUncertaintyInterval {
        read_timestamp: Timestamp,
        existing_timestamp: Timestamp,
        max_timestamp: Timestamp,
    },

    TransactionAborted { reason: AbortReason },

    TransactionRetry { reason: RetryReason, extra: String },

    /// Client-visible retry produced by the transaction sender after an epoch
    /// bump; `next_txn` is the proto the caller must continue with.
    TransactionRetryWithProtoRefresh {
        msg: String,
        txn_id: TxnId,
        next_txn: Box<Transaction>,
        cause: Box<ErrorDetail>,
    },

    /// Request issued on a transaction that has already finished.
    TxnFinalized { status: String },

    /// Outcome of the request is unknown.
    AmbiguousResult { message: String },

    /// Compare-and-set mismatch.
    ConditionFailed { actual_value: Option<Bytes> },

    /// Circuit breaker open for a peer.
    BreakerOpen { name: String, node_id: Option<NodeId> },

    /// Shutdown in progress.
    Unavailable { message: String },

    /// Remote clock reading too far ahead.
    ClockOutOfBounds {
        remote: Timestamp,
        physical_now: i64,
        max_offset_nanos: i64,
    },

    /// Lease request rejected because it conflicts with an existing lease.
    LeaseRejected {
        message: String,
        requested: Box<Lease>,
        existing: Box<Lease>,
    },

    /// Proposal applied at a lease-applied index it did not reserve.
    ProposalIllegalLeaseIndex,

    /// No split key could be found inside the range.
    UnsplittableRange { range_id: RangeId },

    /// Request context was cancelled.
    Canceled,

    /// Request context deadline passed.
    DeadlineExceeded,

    /// Anything else, mostly programmer or I/O errors.
    Internal(String),
}

impl ErrorDetail {
    /// Short name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ErrorDetail::NotLeaseHolder { .. } => "NotLeaseHolder",
            ErrorDetail::RangeKeyMismatch { .. } => "RangeKeyMismatch",
            ErrorDetail::RangeNotFound { .. } => "RangeNotFound",
            ErrorDetail::WriteIntent { .. } => "WriteIntent",
            ErrorDetail::LockConflict { .. } => "LockConflict",
            ErrorDetail::TransactionPush { .. } => "TransactionPush",
            ErrorDetail::IndeterminateCommit { .. } => "IndeterminateCommit",
            ErrorDetail::MergeInProgress => "MergeInProgress",
            ErrorDetail::WriteTooOld { .. } => "WriteTooOld",
            ErrorDetail::ReadWithinUncertaintyInterval { .. } => {
                "ReadWithinUncertaintyInterval"
            }
            ErrorDetail::TransactionAborted { .. } => "TransactionAborted",
            ErrorDetail::TransactionRetry { .. } => "TransactionRetry",
            ErrorDetail::TransactionRetryWithProtoRefresh { .. } => {
                "TransactionRetryWithProtoRefresh"
            }
            ErrorDetail::TxnFinalized { .. } => "TxnFinalized",
            ErrorDetail::AmbiguousResult { .. } => "AmbiguousResult",
            ErrorDetail::ConditionFailed { .. } => "ConditionFailed",
            ErrorDetail::BreakerOpen { .. } => "BreakerOpen",
            ErrorDetail::Unavailable { .. } => "Unavailable",
            ErrorDetail::ClockOutOfBounds { .. } => "ClockOutOfBounds",
            ErrorDetail::LeaseRejected { .. } => "LeaseRejected",
            ErrorDetail::ProposalIllegalLeaseIndex => "ProposalIllegalLeaseIndex",
            ErrorDetail::UnsplittableRange { .. } => "UnsplittableRange",
            ErrorDetail::Canceled => "Canceled",
            ErrorDetail::DeadlineExceeded => "DeadlineExceeded",
            ErrorDetail::Internal(_) => "Internal",
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorDetail::NotLeaseHolder {
                range_id,
                lease_holder,
                ..
            } => write!(
                f,
                "r{}: not lease holder; current lease holder {:?}",
                range_id,
                lease_holder.as_ref().map(|r| r.node_id)
            ),
            ErrorDetail::RangeKeyMismatch { key, end_key, .. } => write!(
                f,
                "key range {:?}-{:?} outside of bounds of range",
                key, end_key
            ),
            ErrorDetail::RangeNotFound { range_id, store_id } => {
                write!(f, "r{} was not found on s{}", range_id, store_id)
            }
            ErrorDetail::WriteIntent { intents } => {
                write!(f, "conflicting intents on {} key(s)", intents.len())
            }
            ErrorDetail::LockConflict { intents } => write!(
                f,
                "conflicting locks on {:?}",
                intents.iter().map(|i| &i.key).collect::<Vec<_>>()
            ),
            ErrorDetail::TransactionPush { pushee } => {
                write!(f, "failed to push {}", pushee.short_id())
            }
            ErrorDetail::WriteTooOld {
                timestamp,
                actual_timestamp,
            } => write!(
                f,
                "write at timestamp {} too old; wrote at {}",
                timestamp, actual_timestamp
            ),
            ErrorDetail::ReadWithinUncertaintyInterval {
                read_timestamp,
                existing_timestamp,
                ..
            } => write!(
                f,
                "read at {} encountered previous write at {} within uncertainty",
                read_timestamp, existing_timestamp
            ),
            ErrorDetail::TransactionAborted { reason } => {
                write!(f, "transaction aborted: {:?}", reason)
            }
            ErrorDetail::TransactionRetry { reason, extra } => {
                write!(f, "transaction retry: {:?} {}", reason, extra)
            }
            ErrorDetail::TransactionRetryWithProtoRefresh { msg, .. } => {
                write!(f, "retry with refreshed txn: {}", msg)
            }
            ErrorDetail::TxnFinalized { status } => {
                write!(f, "transaction already finalized ({})", status)
            }
            ErrorDetail::AmbiguousResult { message } => {
                write!(f, "result is ambiguous: {}", message)
            }
            ErrorDetail::ConditionFailed { actual_value } => {
                write!(f, "unexpected value: {:?}", actual_value)
            }
            ErrorDetail::BreakerOpen { name, node_id } => match node_id {
                Some(n) => write!(f, "breaker open for n{} ({})", n, name),
                None => write!(f, "breaker open ({})", name),
            },
            ErrorDetail::Unavailable { message } => {
                write!(f, "unavailable: {}", message)
            }
            ErrorDetail::ClockOutOfBounds { remote, physical_now, .. } => write!(
                f,
                "remote timestamp {} exceeds physical time {} by more than max offset",
                remote, physical_now
            ),
            ErrorDetail::LeaseRejected { message, .. } => {
                write!(f, "cannot replace lease: {}", message)
            }
            ErrorDetail::UnsplittableRange { range_id } => {
                write!(f, "r{}: could not find valid split key", range_id)
            }
            ErrorDetail::Canceled => write!(f, "context canceled"),
            ErrorDetail::DeadlineExceeded => {
                write!(f, "context deadline exceeded")
            }
            ErrorDetail::Internal(msg) => write!(f, "{}", msg), // no quotes
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Customized error type carrying the error envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct KvError {
    /// Tagged semantic kind.
    pub detail: ErrorDetail,

    /// Updated transaction proto, if the error happened inside one.
    pub txn: Option<Box<Transaction>>,

    /// Index of the offending request in its batch.
    pub index: Option<usize>,
}

impl KvError {
    pub fn new(detail: ErrorDetail) -> Self {
        KvError {
            detail,
            txn: None,
            index: None,
        }
    }

    /// Creates an internal error from a message.
    pub fn msg(msg: impl ToString) -> Self {
        Self::new(ErrorDetail::Internal(msg.to_string()))
    }

    pub fn unavailable(msg: impl ToString) -> Self {
        Self::new(ErrorDetail::Unavailable {
            message: msg.to_string(),
        })
    }

    pub fn with_txn(mut self, txn: Option<Transaction>) -> Self {
        self.txn = txn.map(Box::new);
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    /// Errors the replica resolves itself by waiting and re-sequencing.
    pub fn is_concurrency_retry(&self) -> bool {
        matches!(
            self.detail,
            ErrorDetail::WriteIntent { .. }
                | ErrorDetail::TransactionPush { .. }
                | ErrorDetail::IndeterminateCommit { .. }
                | ErrorDetail::MergeInProgress
        )
    }

    /// Errors after which a transaction restarts at a new epoch.
    pub fn is_txn_retryable(&self) -> bool {
        matches!(
            self.detail,
            ErrorDetail::WriteTooOld { .. }
                | ErrorDetail::ReadWithinUncertaintyInterval { .. }
                | ErrorDetail::TransactionRetry { .. }
        )
    }

    /// Errors that make the gateway refresh routing information and retry.
    pub fn is_routing_retry(&self) -> bool {
        matches!(
            self.detail,
            ErrorDetail::NotLeaseHolder { .. }
                | ErrorDetail::RangeKeyMismatch { .. }
                | ErrorDetail::RangeNotFound { .. }
        )
    }

    /// Errors the transaction client retries by re-running its closure.
    pub fn is_client_retryable(&self) -> bool {
        matches!(
            self.detail,
            ErrorDetail::TransactionRetryWithProtoRefresh { .. }
        )
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self.detail, ErrorDetail::AmbiguousResult { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self.detail, ErrorDetail::Unavailable { .. })
    }

    pub fn is_ctx_err(&self) -> bool {
        matches!(
            self.detail,
            ErrorDetail::Canceled | ErrorDetail::DeadlineExceeded
        )
    }
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.txn {
            Some(txn) => write!(f, "{} [txn {}]", self.detail, txn.short_id()),
            None => write!(f, "{}", self.detail),
        }
    }
}

impl error::Error for KvError {}

impl From<ErrorDetail> for KvError {
    fn from(detail: ErrorDetail) -> Self {
        KvError::new(detail)
    }
}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `KvError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for KvError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                KvError::msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `KvError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for KvError {
            fn from(e: $error) -> KvError {
                KvError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(prost::DecodeError);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::watch::error::RecvError);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = KvError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = KvError::from(io_error);
        assert!(matches!(e.detail, ErrorDetail::Internal(ref s) if s.contains("oh no!")));
    }

    #[test]
    fn classify() {
        assert!(KvError::new(ErrorDetail::MergeInProgress).is_concurrency_retry());
        assert!(KvError::new(ErrorDetail::WriteIntent { intents: vec![] })
            .is_concurrency_retry());
        assert!(!KvError::new(ErrorDetail::Canceled).is_concurrency_retry());
        assert!(KvError::new(ErrorDetail::WriteTooOld {
            timestamp: Timestamp::new(1, 0),
            actual_timestamp: Timestamp::new(2, 0),
        })
        .is_txn_retryable());
        assert!(KvError::new(ErrorDetail::RangeNotFound {
            range_id: 1,
            store_id: 1
        })
        .is_routing_retry());
    }

    #[test]
    fn envelope_index() {
        let e = KvError::new(ErrorDetail::ConditionFailed { actual_value: None })
            .with_index(3);
        assert_eq!(e.index, Some(3));
        assert!(e.txn.is_none());
    }
}
