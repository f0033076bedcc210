//! Request and response types of the batch interface.

use std::fmt;

use crate::hlc::Timestamp;
use crate::kvpb::data::{
    IgnoredSeqRange, KeyValue, MvccStats, RangeDescriptor, RangeInfo,
    ReplicaChange, ReplicaDescriptor, Transaction, TransactionStatus, TxnMeta,
};
use crate::kvpb::keys::{Key, Span};
use crate::kvpb::{NodeId, RangeId, StoreId};

use bytes::Bytes;

use rand::Rng;

/// Every request method known to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    ConditionalPut,
    InitPut,
    Increment,
    Delete,
    DeleteRange,
    Scan,
    ReverseScan,
    BeginTxn,
    EndTxn,
    HeartbeatTxn,
    PushTxn,
    QueryTxn,
    ResolveIntent,
    AdminSplit,
    AdminMerge,
    AdminTransferLease,
    AdminChangeReplicas,
    RangeStats,
    Subsume,
}

impl Method {
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            Method::AdminSplit
                | Method::AdminMerge
                | Method::AdminTransferLease
                | Method::AdminChangeReplicas
        )
    }

    /// Writes replicated state and so goes through consensus.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Method::Put
                | Method::ConditionalPut
                | Method::InitPut
                | Method::Increment
                | Method::Delete
                | Method::DeleteRange
                | Method::BeginTxn
                | Method::EndTxn
                | Method::HeartbeatTxn
                | Method::PushTxn
                | Method::ResolveIntent
                | Method::Subsume
        )
    }

    pub fn is_read_only(&self) -> bool {
        !self.is_admin() && !self.is_write()
    }

    /// Operates over `[key, end_key)` rather than a single key.
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            Method::DeleteRange
                | Method::Scan
                | Method::ReverseScan
                | Method::ResolveIntent
        )
    }

    /// Transactional write that consumes a sequence number.
    pub fn is_txn_write(&self) -> bool {
        matches!(
            self,
            Method::Put
                | Method::ConditionalPut
                | Method::InitPut
                | Method::Increment
                | Method::Delete
                | Method::DeleteRange
        )
    }

    /// Acquires locks on the keys it touches.
    pub fn is_locking(&self) -> bool {
        self.is_txn_write()
    }

    /// Reads user data at a timestamp and records it in the timestamp cache.
    pub fn updates_ts_cache(&self) -> bool {
        matches!(
            self,
            Method::Get
                | Method::Scan
                | Method::ReverseScan
                | Method::ConditionalPut
                | Method::InitPut
                | Method::Increment
                | Method::DeleteRange
        )
    }

    /// Writes subject to range-size backpressure.
    pub fn can_backpressure(&self) -> bool {
        self.is_txn_write()
    }

    /// Operates on a transaction record rather than user data.
    pub fn is_txn_record_op(&self) -> bool {
        matches!(
            self,
            Method::BeginTxn
                | Method::EndTxn
                | Method::HeartbeatTxn
                | Method::PushTxn
                | Method::QueryTxn
        )
    }

    /// Requests whose evaluation needs no lease (served by any replica).
    pub fn skips_lease_check(&self) -> bool {
        matches!(self, Method::Subsume)
    }
}

/// Header shared by every request kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestHeader {
    pub key: Key,
    pub end_key: Key,
    pub sequence: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushTxnType {
    /// Push the pushee's write timestamp above the pusher's read.
    PushTimestamp,
    /// Abort the pushee.
    PushAbort,
    /// Only succeed if the pushee is already finalized or expired.
    PushTouch,
}

/// Method-specific arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestArgs {
    Get,
    Put {
        value: Bytes,
    },
    ConditionalPut {
        value: Bytes,
        exp_value: Option<Bytes>,
    },
    InitPut {
        value: Bytes,
        fail_on_tombstones: bool,
    },
    Increment {
        increment: i64,
    },
    Delete,
    DeleteRange {
        return_keys: bool,
    },
    Scan {
        max_keys: usize,
    },
    ReverseScan {
        max_keys: usize,
    },
    BeginTxn,
    EndTxn {
        commit: bool,
        deadline: Option<Timestamp>,
        lock_spans: Vec<Span>,
        /// Commit at the pushed write timestamp instead of retrying; set
        /// when no reads of the transaction need refreshing.
        can_commit_at_higher_timestamp: bool,
    },
    HeartbeatTxn {
        now: Timestamp,
    },
    PushTxn {
        pusher: Option<Box<Transaction>>,
        pushee: TxnMeta,
        push_to: Timestamp,
        push_type: PushTxnType,
    },
    QueryTxn {
        txn: TxnMeta,
    },
    ResolveIntent {
        intent_txn: TxnMeta,
        status: TransactionStatus,
        ignored_seq_ranges: Vec<IgnoredSeqRange>,
    },
    AdminSplit {
        split_key: Key,
    },
    AdminMerge {
        reason: String,
    },
    AdminTransferLease {
        target: StoreId,
    },
    AdminChangeReplicas {
        changes: Vec<ReplicaChange>,
    },
    RangeStats,
    Subsume {
        left_desc: RangeDescriptor,
        right_desc: RangeDescriptor,
    },
}

/// One request of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub header: RequestHeader,
    pub args: RequestArgs,
}

impl Request {
    fn with(key: impl Into<Key>, end_key: Key, args: RequestArgs) -> Self {
        Request {
            header: RequestHeader {
                key: key.into(),
                end_key,
                sequence: 0,
            },
            args,
        }
    }

    pub fn get(key: impl Into<Key>) -> Self {
        Self::with(key, Bytes::new(), RequestArgs::Get)
    }

    pub fn put(key: impl Into<Key>, value: impl Into<Bytes>) -> Self {
        Self::with(
            key,
            Bytes::new(),
            RequestArgs::Put {
                value: value.into(),
            },
        )
    }

    pub fn conditional_put(
        key: impl Into<Key>,
        value: impl Into<Bytes>,
        exp_value: Option<Bytes>,
    ) -> Self {
        Self::with(
            key,
            Bytes::new(),
            RequestArgs::ConditionalPut {
                value: value.into(),
                exp_value,
            },
        )
    }

    pub fn init_put(key: impl Into<Key>, value: impl Into<Bytes>) -> Self {
        Self::with(
            key,
            Bytes::new(),
            RequestArgs::InitPut {
                value: value.into(),
                fail_on_tombstones: false,
            },
        )
    }

    pub fn increment(key: impl Into<Key>, increment: i64) -> Self {
        Self::with(key, Bytes::new(), RequestArgs::Increment { increment })
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Self::with(key, Bytes::new(), RequestArgs::Delete)
    }

    pub fn delete_range(key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Self::with(
            key,
            end_key.into(),
            RequestArgs::DeleteRange { return_keys: true },
        )
    }

    pub fn scan(key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Self::with(key, end_key.into(), RequestArgs::Scan { max_keys: 0 })
    }

    pub fn reverse_scan(key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Self::with(
            key,
            end_key.into(),
            RequestArgs::ReverseScan { max_keys: 0 },
        )
    }

    pub fn begin_txn(anchor: Key) -> Self {
        Self::with(anchor, Bytes::new(), RequestArgs::BeginTxn)
    }

    pub fn end_txn(anchor: Key, commit: bool, lock_spans: Vec<Span>) -> Self {
        Self::with(
            anchor,
            Bytes::new(),
            RequestArgs::EndTxn {
                commit,
                deadline: None,
                lock_spans,
                can_commit_at_higher_timestamp: false,
            },
        )
    }

    pub fn heartbeat_txn(anchor: Key, now: Timestamp) -> Self {
        Self::with(anchor, Bytes::new(), RequestArgs::HeartbeatTxn { now })
    }

    pub fn push_txn(
        pusher: Option<Transaction>,
        pushee: TxnMeta,
        push_to: Timestamp,
        push_type: PushTxnType,
    ) -> Self {
        Self::with(
            pushee.key.clone(),
            Bytes::new(),
            RequestArgs::PushTxn {
                pusher: pusher.map(Box::new),
                pushee,
                push_to,
                push_type,
            },
        )
    }

    pub fn query_txn(txn: TxnMeta) -> Self {
        Self::with(txn.key.clone(), Bytes::new(), RequestArgs::QueryTxn { txn })
    }

    pub fn resolve_intent(
        span: Span,
        intent_txn: TxnMeta,
        status: TransactionStatus,
        ignored_seq_ranges: Vec<IgnoredSeqRange>,
    ) -> Self {
        Self::with(
            span.key,
            span.end_key,
            RequestArgs::ResolveIntent {
                intent_txn,
                status,
                ignored_seq_ranges,
            },
        )
    }

    pub fn admin_split(key: impl Into<Key>, split_key: Key) -> Self {
        Self::with(key, Bytes::new(), RequestArgs::AdminSplit { split_key })
    }

    pub fn admin_merge(key: impl Into<Key>, reason: impl Into<String>) -> Self {
        Self::with(
            key,
            Bytes::new(),
            RequestArgs::AdminMerge {
                reason: reason.into(),
            },
        )
    }

    pub fn admin_transfer_lease(key: impl Into<Key>, target: StoreId) -> Self {
        Self::with(
            key,
            Bytes::new(),
            RequestArgs::AdminTransferLease { target },
        )
    }

    pub fn admin_change_replicas(
        key: impl Into<Key>,
        changes: Vec<ReplicaChange>,
    ) -> Self {
        Self::with(
            key,
            Bytes::new(),
            RequestArgs::AdminChangeReplicas { changes },
        )
    }

    pub fn range_stats(key: impl Into<Key>) -> Self {
        Self::with(key, Bytes::new(), RequestArgs::RangeStats)
    }

    pub fn subsume(left_desc: RangeDescriptor, right_desc: RangeDescriptor) -> Self {
        Self::with(
            right_desc.start_key.clone(),
            Bytes::new(),
            RequestArgs::Subsume {
                left_desc,
                right_desc,
            },
        )
    }

    pub fn method(&self) -> Method {
        match &self.args {
            RequestArgs::Get => Method::Get,
            RequestArgs::Put { .. } => Method::Put,
            RequestArgs::ConditionalPut { .. } => Method::ConditionalPut,
            RequestArgs::InitPut { .. } => Method::InitPut,
            RequestArgs::Increment { .. } => Method::Increment,
            RequestArgs::Delete => Method::Delete,
            RequestArgs::DeleteRange { .. } => Method::DeleteRange,
            RequestArgs::Scan { .. } => Method::Scan,
            RequestArgs::ReverseScan { .. } => Method::ReverseScan,
            RequestArgs::BeginTxn => Method::BeginTxn,
            RequestArgs::EndTxn { .. } => Method::EndTxn,
            RequestArgs::HeartbeatTxn { .. } => Method::HeartbeatTxn,
            RequestArgs::PushTxn { .. } => Method::PushTxn,
            RequestArgs::QueryTxn { .. } => Method::QueryTxn,
            RequestArgs::ResolveIntent { .. } => Method::ResolveIntent,
            RequestArgs::AdminSplit { .. } => Method::AdminSplit,
            RequestArgs::AdminMerge { .. } => Method::AdminMerge,
            RequestArgs::AdminTransferLease { .. } => {
                Method::AdminTransferLease
            }
            RequestArgs::AdminChangeReplicas { .. } => {
                Method::AdminChangeReplicas
            }
            RequestArgs::RangeStats => Method::RangeStats,
            RequestArgs::Subsume { .. } => Method::Subsume,
        }
    }

    pub fn span(&self) -> Span {
        Span {
            key: self.header.key.clone(),
            end_key: self.header.end_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadConsistency {
    #[default]
    Consistent,
    ReadUncommitted,
    Inconsistent,
}

/// What a request does on meeting a conflicting lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitPolicy {
    #[default]
    Block,
    Error,
    SkipLocked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UserPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl UserPriority {
    /// Draws a random transaction priority in the band of this user
    /// priority; bands do not overlap.
    pub fn make_priority(&self) -> i32 {
        let mut rng = rand::thread_rng();
        match self {
            UserPriority::Low => rng.gen_range(1..1_000),
            UserPriority::Normal => rng.gen_range(1_000..1_000_000),
            UserPriority::High => rng.gen_range(1_000_000..i32::MAX),
        }
    }
}

/// Header shared by all requests of a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    pub txn: Option<Transaction>,
    pub timestamp: Timestamp,
    pub user_priority: UserPriority,
    pub read_consistency: ReadConsistency,
    pub wait_policy: WaitPolicy,
    pub return_range_info: bool,

    /// Target range, filled in by the gateway's routing layer.
    pub range_id: RangeId,

    /// Target replica, filled in by the gateway's routing layer.
    pub replica: ReplicaDescriptor,

    pub gateway_node_id: NodeId,

    /// Reads served from a replicated table at a fixed offset in the past.
    pub replication_table: bool,
}

/// Ordered sequence of requests sharing a header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRequest {
    pub header: Header,
    pub requests: Vec<Request>,
}

impl BatchRequest {
    pub fn new(header: Header, requests: Vec<Request>) -> Self {
        BatchRequest { header, requests }
    }

    /// Convenience for a single request with a default header.
    pub fn single(req: Request) -> Self {
        BatchRequest {
            header: Header::default(),
            requests: vec![req],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn is_admin(&self) -> bool {
        self.requests.iter().any(|r| r.method().is_admin())
    }

    pub fn is_read_only(&self) -> bool {
        !self.requests.is_empty()
            && self.requests.iter().all(|r| r.method().is_read_only())
    }

    pub fn is_write(&self) -> bool {
        self.requests.iter().any(|r| r.method().is_write())
    }

    pub fn is_locking(&self) -> bool {
        self.requests.iter().any(|r| r.method().is_locking())
    }

    pub fn is_single(&self, method: Method) -> bool {
        self.requests.len() == 1 && self.requests[0].method() == method
    }

    pub fn has_end_txn(&self) -> bool {
        self.requests
            .last()
            .map_or(false, |r| r.method() == Method::EndTxn)
    }

    /// Timestamp reads of this batch are served at.
    pub fn read_timestamp(&self) -> Timestamp {
        match &self.header.txn {
            Some(txn) => txn.read_timestamp,
            None => self.header.timestamp,
        }
    }

    /// Timestamp writes of this batch are laid down at.
    pub fn write_timestamp(&self) -> Timestamp {
        match &self.header.txn {
            Some(txn) => txn.write_timestamp(),
            None => self.header.timestamp,
        }
    }

    /// Smallest span covering every request key.
    pub fn rspan(&self) -> Option<Span> {
        let mut iter = self.requests.iter();
        let first = iter.next()?;
        let mut key = first.header.key.clone();
        let mut end = first.span().end_exclusive();
        for r in iter {
            if r.header.key < key {
                key = r.header.key.clone();
            }
            let e = r.span().end_exclusive();
            if e > end {
                end = e;
            }
        }
        Some(Span::range(key, end))
    }
}

impl fmt::Display for BatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, r) in self.requests.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?} {:?}", r.method(), r.span())?;
        }
        if let Some(txn) = &self.header.txn {
            write!(f, " [txn {}]", txn.short_id())?;
        }
        Ok(())
    }
}

/// Method-specific results.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Get {
        value: Option<Bytes>,
    },
    Put,
    ConditionalPut,
    InitPut,
    Increment {
        new_value: i64,
    },
    Delete,
    DeleteRange {
        keys: Vec<Key>,
    },
    Scan {
        rows: Vec<KeyValue>,
    },
    ReverseScan {
        rows: Vec<KeyValue>,
    },
    BeginTxn,
    EndTxn,
    HeartbeatTxn,
    PushTxn {
        pushee: Transaction,
    },
    QueryTxn {
        txn: Option<Transaction>,
    },
    ResolveIntent,
    AdminSplit,
    AdminMerge,
    AdminTransferLease,
    AdminChangeReplicas {
        desc: RangeDescriptor,
    },
    RangeStats {
        stats: MvccStats,
        qps: f64,
    },
    Subsume {
        desc: RangeDescriptor,
        stats: MvccStats,
        lease_applied_index: u64,
        /// Raft index the subsumed range had applied when frozen; replicas
        /// of the left-hand side catch up to it before absorbing the data.
        applied_index: u64,
        freeze_start: Timestamp,
    },
}

impl Response {
    /// Folds the partial response of a request split across ranges into
    /// `self`. Parts arrive in key order (reverse order for reverse scans).
    pub fn combine(&mut self, other: Response) {
        match (self, other) {
            (Response::Scan { rows }, Response::Scan { rows: more })
            | (
                Response::ReverseScan { rows },
                Response::ReverseScan { rows: more },
            ) => rows.extend(more),
            (
                Response::DeleteRange { keys },
                Response::DeleteRange { keys: more },
            ) => keys.extend(more),
            _ => {}
        }
    }

    /// Number of rows returned by a scan, if this is one.
    pub fn num_rows(&self) -> usize {
        match self {
            Response::Scan { rows } | Response::ReverseScan { rows } => {
                rows.len()
            }
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResponseHeader {
    /// Updated transaction proto.
    pub txn: Option<Transaction>,

    /// Clock reading of the serving node.
    pub now: Timestamp,

    pub range_infos: Vec<RangeInfo>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResponse {
    pub header: BatchResponseHeader,
    pub responses: Vec<Response>,
}

#[cfg(test)]
mod api_tests {
    use super::*;

    #[test]
    fn classify_batches() {
        let ro = BatchRequest::new(
            Header::default(),
            vec![Request::get("a"), Request::scan("b", "c")],
        );
        assert!(ro.is_read_only());
        assert!(!ro.is_write());
        let rw = BatchRequest::new(
            Header::default(),
            vec![Request::get("a"), Request::put("a", "v")],
        );
        assert!(!rw.is_read_only());
        assert!(rw.is_write());
        assert!(rw.is_locking());
        let admin = BatchRequest::single(Request::admin_split("a", Bytes::from("b")));
        assert!(admin.is_admin());
        assert!(!BatchRequest::default().is_read_only());
    }

    #[test]
    fn batch_rspan() {
        let ba = BatchRequest::new(
            Header::default(),
            vec![Request::get("m"), Request::scan("b", "d"), Request::put("x", "v")],
        );
        let span = ba.rspan().unwrap();
        assert_eq!(span.key.as_ref(), b"b");
        assert_eq!(span.end_key.as_ref(), b"x\x00");
    }

    #[test]
    fn combine_scans() {
        let mut a = Response::Scan {
            rows: vec![KeyValue {
                key: Bytes::from("a"),
                value: Bytes::from("1"),
            }],
        };
        a.combine(Response::Scan {
            rows: vec![KeyValue {
                key: Bytes::from("q"),
                value: Bytes::from("2"),
            }],
        });
        assert_eq!(a.num_rows(), 2);
    }

    #[test]
    fn priorities_banded() {
        for _ in 0..100 {
            assert!(UserPriority::Low.make_priority() < UserPriority::Normal.make_priority());
            assert!(UserPriority::Normal.make_priority() < UserPriority::High.make_priority());
        }
    }
}
