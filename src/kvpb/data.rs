//! Transactions, descriptors, leases and other records.

use std::fmt;

use crate::hlc::Timestamp;
use crate::kvpb::keys::{Key, Span, SYSTEM_MAX};
use crate::kvpb::{
    LeaseSequence, NodeId, RangeId, ReplicaId, StoreId, TxnId,
};

use bytes::Bytes;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Transaction status. Only moves forward, except that `Pending` or
/// `Staging` may be aborted at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Staging,
    Committed,
    Aborted,
}

impl TransactionStatus {
    #[inline]
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// Inclusive range of sequence numbers rolled back by a savepoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct IgnoredSeqRange {
    pub start: i32,
    pub end: i32,
}

/// True if `seq` falls into any of the (sorted, disjoint) ignored ranges.
pub fn is_seq_ignored(seq: i32, ranges: &[IgnoredSeqRange]) -> bool {
    ranges.iter().any(|r| r.start <= seq && seq <= r.end)
}

/// Timestamp observed on a node; bounds the uncertainty interval of later
/// reads served by that node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTimestamp {
    pub node_id: NodeId,
    pub timestamp: Timestamp,
}

/// Part of the transaction stored alongside every intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnMeta {
    pub id: TxnId,

    /// Anchor key; the transaction record lives in the range holding it.
    pub key: Key,

    pub epoch: i32,
    pub write_timestamp: Timestamp,
    pub min_timestamp: Timestamp,
    pub priority: i32,
    pub sequence: i32,
}

/// Full transaction proto.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub meta: TxnMeta,
    pub name: String,
    pub status: TransactionStatus,
    pub read_timestamp: Timestamp,

    /// Upper bound of the uncertainty interval.
    pub max_timestamp: Timestamp,

    pub last_heartbeat: Timestamp,
    pub observed_timestamps: Vec<ObservedTimestamp>,
    pub ignored_seq_ranges: Vec<IgnoredSeqRange>,

    /// Pinned timestamp; the transaction can never be pushed.
    pub commit_timestamp_fixed: bool,

    /// A write was laid down above the transaction's timestamp; commit must
    /// restart the transaction.
    pub write_too_old: bool,

    /// Spans locked so far; attached to the record at commit.
    pub lock_spans: Vec<Span>,
}

impl Transaction {
    /// Creates a pending transaction reading at `now`.
    pub fn new(
        name: impl Into<String>,
        anchor: Key,
        priority: i32,
        now: Timestamp,
        max_offset_nanos: i64,
    ) -> Self {
        Transaction {
            meta: TxnMeta {
                id: uuid::Uuid::new_v4(),
                key: anchor,
                epoch: 0,
                write_timestamp: now,
                min_timestamp: now,
                priority,
                sequence: 0,
            },
            name: name.into(),
            status: TransactionStatus::Pending,
            read_timestamp: now,
            max_timestamp: now.add(max_offset_nanos, 0),
            last_heartbeat: Timestamp::default(),
            observed_timestamps: Vec::new(),
            ignored_seq_ranges: Vec::new(),
            commit_timestamp_fixed: false,
            write_too_old: false,
            lock_spans: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> TxnId {
        self.meta.id
    }

    #[inline]
    pub fn epoch(&self) -> i32 {
        self.meta.epoch
    }

    #[inline]
    pub fn write_timestamp(&self) -> Timestamp {
        self.meta.write_timestamp
    }

    #[inline]
    pub fn sequence(&self) -> i32 {
        self.meta.sequence
    }

    /// First eight characters of the id, for logs.
    pub fn short_id(&self) -> String {
        self.meta.id.to_string()[..8].to_string()
    }

    /// Restarts at a new epoch: bumps the epoch, resets the sequence,
    /// forwards timestamps to `ts`, and drops savepoint rollbacks.
    pub fn restart(&mut self, priority: i32, ts: Timestamp) {
        self.meta.epoch += 1;
        self.meta.sequence = 0;
        self.meta.priority = self.meta.priority.max(priority);
        self.meta.write_timestamp.forward(ts);
        self.read_timestamp = self.meta.write_timestamp;
        self.max_timestamp.forward(self.read_timestamp);
        self.write_too_old = false;
        self.ignored_seq_ranges.clear();
    }

    /// Merges another copy of the same transaction into `self`.
    pub fn update(&mut self, o: &Transaction) {
        if o.meta.id != self.meta.id {
            return;
        }
        if o.meta.epoch > self.meta.epoch {
            self.meta.epoch = o.meta.epoch;
            self.meta.sequence = o.meta.sequence;
            self.read_timestamp = o.read_timestamp;
            self.write_too_old = o.write_too_old;
            self.ignored_seq_ranges = o.ignored_seq_ranges.clone();
        } else if o.meta.epoch == self.meta.epoch {
            self.meta.sequence = self.meta.sequence.max(o.meta.sequence);
            self.read_timestamp.forward(o.read_timestamp);
            self.write_too_old |= o.write_too_old;
            for r in &o.ignored_seq_ranges {
                self.add_ignored_seq_range(*r);
            }
        }
        match (self.status, o.status) {
            (TransactionStatus::Pending, s) => self.status = s,
            (TransactionStatus::Staging, s) if s.is_finalized() => {
                self.status = s
            }
            _ => {}
        }
        self.meta.write_timestamp.forward(o.meta.write_timestamp);
        self.meta.priority = self.meta.priority.max(o.meta.priority);
        self.last_heartbeat.forward(o.last_heartbeat);
        self.commit_timestamp_fixed |= o.commit_timestamp_fixed;
        for ot in &o.observed_timestamps {
            self.update_observed_timestamp(ot.node_id, ot.timestamp);
        }
        if self.meta.key.is_empty() {
            self.meta.key = o.meta.key.clone();
        }
    }

    /// Adds an ignored range, keeping the list sorted and coalesced.
    pub fn add_ignored_seq_range(&mut self, r: IgnoredSeqRange) {
        let mut all = self.ignored_seq_ranges.clone();
        all.push(r);
        all.sort();
        let mut merged: Vec<IgnoredSeqRange> = Vec::with_capacity(all.len());
        for r in all {
            match merged.last_mut() {
                Some(last) if r.start <= last.end + 1 => {
                    last.end = last.end.max(r.end)
                }
                _ => merged.push(r),
            }
        }
        self.ignored_seq_ranges = merged;
    }

    pub fn observed_timestamp(&self, node_id: NodeId) -> Option<Timestamp> {
        self.observed_timestamps
            .iter()
            .find(|ot| ot.node_id == node_id)
            .map(|ot| ot.timestamp)
    }

    /// Records an observation, keeping the lowest per node.
    pub fn update_observed_timestamp(&mut self, node_id: NodeId, ts: Timestamp) {
        match self
            .observed_timestamps
            .iter_mut()
            .find(|ot| ot.node_id == node_id)
        {
            Some(ot) => ot.timestamp.backward(ts),
            None => self.observed_timestamps.push(ObservedTimestamp {
                node_id,
                timestamp: ts,
            }),
        }
    }

    /// Pins every timestamp of the transaction.
    pub fn set_fixed_timestamp(&mut self, ts: Timestamp) {
        self.read_timestamp = ts;
        self.meta.write_timestamp = ts;
        self.meta.min_timestamp = ts;
        self.max_timestamp = ts;
        self.commit_timestamp_fixed = true;
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" meta={{id={} key={:?} epo={} seq={} ts={}}} rts={} max={} stat={:?} ign={:?}",
            self.name,
            self.short_id(),
            self.meta.key,
            self.meta.epoch,
            self.meta.sequence,
            self.meta.write_timestamp,
            self.read_timestamp,
            self.max_timestamp,
            self.status,
            self.ignored_seq_ranges
        )
    }
}

/// One replica of a range.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

/// Node/store pair a replica may be placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationTarget {
    pub node_id: NodeId,
    pub store_id: StoreId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeReplicasKind {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaChange {
    pub kind: ChangeReplicasKind,
    pub target: ReplicationTarget,
}

/// Range descriptor: `[start_key, end_key)` plus replica placement.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Key,
    pub end_key: Key,
    pub replicas: Vec<ReplicaDescriptor>,
    pub next_replica_id: ReplicaId,

    /// Bumped by every split, merge and replica change.
    pub generation: u64,
}

impl RangeDescriptor {
    pub fn span(&self) -> Span {
        Span::range(self.start_key.clone(), self.end_key.clone())
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.start_key.as_ref() <= key && key < self.end_key.as_ref()
    }

    /// True if `[key, end_key)` (or the single key) lies within the range.
    pub fn contains_key_range(&self, key: &[u8], end_key: &[u8]) -> bool {
        if end_key.is_empty() {
            return self.contains_key(key);
        }
        self.start_key.as_ref() <= key && end_key <= self.end_key.as_ref()
    }

    /// Ranges inside the system keyspace use expiration-based leases.
    pub fn is_system(&self) -> bool {
        self.end_key.as_ref() <= SYSTEM_MAX
    }

    pub fn replica_for_store(
        &self,
        store_id: StoreId,
    ) -> Option<ReplicaDescriptor> {
        self.replicas.iter().copied().find(|r| r.store_id == store_id)
    }

    pub fn replica_by_id(
        &self,
        replica_id: ReplicaId,
    ) -> Option<ReplicaDescriptor> {
        self.replicas
            .iter()
            .copied()
            .find(|r| r.replica_id == replica_id)
    }

    /// Position of a replica in the replica list.
    pub fn slot_of(&self, replica_id: ReplicaId) -> Option<usize> {
        self.replicas.iter().position(|r| r.replica_id == replica_id)
    }

    /// True if both descriptors place replicas on the same stores.
    pub fn same_placement(&self, other: &RangeDescriptor) -> bool {
        let mut a: Vec<_> = self.replicas.iter().map(|r| r.store_id).collect();
        let mut b: Vec<_> =
            other.replicas.iter().map(|r| r.store_id).collect();
        a.sort_unstable();
        b.sort_unstable();
        a == b
    }
}

impl fmt::Debug for RangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "r{}:[{:?}, {:?}) gen={} [",
            self.range_id, self.start_key, self.end_key, self.generation
        )?;
        for (i, r) in self.replicas.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "(n{},s{}):{}", r.node_id, r.store_id, r.replica_id)?;
        }
        write!(f, "]")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseType {
    Expiration,
    Epoch,
}

/// Range lease. Expiration-based if `expiration` is set, epoch-based
/// otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub replica: ReplicaDescriptor,
    pub start: Timestamp,
    pub expiration: Option<Timestamp>,
    pub epoch: i64,
    pub sequence: LeaseSequence,
    pub proposed_ts: Timestamp,
}

impl Lease {
    pub fn typ(&self) -> LeaseType {
        if self.expiration.is_some() {
            LeaseType::Expiration
        } else {
            LeaseType::Epoch
        }
    }

    #[inline]
    pub fn owned_by(&self, store_id: StoreId) -> bool {
        self.replica.store_id == store_id
    }

    /// Same holder and the same term of validity; an extension of an
    /// expiration-based lease counts as equivalent.
    pub fn equivalent(&self, other: &Lease) -> bool {
        self.replica == other.replica
            && self.start == other.start
            && self.epoch == other.epoch
            && self.typ() == other.typ()
    }

    /// An empty lease, as held by a freshly bootstrapped range.
    pub fn is_empty(&self) -> bool {
        self.replica.replica_id == 0
    }
}

/// Key/value pair returned by scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Key,
    pub value: Bytes,
}

/// Provisional write of a transaction, as reported by conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub key: Key,
    pub txn: TxnMeta,
}

/// Resolution instruction for a transaction's locks over a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockUpdate {
    pub span: Span,
    pub txn: TxnMeta,
    pub status: TransactionStatus,
    pub ignored_seq_ranges: Vec<IgnoredSeqRange>,
}

/// MVCC statistics of a range.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, GetSize,
)]
pub struct MvccStats {
    pub live_bytes: i64,
    pub live_count: i64,
    pub key_bytes: i64,
    pub key_count: i64,
    pub val_bytes: i64,
    pub intent_count: i64,
    pub sys_bytes: i64,
}

impl MvccStats {
    /// Total bytes considered for sizing decisions.
    pub fn total(&self) -> i64 {
        self.key_bytes + self.val_bytes
    }

    pub fn add(&mut self, o: &MvccStats) {
        self.live_bytes += o.live_bytes;
        self.live_count += o.live_count;
        self.key_bytes += o.key_bytes;
        self.key_count += o.key_count;
        self.val_bytes += o.val_bytes;
        self.intent_count += o.intent_count;
        self.sys_bytes += o.sys_bytes;
    }

    pub fn subtract(&mut self, o: &MvccStats) {
        self.live_bytes -= o.live_bytes;
        self.live_count -= o.live_count;
        self.key_bytes -= o.key_bytes;
        self.key_count -= o.key_count;
        self.val_bytes -= o.val_bytes;
        self.intent_count -= o.intent_count;
        self.sys_bytes -= o.sys_bytes;
    }
}

/// Routing information returned when requested by the batch header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeInfo {
    pub desc: RangeDescriptor,
    pub lease: Lease,
}
