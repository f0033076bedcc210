//! Replicated commands and the proposer-side bookkeeping of in-flight
//! proposals.

use std::sync::Arc;

use crate::hlc::Timestamp;
use crate::kvpb::{
    BatchResponse, Lease, LeaseAppliedIndex, LeaseSequence, RangeDescriptor,
    ReplicaDescriptor,
};
use crate::quotapool::QuotaPool;
use crate::storage::batcheval::LocalResult;
use crate::storage::engine::WriteBatch;
use crate::storage::stateloader::{decode, encode};
use crate::utils::KvError;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

use tokio::sync::oneshot;

/// Replicated side effect of a command beyond its write batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicatedResult {
    None,

    /// Installs a new lease; applies only on top of `prev_seq`.
    Lease { lease: Lease, prev_seq: LeaseSequence },

    /// Splits the range; this replica keeps `left`.
    Split {
        left: RangeDescriptor,
        right: RangeDescriptor,
    },

    /// Absorbs the right-hand neighbor.
    Merge {
        right_desc: RangeDescriptor,
        merged: RangeDescriptor,
        right_applied_index: u64,
        freeze_start: Timestamp,
    },

    ChangeReplicas { desc: RangeDescriptor },
}

/// Command as it travels through the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftCommand {
    /// Unique per proposing replica.
    pub proposal_id: u64,
    pub proposer: ReplicaDescriptor,

    /// Sequence of the lease the command was evaluated under.
    pub proposer_lease_seq: LeaseSequence,

    /// The command applies only while the range's lease applied index is
    /// below this.
    pub max_lease_index: LeaseAppliedIndex,

    pub timestamp: Timestamp,
    pub write_batch: WriteBatch,
    pub replicated: ReplicatedResult,
}

impl RaftCommand {
    pub fn encode(&self) -> Result<Vec<u8>, KvError> {
        encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, KvError> {
        decode(data)
    }

    /// Bytes charged against the proposal quota.
    pub fn size(&self) -> u64 {
        (self.write_batch.get_heap_size() + std::mem::size_of::<Self>()) as u64
    }

    pub fn is_lease_request(&self) -> bool {
        matches!(self.replicated, ReplicatedResult::Lease { .. })
    }
}

/// Outcome of applying a proposal, handed back to its proposer.
#[derive(Debug)]
pub struct ProposalResult {
    pub reply: Result<BatchResponse, KvError>,
    pub local: LocalResult,
}

/// Proposal known to its proposing replica until it applies.
pub(crate) struct ProposalData {
    pub command: RaftCommand,

    /// Response computed at evaluation; returned if the command applies.
    pub response: BatchResponse,
    pub local: LocalResult,

    /// Quota acquired for the command, returned once it applies.
    pub quota: Option<(Arc<QuotaPool>, u64)>,

    /// Log index the proposal was appended at.
    pub index: u64,

    pub tx_done: Option<oneshot::Sender<ProposalResult>>,
}

impl ProposalData {
    /// Completes the proposal; the waiter may have gone away already.
    pub fn finish(&mut self, reply: Result<BatchResponse, KvError>) {
        if let Some((pool, n)) = self.quota.take() {
            pool.add(n);
        }
        if let Some(tx) = self.tx_done.take() {
            let local = if reply.is_ok() {
                std::mem::take(&mut self.local)
            } else {
                LocalResult::default()
            };
            let _ = tx.send(ProposalResult { reply, local });
        }
    }
}

#[cfg(test)]
mod proposal_tests {
    use super::*;
    use crate::storage::engine::WriteOp;

    #[test]
    fn command_survives_the_log() -> Result<(), KvError> {
        let cmd = RaftCommand {
            proposal_id: 7,
            proposer: ReplicaDescriptor {
                node_id: 1,
                store_id: 1,
                replica_id: 2,
            },
            proposer_lease_seq: 3,
            max_lease_index: 11,
            timestamp: Timestamp::new(100, 1),
            write_batch: WriteBatch {
                ops: vec![WriteOp::Local {
                    key: b"k".to_vec(),
                    value: Some(b"v".to_vec()),
                }],
            },
            replicated: ReplicatedResult::None,
        };
        let back = RaftCommand::decode(&cmd.encode()?)?;
        assert_eq!(back.proposal_id, 7);
        assert_eq!(back.max_lease_index, 11);
        assert_eq!(back.write_batch, cmd.write_batch);
        assert!(!back.is_lease_request());
        assert!(back.size() > 0);
        Ok(())
    }

    #[test]
    fn finish_returns_quota_and_drops_local_result_on_error() {
        let pool = Arc::new(QuotaPool::new("q", 100));
        assert!(pool.try_acquire(40));
        let (tx, mut rx) = oneshot::channel();
        let mut p = ProposalData {
            command: RaftCommand {
                proposal_id: 1,
                proposer: ReplicaDescriptor::default(),
                proposer_lease_seq: 1,
                max_lease_index: 1,
                timestamp: Timestamp::default(),
                write_batch: WriteBatch::default(),
                replicated: ReplicatedResult::None,
            },
            response: BatchResponse::default(),
            local: LocalResult {
                resolved_locks: Vec::new(),
                external_locks: Vec::new(),
                updated_txns: Vec::new(),
                acquired_locks: vec![(
                    bytes::Bytes::from("a"),
                    crate::kvpb::TxnMeta {
                        id: uuid::Uuid::new_v4(),
                        key: bytes::Bytes::from("a"),
                        epoch: 0,
                        write_timestamp: Timestamp::new(5, 0),
                        min_timestamp: Timestamp::new(5, 0),
                        priority: 1,
                        sequence: 1,
                    },
                )],
            },
            quota: Some((pool.clone(), 40)),
            index: 12,
            tx_done: Some(tx),
        };
        p.finish(Err(KvError::new(crate::utils::ErrorDetail::ProposalIllegalLeaseIndex)));
        let res = rx.try_recv().expect("finished");
        assert!(res.reply.is_err());
        assert_eq!(res.local, LocalResult::default());
        assert_eq!(pool.approximate_quota(), 100);
        // second completion is a no-op
        p.finish(Ok(BatchResponse::default()));
    }
}
