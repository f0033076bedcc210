//! Administrative commands executed by a range's leaseholder: splits,
//! merges (and the `Subsume` half run by the right-hand side), lease
//! transfers and replica changes.

use std::sync::Arc;

use crate::concurrency::{SpanAccess, SpanSet};
use crate::kvpb::keys::range_descriptor_key;
use crate::kvpb::{
    BatchRequest, BatchResponse, BatchResponseHeader, ChangeReplicasKind, Key,
    RangeDescriptor, RangeId, ReplicaChange, ReplicaDescriptor, ReplicaId, Request,
    RequestArgs, Response,
};
use crate::storage::engine::{WriteBatch, WriteOp};
use crate::storage::meta::MergeStatus;
use crate::storage::raft::Progress;
use crate::storage::replica::{DestroyStatus, Replica};
use crate::storage::replica_proposal::ReplicatedResult;
use crate::storage::split_delay::{delay_split_to_avoid_snapshot, SplitDelayHelper};
use crate::storage::stateloader::encode;
use crate::utils::{Ctx, KvError, MutexExt};

use async_trait::async_trait;

use tokio::time::{self, Duration};

/// Leader-side view of a replica for split delays.
struct ReplicaSplitDelay<'a> {
    repl: &'a Arc<Replica>,
    interval: Duration,
}

#[async_trait]
impl SplitDelayHelper for ReplicaSplitDelay<'_> {
    fn follower_progress(&self) -> Option<Vec<(ReplicaId, Progress)>> {
        let raft_guard = self.repl.raft_mu.locked();
        let raft = raft_guard.as_ref().filter(|raft| raft.group.is_leader())?;
        let me = raft.group.id();
        Some(
            raft.group
                .peers()
                .iter()
                .filter(|&&peer| peer != me)
                .filter_map(|&peer| raft.group.progress(peer).map(|pr| (peer, pr)))
                .collect(),
        )
    }

    fn propose_empty(&self) {
        let res = match self.repl.raft_mu.locked().as_mut() {
            Some(raft) => raft.group.propose(Vec::new()),
            None => return,
        };
        match res {
            Ok(_) => self.repl.ready_scheduler.enqueue_raft_ready(self.repl.range_id),
            Err(e) => pf_debug!(self.repl.tag; "empty proposal for split delay failed: {}", e),
        }
    }

    fn num_attempts(&self) -> u32 {
        self.repl.config.split_delay_attempts
    }

    async fn sleep(&self) -> Duration {
        time::sleep(self.interval).await;
        self.interval
    }
}

/// How often a frozen right-hand side checks on its merge.
const MERGE_WATCH_INTERVAL: Duration = Duration::from_millis(50);

fn descriptor_op(desc: &RangeDescriptor) -> Result<WriteOp, KvError> {
    Ok(WriteOp::Local {
        key: range_descriptor_key(&desc.start_key),
        value: Some(encode(desc)?),
    })
}

impl Replica {
    pub(super) async fn execute_admin(
        self: &Arc<Self>,
        ctx: &Ctx,
        ba: BatchRequest,
    ) -> Result<BatchResponse, KvError> {
        if ba.requests.len() != 1 {
            return logged_err!(self.tag; "admin batch with {} requests", ba.requests.len());
        }
        let resp = match &ba.requests[0].args {
            RequestArgs::AdminSplit { split_key } => {
                self.admin_split(ctx, split_key.clone(), "manual", true).await?;
                Response::AdminSplit
            }
            RequestArgs::AdminMerge { reason } => {
                self.admin_merge(ctx, reason).await?;
                Response::AdminMerge
            }
            RequestArgs::AdminTransferLease { target } => {
                let desc = self.desc()?;
                let target = desc.replica_for_store(*target).ok_or_else(|| {
                    KvError::msg(format!("s{} holds no replica of r{}", target, self.range_id))
                })?;
                self.transfer_lease(ctx, target).await?;
                Response::AdminTransferLease
            }
            RequestArgs::AdminChangeReplicas { changes } => Response::AdminChangeReplicas {
                desc: self.admin_change_replicas(ctx, changes).await?,
            },
            other => {
                return logged_err!(self.tag; "not an admin request: {:?}", other);
            }
        };
        Ok(BatchResponse {
            header: BatchResponseHeader {
                now: self.clock.now(),
                ..Default::default()
            },
            responses: vec![resp],
        })
    }

    /// Latches the whole range for writing.
    async fn latch_range(&self, ctx: &Ctx, desc: &RangeDescriptor) -> Result<crate::concurrency::LatchGuard, KvError> {
        let mut spans = SpanSet::new();
        spans.add_global(SpanAccess::ReadWrite, desc.span());
        self.concurrency.latch_manager().acquire(ctx, spans).await
    }

    /// Splits the range at `split_key`; this replica keeps the left half.
    /// Splitting at the start key is a no-op. A `delayable` split first
    /// waits a bit for lagging followers.
    pub async fn admin_split(
        self: &Arc<Self>,
        ctx: &Ctx,
        split_key: Key,
        reason: &str,
        delayable: bool,
    ) -> Result<(), KvError> {
        self.redirect_or_acquire_lease(ctx).await?;
        let desc = self.desc()?;
        if split_key == desc.start_key {
            return Ok(());
        }
        if !desc.contains_key(&split_key) {
            return Err(KvError::msg(format!(
                "split key {:?} outside of {:?}",
                split_key, desc
            )));
        }
        if delayable {
            self.maybe_delay_split(ctx).await;
        }

        let _latch = self.latch_range(ctx, &desc).await?;
        let desc = self.desc()?;
        if split_key == desc.start_key {
            return Ok(());
        }
        if !desc.contains_key(&split_key) {
            return Err(KvError::msg(format!(
                "range changed to {:?} before split at {:?}",
                desc, split_key
            )));
        }

        let left = RangeDescriptor {
            end_key: split_key.clone(),
            generation: desc.generation + 1,
            ..desc.clone()
        };
        let right = RangeDescriptor {
            range_id: self.meta.allocate_range_id(),
            start_key: split_key,
            end_key: desc.end_key.clone(),
            replicas: desc.replicas.clone(),
            next_replica_id: desc.next_replica_id,
            generation: desc.generation + 1,
        };
        pf_info!(self.tag; "splitting {:?} at {:?} ({})", desc, right.start_key, reason);
        let batch = WriteBatch {
            ops: vec![descriptor_op(&left)?, descriptor_op(&right)?],
        };
        self.propose_and_wait(
            ctx,
            ReplicatedResult::Split {
                left: left.clone(),
                right: right.clone(),
            },
            batch,
        )
        .await?;
        self.meta.split(&left, &right)
    }

    /// Delays a split while followers are catching up, so that the new
    /// right-hand replicas are not created from a snapshot right away.
    async fn maybe_delay_split(self: &Arc<Self>, ctx: &Ctx) {
        let helper = ReplicaSplitDelay {
            repl: self,
            interval: Duration::from_millis(self.config.split_delay_interval_ms),
        };
        let delay = delay_split_to_avoid_snapshot(ctx, &helper).await;
        if !delay.inactive.is_empty() {
            pf_debug!(self.tag; "followers {:?} inactive, not waiting for them", delay.inactive);
        }
        if !delay.caught_up() {
            pf_warn!(self.tag; "splitting after {:?} with followers {:?} not caught up",
                               delay.waited, delay.lagging);
        } else if !delay.waited.is_zero() {
            pf_debug!(self.tag; "delayed split for {:?} to avoid raft snapshots", delay.waited);
        }
    }

    /// Merges the right-hand neighbor into this range.
    pub async fn admin_merge(self: &Arc<Self>, ctx: &Ctx, reason: &str) -> Result<(), KvError> {
        self.redirect_or_acquire_lease(ctx).await?;
        let left = self.desc()?;
        let right = self
            .meta
            .right_neighbor(&left)
            .ok_or_else(|| KvError::msg(format!("{:?} has no right-hand neighbor", left)))?;
        if !left.same_placement(&right) {
            return Err(KvError::msg(format!(
                "cannot merge {:?} and {:?} with different placement",
                left, right
            )));
        }
        if self.system_config.needs_split(&left.start_key, &right.end_key) {
            return Err(KvError::msg(format!(
                "merge of {:?} and {:?} would span a zone boundary",
                left, right
            )));
        }
        self.meta.begin_merge(&left, &right)?;
        pf_info!(self.tag; "merging {:?} into {:?} ({})", right, left, reason);
        let res = self.merge_with(ctx, &left, &right).await;
        if let Err(e) = &res {
            pf_warn!(self.tag; "merge with r{} failed: {}", right.range_id, e);
            self.meta.abort_merge(right.range_id);
        }
        res
    }

    async fn merge_with(
        self: &Arc<Self>,
        ctx: &Ctx,
        left: &RangeDescriptor,
        right: &RangeDescriptor,
    ) -> Result<(), KvError> {
        let db = self.store()?.db()?;
        let br = db
            .send(ctx, BatchRequest::single(Request::subsume(left.clone(), right.clone())))
            .await?;
        let (desc, applied_index, freeze_start) = match br.responses.into_iter().next() {
            Some(Response::Subsume {
                desc,
                applied_index,
                freeze_start,
                ..
            }) => (desc, applied_index, freeze_start),
            other => {
                return logged_err!(self.tag; "unexpected subsume response {:?}", other);
            }
        };
        if desc != *right {
            return Err(KvError::msg(format!(
                "right-hand range changed to {:?} during merge",
                desc
            )));
        }

        let _latch = self.latch_range(ctx, left).await?;
        let current = self.desc()?;
        if current != *left {
            return Err(KvError::msg(format!(
                "left-hand range changed to {:?} during merge",
                current
            )));
        }
        let merged = RangeDescriptor {
            end_key: right.end_key.clone(),
            generation: left.generation.max(right.generation) + 1,
            ..left.clone()
        };
        let batch = WriteBatch {
            ops: vec![
                descriptor_op(&merged)?,
                WriteOp::Local {
                    key: range_descriptor_key(&right.start_key),
                    value: None,
                },
            ],
        };
        self.propose_and_wait(
            ctx,
            ReplicatedResult::Merge {
                right_desc: right.clone(),
                merged: merged.clone(),
                right_applied_index: applied_index,
                freeze_start,
            },
            batch,
        )
        .await?;
        self.meta.commit_merge(&merged, right.range_id)
    }

    /// Freezes this range as the right-hand side of a merge and reports
    /// the state the left-hand side absorbs.
    pub(super) async fn execute_subsume(
        self: &Arc<Self>,
        ctx: &Ctx,
        ba: BatchRequest,
    ) -> Result<BatchResponse, KvError> {
        let right_desc = match &ba.requests[0].args {
            RequestArgs::Subsume { right_desc, .. } => right_desc.clone(),
            other => return logged_err!(self.tag; "not a subsume request: {:?}", other),
        };
        self.redirect_or_acquire_lease(ctx).await?;
        let desc = self.desc()?;
        if desc != right_desc {
            return Err(KvError::msg(format!(
                "subsume of {:?} but range is {:?}",
                right_desc, desc
            )));
        }

        // in-flight writes hold their latches until they applied
        let _latch = self.latch_range(ctx, &desc).await?;
        let freeze_start = self.clock.now();
        let resp = {
            let mut mu = self.mu.locked();
            let freeze_start = *mu.merge_freeze.get_or_insert(freeze_start);
            Response::Subsume {
                desc: desc.clone(),
                stats: mu.stats,
                lease_applied_index: mu.lease_applied_index,
                applied_index: mu.applied_index,
                freeze_start,
            }
        };
        if !self.merge_tx.send_replace(true) {
            pf_info!(self.tag; "frozen for merge at {}", freeze_start);
            self.watch_merge(desc.range_id);
        }
        Ok(BatchResponse {
            header: BatchResponseHeader {
                now: self.clock.now(),
                ..Default::default()
            },
            responses: vec![resp],
        })
    }

    /// Unfreezes the range if its merge is abandoned.
    fn watch_merge(self: &Arc<Self>, range_id: RangeId) {
        let me = self.clone();
        let res = self.stopper.run_worker("merge-watcher", async move {
            loop {
                tokio::select! {
                    _ = time::sleep(MERGE_WATCH_INTERVAL) => {},
                    _ = me.stopper.quiesced() => return,
                }
                if me.destroy_status() != DestroyStatus::Alive {
                    return;
                }
                match me.meta.merge_status(range_id) {
                    Some(MergeStatus::InProgress { .. }) | Some(MergeStatus::Committed { .. }) => {}
                    Some(MergeStatus::Aborted) | None => {
                        me.mu.locked().merge_freeze = None;
                        me.merge_tx.send_replace(false);
                        pf_info!(me.tag; "merge abandoned, unfrozen");
                        return;
                    }
                }
            }
        });
        if let Err(e) = res {
            pf_warn!(self.tag; "cannot watch merge: {}", e);
        }
    }

    /// Adds or removes replicas. The leaseholder cannot remove itself.
    pub async fn admin_change_replicas(
        self: &Arc<Self>,
        ctx: &Ctx,
        changes: &[ReplicaChange],
    ) -> Result<RangeDescriptor, KvError> {
        self.redirect_or_acquire_lease(ctx).await?;
        let desc = self.desc()?;
        let mut updated = desc.clone();
        updated.generation += 1;
        for change in changes {
            let existing = updated.replica_for_store(change.target.store_id);
            match change.kind {
                ChangeReplicasKind::Add => {
                    if existing.is_some() {
                        return Err(KvError::msg(format!(
                            "s{} already holds a replica of {:?}",
                            change.target.store_id, desc
                        )));
                    }
                    updated.replicas.push(ReplicaDescriptor {
                        node_id: change.target.node_id,
                        store_id: change.target.store_id,
                        replica_id: updated.next_replica_id,
                    });
                    updated.next_replica_id += 1;
                }
                ChangeReplicasKind::Remove => {
                    if change.target.store_id == self.ident.store_id {
                        return Err(KvError::msg(format!(
                            "leaseholder s{} cannot remove itself from {:?}",
                            self.ident.store_id, desc
                        )));
                    }
                    if existing.is_none() {
                        return Err(KvError::msg(format!(
                            "s{} holds no replica of {:?}",
                            change.target.store_id, desc
                        )));
                    }
                    updated.replicas.retain(|r| r.store_id != change.target.store_id);
                }
            }
        }

        pf_info!(self.tag; "changing replicas {:?} -> {:?}", desc, updated);
        let batch = WriteBatch {
            ops: vec![descriptor_op(&updated)?],
        };
        self.propose_and_wait(
            ctx,
            ReplicatedResult::ChangeReplicas {
                desc: updated.clone(),
            },
            batch,
        )
        .await?;
        self.meta.update(&updated)?;
        Ok(updated)
    }
}
