//! Range leases: validity, redirection and coalesced acquisition.
//!
//! Ranges in the system keyspace hold expiration-based leases that the
//! holder renews; all other ranges hold epoch-based leases tied to the
//! holder's liveness record.

use std::sync::Arc;

use crate::hlc::Timestamp;
use crate::kvpb::{Lease, LeaseType, ReplicaDescriptor};
use crate::storage::engine::WriteBatch;
use crate::storage::replica::{LeaseFuture, Replica};
use crate::storage::replica_proposal::ReplicatedResult;
use crate::utils::{Ctx, ErrorDetail, KvError, MutexExt};

use futures::future::FutureExt;

use tokio::time::Duration;

impl Replica {
    /// Whether `lease` is in effect at `now`.
    pub(super) fn lease_valid(&self, lease: &Lease, now: Timestamp) -> bool {
        if lease.is_empty() {
            return false;
        }
        match lease.expiration {
            Some(expiration) => now < expiration,
            None => self
                .liveness
                .get(lease.replica.node_id)
                .map_or(false, |rec| rec.epoch == lease.epoch && rec.is_live(now)),
        }
    }

    /// Returns the lease if this replica holds it. Redirects to the holder
    /// of a valid lease elsewhere; otherwise acquires the lease, joining
    /// any acquisition already in flight.
    pub(super) async fn redirect_or_acquire_lease(self: &Arc<Self>, ctx: &Ctx) -> Result<Lease, KvError> {
        loop {
            ctx.check()?;
            let (lease, transferring) = {
                let mu = self.mu.locked();
                (mu.lease.clone(), mu.transferring_lease)
            };
            let now = self.clock.now();
            if self.lease_valid(&lease, now) {
                if !lease.owned_by(self.ident.store_id) || transferring {
                    return Err(self.not_lease_holder(Some(lease)));
                }
                self.maybe_renew_lease(&lease, now);
                return Ok(lease);
            }

            let pending = self.request_lease();
            match ctx.run(pending).await {
                Ok(lease) if lease.owned_by(self.ident.store_id) => return Ok(lease),
                Ok(lease) => return Err(self.not_lease_holder(Some(lease))),
                Err(KvError {
                    detail: ErrorDetail::LeaseRejected { existing, .. },
                    ..
                }) => {
                    pf_debug!(self.tag; "lease request lost to {:?}", existing);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Starts a lease acquisition, or joins the one in flight. The request
    /// runs to completion even if every caller gives up.
    pub(super) fn request_lease(self: &Arc<Self>) -> LeaseFuture {
        let mut pending = self.pending_lease.locked();
        if let Some(fut) = pending.as_ref() {
            return fut.clone();
        }
        let me = self.clone();
        let fut = async move {
            let res = me.acquire_lease().await;
            *me.pending_lease.locked() = None;
            res
        }
        .boxed()
        .shared();
        *pending = Some(fut.clone());
        tokio::spawn(fut.clone());
        fut
    }

    /// Renews an expiration-based lease in the background once half of its
    /// term has passed.
    fn maybe_renew_lease(self: &Arc<Self>, lease: &Lease, now: Timestamp) {
        if let Some(expiration) = lease.expiration {
            let half = self.config.expiration_lease_ms as i64 * 1_000_000 / 2;
            if expiration.wall_time - now.wall_time < half {
                pf_trace!(self.tag; "renewing lease expiring at {}", expiration);
                let _ = self.request_lease();
            }
        }
    }

    async fn acquire_lease(self: &Arc<Self>) -> Result<Lease, KvError> {
        let ctx = Ctx::background()
            .with_tag(&self.tag)
            .with_timeout(Duration::from_millis(self.config.lease_request_timeout_ms));
        let desc = self.desc()?;
        let prev = self.lease();
        let now = self.clock.now();

        if self.lease_valid(&prev, now) && !prev.owned_by(self.ident.store_id) {
            return Err(self.not_lease_holder(Some(prev)));
        }
        if !prev.is_empty() && prev.typ() == LeaseType::Epoch && !prev.owned_by(self.ident.store_id) {
            // the holder's record expired; bumping its epoch invalidates
            // the lease for good
            if let Some(rec) = self.liveness.get(prev.replica.node_id) {
                if rec.epoch == prev.epoch {
                    self.liveness.increment_epoch(prev.replica.node_id, now)?;
                }
            }
        }

        self.ensure_leadership(&ctx).await?;

        let replica = self.replica_descriptor();
        let now = self.clock.now();
        let mut lease = Lease {
            replica,
            start: now,
            expiration: None,
            epoch: 0,
            sequence: prev.sequence + 1,
            proposed_ts: now,
        };
        if desc.is_system() {
            lease.expiration = Some(now.add(self.config.expiration_lease_ms as i64 * 1_000_000, 0));
            if prev.replica == replica && prev.typ() == LeaseType::Expiration && self.lease_valid(&prev, now) {
                // extension
                lease.start = prev.start;
                lease.sequence = prev.sequence;
            }
        } else {
            let rec = self
                .liveness
                .get(self.ident.node_id)
                .filter(|rec| rec.is_live(now))
                .ok_or_else(|| {
                    KvError::unavailable(format!("{}: own liveness record is not live", self.tag))
                })?;
            lease.epoch = rec.epoch;
        }

        pf_debug!(self.tag; "requesting lease {:?}", lease);
        self.propose_and_wait(
            &ctx,
            ReplicatedResult::Lease {
                lease,
                prev_seq: prev.sequence,
            },
            WriteBatch::default(),
        )
        .await?;
        Ok(self.lease())
    }

    /// Hands the lease to `target`. Requests arriving meanwhile are
    /// redirected.
    pub(super) async fn transfer_lease(
        self: &Arc<Self>,
        ctx: &Ctx,
        target: ReplicaDescriptor,
    ) -> Result<(), KvError> {
        let prev = self.redirect_or_acquire_lease(ctx).await?;
        if prev.replica == target {
            return Ok(());
        }
        let desc = self.desc()?;
        let now = self.clock.now();
        let mut lease = Lease {
            replica: target,
            start: now,
            expiration: None,
            epoch: 0,
            sequence: prev.sequence + 1,
            proposed_ts: now,
        };
        if desc.is_system() {
            lease.expiration = Some(now.add(self.config.expiration_lease_ms as i64 * 1_000_000, 0));
        } else {
            let rec = self
                .liveness
                .get(target.node_id)
                .filter(|rec| rec.is_live(now))
                .ok_or_else(|| {
                    KvError::msg(format!("lease transfer target n{} is not live", target.node_id))
                })?;
            lease.epoch = rec.epoch;
        }

        self.mu.locked().transferring_lease = true;
        pf_info!(self.tag; "transferring lease to {:?}", target);
        let res = self
            .propose_and_wait(
                ctx,
                ReplicatedResult::Lease {
                    lease,
                    prev_seq: prev.sequence,
                },
                WriteBatch::default(),
            )
            .await;
        self.mu.locked().transferring_lease = false;
        res
    }
}

#[cfg(test)]
mod lease_tests {
    use crate::kvpb::{BatchRequest, LeaseType, Request};
    use crate::storage::store::store_tests::single_store;
    use crate::utils::{Ctx, KvError};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lease_kind_follows_keyspace() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let ctx = Ctx::background();
        let sys = store.replica_for_key(b"\x01a").expect("system range");
        sys.send(&ctx, BatchRequest::single(Request::put(&b"\x01a"[..], "v"))).await?;
        assert_eq!(sys.lease().typ(), LeaseType::Expiration);

        let user = store.replica_for_key(b"u").expect("user range");
        user.send(&ctx, BatchRequest::single(Request::put("u", "v"))).await?;
        assert_eq!(user.lease().typ(), LeaseType::Epoch);
        assert!(user.owns_valid_lease(store.clock().now()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_lease() -> Result<(), KvError> {
        let (store, _stopper) = single_store().await?;
        let repl = store.replica_for_key(b"x").expect("user range");
        let mut handles = Vec::new();
        for i in 0..8 {
            let repl = repl.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("x{}", i);
                repl.send(&Ctx::background(), BatchRequest::single(Request::put(key, "v")))
                    .await
            }));
        }
        for h in handles {
            h.await.expect("join")?;
        }
        assert_eq!(repl.lease().sequence, 1);
        Ok(())
    }
}
