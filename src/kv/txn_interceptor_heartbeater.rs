//! Keeps the record of a writing transaction alive so concurrent pushers
//! do not abort it. Only root coordinators heartbeat.

use std::sync::Weak;

use crate::kv::txn_coord_sender::{TxnCoordMeta, TxnCoordSender, TxnInterceptor};
use crate::kvpb::{BatchRequest, Transaction, TxnId};
use crate::utils::{KvError, Stopper};

use tokio::time::{self, Duration, MissedTickBehavior};

#[derive(Debug, Default)]
pub(super) struct TxnHeartbeater {
    enabled: bool,

    /// The loop has been started.
    started: bool,

    /// Start the loop after this batch goes out.
    start_pending: bool,
}

impl TxnHeartbeater {
    pub(super) fn new(enabled: bool) -> Self {
        TxnHeartbeater {
            enabled,
            ..Default::default()
        }
    }

    /// True exactly once, after the first locking batch.
    pub(super) fn take_start(&mut self) -> bool {
        std::mem::take(&mut self.start_pending)
    }

    #[inline]
    pub(super) fn started(&self) -> bool {
        self.started
    }
}

impl TxnInterceptor for TxnHeartbeater {
    fn prepare(&mut self, _txn: &mut Transaction, ba: &mut BatchRequest) -> Result<(), KvError> {
        if self.enabled && !self.started && ba.is_locking() && !ba.has_end_txn() {
            self.started = true;
            self.start_pending = true;
        }
        Ok(())
    }

    fn populate_meta(&self, _meta: &mut TxnCoordMeta) {}

    fn augment_meta(&mut self, _meta: &TxnCoordMeta) {}

    fn epoch_bumped(&mut self) {}
}

/// Heartbeats transaction `txn_id` every `interval` until it finishes or
/// gets replaced, the coordinator is dropped, or the stopper quiesces.
pub(super) fn spawn_heartbeat_loop(
    tcs: Weak<TxnCoordSender>,
    interval: Duration,
    stopper: &Stopper,
    txn_id: TxnId,
) -> Result<(), KvError> {
    let mut rx_quiesce = stopper.subscribe();
    stopper.run_worker("txn-heartbeat", async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let tcs = match tcs.upgrade() {
                        Some(tcs) => tcs,
                        None => break,
                    };
                    if !tcs.heartbeat_once(txn_id).await {
                        break;
                    }
                },
                _ = rx_quiesce.changed() => break,
            }
        }
    })
}
