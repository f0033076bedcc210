//! Delivery of consensus messages between stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::kvpb::{NodeId, RangeId, ReplicaDescriptor};
use crate::rpc::{ConnectionClass, NodeDialer};
use crate::storage::raft::Message;
use crate::utils::{Ctx, KvError, LogEvery, MutexExt, Stopper};

use tokio::sync::mpsc;
use tokio::time::Duration;

/// Consensus message addressed to one replica of a range.
#[derive(Debug, Clone)]
pub struct RaftMessageRequest {
    pub range_id: RangeId,
    pub from: ReplicaDescriptor,
    pub to: ReplicaDescriptor,
    pub message: Message,
}

/// Per-node outgoing queues of consensus messages. Each destination node
/// gets a messenger task that dials it and forwards messages in order.
/// Delivery is best effort; the consensus layer retransmits.
pub struct RaftTransport {
    node_id: NodeId,
    dialer: Arc<NodeDialer>,
    stopper: Stopper,

    /// Map from destination node -> sender side of its queue.
    tx_sends: Mutex<HashMap<NodeId, mpsc::UnboundedSender<RaftMessageRequest>>>,

    dropped: AtomicU64,
    log_every: LogEvery,
}

impl RaftTransport {
    pub fn new(node_id: NodeId, dialer: Arc<NodeDialer>, stopper: Stopper) -> Arc<Self> {
        Arc::new(RaftTransport {
            node_id,
            dialer,
            stopper,
            tx_sends: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
            log_every: LogEvery::new(Duration::from_secs(10)),
        })
    }

    /// Queues a message for sending. Returns false if it was dropped.
    pub fn send(self: &Arc<Self>, req: RaftMessageRequest) -> bool {
        let to = req.to.node_id;
        let mut tx_sends = self.tx_sends.locked();
        if let Some(tx) = tx_sends.get(&to) {
            if tx.send(req.clone()).is_ok() {
                return true;
            }
            tx_sends.remove(&to);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let me = self.clone();
        if self
            .stopper
            .run_worker(&format!("raft-messenger-n{}", to), me.peer_messenger_task(to, rx))
            .is_err()
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let ok = tx.send(req).is_ok();
        tx_sends.insert(to, tx);
        ok
    }

    /// Number of messages dropped so far.
    pub fn num_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Peer messenger task function.
    async fn peer_messenger_task(
        self: Arc<Self>,
        to: NodeId,
        mut rx_send: mpsc::UnboundedReceiver<RaftMessageRequest>,
    ) {
        let me = format!("n{}", self.node_id);
        pf_debug!(me; "raft messenger to n{} spawned", to);
        let mut rx_quiesce = self.stopper.subscribe();
        let ctx = Ctx::background().with_tag(&me);

        loop {
            tokio::select! {
                msg = rx_send.recv() => {
                    let msg = match msg {
                        Some(msg) => msg,
                        None => break,
                    };
                    if let Err(e) = self.deliver(&ctx, to, msg).await {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        if self.log_every.should_log() {
                            pf_warn!(me; "error sending raft message to n{}: {}", to, e);
                        }
                    }
                },

                _ = rx_quiesce.changed() => break,
            }
        }

        pf_debug!(me; "raft messenger to n{} exited", to);
    }

    async fn deliver(&self, ctx: &Ctx, to: NodeId, msg: RaftMessageRequest) -> Result<(), KvError> {
        let conn = self
            .dialer
            .dial_internal_client(ctx, to, ConnectionClass::System)
            .await?;
        conn.raft_message(msg)
    }
}
