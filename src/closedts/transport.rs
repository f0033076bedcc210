//! Closed timestamp streams between nodes.
//!
//! The server half of a stream pushes the local provider's entries; the
//! client half stores them per peer and sends reactions asking for ranges
//! it is missing. A broken client stream is redialed with exponential
//! backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::closedts::ctpb::{self, Entry, Reaction};
use crate::closedts::provider::Provider;
use crate::kvpb::{NodeId, RangeId};
use crate::rpc::{ConnectionClass, NodeDialer};
use crate::utils::{Ctx, KvError, MutexExt, RwLockExt, Stopper};

use bytes::BytesMut;

use tokio::io::{self, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration};

/// Callback asking the local store to publish the current applied index
/// of the given ranges.
pub type RefreshFn = Arc<dyn Fn(&[RangeId]) + Send + Sync>;

const STREAM_BUFFER: usize = 64 << 10;

/// Server side: serves one stream per connecting peer.
pub struct Server {
    node_id: NodeId,
    provider: Arc<Provider>,
    refresh: RwLock<Option<RefreshFn>>,
    stopper: Stopper,
}

impl Server {
    pub fn new(node_id: NodeId, provider: Arc<Provider>, stopper: Stopper) -> Arc<Self> {
        Arc::new(Server {
            node_id,
            provider,
            refresh: RwLock::new(None),
            stopper,
        })
    }

    pub fn set_refresh(&self, refresh: RefreshFn) {
        *self.refresh.write_locked() = Some(refresh);
    }

    /// Opens a new stream; the returned half belongs to the client.
    pub fn open_stream(self: &Arc<Self>) -> Result<DuplexStream, KvError> {
        let (client_half, server_half) = io::duplex(STREAM_BUFFER);
        let me = self.clone();
        let rx_entry = self.provider.subscribe();
        self.stopper.run_worker(
            &format!("ct-server-n{}", self.node_id),
            async move {
                if let Err(e) = me.serve(server_half, rx_entry).await {
                    pf_debug!("ctserver"; "n{} stream ended: {}", me.node_id, e);
                }
            },
        )?;
        Ok(client_half)
    }

    async fn serve(
        &self,
        stream: DuplexStream,
        mut rx_entry: broadcast::Receiver<Entry>,
    ) -> Result<(), KvError> {
        let (mut conn_read, mut conn_write) = io::split(stream);
        let mut read_buf = BytesMut::new();
        let mut rx_quiesce = self.stopper.subscribe();

        if let Some(full) = self.provider.full_entry() {
            ctpb::write_frame(&mut conn_write, &full).await?;
        }

        loop {
            tokio::select! {
                entry = rx_entry.recv() => match entry {
                    Ok(entry) => ctpb::write_frame(&mut conn_write, &entry).await?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // skipped increments: resync with a full entry
                        pf_debug!("ctserver"; "stream lagged by {} entries", n);
                        if let Some(full) = self.provider.full_entry() {
                            ctpb::write_frame(&mut conn_write, &full).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },

                reaction = ctpb::read_frame::<Reaction, _>(&mut read_buf, &mut conn_read) => {
                    let reaction = reaction?;
                    if !reaction.requested.is_empty() {
                        let refresh = self.refresh.read_locked().clone();
                        if let Some(refresh) = refresh {
                            refresh(&reaction.requested);
                        }
                    }
                },

                _ = rx_quiesce.changed() => return Ok(()),
            }
        }
    }
}

/// Client side: one stream per peer node, created on first use.
pub struct Clients {
    node_id: NodeId,
    dialer: Arc<NodeDialer>,
    provider: Arc<Provider>,
    stopper: Stopper,

    initial_backoff: Duration,
    max_backoff: Duration,

    /// Request channels of the running per-peer streams.
    peers: Mutex<HashMap<NodeId, mpsc::Sender<RangeId>>>,
}

impl Clients {
    pub fn new(
        node_id: NodeId,
        dialer: Arc<NodeDialer>,
        provider: Arc<Provider>,
        stopper: Stopper,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Arc<Self> {
        Arc::new(Clients {
            node_id,
            dialer,
            provider,
            stopper,
            initial_backoff,
            max_backoff,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Makes sure a stream to the peer exists.
    pub fn ensure_client(self: &Arc<Self>, peer: NodeId) -> Option<mpsc::Sender<RangeId>> {
        if peer == self.node_id {
            return None;
        }
        let mut peers = self.peers.locked();
        if let Some(tx) = peers.get(&peer) {
            if !tx.is_closed() {
                return Some(tx.clone());
            }
        }
        let (tx_req, rx_req) = mpsc::channel(256);
        let me = self.clone();
        if let Err(e) = self.stopper.run_worker(
            &format!("ct-client-n{}-n{}", self.node_id, peer),
            async move { me.run_client(peer, rx_req).await },
        ) {
            pf_debug!("ctclient"; "cannot start stream to n{}: {}", peer, e);
            return None;
        }
        peers.insert(peer, tx_req.clone());
        Some(tx_req)
    }

    /// Asks the peer to include a range in its next entry.
    pub fn request(self: &Arc<Self>, peer: NodeId, range_id: RangeId) {
        if let Some(tx) = self.ensure_client(peer) {
            // full channel means a request is already pending
            let _ = tx.try_send(range_id);
        }
    }

    async fn run_client(&self, peer: NodeId, mut rx_req: mpsc::Receiver<RangeId>) {
        let mut rx_quiesce = self.stopper.subscribe();
        let mut backoff = self.initial_backoff;
        loop {
            if self.stopper.is_quiescing() {
                return;
            }
            let ctx = Ctx::background().with_tag(format!("ct-n{}", peer));
            let stream = match self.dialer.dial(&ctx, peer, ConnectionClass::System).await {
                Ok(conn) => conn.closed_ts_stream(),
                Err(e) => Err(e),
            };
            match stream {
                Ok(stream) => {
                    backoff = self.initial_backoff;
                    match self.run_stream(peer, stream, &mut rx_req).await {
                        Ok(()) => return,
                        Err(e) => {
                            pf_debug!("ctclient"; "stream n{} -> n{} broke: {}",
                                                  self.node_id, peer, e);
                        }
                    }
                }
                Err(e) => {
                    pf_debug!("ctclient"; "dial n{} -> n{} failed: {}", self.node_id, peer, e);
                }
            }

            tokio::select! {
                _ = time::sleep(backoff) => {},
                _ = rx_quiesce.changed() => return,
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// Pumps one stream until it breaks (`Err`) or the node stops (`Ok`).
    async fn run_stream(
        &self,
        peer: NodeId,
        stream: DuplexStream,
        rx_req: &mut mpsc::Receiver<RangeId>,
    ) -> Result<(), KvError> {
        let (mut conn_read, mut conn_write) = io::split(stream);
        let mut read_buf = BytesMut::new();
        let mut rx_quiesce = self.stopper.subscribe();
        loop {
            tokio::select! {
                entry = ctpb::read_frame::<Entry, _>(&mut read_buf, &mut conn_read) => {
                    self.provider.notify(peer, entry?);
                },

                range_id = rx_req.recv() => {
                    let Some(range_id) = range_id else {
                        return Ok(());
                    };
                    let mut requested = vec![range_id];
                    while let Ok(more) = rx_req.try_recv() {
                        if !requested.contains(&more) {
                            requested.push(more);
                        }
                    }
                    ctpb::write_frame(&mut conn_write, &Reaction { requested }).await?;
                },

                _ = rx_quiesce.changed() => return Ok(()),
            }
        }
    }
}
