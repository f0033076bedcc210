//! Node services and the in-process network connecting them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::kvpb::{BatchRequest, BatchResponse, NodeId};
use crate::storage::RaftMessageRequest;
use crate::utils::{Ctx, KvError, RwLockExt};

use async_trait::async_trait;

use tokio::io::DuplexStream;
use tokio::time::{self, Duration};

/// Connection class; each class gets its own breaker and connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionClass {
    Default,
    System,
}

/// Services a node exposes to its peers.
#[async_trait]
pub trait NodeService: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Serves a batch request addressed to a range on this node.
    async fn batch(
        &self,
        ctx: &Ctx,
        ba: BatchRequest,
    ) -> Result<BatchResponse, KvError>;

    /// Opens a closed-timestamp stream; the returned half carries
    /// length-prefixed frames, with the node's server on the other end.
    fn closed_ts_stream(&self) -> Result<DuplexStream, KvError>;

    /// Hands a consensus message to the addressed replica. Never blocks.
    fn raft_message(&self, req: RaftMessageRequest) -> Result<(), KvError> {
        Err(KvError::msg(format!(
            "n{} does not accept raft traffic (r{})",
            self.node_id(),
            req.range_id
        )))
    }
}

/// Dials addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(
        &self,
        ctx: &Ctx,
        addr: &str,
        class: ConnectionClass,
    ) -> Result<Arc<dyn NodeService>, KvError>;
}

/// Handle returned by the dialer.
#[derive(Clone)]
pub struct Connection {
    pub node_id: NodeId,
    service: Arc<dyn NodeService>,

    /// True for the loopback handle.
    local: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("node_id", &self.node_id)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(node_id: NodeId, service: Arc<dyn NodeService>, local: bool) -> Self {
        Connection {
            node_id,
            service,
            local,
        }
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Sends a batch; the loopback handle tags the context so the server
    /// can tell the request never left the process.
    pub async fn batch(
        &self,
        ctx: &Ctx,
        ba: BatchRequest,
    ) -> Result<BatchResponse, KvError> {
        if self.local {
            let ctx = ctx.with_local_request();
            self.service.batch(&ctx, ba).await
        } else {
            self.service.batch(ctx, ba).await
        }
    }

    pub fn closed_ts_stream(&self) -> Result<DuplexStream, KvError> {
        self.service.closed_ts_stream()
    }

    pub fn raft_message(&self, req: RaftMessageRequest) -> Result<(), KvError> {
        self.service.raft_message(req)
    }
}

/// In-process network: address -> node service, with injectable partitions
/// and dial latency.
#[derive(Default)]
pub struct LocalNetwork {
    services: RwLock<HashMap<String, Arc<dyn NodeService>>>,
    partitioned: RwLock<HashSet<String>>,
    dial_delay: RwLock<Duration>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addr: impl Into<String>, svc: Arc<dyn NodeService>) {
        self.services.write_locked().insert(addr.into(), svc);
    }

    /// Removes a listener; later dials of `addr` fail.
    pub fn deregister(&self, addr: &str) {
        self.services.write_locked().remove(addr);
    }

    /// Makes dials to `addr` fail (or succeed again).
    pub fn set_partitioned(&self, addr: &str, partitioned: bool) {
        let mut set = self.partitioned.write_locked();
        if partitioned {
            set.insert(addr.to_string());
        } else {
            set.remove(addr);
        }
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        *self.dial_delay.write_locked() = delay;
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn dial(
        &self,
        ctx: &Ctx,
        addr: &str,
        _class: ConnectionClass,
    ) -> Result<Arc<dyn NodeService>, KvError> {
        let delay = *self.dial_delay.read_locked();
        if !delay.is_zero() {
            ctx.run(async {
                time::sleep(delay).await;
                Ok(())
            })
            .await?;
        }
        if self.partitioned.read_locked().contains(addr) {
            return Err(KvError::msg(format!(
                "connection to {} refused",
                addr
            )));
        }
        self.services
            .read_locked()
            .get(addr)
            .cloned()
            .ok_or_else(|| KvError::msg(format!("no listener at {}", addr)))
    }
}
