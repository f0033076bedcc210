//! Dialing nodes by id, guarded by per-(node, class) circuit breakers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::kvpb::NodeId;
use crate::rpc::breaker::{Breaker, BreakerConfig};
use crate::rpc::network::{ConnectionClass, Connection, NodeService, Transport};
use crate::utils::{Ctx, ErrorDetail, KvError, MutexExt, RwLockExt};

/// Resolves a node id to its address.
pub type AddressResolver =
    Arc<dyn Fn(NodeId) -> Result<String, KvError> + Send + Sync>;

/// Dials nodes by id. A dial that the local node's address resolves to is
/// served by the loopback handle without touching the network.
pub struct NodeDialer {
    resolver: AddressResolver,
    transport: Arc<dyn Transport>,
    breaker_config: BreakerConfig,

    /// Local node's address and service, set once the node has started.
    local: RwLock<Option<(String, Arc<dyn NodeService>)>>,

    breakers: Mutex<HashMap<(NodeId, ConnectionClass), Arc<Breaker>>>,
}

impl NodeDialer {
    pub fn new(
        resolver: AddressResolver,
        transport: Arc<dyn Transport>,
        breaker_config: BreakerConfig,
    ) -> Self {
        NodeDialer {
            resolver,
            transport,
            breaker_config,
            local: RwLock::new(None),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Installs the loopback service for the local node.
    pub fn set_local(&self, addr: impl Into<String>, svc: Arc<dyn NodeService>) {
        *self.local.write_locked() = Some((addr.into(), svc));
    }

    /// Drops the loopback service when the node shuts down.
    pub fn clear_local(&self) {
        *self.local.write_locked() = None;
    }

    /// Returns the breaker of a (node, class) pair, creating it on demand.
    pub fn breaker(&self, node_id: NodeId, class: ConnectionClass) -> Arc<Breaker> {
        self.breakers
            .locked()
            .entry((node_id, class))
            .or_insert_with(|| {
                Arc::new(Breaker::new(
                    format!("breaker n{}/{:?}", node_id, class),
                    self.breaker_config.clone(),
                ))
            })
            .clone()
    }

    /// Dials a node through its breaker.
    pub async fn dial(
        &self,
        ctx: &Ctx,
        node_id: NodeId,
        class: ConnectionClass,
    ) -> Result<Connection, KvError> {
        // an already-cancelled context must not count against the peer
        ctx.check()?;
        let breaker = self.breaker(node_id, class);
        if !breaker.ready() {
            return Err(KvError::new(ErrorDetail::BreakerOpen {
                name: breaker.name().to_string(),
                node_id: Some(node_id),
            }));
        }

        let addr = match (self.resolver)(node_id) {
            Ok(addr) => addr,
            Err(e) => {
                let err = KvError::msg(format!(
                    "failed to resolve n{}: {}",
                    node_id, e
                ));
                breaker.fail(&err);
                return Err(err);
            }
        };
        self.dial_addr(ctx, node_id, &addr, Some(&breaker), class).await
    }

    /// Dials a node without consulting or updating its breaker.
    pub async fn dial_no_breaker(
        &self,
        ctx: &Ctx,
        node_id: NodeId,
        class: ConnectionClass,
    ) -> Result<Connection, KvError> {
        ctx.check()?;
        let addr = (self.resolver)(node_id)?;
        self.dial_addr(ctx, node_id, &addr, None, class).await
    }

    /// Like `dial()`, but returns the in-process loopback handle when the
    /// target is the local node.
    pub async fn dial_internal_client(
        &self,
        ctx: &Ctx,
        node_id: NodeId,
        class: ConnectionClass,
    ) -> Result<Connection, KvError> {
        ctx.check()?;
        let local = self.local.read_locked().clone();
        if let Some((local_addr, svc)) = local {
            if svc.node_id() == node_id {
                return Ok(Connection::new(node_id, svc, true));
            }
            if let Ok(addr) = (self.resolver)(node_id) {
                if addr == local_addr {
                    return Ok(Connection::new(node_id, svc, true));
                }
            }
        }
        self.dial(ctx, node_id, class).await
    }

    /// Returns `Ok(())` if the connection to the node is believed healthy.
    pub fn conn_health(
        &self,
        node_id: NodeId,
        class: ConnectionClass,
    ) -> Result<(), KvError> {
        let breaker = self.breaker(node_id, class);
        match breaker.state() {
            crate::rpc::BreakerState::Closed => Ok(()),
            _ => Err(KvError::new(ErrorDetail::BreakerOpen {
                name: breaker.name().to_string(),
                node_id: Some(node_id),
            })),
        }
    }

    async fn dial_addr(
        &self,
        ctx: &Ctx,
        node_id: NodeId,
        addr: &str,
        breaker: Option<&Arc<Breaker>>,
        class: ConnectionClass,
    ) -> Result<Connection, KvError> {
        match self.transport.dial(ctx, addr, class).await {
            Ok(svc) => {
                if let Some(b) = breaker {
                    b.success();
                }
                Ok(Connection::new(node_id, svc, false))
            }
            Err(e) if e.is_ctx_err() || ctx.err().is_some() => {
                // cancelled mid-dial: the peer is not to blame
                Err(ctx.err().unwrap_or(e))
            }
            Err(e) => {
                if let Some(b) = breaker {
                    b.fail(&e);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod nodedialer_tests {
    use super::*;
    use crate::kvpb::{BatchRequest, BatchResponse};
    use crate::rpc::{BreakerState, LocalNetwork};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;
    use tokio::time::{self, Duration};

    struct EchoService(NodeId);

    #[async_trait]
    impl NodeService for EchoService {
        fn node_id(&self) -> NodeId {
            self.0
        }

        async fn batch(
            &self,
            ctx: &Ctx,
            _ba: BatchRequest,
        ) -> Result<BatchResponse, KvError> {
            if ctx.is_local_request() {
                Ok(BatchResponse::default())
            } else {
                Err(KvError::msg("remote"))
            }
        }

        fn closed_ts_stream(&self) -> Result<DuplexStream, KvError> {
            Err(KvError::msg("unsupported"))
        }
    }

    fn setup(resolve_calls: Arc<AtomicUsize>) -> (Arc<LocalNetwork>, NodeDialer) {
        let net = LocalNetwork::new();
        net.register("addr-1", Arc::new(EchoService(1)));
        net.register("addr-2", Arc::new(EchoService(2)));
        let resolver: AddressResolver = Arc::new(move |node_id| {
            resolve_calls.fetch_add(1, Ordering::SeqCst);
            match node_id {
                1 | 2 => Ok(format!("addr-{}", node_id)),
                _ => Err(KvError::msg(format!("unknown node {}", node_id))),
            }
        });
        let dialer = NodeDialer::new(
            resolver,
            net.clone(),
            BreakerConfig {
                consecutive_failure_threshold: 5,
                cooldown_ms: 60_000,
                log_interval_secs: 60,
            },
        );
        (net, dialer)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unresolvable_trips_breaker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_net, dialer) = setup(calls.clone());
        let ctx = Ctx::background();
        for _ in 0..5 {
            let err = dialer.dial(&ctx, 9, ConnectionClass::Default).await;
            assert!(matches!(err.unwrap_err().detail, ErrorDetail::Internal(_)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let err = dialer
            .dial(&ctx, 9, ConnectionClass::Default)
            .await
            .unwrap_err();
        assert!(matches!(
            err.detail,
            ErrorDetail::BreakerOpen { node_id: Some(9), .. }
        ));
        // the sixth dial never reached the resolver
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // other classes have their own breaker
        assert_eq!(
            dialer.breaker(9, ConnectionClass::System).state(),
            BreakerState::Closed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_ctx_does_not_trip() {
        let (net, dialer) = setup(Arc::new(AtomicUsize::new(0)));
        let (ctx, handle) = Ctx::background().with_cancel();
        handle.cancel();
        assert!(dialer
            .dial(&ctx, 9, ConnectionClass::Default)
            .await
            .unwrap_err()
            .is_ctx_err());
        assert_eq!(dialer.breaker(9, ConnectionClass::Default).consecutive_failures(), 0);

        // cancellation while the dial is in progress
        net.set_dial_delay(Duration::from_millis(200));
        let (ctx, handle) = Ctx::background().with_cancel();
        let task = tokio::spawn(async move {
            let res = dialer.dial(&ctx, 2, ConnectionClass::Default).await;
            (res.map(|_| ()), dialer)
        });
        time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let (res, dialer) = task.await.unwrap();
        assert!(res.unwrap_err().is_ctx_err());
        assert_eq!(dialer.breaker(2, ConnectionClass::Default).consecutive_failures(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn partition_fails_and_recovers() -> Result<(), KvError> {
        let (net, dialer) = setup(Arc::new(AtomicUsize::new(0)));
        let ctx = Ctx::background();
        net.set_partitioned("addr-2", true);
        assert!(dialer.dial(&ctx, 2, ConnectionClass::Default).await.is_err());
        assert_eq!(dialer.breaker(2, ConnectionClass::Default).consecutive_failures(), 1);
        net.set_partitioned("addr-2", false);
        let conn = dialer.dial(&ctx, 2, ConnectionClass::Default).await?;
        assert!(!conn.is_local());
        assert!(dialer.conn_health(2, ConnectionClass::Default).is_ok());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loopback_tags_local() -> Result<(), KvError> {
        let (_net, dialer) = setup(Arc::new(AtomicUsize::new(0)));
        dialer.set_local("addr-1", Arc::new(EchoService(1)));
        let ctx = Ctx::background();
        let conn = dialer
            .dial_internal_client(&ctx, 1, ConnectionClass::Default)
            .await?;
        assert!(conn.is_local());
        conn.batch(&ctx, BatchRequest::default()).await?;
        let remote = dialer
            .dial_internal_client(&ctx, 2, ConnectionClass::Default)
            .await?;
        assert!(remote.batch(&ctx, BatchRequest::default()).await.is_err());
        Ok(())
    }
}
