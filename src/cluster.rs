//! Local in-process cluster: nodes wired through one in-process network,
//! sharing node liveness, the meta directory and the system config. Used by
//! the server binary and by end-to-end tests.

use std::sync::Arc;

use crate::closedts::ClosedTsConfig;
use crate::hlc::Clock;
use crate::jobs::{JobScheduler, JobsConfig, ProdJobSchedulerEnv};
use crate::kv::{DialerConfig, DistSender, TxnConfig, TxnCoordSenderFactory, DB};
use crate::kvpb::keys::{key_max, key_min, SYSTEM_MAX};
use crate::kvpb::{Key, NodeId, RangeDescriptor, RangeId, ReplicaDescriptor};
use crate::rpc::{AddressResolver, BreakerConfig, LocalNetwork, NodeDialer};
use crate::storage::{
    LivenessConfig, MetaDirectory, NodeLiveness, QueueConfig, Store, StoreConfig, StoreIdent,
    StoreParams, SystemConfig, ZoneConfig,
};
use crate::utils::{KvError, Stopper};

use bytes::Bytes;

use tokio::time::Duration;

/// Configuration of a local cluster, one TOML table per section.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub num_nodes: usize,

    /// Maximum clock offset tolerated between nodes.
    pub max_offset_ms: u64,

    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub closedts: ClosedTsConfig,
    pub breaker: BreakerConfig,
    pub dialer: DialerConfig,
    pub liveness: LivenessConfig,
    pub txn: TxnConfig,
    pub jobs: JobsConfig,

    /// Default zone; its replica count decides the initial placement.
    pub zone: ZoneConfig,
}

#[allow(clippy::derivable_impls)]
impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            num_nodes: 3,
            max_offset_ms: 500,
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
            closedts: ClosedTsConfig::default(),
            breaker: BreakerConfig::default(),
            dialer: DialerConfig::default(),
            liveness: LivenessConfig::default(),
            txn: TxnConfig::default(),
            jobs: JobsConfig::default(),
            zone: ZoneConfig::default(),
        }
    }
}

/// Removes section `name` from `table`, re-serialized for `parsed_config!`.
fn take_section(table: &mut toml::Table, name: &str) -> Result<Option<String>, KvError> {
    match table.remove(name) {
        Some(toml::Value::Table(section)) => Ok(Some(toml::to_string(&section)?)),
        Some(_) => Err(KvError::msg(format!("config section '{}' must be a table", name))),
        None => Ok(None),
    }
}

impl ClusterConfig {
    /// Parses a TOML document; absent keys keep their defaults, unknown
    /// ones are rejected.
    pub fn from_toml(s: &str) -> Result<Self, KvError> {
        let mut table = s.parse::<toml::Table>()?;
        let mut config = ClusterConfig::default();
        if let Some(v) = table.remove("num_nodes") {
            config.num_nodes = v.try_into()?;
        }
        if let Some(v) = table.remove("max_offset_ms") {
            config.max_offset_ms = v.try_into()?;
        }

        let section = take_section(&mut table, "store")?;
        config.store = parsed_config!(section.as_deref() => StoreConfig;
                                      raft_tick_ms, raft_heartbeat_ticks,
                                      raft_ready_workers, raft_tick_workers,
                                      proposal_quota_bytes,
                                      raft_log_truncation_threshold,
                                      backpressure_multiplier,
                                      split_delay_attempts, split_delay_interval_ms,
                                      expiration_lease_ms, lease_request_timeout_ms,
                                      replication_table_offset_ms,
                                      txn_liveness_threshold_ms, push_delay_ms,
                                      intent_resolver_batcher)?;
        let section = take_section(&mut table, "queue")?;
        config.queue = parsed_config!(section.as_deref() => QueueConfig;
                                      scan_interval_ms, purgatory_interval_ms,
                                      process_timeout_ms, max_size,
                                      split_enabled, merge_enabled)?;
        let section = take_section(&mut table, "closedts")?;
        config.closedts = parsed_config!(section.as_deref() => ClosedTsConfig;
                                         target_duration_ms, close_interval_ms,
                                         bucket_scale_ms, initial_backoff_ms,
                                         max_backoff_ms)?;
        let section = take_section(&mut table, "breaker")?;
        config.breaker = parsed_config!(section.as_deref() => BreakerConfig;
                                        consecutive_failure_threshold, cooldown_ms,
                                        log_interval_secs)?;
        let section = take_section(&mut table, "dialer")?;
        config.dialer = parsed_config!(section.as_deref() => DialerConfig;
                                       max_routing_retries, routing_backoff_ms,
                                       routing_max_backoff_ms)?;
        let section = take_section(&mut table, "liveness")?;
        config.liveness = parsed_config!(section.as_deref() => LivenessConfig;
                                         liveness_duration_ms, heartbeat_interval_ms)?;
        let section = take_section(&mut table, "txn")?;
        config.txn = parsed_config!(section.as_deref() => TxnConfig;
                                    heartbeat_interval_ms, liveness_threshold_ms,
                                    max_auto_retries)?;
        let section = take_section(&mut table, "jobs")?;
        config.jobs = parsed_config!(section.as_deref() => JobsConfig;
                                     enabled, poll_interval_ms,
                                     max_schedules_per_poll, retry_failed_after_secs)?;
        if let Some(section) = take_section(&mut table, "zone")? {
            config.zone = ZoneConfig::from_toml(&section)?;
        }

        if let Some(key) = table.keys().next() {
            return Err(KvError::msg(format!("invalid field name '{}' in config", key)));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), KvError> {
        if self.num_nodes == 0 || self.num_nodes > NodeId::MAX as usize {
            return Err(KvError::msg(format!("invalid number of nodes {}", self.num_nodes)));
        }
        self.zone.validate()
    }

    /// Nodes holding the bootstrap ranges.
    fn replication_factor(&self) -> usize {
        self.zone.num_replicas.min(self.num_nodes)
    }
}

/// Address of node `node_id` on the in-process network.
pub fn node_addr(node_id: NodeId) -> String {
    format!("local:{}", node_id)
}

/// One node: a single store plus its gateway.
pub struct Node {
    pub node_id: NodeId,
    pub store: Arc<Store>,
    pub dialer: Arc<NodeDialer>,

    /// Gateway client handle of the node.
    pub db: Arc<DB>,

    /// Owns the node's executor registry.
    pub jobs: Arc<JobScheduler>,
}

pub struct LocalCluster {
    config: ClusterConfig,
    network: Arc<LocalNetwork>,
    liveness: Arc<NodeLiveness>,
    meta: Arc<MetaDirectory>,
    system_config: Arc<SystemConfig>,
    nodes: Vec<Node>,
    stopper: Stopper,
}

impl LocalCluster {
    /// Boots every node: one system range and one user range, replicated
    /// on the first nodes per the zone's replica count.
    pub async fn start(config: ClusterConfig) -> Result<Self, KvError> {
        config.validate()?;
        let stopper = Stopper::new();
        let network = LocalNetwork::new();
        let liveness = NodeLiveness::new(config.liveness.clone());
        let meta = Arc::new(MetaDirectory::new());
        let system_config = Arc::new(SystemConfig::new(config.zone.clone()));

        let num_nodes = config.num_nodes as NodeId;
        let rf = config.replication_factor() as NodeId;
        let replicas: Vec<ReplicaDescriptor> = (1..=rf)
            .map(|id| ReplicaDescriptor {
                node_id: id,
                store_id: id,
                replica_id: id,
            })
            .collect();
        let bootstrap = |range_id: RangeId, start: Key, end: Key| RangeDescriptor {
            range_id,
            start_key: start,
            end_key: end,
            replicas: replicas.clone(),
            next_replica_id: rf + 1,
            generation: 0,
        };
        let descs = vec![
            bootstrap(1, key_min(), Bytes::from_static(SYSTEM_MAX)),
            bootstrap(2, Bytes::from_static(SYSTEM_MAX), key_max()),
        ];
        meta.bootstrap(descs.clone())?;

        let resolver: AddressResolver = Arc::new(move |node_id| {
            if node_id >= 1 && node_id <= num_nodes {
                Ok(node_addr(node_id))
            } else {
                Err(KvError::msg(format!("unknown node n{}", node_id)))
            }
        });

        // every store listens before any of them starts talking
        let mut built = Vec::with_capacity(config.num_nodes);
        for node_id in 1..=num_nodes {
            let clock = Arc::new(Clock::system(Duration::from_millis(config.max_offset_ms)));
            let dialer = Arc::new(NodeDialer::new(
                resolver.clone(),
                network.clone(),
                config.breaker.clone(),
            ));
            let store = Store::new(StoreParams {
                ident: StoreIdent {
                    node_id,
                    store_id: node_id,
                },
                config: config.store.clone(),
                queue_config: config.queue.clone(),
                closedts_config: config.closedts.clone(),
                clock: clock.clone(),
                liveness: liveness.clone(),
                meta: meta.clone(),
                system_config: system_config.clone(),
                dialer: dialer.clone(),
                stopper: stopper.clone(),
            });
            network.register(node_addr(node_id), store.clone());
            dialer.set_local(node_addr(node_id), store.clone());
            built.push((node_id, clock, dialer, store));
        }

        let mut nodes = Vec::with_capacity(built.len());
        for (node_id, clock, dialer, store) in built {
            for desc in descs.iter().filter(|d| d.replica_for_store(node_id).is_some()) {
                store.bootstrap_range(desc)?;
            }
            liveness.start_heartbeat(node_id, clock.clone(), &stopper)?;

            let dist_sender = DistSender::with_config(
                node_id,
                clock.clone(),
                meta.clone(),
                dialer.clone(),
                config.dialer.clone(),
            );
            let factory =
                TxnCoordSenderFactory::new(config.txn.clone(), clock, dist_sender, stopper.clone());
            let db = DB::new(factory);
            store.start(db.clone())?;

            let jobs = JobScheduler::new(
                store.tag(),
                config.jobs.clone(),
                db.clone(),
                Arc::new(ProdJobSchedulerEnv),
                stopper.clone(),
            );
            jobs.start()?;
            nodes.push(Node {
                node_id,
                store,
                dialer,
                db,
                jobs,
            });
        }
        pf_info!("cluster"; "started {} node(s), replication factor {}", nodes.len(), rf);

        Ok(LocalCluster {
            config,
            network,
            liveness,
            meta,
            system_config,
            nodes,
            stopper,
        })
    }

    #[inline]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node with id `node_id`, counting from 1.
    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Gateway of the first node.
    pub fn db(&self) -> Result<Arc<DB>, KvError> {
        self.nodes
            .first()
            .map(|n| n.db.clone())
            .ok_or_else(|| KvError::msg("cluster has no nodes"))
    }

    #[inline]
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    #[inline]
    pub fn liveness(&self) -> &Arc<NodeLiveness> {
        &self.liveness
    }

    #[inline]
    pub fn meta(&self) -> &Arc<MetaDirectory> {
        &self.meta
    }

    #[inline]
    pub fn system_config(&self) -> &Arc<SystemConfig> {
        &self.system_config
    }

    #[inline]
    pub fn stopper(&self) -> &Stopper {
        &self.stopper
    }

    /// Quiesces every node and waits for their workers.
    pub async fn stop(&self) {
        pf_info!("cluster"; "stopping {} node(s)", self.nodes.len());
        for node in &self.nodes {
            node.dialer.clear_local();
            self.network.deregister(&node_addr(node.node_id));
        }
        self.stopper.stop().await;
    }
}

#[cfg(test)]
mod cluster_tests {
    use super::*;
    use crate::closedts::ctpb::Entry;
    use crate::closedts::{can_serve_follower_read, FollowerReadCheck};
    use crate::hlc::Timestamp;
    use crate::kv::Sender;
    use crate::kvpb::{BatchRequest, BatchResponse, LeaseType, Request, Response};
    use crate::requestbatcher::{BatcherConfig, BatcherOptions, RequestBatcher};
    use crate::rpc::ConnectionClass;
    use crate::storage::Replica;
    use crate::utils::{Ctx, ErrorDetail};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::{self, Instant};

    fn single_node_config() -> ClusterConfig {
        ClusterConfig {
            num_nodes: 1,
            queue: QueueConfig {
                split_enabled: false,
                merge_enabled: false,
                ..Default::default()
            },
            jobs: JobsConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn eventually<F>(what: &str, mut cond: F) -> Result<(), KvError>
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            if Instant::now() >= deadline {
                return Err(KvError::msg(format!("timed out waiting for {}", what)));
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lost_update_is_prevented() -> Result<(), KvError> {
        let cluster = LocalCluster::start(single_node_config()).await?;
        let db = cluster.db()?;
        let ctx = Ctx::background();

        let t1 = db.new_txn("t1");
        assert_eq!(t1.get(&ctx, "a").await?, None);

        let t2 = db.new_txn("t2");
        t2.put(&ctx, "a", "hi").await?;
        t2.commit(&ctx).await?;

        t1.put(&ctx, "a", "oops!").await?;
        let err = t1.commit(&ctx).await.expect_err("lost update must not commit");
        match err.detail {
            ErrorDetail::TransactionRetryWithProtoRefresh { cause, .. } => {
                assert!(matches!(*cause, ErrorDetail::WriteTooOld { .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(t1.epoch(), 1);
        assert_eq!(t1.sender().write_seq(), 0);

        assert_eq!(t1.get(&ctx, "a").await?, Some(Bytes::from("hi")));
        t1.put(&ctx, "a", "correct").await?;
        t1.commit(&ctx).await?;
        assert_eq!(db.get(&ctx, "a").await?, Some(Bytes::from("correct")));
        cluster.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn savepoint_rollback_drops_later_writes() -> Result<(), KvError> {
        let cluster = LocalCluster::start(single_node_config()).await?;
        let db = cluster.db()?;
        let ctx = Ctx::background();

        let txn = db.new_txn("savepoint");
        txn.put(&ctx, "a", "1").await?;
        txn.put(&ctx, "b", "2").await?;
        let sp = txn.create_savepoint()?;
        txn.put(&ctx, "a", "3").await?;
        txn.put(&ctx, "c", "4").await?;
        txn.rollback_to_savepoint(&sp)?;
        assert_eq!(txn.get(&ctx, "a").await?, Some(Bytes::from("1")));
        txn.commit(&ctx).await?;

        assert_eq!(db.get(&ctx, "a").await?, Some(Bytes::from("1")));
        assert_eq!(db.get(&ctx, "b").await?, Some(Bytes::from("2")));
        assert_eq!(db.get(&ctx, "c").await?, None);
        cluster.stop().await;
        Ok(())
    }

    /// Records every batch on its way to the cluster.
    struct RecordingSender {
        start: Instant,
        inner: Arc<dyn Sender>,
        batches: Mutex<Vec<(RangeId, usize, Duration)>>,
    }

    #[async_trait]
    impl Sender for RecordingSender {
        async fn send(&self, ctx: &Ctx, ba: BatchRequest) -> Result<BatchResponse, KvError> {
            self.batches.lock().unwrap().push((
                ba.header.range_id,
                ba.requests.len(),
                self.start.elapsed(),
            ));
            self.inner.send(ctx, ba).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batcher_coalesces_per_range() -> Result<(), KvError> {
        let cluster = LocalCluster::start(single_node_config()).await?;
        let db = cluster.db()?;
        let ctx = Ctx::background();
        let recorder = Arc::new(RecordingSender {
            start: Instant::now(),
            inner: db.sender(),
            batches: Mutex::new(Vec::new()),
        });
        let batcher = RequestBatcher::new(BatcherOptions {
            name: "e2e".into(),
            config: BatcherConfig {
                max_idle_ms: 50,
                max_wait_ms: 50,
                max_msgs_per_batch: 3,
                in_flight_backpressure_limit: 0,
            },
            sender: Some(recorder.clone() as Arc<dyn Sender>),
            stopper: Some(cluster.stopper().clone()),
            now_fn: None,
        })?;

        let sends = vec![
            batcher.send(&ctx, 2, Request::put("u1", "x")),
            batcher.send(&ctx, 1, Request::get(Bytes::from_static(b"\x02s1"))),
            batcher.send(&ctx, 2, Request::put("u2", "y")),
            batcher.send(&ctx, 1, Request::get(Bytes::from_static(b"\x02s2"))),
            batcher.send(&ctx, 2, Request::put("u3", "z")),
        ];
        let results = futures::future::join_all(sends).await;
        for res in results {
            let resp = res?;
            assert!(matches!(resp, Response::Put | Response::Get { value: None }));
        }

        let batches = recorder.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 2);
        let (range, len, at) = batches[0];
        assert_eq!((range, len), (2, 3));
        assert!(at < Duration::from_millis(50));
        let (range, len, at) = batches[1];
        assert_eq!((range, len), (1, 2));
        assert!(at >= Duration::from_millis(45));
        assert!(at < Duration::from_millis(1000));
        cluster.stop().await;
        Ok(())
    }

    #[test]
    fn follower_read_rule() {
        let closed = Timestamp::from_wall(100);
        let read = Timestamp::from_wall(95);
        assert!(can_serve_follower_read(read, closed, Some(42), 45));
        assert!(!can_serve_follower_read(read, closed, Some(42), 40));
    }

    /// Replica of range `range_id` on `node`.
    fn replica_of(node: &Node, range_id: RangeId) -> Result<Arc<Replica>, KvError> {
        node.store
            .get_replica(range_id)
            .ok_or_else(|| KvError::msg(format!("n{} has no r{}", node.node_id, range_id)))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn follower_serves_closed_reads() -> Result<(), KvError> {
        let config = ClusterConfig {
            num_nodes: 3,
            closedts: ClosedTsConfig {
                // keep published entries out of the way of the injected ones
                close_interval_ms: 3_600_000,
                ..Default::default()
            },
            ..single_node_config()
        };
        let cluster = LocalCluster::start(config).await?;
        let ctx = Ctx::background();
        let db = cluster.db()?;
        db.put(&ctx, "fr", "v").await?;

        let range_id = 2;
        let holder = cluster
            .nodes()
            .iter()
            .find(|n| {
                n.store
                    .get_replica(range_id)
                    .map_or(false, |r| r.lease().owned_by(n.store.ident().store_id))
            })
            .ok_or_else(|| KvError::msg("no leaseholder"))?;
        let lease = replica_of(holder, range_id)?.lease();
        assert_eq!(lease.typ(), LeaseType::Epoch);
        let holder_lai = replica_of(holder, range_id)?.lease_applied_index();

        let follower = cluster
            .nodes()
            .iter()
            .find(|n| n.node_id != holder.node_id)
            .ok_or_else(|| KvError::msg("no follower"))?;
        let repl = replica_of(follower, range_id)?;
        eventually("follower to catch up", || {
            repl.lease().equivalent(&lease) && repl.lease_applied_index() >= holder_lai
        })
        .await?;
        let applied = repl.lease_applied_index();

        let scan_at_95 = || {
            let mut ba = BatchRequest::single(Request::scan("f", "g"));
            ba.header.range_id = range_id;
            ba.header.timestamp = Timestamp::from_wall(95);
            ba
        };
        let storage = &follower.store.closedts().storage;
        let entry = |mlai: u64| Entry {
            epoch: lease.epoch,
            closed_timestamp: Timestamp::from_wall(100),
            mlai: HashMap::from([(range_id, mlai)]),
            full: true,
        };

        storage.add(holder.node_id, entry(applied));
        assert_eq!(
            follower.store.closedts().check_follower_read(
                holder.node_id,
                lease.epoch,
                range_id,
                Timestamp::from_wall(95),
                applied,
            ),
            FollowerReadCheck::CanServe
        );
        let br = follower.store.send(&ctx, scan_at_95()).await?;
        assert_eq!(br.responses[0], Response::Scan { rows: vec![] });

        // the follower has not applied through the entry's MLAI
        storage.clear(holder.node_id);
        storage.add(holder.node_id, entry(applied + 5));
        let err = follower
            .store
            .send(&ctx, scan_at_95())
            .await
            .expect_err("lagging follower must redirect");
        assert!(matches!(err.detail, ErrorDetail::NotLeaseHolder { .. }));
        cluster.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn breaker_opens_on_unresolvable_node() -> Result<(), KvError> {
        let config = ClusterConfig {
            breaker: BreakerConfig {
                consecutive_failure_threshold: 5,
                cooldown_ms: 60_000,
                log_interval_secs: 60,
            },
            ..single_node_config()
        };
        let cluster = LocalCluster::start(config).await?;
        let dialer = &cluster.nodes()[0].dialer;
        let ctx = Ctx::background();
        for _ in 0..5 {
            let err = dialer.dial(&ctx, 99, ConnectionClass::Default).await.unwrap_err();
            assert!(matches!(err.detail, ErrorDetail::Internal(_)));
        }
        let err = dialer.dial(&ctx, 99, ConnectionClass::Default).await.unwrap_err();
        assert!(matches!(err.detail, ErrorDetail::BreakerOpen { node_id: Some(99), .. }));
        // the open breaker answered without resolving
        assert_eq!(
            dialer.breaker(99, ConnectionClass::Default).consecutive_failures(),
            5
        );
        cluster.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn oversized_range_splits_before_merging() -> Result<(), KvError> {
        let cluster = LocalCluster::start(single_node_config()).await?;
        let db = cluster.db()?;
        let ctx = Ctx::background();
        db.admin_split(&ctx, "m").await?;
        for i in 0..18 {
            db.put(&ctx, format!("k{:02}", i), vec![b'x'; 100]).await?;
        }
        let store = &cluster.nodes()[0].store;
        let left = store
            .replica_for_key(b"k00")
            .ok_or_else(|| KvError::msg("no left-hand range"))?;

        // left-hand range at 150% of its max size
        let size = left.stats().total();
        let max_bytes = size * 2 / 3;
        let min_bytes = size * 3 / 5;
        cluster.system_config().set_default_zone(ZoneConfig {
            range_min_bytes: min_bytes,
            range_max_bytes: max_bytes,
            ..Default::default()
        });

        let now = store.clock().now();
        let merge_queue = store.merge_queue();
        assert!(!merge_queue.base().should_queue(&left, now).0);
        assert!(!merge_queue.base().manually_process(&ctx, &left, false).await?);

        let split_queue = store.split_queue()?;
        assert!(split_queue.base().manually_process(&ctx, &left, false).await?);
        let desc = left.desc()?;
        assert!(desc.end_key < Bytes::from("m"));
        assert!(left.stats().total() < min_bytes);

        let (wanted, priority) = merge_queue.base().should_queue(&left, store.clock().now());
        assert!(wanted);
        assert!(priority > 0.0);
        cluster.stop().await;
        Ok(())
    }

    #[test]
    fn config_sections_from_toml() -> Result<(), KvError> {
        let config = ClusterConfig::from_toml(
            "num_nodes = 5\n\
             [store]\n\
             raft_tick_ms = 20\n\
             [breaker]\n\
             consecutive_failure_threshold = 3\n\
             [zone]\n\
             num_replicas = 5\n",
        )?;
        assert_eq!(config.num_nodes, 5);
        assert_eq!(config.store.raft_tick_ms, 20);
        assert_eq!(config.store.push_delay_ms, 50);
        assert_eq!(config.breaker.consecutive_failure_threshold, 3);
        assert_eq!(config.replication_factor(), 5);
        assert_eq!(config.txn.heartbeat_interval_ms, 1000);

        assert!(ClusterConfig::from_toml("[store]\nbogus = 1").is_err());
        assert!(ClusterConfig::from_toml("[nonsense]\nx = 1").is_err());
        assert!(ClusterConfig::from_toml("num_nodes = 0").is_err());
        assert!(ClusterConfig::from_toml("store = 3").is_err());
        Ok(())
    }
}
