//! Per-node storage: the engine, replicas of ranges with their consensus
//! groups, and the store that owns them plus its background queues.

mod backpressure;
mod batcheval;
mod engine;
mod intent_resolver;
mod liveness;
mod merge_queue;
mod meta;
mod queue;
mod raft;
mod raft_transport;
mod replica;
mod replica_command;
mod replica_lease;
mod replica_proposal;
mod scheduler;
mod split_decider;
mod split_delay;
mod split_queue;
mod stateloader;
mod store;
mod tscache;
mod zone;

pub use batcheval::{decode_int, encode_int, EvalContext, LocalResult};
pub use engine::{Engine, KeyHistory, Reader};
pub use intent_resolver::IntentResolver;
pub use liveness::{LivenessConfig, LivenessRecord, NodeLiveness};
pub use merge_queue::MergeQueue;
pub use meta::{MergeStatus, MetaDirectory};
pub use queue::{BaseQueue, ProcessCallback, QueueConfig, QueueImpl};
pub use raft::{Entry, HardState, Message, MessageBody, ProgressState, Role};
pub use raft_transport::{RaftMessageRequest, RaftTransport};
pub use replica::{DestroyStatus, Replica};
pub use scheduler::{RaftProcessor, RaftScheduler, SchedulerType};
pub use split_decider::SplitDecider;
pub use split_queue::SplitQueue;
pub use store::{Store, StoreConfig, StoreIdent, StoreParams};
#[cfg(test)]
pub(crate) use store::store_tests;
pub use tscache::TimestampCache;
pub use zone::{zone_with_bounds, SystemConfig, ZoneConfig};
