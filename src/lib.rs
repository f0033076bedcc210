//! Transaction coordination and per-range replication core of a
//! range-partitioned, replicated key-value store.
//!
//! Layers, bottom-up: hybrid-logical clocks, quota pools, circuit breakers
//! and the node dialer; latches, the lock table and the concurrency manager;
//! the in-memory MVCC engine, replicas and their consensus log, the raft
//! scheduler and the split/merge queues; the closed-timestamp subsystem; the
//! transaction coordinator with the request batcher; and scheduled jobs.

#[macro_use]
mod utils;

pub mod closedts;
pub mod cluster;
pub mod concurrency;
pub mod hlc;
pub mod jobs;
pub mod kv;
pub mod kvpb;
pub mod quotapool;
pub mod requestbatcher;
pub mod rpc;
pub mod storage;

pub use utils::{
    logger_init, AbortReason, Bitmap, CancelHandle, Ctx, ErrorDetail,
    KvError, LogEvery, RetryReason, Stopper, Timer, ME,
};
pub use utils::{MutexExt, RwLockExt};
