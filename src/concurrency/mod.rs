//! Request sequencing: span sets, latches, the lock table and the
//! concurrency manager tying them together.

mod latch;
mod lock_table;
mod lock_table_waiter;
mod manager;
mod spanset;

pub use latch::{LatchGuard, LatchManager};
pub use lock_table::{LockConflict, LockHolder, LockTable};
pub use lock_table_waiter::{
    IntentPusher, LockTableWaiter, LockWaitConfig, WaitingRequest,
};
pub use manager::{ConcurrencyManager, ConcurrencyRequest, Guard};
pub use spanset::{DeclaredSpan, SpanAccess, SpanScope, SpanSet};
