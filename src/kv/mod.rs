//! Gateway side of the store: routing of batches to ranges, transaction
//! coordination, and the client-facing `DB` / `Txn` handles.

mod db;
mod dist_sender;
mod range_cache;
mod sender;
mod txn;
mod txn_coord_sender;
mod txn_interceptor_committer;
mod txn_interceptor_heartbeater;
mod txn_interceptor_seq_num_allocator;
mod txn_interceptor_span_refresher;

pub use db::DB;
pub use dist_sender::{DialerConfig, DistSender};
pub use range_cache::{RangeCache, RangeCacheEntry};
pub use sender::{Sender, SenderKind, TxnSender, TxnType};
pub use txn::Txn;
pub use txn_coord_sender::{
    SavepointToken, TxnConfig, TxnCoordMeta, TxnCoordSender, TxnCoordSenderFactory,
};
