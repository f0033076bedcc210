//! Lock table: per-key locks held by transactions, with wait signals for
//! requests queued behind them.
//!
//! The engine's intents are the source of truth; the table tracks the locks
//! a replica has acquired or discovered since it became leaseholder, and is
//! cleared whenever that knowledge may have gone stale (lease changes,
//! splits, merges).

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use crate::concurrency::spanset::{SpanAccess, SpanScope, SpanSet};
use crate::hlc::Timestamp;
use crate::kvpb::{Intent, Key, LockUpdate, Span, TxnId, TxnMeta};
use crate::utils::MutexExt;

use tokio::sync::watch;

/// Transaction holding a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub txn: TxnMeta,
    pub ts: Timestamp,
}

struct LockState {
    holder: Option<LockHolder>,

    /// Transactions (or anonymous requests) queued on the lock.
    queued: Vec<Option<TxnId>>,

    /// Bumped on every release or update of the holder.
    version: watch::Sender<u64>,
}

impl LockState {
    fn new(holder: LockHolder) -> Self {
        let (version, _) = watch::channel(0);
        LockState {
            holder: Some(holder),
            queued: Vec::new(),
            version,
        }
    }

    fn signal(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

/// Conflicting lock found by a scan.
pub struct LockConflict {
    pub intent: Intent,

    /// True if the scanning request wants to write the key.
    pub is_write: bool,

    /// Changes when the holder releases or updates the lock.
    pub changed: watch::Receiver<u64>,
}

/// Per-range lock table.
pub struct LockTable {
    locks: Mutex<BTreeMap<Key, LockState>>,
}

impl LockTable {
    pub fn new() -> Self {
        LockTable {
            locks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Records a lock acquired by `txn` on `key` (own write applied).
    pub fn acquire_lock(&self, key: Key, txn: &TxnMeta) {
        let holder = LockHolder {
            txn: txn.clone(),
            ts: txn.write_timestamp,
        };
        let mut locks = self.locks.locked();
        match locks.get_mut(&key) {
            Some(state) => {
                state.holder = Some(holder);
            }
            None => {
                locks.insert(key, LockState::new(holder));
            }
        }
    }

    /// Records locks discovered as intents during evaluation.
    pub fn add_discovered(&self, intents: &[Intent]) {
        let mut locks = self.locks.locked();
        for intent in intents {
            let holder = LockHolder {
                txn: intent.txn.clone(),
                ts: intent.txn.write_timestamp,
            };
            match locks.get_mut(&intent.key) {
                Some(state) if state.holder.is_none() => {
                    state.holder = Some(holder)
                }
                Some(_) => {}
                None => {
                    locks.insert(intent.key.clone(), LockState::new(holder));
                }
            }
        }
    }

    /// Returns conflicting locks over the request's lock spans. Readers
    /// only conflict with locks at or below their read timestamp.
    pub fn scan_conflicts(
        &self,
        txn_id: Option<TxnId>,
        read_ts: Timestamp,
        lock_spans: &SpanSet,
    ) -> Vec<LockConflict> {
        let mut locks = self.locks.locked();
        let mut conflicts = Vec::new();
        for declared in lock_spans.iter() {
            if declared.scope != SpanScope::Global {
                continue;
            }
            let is_write = declared.access == SpanAccess::ReadWrite;
            let end = declared.span.end_exclusive();
            let range = (
                Bound::Included(declared.span.key.clone()),
                Bound::Excluded(end),
            );
            for (key, state) in locks.range_mut(range) {
                let holder = match &state.holder {
                    Some(h) => h,
                    None => continue,
                };
                if Some(holder.txn.id) == txn_id {
                    continue;
                }
                if !is_write && holder.ts > read_ts {
                    continue;
                }
                if !state.queued.contains(&txn_id) {
                    state.queued.push(txn_id);
                }
                conflicts.push(LockConflict {
                    intent: Intent {
                        key: key.clone(),
                        txn: holder.txn.clone(),
                    },
                    is_write,
                    changed: state.version.subscribe(),
                });
            }
        }
        conflicts
    }

    /// Removes a request from the queues it joined.
    pub fn dequeue(&self, txn_id: Option<TxnId>, keys: &[Key]) {
        let mut locks = self.locks.locked();
        for key in keys {
            if let Some(state) = locks.get_mut(key) {
                state.queued.retain(|q| *q != txn_id);
            }
        }
        Self::gc(&mut locks);
    }

    /// Applies a resolution: finalized transactions release their locks,
    /// pending ones have their timestamp moved.
    pub fn update_locks(&self, update: &LockUpdate) {
        let mut locks = self.locks.locked();
        let end = update.span.end_exclusive();
        let range = (
            Bound::Included(update.span.key.clone()),
            Bound::Excluded(end),
        );
        for (_, state) in locks.range_mut(range) {
            let matches = state
                .holder
                .as_ref()
                .map_or(false, |h| h.txn.id == update.txn.id);
            if !matches {
                continue;
            }
            if update.status.is_finalized() {
                state.holder = None;
            } else if let Some(h) = state.holder.as_mut() {
                h.ts.forward(update.txn.write_timestamp);
                h.txn.write_timestamp = h.ts;
            }
            state.signal();
        }
        Self::gc(&mut locks);
    }

    /// Drops every lock and wakes all waiters.
    pub fn clear(&self) {
        let mut locks = self.locks.locked();
        for state in locks.values() {
            state.signal();
        }
        locks.clear();
    }

    /// Holder of the lock on `key`, if any.
    pub fn holder(&self, key: &[u8]) -> Option<LockHolder> {
        self.locks
            .locked()
            .get(key)
            .and_then(|s| s.holder.clone())
    }

    pub fn num_locks(&self) -> usize {
        self.locks
            .locked()
            .values()
            .filter(|s| s.holder.is_some())
            .count()
    }

    /// Keys in `span` currently locked by a transaction other than
    /// `txn_id`.
    pub fn locked_keys(&self, txn_id: Option<TxnId>, span: &Span) -> Vec<Key> {
        let end = span.end_exclusive();
        self.locks
            .locked()
            .range((Bound::Included(span.key.clone()), Bound::Excluded(end)))
            .filter(|(_, s)| {
                s.holder
                    .as_ref()
                    .map_or(false, |h| Some(h.txn.id) != txn_id)
            })
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn gc(locks: &mut BTreeMap<Key, LockState>) {
        locks.retain(|_, s| s.holder.is_some() || !s.queued.is_empty());
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}
