//! In-memory MVCC engine of a store.
//!
//! Every user key maps to a `KeyHistory`: committed versions (newest first)
//! plus at most one provisional intent, which keeps its per-sequence value
//! history. Range state, transaction records and the consensus log live in
//! a separate unversioned local keyspace.
//!
//! Commands are evaluated against an `EvalBatch` overlay and produce a
//! `WriteBatch` of whole-key replacements, which every replica applies
//! identically.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::hlc::Timestamp;
use crate::kvpb::{
    is_seq_ignored, IgnoredSeqRange, Intent, Key, KeyValue, LockUpdate,
    MvccStats, Transaction, TransactionStatus, TxnMeta,
};
use crate::utils::{ErrorDetail, KvError, RwLockExt};

use bytes::Bytes;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Committed version; `None` value is a deletion tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub ts: Timestamp,
    pub value: Option<Bytes>,
}

/// Value written by an intent at a given sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentValue {
    pub seq: i32,
    pub value: Option<Bytes>,
}

/// Provisional write of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteIntent {
    pub txn: TxnMeta,

    /// Sorted by sequence; the last entry is the current value.
    pub history: Vec<IntentValue>,
}

impl WriteIntent {
    /// Latest value at or below `seq` that is not rolled back.
    fn value_at(
        &self,
        seq: i32,
        ignored: &[IgnoredSeqRange],
    ) -> Option<&IntentValue> {
        self.history
            .iter()
            .rev()
            .find(|v| v.seq <= seq && !is_seq_ignored(v.seq, ignored))
    }
}

/// Everything stored under one user key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHistory {
    pub intent: Option<WriteIntent>,

    /// Newest first.
    pub versions: Vec<Version>,
}

impl KeyHistory {
    pub fn is_empty(&self) -> bool {
        self.intent.is_none() && self.versions.is_empty()
    }

    /// Latest committed version at or below `ts`.
    pub fn version_at(&self, ts: Timestamp) -> Option<&Version> {
        self.versions.iter().find(|v| v.ts <= ts)
    }

    pub fn latest(&self) -> Option<&Version> {
        self.versions.first()
    }

    /// Inserts a committed version, keeping newest-first order.
    pub fn add_version(&mut self, version: Version) {
        match self.versions.iter().position(|v| v.ts <= version.ts) {
            Some(i) if self.versions[i].ts == version.ts => {
                self.versions[i] = version
            }
            Some(i) => self.versions.insert(i, version),
            None => self.versions.push(version),
        }
    }

    /// Statistics contributed by this key.
    pub fn stats(&self, key: &[u8]) -> MvccStats {
        let mut ms = MvccStats::default();
        if self.is_empty() {
            return ms;
        }
        let klen = key.len() as i64;
        let value_len = |v: &Option<Bytes>| v.as_ref().map_or(0, |b| b.len() as i64);
        ms.key_count = 1;
        for v in &self.versions {
            ms.key_bytes += klen;
            ms.val_bytes += value_len(&v.value);
        }
        let current = match &self.intent {
            Some(intent) => {
                ms.intent_count = 1;
                ms.key_bytes += klen;
                let cur = intent.history.last().and_then(|v| v.value.clone());
                ms.val_bytes += value_len(&cur);
                cur
            }
            None => self.latest().and_then(|v| v.value.clone()),
        };
        if let Some(value) = current {
            ms.live_count = 1;
            ms.live_bytes = klen + value.len() as i64;
        }
        ms
    }
}

/// One replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Replaces (or deletes) the full history of a user key.
    Key { key: Key, history: Option<KeyHistory> },

    /// Sets (or deletes) a local key.
    Local { key: Vec<u8>, value: Option<Vec<u8>> },
}

/// Deterministic output of evaluating a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// User keys touched by the batch.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.ops.iter().filter_map(|op| match op {
            WriteOp::Key { key, .. } => Some(key),
            WriteOp::Local { .. } => None,
        })
    }
}

impl GetSize for WriteBatch {
    fn get_heap_size(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                WriteOp::Key { key, history } => {
                    key.len()
                        + history.as_ref().map_or(0, |h| {
                            h.stats(key).val_bytes as usize
                                + h.versions.len() * 12
                        })
                }
                WriteOp::Local { key, value } => {
                    key.len() + value.as_ref().map_or(0, |v| v.len())
                }
            })
            .sum()
    }
}

/// Read access to engine state.
pub trait Reader {
    fn history(&self, key: &[u8]) -> Option<KeyHistory>;

    /// Non-empty histories of keys in `[start, end)`, ascending.
    fn histories(&self, start: &[u8], end: &[u8]) -> Vec<(Key, KeyHistory)>;

    fn local(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Local pairs with keys in `[start, end)`.
    fn local_range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;
}

/// Write access used during evaluation.
pub trait Writer: Reader {
    fn put_history(&mut self, key: Key, history: KeyHistory);

    fn put_local(&mut self, key: Vec<u8>, value: Option<Vec<u8>>);
}

/// Store-wide engine. Cheap to share.
#[derive(Default)]
pub struct Engine {
    data: RwLock<BTreeMap<Key, KeyHistory>>,
    local: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

fn bounds(start: &[u8], end: &[u8]) -> (Bound<Key>, Bound<Key>) {
    (
        Bound::Included(Bytes::copy_from_slice(start)),
        Bound::Excluded(Bytes::copy_from_slice(end)),
    )
}

impl Engine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Applies a write batch; returns the statistics delta.
    pub fn apply(&self, batch: &WriteBatch) -> MvccStats {
        let mut delta = MvccStats::default();
        let mut data = self.data.write_locked();
        let mut local = self.local.write_locked();
        for op in &batch.ops {
            match op {
                WriteOp::Key { key, history } => {
                    if let Some(old) = data.remove(key) {
                        delta.subtract(&old.stats(key));
                    }
                    if let Some(h) = history {
                        if !h.is_empty() {
                            delta.add(&h.stats(key));
                            data.insert(key.clone(), h.clone());
                        }
                    }
                }
                WriteOp::Local { key, value } => match value {
                    Some(v) => {
                        local.insert(key.clone(), v.clone());
                    }
                    None => {
                        local.remove(key);
                    }
                },
            }
        }
        delta
    }

    /// Writes a local key directly, outside of any replicated command.
    pub fn set_local(&self, key: Vec<u8>, value: Option<Vec<u8>>) {
        let mut local = self.local.write_locked();
        match value {
            Some(v) => {
                local.insert(key, v);
            }
            None => {
                local.remove(&key);
            }
        }
    }

    /// Deletes local keys in `[start, end)`.
    pub fn clear_local_range(&self, start: &[u8], end: &[u8]) {
        self.local
            .write_locked()
            .retain(|k, _| !(k.as_slice() >= start && k.as_slice() < end));
    }

    /// Replaces all user data in `[start, end)`.
    pub fn ingest(&self, start: &[u8], end: &[u8], rows: Vec<(Key, KeyHistory)>) {
        let mut data = self.data.write_locked();
        let doomed: Vec<Key> = data.range(bounds(start, end)).map(|(k, _)| k.clone()).collect();
        for k in doomed {
            data.remove(&k);
        }
        for (k, h) in rows {
            data.insert(k, h);
        }
    }

    /// Statistics of the user keys in `[start, end)`.
    pub fn compute_stats(&self, start: &[u8], end: &[u8]) -> MvccStats {
        let mut ms = MvccStats::default();
        for (k, h) in self.data.read_locked().range(bounds(start, end)) {
            ms.add(&h.stats(k));
        }
        ms
    }

    /// Key splitting `[start, end)` into halves of roughly equal size.
    /// Never returns `start` itself; `None` if the span holds fewer than two
    /// keys.
    pub fn median_key(&self, start: &[u8], end: &[u8]) -> Option<Key> {
        let data = self.data.read_locked();
        let sizes: Vec<(Key, i64)> = data
            .range(bounds(start, end))
            .map(|(k, h)| (k.clone(), h.stats(k).total()))
            .collect();
        if sizes.len() < 2 {
            return None;
        }
        let total: i64 = sizes.iter().map(|(_, s)| s).sum();
        let mut acc = 0;
        for (i, (k, s)) in sizes.iter().enumerate() {
            if i > 0 && acc * 2 >= total {
                return Some(k.clone());
            }
            acc += s;
        }
        sizes.last().map(|(k, _)| k.clone())
    }
}

impl Reader for Engine {
    fn history(&self, key: &[u8]) -> Option<KeyHistory> {
        self.data.read_locked().get(key).cloned()
    }

    fn histories(&self, start: &[u8], end: &[u8]) -> Vec<(Key, KeyHistory)> {
        if start >= end {
            return Vec::new();
        }
        self.data
            .read_locked()
            .range(bounds(start, end))
            .map(|(k, h)| (k.clone(), h.clone()))
            .collect()
    }

    fn local(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.local.read_locked().get(key).cloned()
    }

    fn local_range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        if start >= end {
            return Vec::new();
        }
        self.local
            .read_locked()
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Overlay of pending writes on top of the engine, used for evaluation.
pub struct EvalBatch<'a> {
    engine: &'a Engine,
    writes: BTreeMap<Key, KeyHistory>,
    local_writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> EvalBatch<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        EvalBatch {
            engine,
            writes: BTreeMap::new(),
            local_writes: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.local_writes.is_empty()
    }

    pub fn into_write_batch(self) -> WriteBatch {
        let mut ops: Vec<WriteOp> = self
            .writes
            .into_iter()
            .map(|(key, h)| WriteOp::Key {
                key,
                history: if h.is_empty() { None } else { Some(h) },
            })
            .collect();
        ops.extend(
            self.local_writes
                .into_iter()
                .map(|(key, value)| WriteOp::Local { key, value }),
        );
        WriteBatch { ops }
    }
}

impl Reader for EvalBatch<'_> {
    fn history(&self, key: &[u8]) -> Option<KeyHistory> {
        match self.writes.get(key) {
            Some(h) if h.is_empty() => None,
            Some(h) => Some(h.clone()),
            None => self.engine.history(key),
        }
    }

    fn histories(&self, start: &[u8], end: &[u8]) -> Vec<(Key, KeyHistory)> {
        let mut merged: BTreeMap<Key, KeyHistory> =
            self.engine.histories(start, end).into_iter().collect();
        if start < end {
            for (k, h) in self.writes.range(bounds(start, end)) {
                merged.insert(k.clone(), h.clone());
            }
        }
        merged.into_iter().filter(|(_, h)| !h.is_empty()).collect()
    }

    fn local(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.local_writes.get(key) {
            Some(v) => v.clone(),
            None => self.engine.local(key),
        }
    }

    fn local_range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = self
            .engine
            .local_range(start, end)
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect();
        for (k, v) in &self.local_writes {
            if k.as_slice() >= start && k.as_slice() < end {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect()
    }
}

impl Writer for EvalBatch<'_> {
    fn put_history(&mut self, key: Key, history: KeyHistory) {
        self.writes.insert(key, history);
    }

    fn put_local(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) {
        self.local_writes.insert(key, value);
    }
}

/// Options of an MVCC read.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions<'t> {
    pub txn: Option<&'t Transaction>,

    /// Ignore other transactions' intents instead of failing on them.
    pub inconsistent: bool,

    /// Skip keys locked by other transactions.
    pub skip_locked: bool,

    /// Upper bound of the uncertainty interval; empty for none.
    pub uncertainty_limit: Timestamp,
}

impl<'t> ReadOptions<'t> {
    pub fn with_txn(txn: Option<&'t Transaction>) -> Self {
        ReadOptions {
            txn,
            inconsistent: false,
            skip_locked: false,
            uncertainty_limit: Timestamp::default(),
        }
    }
}

enum ReadOutcome {
    Value(Option<Bytes>),
    Skip,
}

fn read_history(
    key: &Key,
    h: &KeyHistory,
    ts: Timestamp,
    opts: &ReadOptions,
) -> Result<ReadOutcome, KvError> {
    if let Some(intent) = &h.intent {
        let own = opts.txn.map_or(false, |t| t.id() == intent.txn.id);
        if own {
            let txn = opts.txn.map(|t| (t.epoch(), t.sequence(), &t.ignored_seq_ranges));
            if let Some((epoch, seq, ignored)) = txn {
                if intent.txn.epoch == epoch {
                    if let Some(v) = intent.value_at(seq, ignored) {
                        return Ok(ReadOutcome::Value(v.value.clone()));
                    }
                }
            }
        } else {
            let limit = if opts.uncertainty_limit > ts {
                opts.uncertainty_limit
            } else {
                ts
            };
            if intent.txn.write_timestamp <= limit {
                if opts.skip_locked {
                    return Ok(ReadOutcome::Skip);
                }
                if !opts.inconsistent {
                    return Err(KvError::new(ErrorDetail::WriteIntent {
                        intents: vec![Intent {
                            key: key.clone(),
                            txn: intent.txn.clone(),
                        }],
                    }));
                }
            }
        }
    }

    if opts.uncertainty_limit > ts {
        if let Some(v) = h
            .versions
            .iter()
            .find(|v| v.ts > ts && v.ts <= opts.uncertainty_limit)
        {
            return Err(KvError::new(
                ErrorDetail::ReadWithinUncertaintyInterval {
                    read_timestamp: ts,
                    existing_timestamp: v.ts,
                    max_timestamp: opts.uncertainty_limit,
                },
            ));
        }
    }
    Ok(ReadOutcome::Value(h.version_at(ts).and_then(|v| v.value.clone())))
}

/// Reads the value of `key` visible at `ts`.
pub fn mvcc_get(
    reader: &impl Reader,
    key: &Key,
    ts: Timestamp,
    opts: &ReadOptions,
) -> Result<Option<Bytes>, KvError> {
    match reader.history(key) {
        None => Ok(None),
        Some(h) => match read_history(key, &h, ts, opts)? {
            ReadOutcome::Value(v) => Ok(v),
            ReadOutcome::Skip => Ok(None),
        },
    }
}

/// Scans `[start, end)` at `ts`, returning at most `max_keys` live rows
/// (`0` for no limit). Conflicting intents of the whole scan are reported
/// together.
pub fn mvcc_scan(
    reader: &impl Reader,
    start: &[u8],
    end: &[u8],
    ts: Timestamp,
    max_keys: usize,
    reverse: bool,
    opts: &ReadOptions,
) -> Result<Vec<KeyValue>, KvError> {
    let mut rows = Vec::new();
    let mut intents = Vec::new();
    let mut histories = reader.histories(start, end);
    if reverse {
        histories.reverse();
    }
    for (key, h) in histories {
        match read_history(&key, &h, ts, opts) {
            Ok(ReadOutcome::Value(Some(value))) => {
                if intents.is_empty() {
                    rows.push(KeyValue { key, value });
                    if max_keys > 0 && rows.len() >= max_keys {
                        break;
                    }
                }
            }
            Ok(_) => {}
            Err(KvError {
                detail: ErrorDetail::WriteIntent { intents: mut found },
                ..
            }) => intents.append(&mut found),
            Err(e) => return Err(e),
        }
    }
    if !intents.is_empty() {
        return Err(KvError::new(ErrorDetail::WriteIntent { intents }));
    }
    Ok(rows)
}

/// Writes `value` (`None` deletes) at `ts`, or at the transaction's write
/// timestamp as an intent. A write below an existing committed version is
/// moved above it; for transactions this sets `write_too_old`, which fails
/// the eventual commit.
///
/// Returns the timestamp the write landed at.
pub fn mvcc_put(
    writer: &mut impl Writer,
    key: &Key,
    value: Option<Bytes>,
    ts: Timestamp,
    txn: Option<&mut Transaction>,
) -> Result<Timestamp, KvError> {
    let mut h = writer.history(key).unwrap_or_default();
    let mut write_ts = match &txn {
        Some(t) => t.write_timestamp(),
        None => ts,
    };

    if let Some(intent) = &h.intent {
        let own = txn.as_ref().map_or(false, |t| t.id() == intent.txn.id);
        if !own {
            return Err(KvError::new(ErrorDetail::WriteIntent {
                intents: vec![Intent {
                    key: key.clone(),
                    txn: intent.txn.clone(),
                }],
            }));
        }
    }

    if let Some(latest) = h.latest() {
        if latest.ts >= write_ts {
            write_ts = latest.ts.next();
        }
    }

    match txn {
        None => {
            h.add_version(Version {
                ts: write_ts,
                value,
            });
        }
        Some(txn) => {
            if write_ts > txn.write_timestamp() {
                txn.meta.write_timestamp = write_ts;
                txn.write_too_old = true;
            }
            let entry = IntentValue {
                seq: txn.sequence(),
                value,
            };
            match h.intent.as_mut() {
                Some(intent) if intent.txn.epoch == txn.epoch() => {
                    // replays of the same sequence overwrite in place
                    intent.history.retain(|v| v.seq != entry.seq);
                    let pos = intent
                        .history
                        .iter()
                        .position(|v| v.seq > entry.seq)
                        .unwrap_or(intent.history.len());
                    intent.history.insert(pos, entry);
                    intent.txn = txn.meta.clone();
                }
                _ => {
                    h.intent = Some(WriteIntent {
                        txn: txn.meta.clone(),
                        history: vec![entry],
                    });
                }
            }
        }
    }
    writer.put_history(key.clone(), h);
    Ok(write_ts)
}

/// Resolves the intent on `key` if it belongs to `update.txn`. Returns
/// true if an intent was resolved.
pub fn mvcc_resolve(writer: &mut impl Writer, key: &Key, update: &LockUpdate) -> bool {
    let mut h = match writer.history(key) {
        Some(h) => h,
        None => return false,
    };
    let intent = match h.intent.take() {
        Some(i) if i.txn.id == update.txn.id => i,
        other => {
            h.intent = other;
            return false;
        }
    };

    match update.status {
        TransactionStatus::Committed => {
            // intents of a prior epoch were never re-written and are void
            if intent.txn.epoch == update.txn.epoch {
                if let Some(v) = intent.value_at(i32::MAX, &update.ignored_seq_ranges) {
                    let mut commit_ts = update.txn.write_timestamp;
                    commit_ts.forward(intent.txn.write_timestamp);
                    h.add_version(Version {
                        ts: commit_ts,
                        value: v.value.clone(),
                    });
                }
            }
        }
        TransactionStatus::Aborted => {}
        TransactionStatus::Pending | TransactionStatus::Staging => {
            let mut intent = intent;
            intent
                .history
                .retain(|v| !is_seq_ignored(v.seq, &update.ignored_seq_ranges));
            if update.txn.epoch == intent.txn.epoch {
                intent.txn.write_timestamp.forward(update.txn.write_timestamp);
            }
            if !intent.history.is_empty() {
                h.intent = Some(intent);
            }
        }
    }
    writer.put_history(key.clone(), h);
    true
}

/// Resolves intents of `update.txn` over its whole span; returns the keys
/// resolved.
pub fn mvcc_resolve_range(writer: &mut impl Writer, update: &LockUpdate) -> Vec<Key> {
    if update.span.is_point() {
        let key = update.span.key.clone();
        return if mvcc_resolve(writer, &key, update) {
            vec![key]
        } else {
            Vec::new()
        };
    }
    let keys: Vec<Key> = writer
        .histories(&update.span.key, &update.span.end_key)
        .into_iter()
        .filter(|(_, h)| {
            h.intent.as_ref().map_or(false, |i| i.txn.id == update.txn.id)
        })
        .map(|(k, _)| k)
        .collect();
    keys.into_iter()
        .filter(|k| mvcc_resolve(writer, k, update))
        .collect()
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::kvpb::Span;

    fn ts(w: i64) -> Timestamp {
        Timestamp::new(w, 0)
    }

    fn key(k: &'static str) -> Key {
        Bytes::from(k)
    }

    fn commit(engine: &Engine, batch: EvalBatch) {
        engine.apply(&batch.into_write_batch());
    }

    #[test]
    fn versions_visible_by_timestamp() -> Result<(), KvError> {
        let engine = Engine::new();
        let mut b = EvalBatch::new(&engine);
        mvcc_put(&mut b, &key("a"), Some(Bytes::from("1")), ts(10), None)?;
        mvcc_put(&mut b, &key("a"), Some(Bytes::from("2")), ts(20), None)?;
        commit(&engine, b);
        let opts = ReadOptions::with_txn(None);
        assert_eq!(mvcc_get(engine.as_ref(), &key("a"), ts(5), &opts)?, None);
        assert_eq!(mvcc_get(engine.as_ref(), &key("a"), ts(15), &opts)?, Some(Bytes::from("1")));
        assert_eq!(mvcc_get(engine.as_ref(), &key("a"), ts(25), &opts)?, Some(Bytes::from("2")));
        Ok(())
    }

    #[test]
    fn txn_write_too_old_is_deferred() -> Result<(), KvError> {
        let engine = Engine::new();
        let mut b = EvalBatch::new(&engine);
        mvcc_put(&mut b, &key("a"), Some(Bytes::from("hi")), ts(20), None)?;
        commit(&engine, b);

        let mut txn = Transaction::new("t", key("a"), 1, ts(10), 0);
        let mut b = EvalBatch::new(&engine);
        let landed = mvcc_put(&mut b, &key("a"), Some(Bytes::from("oops")), ts(10), Some(&mut txn))?;
        assert_eq!(landed, ts(20).next());
        assert!(txn.write_too_old);
        assert_eq!(txn.write_timestamp(), ts(20).next());
        Ok(())
    }

    #[test]
    fn intents_conflict_and_resolve() -> Result<(), KvError> {
        let engine = Engine::new();
        let mut txn = Transaction::new("t", key("a"), 1, ts(10), 0);
        let mut b = EvalBatch::new(&engine);
        mvcc_put(&mut b, &key("a"), Some(Bytes::from("v")), ts(10), Some(&mut txn))?;
        commit(&engine, b);

        // other readers above the intent hit it, readers below don't
        let opts = ReadOptions::with_txn(None);
        let err = mvcc_get(engine.as_ref(), &key("a"), ts(15), &opts).unwrap_err();
        assert!(matches!(err.detail, ErrorDetail::WriteIntent { .. }));
        assert_eq!(mvcc_get(engine.as_ref(), &key("a"), ts(5), &opts)?, None);
        let mut skip = ReadOptions::with_txn(None);
        skip.skip_locked = true;
        assert_eq!(mvcc_get(engine.as_ref(), &key("a"), ts(15), &skip)?, None);

        let mut b = EvalBatch::new(&engine);
        let update = LockUpdate {
            span: Span::point("a"),
            txn: txn.meta.clone(),
            status: TransactionStatus::Committed,
            ignored_seq_ranges: vec![],
        };
        assert_eq!(mvcc_resolve_range(&mut b, &update).len(), 1);
        commit(&engine, b);
        assert_eq!(mvcc_get(engine.as_ref(), &key("a"), ts(15), &opts)?, Some(Bytes::from("v")));
        Ok(())
    }

    #[test]
    fn rolled_back_sequences_are_dropped() -> Result<(), KvError> {
        let engine = Engine::new();
        let mut txn = Transaction::new("t", key("a"), 1, ts(10), 0);
        let mut b = EvalBatch::new(&engine);
        txn.meta.sequence = 1;
        mvcc_put(&mut b, &key("a"), Some(Bytes::from("1")), ts(10), Some(&mut txn))?;
        txn.meta.sequence = 3;
        mvcc_put(&mut b, &key("a"), Some(Bytes::from("3")), ts(10), Some(&mut txn))?;
        txn.meta.sequence = 4;
        mvcc_put(&mut b, &key("c"), Some(Bytes::from("4")), ts(10), Some(&mut txn))?;
        txn.add_ignored_seq_range(IgnoredSeqRange { start: 3, end: 4 });

        // own reads skip the ignored writes
        let opts = ReadOptions::with_txn(Some(&txn));
        assert_eq!(mvcc_get(&b, &key("a"), ts(10), &opts)?, Some(Bytes::from("1")));
        assert_eq!(mvcc_get(&b, &key("c"), ts(10), &opts)?, None);

        let update = LockUpdate {
            span: Span::range("a", "z"),
            txn: txn.meta.clone(),
            status: TransactionStatus::Committed,
            ignored_seq_ranges: txn.ignored_seq_ranges.clone(),
        };
        mvcc_resolve_range(&mut b, &update);
        commit(&engine, b);
        let opts = ReadOptions::with_txn(None);
        assert_eq!(mvcc_get(engine.as_ref(), &key("a"), ts(20), &opts)?, Some(Bytes::from("1")));
        assert_eq!(mvcc_get(engine.as_ref(), &key("c"), ts(20), &opts)?, None);
        Ok(())
    }

    #[test]
    fn uncertainty_interval() -> Result<(), KvError> {
        let engine = Engine::new();
        let mut b = EvalBatch::new(&engine);
        mvcc_put(&mut b, &key("a"), Some(Bytes::from("1")), ts(12), None)?;
        commit(&engine, b);
        let txn = Transaction::new("t", key("a"), 1, ts(10), 5);
        let mut opts = ReadOptions::with_txn(Some(&txn));
        opts.uncertainty_limit = txn.max_timestamp;
        let err = mvcc_get(engine.as_ref(), &key("a"), ts(10), &opts).unwrap_err();
        assert!(matches!(err.detail, ErrorDetail::ReadWithinUncertaintyInterval { .. }));
        Ok(())
    }

    #[test]
    fn stats_and_median() -> Result<(), KvError> {
        let engine = Engine::new();
        let mut b = EvalBatch::new(&engine);
        for k in ["a", "b", "c", "d"] {
            mvcc_put(&mut b, &Bytes::from(k), Some(Bytes::from("xxxx")), ts(1), None)?;
        }
        let delta = engine.apply(&b.into_write_batch());
        assert_eq!(delta.live_count, 4);
        assert_eq!(delta, engine.compute_stats(b"", b"\xff"));
        let mid = engine.median_key(b"", b"\xff").unwrap();
        assert!(mid.as_ref() == b"c" || mid.as_ref() == b"b");
        assert!(engine.median_key(b"a", b"b").is_none());
        Ok(())
    }

    #[test]
    fn scan_limits_and_reverse() -> Result<(), KvError> {
        let engine = Engine::new();
        let mut b = EvalBatch::new(&engine);
        for k in ["a", "b", "c"] {
            mvcc_put(&mut b, &Bytes::from(k), Some(Bytes::from(k)), ts(1), None)?;
        }
        commit(&engine, b);
        let opts = ReadOptions::with_txn(None);
        let rows = mvcc_scan(engine.as_ref(), b"a", b"z", ts(2), 2, false, &opts)?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key.as_ref(), b"a");
        let rows = mvcc_scan(engine.as_ref(), b"a", b"z", ts(2), 0, true, &opts)?;
        assert_eq!(rows[0].key.as_ref(), b"c");
        Ok(())
    }
}
