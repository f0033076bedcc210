//! Command evaluation: declared keys and an evaluator per request method.
//!
//! Evaluation runs on the leaseholder against an `EvalBatch` overlay and
//! never touches the engine directly; its output is a deterministic write
//! batch plus local side effects the proposer handles after apply.

use crate::concurrency::{SpanAccess, SpanScope, SpanSet};
use crate::hlc::Timestamp;
use crate::kvpb::keys::transaction_key;
use crate::kvpb::{
    BatchRequest, BatchResponse, BatchResponseHeader, Key, Lease, LockUpdate,
    Method, MvccStats, PushTxnType, RangeDescriptor, ReadConsistency, Request,
    RequestArgs, Response, Span, Transaction, TransactionStatus, TxnMeta,
    UserPriority, WaitPolicy,
};
use crate::storage::engine::{
    mvcc_get, mvcc_put, mvcc_resolve_range, mvcc_scan, EvalBatch, ReadOptions,
    Reader, Writer,
};
use crate::storage::stateloader::{decode, encode};
use crate::utils::{AbortReason, ErrorDetail, KvError, RetryReason};

use bytes::Bytes;

/// Read-only view of the replica handed to evaluators.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub desc: RangeDescriptor,
    pub lease: Lease,
    pub now: Timestamp,

    /// A transaction record without a heartbeat for this long is
    /// considered abandoned.
    pub txn_liveness_threshold_nanos: i64,

    pub stats: MvccStats,
    pub qps: f64,
}

/// Side effects of a command, handled by the proposer once it applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalResult {
    /// Locks acquired by transactional writes.
    pub acquired_locks: Vec<(Key, TxnMeta)>,

    /// Locks resolved inside this range.
    pub resolved_locks: Vec<LockUpdate>,

    /// Locks of a finalized transaction outside this range, to resolve
    /// asynchronously.
    pub external_locks: Vec<LockUpdate>,

    /// Transaction records updated by this command.
    pub updated_txns: Vec<Transaction>,
}

impl LocalResult {
    fn merge(&mut self, o: LocalResult) {
        self.acquired_locks.extend(o.acquired_locks);
        self.resolved_locks.extend(o.resolved_locks);
        self.external_locks.extend(o.external_locks);
        self.updated_txns.extend(o.updated_txns);
    }
}

/// Declares the latch and lock spans of one request.
pub fn declare_keys(
    desc: &RangeDescriptor,
    ba: &BatchRequest,
    req: &Request,
    latch_spans: &mut SpanSet,
    lock_spans: &mut SpanSet,
) {
    let span = req.span();
    let txn_record = |anchor: &Key, txn: &TxnMeta| {
        Span::point(Bytes::from(transaction_key(anchor, txn.id)))
    };
    match &req.args {
        RequestArgs::Get | RequestArgs::Scan { .. } | RequestArgs::ReverseScan { .. } => {
            latch_spans.add_global(SpanAccess::ReadOnly, span.clone());
            if ba.header.read_consistency == ReadConsistency::Consistent {
                lock_spans.add_global(SpanAccess::ReadOnly, span);
            }
        }
        RequestArgs::Put { .. }
        | RequestArgs::ConditionalPut { .. }
        | RequestArgs::InitPut { .. }
        | RequestArgs::Increment { .. }
        | RequestArgs::Delete
        | RequestArgs::DeleteRange { .. } => {
            latch_spans.add_global(SpanAccess::ReadWrite, span.clone());
            lock_spans.add_global(SpanAccess::ReadWrite, span);
        }
        RequestArgs::BeginTxn | RequestArgs::HeartbeatTxn { .. } => {
            if let Some(txn) = &ba.header.txn {
                latch_spans.add(
                    SpanAccess::ReadWrite,
                    SpanScope::Local,
                    txn_record(&req.header.key, &txn.meta),
                );
            }
        }
        RequestArgs::EndTxn { lock_spans: spans, .. } => {
            if let Some(txn) = &ba.header.txn {
                latch_spans.add(
                    SpanAccess::ReadWrite,
                    SpanScope::Local,
                    txn_record(&req.header.key, &txn.meta),
                );
            }
            for s in spans {
                if let Some(local) = s.intersect(&desc.start_key, &desc.end_key) {
                    latch_spans.add_global(SpanAccess::ReadWrite, local);
                }
            }
        }
        RequestArgs::PushTxn { pushee, .. } => {
            latch_spans.add(
                SpanAccess::ReadWrite,
                SpanScope::Local,
                txn_record(&pushee.key, pushee),
            );
        }
        RequestArgs::QueryTxn { txn } => {
            latch_spans.add(SpanAccess::ReadOnly, SpanScope::Local, txn_record(&txn.key, txn));
        }
        RequestArgs::ResolveIntent { .. } => {
            latch_spans.add_global(SpanAccess::ReadWrite, span);
        }
        RequestArgs::Subsume { right_desc, .. } => {
            latch_spans.add_global(SpanAccess::ReadOnly, right_desc.span());
        }
        RequestArgs::RangeStats
        | RequestArgs::AdminSplit { .. }
        | RequestArgs::AdminMerge { .. }
        | RequestArgs::AdminTransferLease { .. }
        | RequestArgs::AdminChangeReplicas { .. } => {}
    }
}

/// Latch and lock spans of a whole batch.
pub fn collect_spans(desc: &RangeDescriptor, ba: &BatchRequest) -> (SpanSet, SpanSet) {
    let mut latch_spans = SpanSet::new();
    let mut lock_spans = SpanSet::new();
    for req in &ba.requests {
        declare_keys(desc, ba, req, &mut latch_spans, &mut lock_spans);
    }
    (latch_spans, lock_spans)
}

/// Evaluates a batch. On error nothing of the batch is kept; the error
/// carries the index of the failing request and the updated transaction.
pub fn evaluate_batch(
    ec: &EvalContext,
    batch: &mut EvalBatch,
    ba: &BatchRequest,
) -> Result<(BatchResponse, LocalResult), KvError> {
    if ba.requests.is_empty() {
        return logged_err!("eval"; "r{}: empty batch", ec.desc.range_id);
    }
    let mut txn = ba.header.txn.clone();
    let mut responses = Vec::with_capacity(ba.requests.len());
    let mut local = LocalResult::default();

    for (index, req) in ba.requests.iter().enumerate() {
        if let Some(txn) = txn.as_mut() {
            txn.meta.sequence = req.header.sequence;
        }
        match evaluate_request(ec, batch, ba, req, txn.as_mut()) {
            Ok((resp, res)) => {
                responses.push(resp);
                local.merge(res);
            }
            Err(e) => {
                let mut e = e.with_index(index);
                let txn = match e.txn.take() {
                    Some(t) => Some(*t),
                    None => txn,
                };
                return Err(e.with_txn(txn));
            }
        }
    }

    Ok((
        BatchResponse {
            header: BatchResponseHeader {
                txn,
                now: ec.now,
                range_infos: Vec::new(),
            },
            responses,
        },
        local,
    ))
}

fn read_opts<'t>(ba: &BatchRequest, txn: Option<&'t Transaction>) -> ReadOptions<'t> {
    let mut opts = ReadOptions::with_txn(txn);
    opts.inconsistent = ba.header.read_consistency != ReadConsistency::Consistent;
    opts.skip_locked = ba.header.wait_policy == WaitPolicy::SkipLocked;
    if let Some(t) = txn {
        if t.max_timestamp > t.read_timestamp {
            opts.uncertainty_limit = t.max_timestamp;
        }
    }
    opts
}

fn read_ts(ba: &BatchRequest, txn: Option<&Transaction>) -> Timestamp {
    txn.map_or(ba.header.timestamp, |t| t.read_timestamp)
}

/// Latest value of `key` as a writer sees it: committed versions at any
/// timestamp plus the writer's own intent.
fn read_for_write(
    batch: &EvalBatch,
    key: &Key,
    txn: Option<&Transaction>,
) -> Result<Option<Bytes>, KvError> {
    let opts = ReadOptions::with_txn(txn);
    mvcc_get(batch, key, Timestamp::MAX, &opts)
}

fn write(
    batch: &mut EvalBatch,
    ba: &BatchRequest,
    key: &Key,
    value: Option<Bytes>,
    txn: Option<&mut Transaction>,
    local: &mut LocalResult,
) -> Result<(), KvError> {
    match txn {
        Some(txn) => {
            mvcc_put(batch, key, value, ba.header.timestamp, Some(&mut *txn))?;
            local.acquired_locks.push((key.clone(), txn.meta.clone()));
        }
        None => {
            mvcc_put(batch, key, value, ba.header.timestamp, None)?;
        }
    }
    Ok(())
}

fn evaluate_request(
    ec: &EvalContext,
    batch: &mut EvalBatch,
    ba: &BatchRequest,
    req: &Request,
    mut txn: Option<&mut Transaction>,
) -> Result<(Response, LocalResult), KvError> {
    let mut local = LocalResult::default();
    let key = &req.header.key;
    let resp = match &req.args {
        RequestArgs::Get => {
            let t = txn.as_deref();
            let value = mvcc_get(&*batch, key, read_ts(ba, t), &read_opts(ba, t))?;
            Response::Get { value }
        }
        RequestArgs::Scan { max_keys } | RequestArgs::ReverseScan { max_keys } => {
            let t = txn.as_deref();
            let reverse = req.method() == Method::ReverseScan;
            let rows = mvcc_scan(
                &*batch,
                key,
                &req.header.end_key,
                read_ts(ba, t),
                *max_keys,
                reverse,
                &read_opts(ba, t),
            )?;
            if reverse {
                Response::ReverseScan { rows }
            } else {
                Response::Scan { rows }
            }
        }
        RequestArgs::Put { value } => {
            write(batch, ba, key, Some(value.clone()), txn, &mut local)?;
            Response::Put
        }
        RequestArgs::ConditionalPut { value, exp_value } => {
            let actual = read_for_write(batch, key, txn.as_deref())?;
            if actual != *exp_value {
                return Err(KvError::new(ErrorDetail::ConditionFailed {
                    actual_value: actual,
                }));
            }
            write(batch, ba, key, Some(value.clone()), txn, &mut local)?;
            Response::ConditionalPut
        }
        RequestArgs::InitPut {
            value,
            fail_on_tombstones,
        } => {
            let actual = read_for_write(batch, key, txn.as_deref())?;
            let tombstone = actual.is_none()
                && batch
                    .history(key)
                    .and_then(|h| h.latest().map(|v| v.value.is_none()))
                    .unwrap_or(false);
            match actual {
                Some(v) if v != *value => {
                    return Err(KvError::new(ErrorDetail::ConditionFailed {
                        actual_value: Some(v),
                    }));
                }
                None if tombstone && *fail_on_tombstones => {
                    return Err(KvError::new(ErrorDetail::ConditionFailed {
                        actual_value: None,
                    }));
                }
                _ => {}
            }
            write(batch, ba, key, Some(value.clone()), txn, &mut local)?;
            Response::InitPut
        }
        RequestArgs::Increment { increment } => {
            let current = match read_for_write(batch, key, txn.as_deref())? {
                None => 0,
                Some(v) => decode_int(&v)?,
            };
            let new_value = current.checked_add(*increment).ok_or_else(|| {
                KvError::msg(format!("key {:?} with value {} incremented by {} overflows",
                                     key, current, increment))
            })?;
            write(batch, ba, key, Some(encode_int(new_value)), txn, &mut local)?;
            Response::Increment { new_value }
        }
        RequestArgs::Delete => {
            write(batch, ba, key, None, txn, &mut local)?;
            Response::Delete
        }
        RequestArgs::DeleteRange { return_keys } => {
            let t = txn.as_deref();
            let rows = mvcc_scan(
                &*batch,
                key,
                &req.header.end_key,
                Timestamp::MAX,
                0,
                false,
                &ReadOptions::with_txn(t),
            )?;
            let mut keys = Vec::with_capacity(rows.len());
            for row in rows {
                write(batch, ba, &row.key, None, txn.as_deref_mut(), &mut local)?;
                keys.push(row.key);
            }
            Response::DeleteRange {
                keys: if *return_keys { keys } else { Vec::new() },
            }
        }
        RequestArgs::BeginTxn => {
            let txn = require_txn(txn, req)?;
            begin_txn(ec, batch, key, txn)?;
            Response::BeginTxn
        }
        RequestArgs::HeartbeatTxn { now } => {
            let txn = require_txn(txn, req)?;
            heartbeat_txn(batch, key, txn, *now)?;
            Response::HeartbeatTxn
        }
        RequestArgs::EndTxn {
            commit,
            deadline,
            lock_spans,
            can_commit_at_higher_timestamp,
        } => {
            let txn = require_txn(txn, req)?;
            let args = EndTxnArgs {
                commit: *commit,
                deadline: *deadline,
                lock_spans,
                can_commit_at_higher_timestamp: *can_commit_at_higher_timestamp,
            };
            local.merge(end_txn(ec, batch, key, txn, args)?);
            Response::EndTxn
        }
        RequestArgs::PushTxn {
            pusher,
            pushee,
            push_to,
            push_type,
        } => {
            let (pushee, res) =
                push_txn(ec, batch, pusher.as_deref(), pushee, *push_to, *push_type)?;
            local.merge(res);
            Response::PushTxn { pushee }
        }
        RequestArgs::QueryTxn { txn } => Response::QueryTxn {
            txn: load_txn_record(&*batch, &txn.key, txn)?,
        },
        RequestArgs::ResolveIntent {
            intent_txn,
            status,
            ignored_seq_ranges,
        } => {
            let update = LockUpdate {
                span: req.span(),
                txn: intent_txn.clone(),
                status: *status,
                ignored_seq_ranges: ignored_seq_ranges.clone(),
            };
            mvcc_resolve_range(batch, &update);
            local.resolved_locks.push(update);
            Response::ResolveIntent
        }
        RequestArgs::RangeStats => Response::RangeStats {
            stats: ec.stats,
            qps: ec.qps,
        },
        _ => {
            return logged_err!("eval"; "r{}: {:?} is not evaluated as a command",
                                       ec.desc.range_id, req.method());
        }
    };
    Ok((resp, local))
}

fn require_txn<'a>(
    txn: Option<&'a mut Transaction>,
    req: &Request,
) -> Result<&'a mut Transaction, KvError> {
    txn.ok_or_else(|| KvError::msg(format!("{:?} requires a transaction", req.method())))
}

/// Encodes an integer value as stored by `Increment`.
pub fn encode_int(v: i64) -> Bytes {
    Bytes::copy_from_slice(&v.to_be_bytes())
}

pub fn decode_int(v: &[u8]) -> Result<i64, KvError> {
    let arr: [u8; 8] = v
        .try_into()
        .map_err(|_| KvError::msg(format!("value {:?} is not an integer", v)))?;
    Ok(i64::from_be_bytes(arr))
}

fn record_key(anchor: &[u8], txn: &TxnMeta) -> Vec<u8> {
    transaction_key(anchor, txn.id)
}

fn load_txn_record(
    reader: &impl Reader,
    anchor: &[u8],
    txn: &TxnMeta,
) -> Result<Option<Transaction>, KvError> {
    reader
        .local(&record_key(anchor, txn))
        .map(|v| decode(&v))
        .transpose()
}

fn put_txn_record(
    writer: &mut impl Writer,
    anchor: &[u8],
    txn: &Transaction,
) -> Result<(), KvError> {
    writer.put_local(record_key(anchor, &txn.meta), Some(encode(txn)?));
    Ok(())
}

fn begin_txn(
    ec: &EvalContext,
    batch: &mut EvalBatch,
    anchor: &Key,
    txn: &mut Transaction,
) -> Result<(), KvError> {
    if let Some(record) = load_txn_record(&*batch, anchor, &txn.meta)? {
        match record.status {
            TransactionStatus::Aborted => {
                return Err(KvError::new(ErrorDetail::TransactionAborted {
                    reason: AbortReason::AbortedRecordFound,
                }));
            }
            TransactionStatus::Committed => {
                return Err(KvError::new(ErrorDetail::TxnFinalized {
                    status: "COMMITTED".into(),
                }));
            }
            _ => {
                // pushed before it began; inherit the push
                txn.meta.write_timestamp.forward(record.write_timestamp());
            }
        }
    }
    txn.last_heartbeat.forward(ec.now);
    let mut record = txn.clone();
    record.lock_spans.clear();
    put_txn_record(batch, anchor, &record)
}

fn heartbeat_txn(
    batch: &mut EvalBatch,
    anchor: &Key,
    txn: &mut Transaction,
    now: Timestamp,
) -> Result<(), KvError> {
    let mut record = match load_txn_record(&*batch, anchor, &txn.meta)? {
        Some(r) => r,
        None => {
            let mut r = txn.clone();
            r.lock_spans.clear();
            r
        }
    };
    match record.status {
        TransactionStatus::Aborted => {
            return Err(KvError::new(ErrorDetail::TransactionAborted {
                reason: AbortReason::AbandonedByHeartbeat,
            }));
        }
        TransactionStatus::Committed => {}
        _ => {
            record.last_heartbeat.forward(now);
            put_txn_record(batch, anchor, &record)?;
        }
    }
    txn.update(&record);
    Ok(())
}

struct EndTxnArgs<'a> {
    commit: bool,
    deadline: Option<Timestamp>,
    lock_spans: &'a [Span],
    can_commit_at_higher_timestamp: bool,
}

fn end_txn(
    ec: &EvalContext,
    batch: &mut EvalBatch,
    anchor: &Key,
    txn: &mut Transaction,
    args: EndTxnArgs,
) -> Result<LocalResult, KvError> {
    if let Some(record) = load_txn_record(&*batch, anchor, &txn.meta)? {
        match record.status {
            TransactionStatus::Committed => {
                return Err(KvError::new(ErrorDetail::TxnFinalized {
                    status: "COMMITTED".into(),
                }));
            }
            TransactionStatus::Aborted => {
                if args.commit {
                    return Err(KvError::new(ErrorDetail::TransactionAborted {
                        reason: AbortReason::AbortedRecordFound,
                    }));
                }
                // rolling back an aborted txn just cleans up its intents
                txn.status = TransactionStatus::Aborted;
                return finalize(ec, batch, anchor, txn, args.lock_spans);
            }
            TransactionStatus::Pending | TransactionStatus::Staging => {
                if txn.epoch() < record.epoch() {
                    return logged_err!("eval"; "epoch regression: {} < {}",
                                               txn.epoch(), record.epoch());
                }
                // a pusher may have moved the record
                txn.meta.write_timestamp.forward(record.write_timestamp());
                txn.last_heartbeat.forward(record.last_heartbeat);
            }
        }
    }

    if args.commit {
        if txn.write_too_old {
            return Err(KvError::new(ErrorDetail::WriteTooOld {
                timestamp: txn.read_timestamp,
                actual_timestamp: txn.write_timestamp(),
            }));
        }
        if txn.write_timestamp() != txn.read_timestamp {
            if !args.can_commit_at_higher_timestamp {
                return Err(KvError::new(ErrorDetail::TransactionRetry {
                    reason: RetryReason::Serializable,
                    extra: format!(
                        "write timestamp {} above read timestamp {}",
                        txn.write_timestamp(),
                        txn.read_timestamp
                    ),
                }));
            }
            txn.read_timestamp = txn.write_timestamp();
        }
        if let Some(deadline) = args.deadline {
            if txn.write_timestamp() >= deadline {
                return Err(KvError::new(ErrorDetail::TransactionRetry {
                    reason: RetryReason::CommitDeadlineExceeded,
                    extra: format!(
                        "txn timestamp pushed too much; deadline exceeded ({} >= {})",
                        txn.write_timestamp(),
                        deadline
                    ),
                }));
            }
        }
        txn.status = TransactionStatus::Committed;
    } else {
        txn.status = TransactionStatus::Aborted;
    }
    finalize(ec, batch, anchor, txn, args.lock_spans)
}

/// Resolves the finalized transaction's locks inside this range and
/// writes its final record; locks elsewhere are returned.
fn finalize(
    ec: &EvalContext,
    batch: &mut EvalBatch,
    anchor: &Key,
    txn: &mut Transaction,
    lock_spans: &[Span],
) -> Result<LocalResult, KvError> {
    let mut local = LocalResult::default();
    let (start, end) = (&ec.desc.start_key, &ec.desc.end_key);
    let update_for = |span: Span| LockUpdate {
        span,
        txn: txn.meta.clone(),
        status: txn.status,
        ignored_seq_ranges: txn.ignored_seq_ranges.clone(),
    };

    for span in lock_spans {
        if let Some(inside) = span.intersect(start, end) {
            let update = update_for(inside);
            mvcc_resolve_range(batch, &update);
            local.resolved_locks.push(update);
        }
        if span.is_point() {
            if !ec.desc.contains_key(&span.key) {
                local.external_locks.push(update_for(span.clone()));
            }
            continue;
        }
        if span.key < *start {
            let left_end = if span.end_key < *start {
                span.end_key.clone()
            } else {
                start.clone()
            };
            local
                .external_locks
                .push(update_for(Span::range(span.key.clone(), left_end)));
        }
        if span.end_key > *end {
            let right_start = if span.key > *end {
                span.key.clone()
            } else {
                end.clone()
            };
            local
                .external_locks
                .push(update_for(Span::range(right_start, span.end_key.clone())));
        }
    }

    let mut record = txn.clone();
    record.lock_spans = local.external_locks.iter().map(|u| u.span.clone()).collect();
    put_txn_record(batch, anchor, &record)?;
    local.updated_txns.push(record);
    Ok(local)
}

/// Record of a transaction that never wrote one, as seen by a pusher.
fn synthesize_record(pushee: &TxnMeta) -> Transaction {
    let mut txn = Transaction::new("", pushee.key.clone(), pushee.priority, pushee.write_timestamp, 0);
    txn.meta = pushee.clone();
    txn.read_timestamp = pushee.min_timestamp;
    txn.last_heartbeat = pushee.min_timestamp;
    txn
}

fn push_txn(
    ec: &EvalContext,
    batch: &mut EvalBatch,
    pusher: Option<&Transaction>,
    pushee: &TxnMeta,
    push_to: Timestamp,
    push_type: PushTxnType,
) -> Result<(Transaction, LocalResult), KvError> {
    let mut record = match load_txn_record(&*batch, &pushee.key, pushee)? {
        Some(r) => r,
        None => synthesize_record(pushee),
    };
    if pushee.epoch > record.epoch() {
        record.meta.epoch = pushee.epoch;
    }
    record.meta.write_timestamp.forward(pushee.write_timestamp);

    if record.status.is_finalized() {
        return Ok((record, LocalResult::default()));
    }
    if push_type == PushTxnType::PushTimestamp && record.write_timestamp() >= push_to {
        return Ok((record, LocalResult::default()));
    }

    let expired = {
        let mut last_active = record.last_heartbeat;
        last_active.forward(record.meta.min_timestamp);
        last_active.add(ec.txn_liveness_threshold_nanos, 0) < ec.now
    };
    let pusher_wins = if expired {
        true
    } else if push_type == PushTxnType::PushTouch {
        false
    } else if record.commit_timestamp_fixed && push_type == PushTxnType::PushTimestamp {
        false
    } else {
        let pusher_priority = pusher.map_or_else(
            || UserPriority::Normal.make_priority(),
            |p| p.meta.priority,
        );
        pusher_priority > record.meta.priority
    };
    if !pusher_wins {
        return Err(KvError::new(ErrorDetail::TransactionPush {
            pushee: Box::new(record),
        }));
    }

    if expired || push_type == PushTxnType::PushAbort {
        record.status = TransactionStatus::Aborted;
    } else {
        record.meta.write_timestamp.forward(push_to);
    }
    put_txn_record(batch, &pushee.key, &record)?;
    let local = LocalResult {
        updated_txns: vec![record.clone()],
        ..Default::default()
    };
    Ok((record, local))
}

#[cfg(test)]
mod batcheval_tests {
    use super::*;
    use crate::storage::engine::Engine;

    fn ts(w: i64) -> Timestamp {
        Timestamp::new(w, 0)
    }

    fn eval_ctx() -> EvalContext {
        EvalContext {
            desc: RangeDescriptor {
                range_id: 1,
                start_key: Bytes::new(),
                end_key: Bytes::from("m"),
                ..Default::default()
            },
            lease: Lease::default(),
            now: ts(100),
            txn_liveness_threshold_nanos: 50,
            stats: MvccStats::default(),
            qps: 0.0,
        }
    }

    fn run(
        engine: &Engine,
        ec: &EvalContext,
        ba: &BatchRequest,
    ) -> Result<(BatchResponse, LocalResult), KvError> {
        let mut batch = EvalBatch::new(engine);
        let res = evaluate_batch(ec, &mut batch, ba)?;
        engine.apply(&batch.into_write_batch());
        Ok(res)
    }

    fn txn_batch(txn: &Transaction, reqs: Vec<Request>) -> BatchRequest {
        let mut ba = BatchRequest::new(Default::default(), reqs);
        ba.header.txn = Some(txn.clone());
        ba
    }

    fn put(ts_: Timestamp, key: &'static str, value: &'static str) -> BatchRequest {
        let mut ba = BatchRequest::single(Request::put(key, value));
        ba.header.timestamp = ts_;
        ba
    }

    #[test]
    fn empty_batch_rejected() {
        let engine = Engine::new();
        assert!(run(&engine, &eval_ctx(), &BatchRequest::default()).is_err());
    }

    #[test]
    fn conditional_put_and_increment() -> Result<(), KvError> {
        let engine = Engine::new();
        let ec = eval_ctx();
        run(&engine, &ec, &put(ts(10), "a", "x"))?;

        let mut ba = BatchRequest::single(Request::conditional_put("a", "y", None));
        ba.header.timestamp = ts(11);
        let err = run(&engine, &ec, &ba).unwrap_err();
        assert_eq!(
            err.detail,
            ErrorDetail::ConditionFailed {
                actual_value: Some(Bytes::from("x"))
            }
        );
        assert_eq!(err.index, Some(0));

        let mut ba = BatchRequest::single(Request::conditional_put(
            "a",
            "y",
            Some(Bytes::from("x")),
        ));
        ba.header.timestamp = ts(12);
        run(&engine, &ec, &ba)?;

        for expect in [5, 10] {
            let mut ba = BatchRequest::single(Request::increment("c", 5));
            ba.header.timestamp = ts(20 + expect);
            let (resp, _) = run(&engine, &ec, &ba)?;
            assert_eq!(resp.responses[0], Response::Increment { new_value: expect });
        }
        let mut ba = BatchRequest::single(Request::increment("a", 1));
        ba.header.timestamp = ts(40);
        assert!(run(&engine, &ec, &ba).is_err());
        Ok(())
    }

    #[test]
    fn commit_after_write_too_old_fails() -> Result<(), KvError> {
        let engine = Engine::new();
        let ec = eval_ctx();
        let txn = Transaction::new("t1", Bytes::from("a"), 10, ts(5), 0);
        run(&engine, &ec, &put(ts(10), "a", "hi"))?;

        let mut ba = txn_batch(&txn, vec![Request::put("a", "oops!")]);
        ba.requests[0].header.sequence = 1;
        let (resp, local) = run(&engine, &ec, &ba)?;
        let txn = resp.header.txn.unwrap();
        assert!(txn.write_too_old);
        assert!(txn.write_timestamp() > ts(10));
        assert_eq!(local.acquired_locks.len(), 1);

        let ba = txn_batch(
            &txn,
            vec![Request::end_txn(Bytes::from("a"), true, vec![Span::point("a")])],
        );
        let err = run(&engine, &ec, &ba).unwrap_err();
        assert!(matches!(err.detail, ErrorDetail::WriteTooOld { .. }));
        assert!(err.txn.is_some());
        Ok(())
    }

    #[test]
    fn end_txn_resolves_local_and_returns_external() -> Result<(), KvError> {
        let engine = Engine::new();
        let ec = eval_ctx();
        let txn = Transaction::new("t", Bytes::from("a"), 10, ts(5), 0);
        let mut ba = txn_batch(&txn, vec![Request::put("a", "1"), Request::put("b", "2")]);
        ba.requests[0].header.sequence = 1;
        ba.requests[1].header.sequence = 2;
        run(&engine, &ec, &ba)?;

        let spans = vec![Span::point("a"), Span::range("b", "z")];
        let ba = txn_batch(&txn, vec![Request::end_txn(Bytes::from("a"), true, spans)]);
        let (resp, local) = run(&engine, &ec, &ba)?;
        assert_eq!(
            resp.header.txn.map(|t| t.status),
            Some(TransactionStatus::Committed)
        );
        assert_eq!(local.resolved_locks.len(), 2);
        assert_eq!(local.external_locks.len(), 1);
        assert_eq!(local.external_locks[0].span, Span::range("m", "z"));

        let value = mvcc_get(&*engine, &Bytes::from("b"), ts(6), &ReadOptions::with_txn(None))?;
        assert_eq!(value, Some(Bytes::from("2")));

        // a second commit finds the finalized record
        let err = run(&engine, &ec, &ba).unwrap_err();
        assert!(matches!(err.detail, ErrorDetail::TxnFinalized { .. }));
        Ok(())
    }

    #[test]
    fn pushed_record_forces_retry() -> Result<(), KvError> {
        let engine = Engine::new();
        let ec = eval_ctx();
        let pushee = Transaction::new("pushee", Bytes::from("a"), 10, ts(90), 0);
        let pusher = Transaction::new("pusher", Bytes::from("b"), 20, ts(95), 0);
        run(&engine, &ec, &txn_batch(&pushee, vec![Request::begin_txn(Bytes::from("a"))]))?;

        let ba = BatchRequest::single(Request::push_txn(
            Some(pusher),
            pushee.meta.clone(),
            ts(96),
            PushTxnType::PushTimestamp,
        ));
        let (resp, _) = run(&engine, &ec, &ba)?;
        match &resp.responses[0] {
            Response::PushTxn { pushee } => assert_eq!(pushee.write_timestamp(), ts(96)),
            other => panic!("unexpected {:?}", other),
        }

        let ba = txn_batch(&pushee, vec![Request::end_txn(Bytes::from("a"), true, vec![])]);
        let err = run(&engine, &ec, &ba).unwrap_err();
        assert!(matches!(
            err.detail,
            ErrorDetail::TransactionRetry {
                reason: RetryReason::Serializable,
                ..
            }
        ));

        // without reads to refresh, the commit may move up instead
        let mut ba = ba.clone();
        if let RequestArgs::EndTxn {
            can_commit_at_higher_timestamp,
            ..
        } = &mut ba.requests[0].args
        {
            *can_commit_at_higher_timestamp = true;
        }
        let (resp, _) = run(&engine, &ec, &ba)?;
        assert_eq!(resp.header.txn.map(|t| t.write_timestamp()), Some(ts(96)));
        Ok(())
    }

    #[test]
    fn push_rules() -> Result<(), KvError> {
        let engine = Engine::new();
        let mut ec = eval_ctx();
        let pushee = Transaction::new("pushee", Bytes::from("a"), 10, ts(90), 0);
        run(&engine, &ec, &txn_batch(&pushee, vec![Request::begin_txn(Bytes::from("a"))]))?;

        // lower priority loses, touch never wins against a live txn
        let low = Transaction::new("low", Bytes::from("b"), 5, ts(95), 0);
        for push_type in [PushTxnType::PushAbort, PushTxnType::PushTouch] {
            let ba = BatchRequest::single(Request::push_txn(
                Some(low.clone()),
                pushee.meta.clone(),
                ts(96),
                push_type,
            ));
            let err = run(&engine, &ec, &ba).unwrap_err();
            assert!(matches!(err.detail, ErrorDetail::TransactionPush { .. }));
        }

        // an abandoned record is aborted by anyone
        ec.now = ts(1000);
        let ba = BatchRequest::single(Request::push_txn(
            Some(low),
            pushee.meta.clone(),
            ts(96),
            PushTxnType::PushTouch,
        ));
        let (resp, local) = run(&engine, &ec, &ba)?;
        match &resp.responses[0] {
            Response::PushTxn { pushee } => {
                assert_eq!(pushee.status, TransactionStatus::Aborted)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(local.updated_txns.len(), 1);

        // the aborted txn can no longer commit
        let ba = txn_batch(&pushee, vec![Request::end_txn(Bytes::from("a"), true, vec![])]);
        let err = run(&engine, &ec, &ba).unwrap_err();
        assert!(matches!(err.detail, ErrorDetail::TransactionAborted { .. }));
        Ok(())
    }
}
