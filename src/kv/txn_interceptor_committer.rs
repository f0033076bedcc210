//! Lock footprint of a transaction: picks the anchor key, remembers every
//! span the transaction may hold intents on, and hands the footprint to
//! `EndTxn` so the intents get resolved.

use crate::hlc::Timestamp;
use crate::kv::txn_coord_sender::{TxnCoordMeta, TxnInterceptor};
use crate::kvpb::{BatchRequest, RequestArgs, Span, Transaction};
use crate::utils::KvError;

#[derive(Debug, Default)]
pub(super) struct TxnCommitter {
    /// Sorted, coalesced spans of possible intents.
    pub(super) lock_spans: Vec<Span>,

    /// Commit must happen below this timestamp.
    pub(super) deadline: Option<Timestamp>,
}

impl TxnCommitter {
    fn add_lock_span(&mut self, span: Span) {
        self.lock_spans.push(span);
        self.lock_spans = merge_spans(std::mem::take(&mut self.lock_spans));
    }
}

impl TxnInterceptor for TxnCommitter {
    fn prepare(&mut self, txn: &mut Transaction, ba: &mut BatchRequest) -> Result<(), KvError> {
        for req in ba.requests.iter_mut() {
            if req.method().is_locking() {
                if txn.meta.key.is_empty() {
                    txn.meta.key = req.header.key.clone();
                }
                self.add_lock_span(req.span());
                continue;
            }
            if let RequestArgs::EndTxn {
                lock_spans,
                deadline,
                ..
            } = &mut req.args
            {
                if txn.meta.key.is_empty() {
                    return Err(KvError::msg("EndTxn of a transaction without an anchor"));
                }
                req.header.key = txn.meta.key.clone();
                *lock_spans = self.lock_spans.clone();
                if let Some(d) = self.deadline {
                    let earlier = deadline.map_or(d, |cur| if cur < d { cur } else { d });
                    *deadline = Some(earlier);
                }
            }
        }
        Ok(())
    }

    fn populate_meta(&self, meta: &mut TxnCoordMeta) {
        meta.lock_spans = self.lock_spans.clone();
    }

    fn augment_meta(&mut self, meta: &TxnCoordMeta) {
        for span in &meta.lock_spans {
            self.lock_spans.push(span.clone());
        }
        self.lock_spans = merge_spans(std::mem::take(&mut self.lock_spans));
    }

    // intents written at older epochs still need resolving, so the
    // footprint survives epoch bumps
    fn epoch_bumped(&mut self) {}
}

/// Sorts spans and coalesces overlapping or adjacent ones.
pub(super) fn merge_spans(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by(|a, b| a.key.cmp(&b.key));
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.key <= last.end_exclusive() => {
                if span.is_point() && last.is_point() && span.key == last.key {
                    continue;
                }
                let end = span.end_exclusive().max(last.end_exclusive());
                if last.is_point() && end == last.end_exclusive() {
                    continue;
                }
                *last = Span::range(last.key.clone(), end);
            }
            _ => merged.push(span),
        }
    }
    merged
}

#[cfg(test)]
mod txn_interceptor_committer_tests {
    use super::*;
    use crate::kvpb::{Header, Request};
    use bytes::Bytes;

    fn txn() -> Transaction {
        Transaction::new("test", Bytes::new(), 1, Timestamp::new(10, 0), 0)
    }

    #[test]
    fn spans_coalesce() {
        let merged = merge_spans(vec![
            Span::point("c"),
            Span::range("a", "b"),
            Span::point("c"),
            Span::range("b", "bb"),
            Span::point("x"),
        ]);
        assert_eq!(
            merged,
            vec![Span::range("a", "bb"), Span::point("c"), Span::point("x")]
        );
    }

    #[test]
    fn anchor_and_footprint() -> Result<(), KvError> {
        let mut c = TxnCommitter::default();
        let mut t = txn();
        let mut ba = BatchRequest::new(
            Header::default(),
            vec![Request::get("a"), Request::put("k", "v"), Request::delete_range("p", "r")],
        );
        c.prepare(&mut t, &mut ba)?;
        assert_eq!(t.meta.key, Bytes::from("k"));
        assert_eq!(c.lock_spans, vec![Span::point("k"), Span::range("p", "r")]);

        c.deadline = Some(Timestamp::new(100, 0));
        let mut commit = BatchRequest::new(
            Header::default(),
            vec![Request::end_txn(Bytes::new(), true, vec![])],
        );
        c.prepare(&mut t, &mut commit)?;
        let req = &commit.requests[0];
        assert_eq!(req.header.key, Bytes::from("k"));
        match &req.args {
            RequestArgs::EndTxn {
                lock_spans,
                deadline,
                ..
            } => {
                assert_eq!(lock_spans, &c.lock_spans);
                assert_eq!(*deadline, Some(Timestamp::new(100, 0)));
            }
            other => panic!("unexpected args {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn end_txn_needs_anchor() {
        let mut c = TxnCommitter::default();
        let mut ba = BatchRequest::new(
            Header::default(),
            vec![Request::end_txn(Bytes::new(), true, vec![])],
        );
        assert!(c.prepare(&mut txn(), &mut ba).is_err());
    }
}
