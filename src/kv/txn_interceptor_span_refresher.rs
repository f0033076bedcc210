//! Read footprint of a transaction. A transaction that has read nothing
//! may commit at a pushed timestamp; one that has read must restart.

use crate::kv::txn_coord_sender::{TxnCoordMeta, TxnInterceptor};
use crate::kv::txn_interceptor_committer::merge_spans;
use crate::kvpb::{BatchRequest, RequestArgs, Span, Transaction};
use crate::utils::KvError;

#[derive(Debug, Default)]
pub(super) struct TxnSpanRefresher {
    pub(super) refresh_spans: Vec<Span>,
}

impl TxnInterceptor for TxnSpanRefresher {
    fn prepare(&mut self, _txn: &mut Transaction, ba: &mut BatchRequest) -> Result<(), KvError> {
        for req in ba.requests.iter_mut() {
            if req.method().updates_ts_cache() {
                self.refresh_spans.push(req.span());
                continue;
            }
            if let RequestArgs::EndTxn {
                can_commit_at_higher_timestamp,
                ..
            } = &mut req.args
            {
                *can_commit_at_higher_timestamp = self.refresh_spans.is_empty();
            }
        }
        if self.refresh_spans.len() > 64 {
            self.refresh_spans = merge_spans(std::mem::take(&mut self.refresh_spans));
        }
        Ok(())
    }

    fn populate_meta(&self, meta: &mut TxnCoordMeta) {
        meta.refresh_spans = self.refresh_spans.clone();
    }

    fn augment_meta(&mut self, meta: &TxnCoordMeta) {
        self.refresh_spans.extend(meta.refresh_spans.iter().cloned());
    }

    fn epoch_bumped(&mut self) {
        self.refresh_spans.clear();
    }
}
