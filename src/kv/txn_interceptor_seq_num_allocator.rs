//! Sequence numbers of a transaction's requests.
//!
//! Every write (and the final `EndTxn`) gets a fresh sequence number above
//! all earlier ones; reads get the latest write sequence, so they observe
//! every earlier write of the transaction. With stepping enabled, reads
//! instead get the sequence captured by the last `step()`.

use crate::kv::txn_coord_sender::{SavepointToken, TxnCoordMeta, TxnInterceptor};
use crate::kvpb::{BatchRequest, Method, Transaction};
use crate::utils::KvError;

#[derive(Debug, Default)]
pub(super) struct TxnSeqNumAllocator {
    /// Sequence of the latest write.
    pub(super) write_seq: i32,

    /// Sequence reads are served at while stepping.
    pub(super) read_seq: i32,

    pub(super) stepping: bool,
}

impl TxnSeqNumAllocator {
    /// Moves the read snapshot up to the latest write.
    pub(super) fn step(&mut self) -> Result<(), KvError> {
        if !self.stepping {
            return Err(KvError::msg("stepping mode is not enabled"));
        }
        self.read_seq = self.write_seq;
        Ok(())
    }

    /// Turns stepping on or off; returns whether it was on.
    pub(super) fn configure_stepping(&mut self, enabled: bool) -> bool {
        let prev = self.stepping;
        self.stepping = enabled;
        if enabled {
            self.read_seq = self.write_seq;
        }
        prev
    }
}

impl TxnInterceptor for TxnSeqNumAllocator {
    fn prepare(&mut self, txn: &mut Transaction, ba: &mut BatchRequest) -> Result<(), KvError> {
        for req in ba.requests.iter_mut() {
            let method = req.method();
            if method.is_txn_write() || method == Method::EndTxn {
                self.write_seq += 1;
                req.header.sequence = self.write_seq;
            } else if self.stepping {
                req.header.sequence = self.read_seq;
            } else {
                req.header.sequence = self.write_seq;
            }
        }
        txn.meta.sequence = self.write_seq;
        Ok(())
    }

    fn populate_meta(&self, meta: &mut TxnCoordMeta) {
        meta.txn.meta.sequence = self.write_seq;
    }

    fn augment_meta(&mut self, meta: &TxnCoordMeta) {
        self.write_seq = self.write_seq.max(meta.txn.meta.sequence);
    }

    fn epoch_bumped(&mut self) {
        self.write_seq = 0;
        self.read_seq = 0;
    }

    fn create_savepoint(&self, sp: &mut SavepointToken) {
        sp.seq_num = self.write_seq;
    }
}
