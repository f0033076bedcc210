//! Loading and saving the persisted state of a range in the engine's local
//! keyspace. Values are MessagePack-encoded.

use crate::kvpb::keys::{
    queue_last_processed_key, raft_hard_state_key, raft_log_key,
    raft_log_prefix, range_applied_state_key, range_descriptor_key,
    range_lease_key, range_truncated_state_key,
};
use crate::hlc::Timestamp;
use crate::kvpb::{Lease, MvccStats, RangeDescriptor, RangeId};
use crate::storage::engine::{Engine, Reader};
use crate::storage::raft::{Entry, HardState};
use crate::utils::KvError;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Applied state of a range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeAppliedState {
    pub applied_index: u64,
    pub lease_applied_index: u64,
    pub stats: MvccStats,
}

/// Log prefix discarded by truncation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedState {
    pub index: u64,
    pub term: u64,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, KvError> {
    Ok(rmp_serde::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, KvError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

fn load<T: DeserializeOwned>(
    reader: &impl Reader,
    key: &[u8],
) -> Result<Option<T>, KvError> {
    reader.local(key).map(|v| decode(&v)).transpose()
}

/// Accessor of one range's persisted state.
#[derive(Debug, Clone, Copy)]
pub struct StateLoader {
    range_id: RangeId,
}

impl StateLoader {
    pub fn new(range_id: RangeId) -> Self {
        StateLoader { range_id }
    }

    pub fn load_descriptor(
        reader: &impl Reader,
        start_key: &[u8],
    ) -> Result<Option<RangeDescriptor>, KvError> {
        load(reader, &range_descriptor_key(start_key))
    }

    pub fn set_descriptor(engine: &Engine, desc: &RangeDescriptor) -> Result<(), KvError> {
        engine.set_local(range_descriptor_key(&desc.start_key), Some(encode(desc)?));
        Ok(())
    }

    pub fn clear_descriptor(engine: &Engine, start_key: &[u8]) {
        engine.set_local(range_descriptor_key(start_key), None);
    }

    pub fn load_lease(&self, reader: &impl Reader) -> Result<Lease, KvError> {
        Ok(load(reader, &range_lease_key(self.range_id))?.unwrap_or_default())
    }

    pub fn set_lease(&self, engine: &Engine, lease: &Lease) -> Result<(), KvError> {
        engine.set_local(range_lease_key(self.range_id), Some(encode(lease)?));
        Ok(())
    }

    pub fn load_applied_state(
        &self,
        reader: &impl Reader,
    ) -> Result<RangeAppliedState, KvError> {
        Ok(load(reader, &range_applied_state_key(self.range_id))?
            .unwrap_or_default())
    }

    pub fn set_applied_state(
        &self,
        engine: &Engine,
        state: &RangeAppliedState,
    ) -> Result<(), KvError> {
        engine.set_local(
            range_applied_state_key(self.range_id),
            Some(encode(state)?),
        );
        Ok(())
    }

    pub fn load_truncated_state(
        &self,
        reader: &impl Reader,
    ) -> Result<TruncatedState, KvError> {
        Ok(load(reader, &range_truncated_state_key(self.range_id))?
            .unwrap_or_default())
    }

    pub fn set_truncated_state(
        &self,
        engine: &Engine,
        state: &TruncatedState,
    ) -> Result<(), KvError> {
        engine.set_local(
            range_truncated_state_key(self.range_id),
            Some(encode(state)?),
        );
        Ok(())
    }

    pub fn load_hard_state(&self, reader: &impl Reader) -> Result<HardState, KvError> {
        Ok(load(reader, &raft_hard_state_key(self.range_id))?.unwrap_or_default())
    }

    pub fn set_hard_state(&self, engine: &Engine, hs: &HardState) -> Result<(), KvError> {
        engine.set_local(raft_hard_state_key(self.range_id), Some(encode(hs)?));
        Ok(())
    }

    /// Persists log entries, overwriting any conflicting suffix.
    pub fn append_entries(&self, engine: &Engine, entries: &[Entry]) -> Result<(), KvError> {
        if let Some(first) = entries.first() {
            let mut end = raft_log_prefix(self.range_id);
            end.push(0xff);
            engine.clear_local_range(&raft_log_key(self.range_id, first.index), &end);
        }
        for e in entries {
            engine.set_local(raft_log_key(self.range_id, e.index), Some(encode(e)?));
        }
        Ok(())
    }

    /// Log entries in `[lo, hi)`.
    pub fn load_entries(
        &self,
        reader: &impl Reader,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<Entry>, KvError> {
        reader
            .local_range(
                &raft_log_key(self.range_id, lo),
                &raft_log_key(self.range_id, hi),
            )
            .into_iter()
            .map(|(_, v)| decode(&v))
            .collect()
    }

    /// Discards log entries up to and including `index`.
    pub fn truncate_log(
        &self,
        engine: &Engine,
        index: u64,
        term: u64,
    ) -> Result<(), KvError> {
        engine.clear_local_range(
            &raft_log_key(self.range_id, 0),
            &raft_log_key(self.range_id, index + 1),
        );
        self.set_truncated_state(engine, &TruncatedState { index, term })
    }

    /// Removes all state of the range, e.g. after it was merged away.
    pub fn destroy(&self, engine: &Engine) {
        let mut end = raft_log_prefix(self.range_id);
        end.push(0xff);
        engine.clear_local_range(&raft_log_prefix(self.range_id), &end);
        for key in [
            range_lease_key(self.range_id),
            range_applied_state_key(self.range_id),
            range_truncated_state_key(self.range_id),
            raft_hard_state_key(self.range_id),
        ] {
            engine.set_local(key, None);
        }
    }
}

pub fn load_queue_last_processed(
    reader: &impl Reader,
    queue: &str,
    start_key: &[u8],
) -> Result<Timestamp, KvError> {
    Ok(load(reader, &queue_last_processed_key(queue, start_key))?.unwrap_or_default())
}

pub fn set_queue_last_processed(
    engine: &Engine,
    queue: &str,
    start_key: &[u8],
    ts: Timestamp,
) -> Result<(), KvError> {
    engine.set_local(queue_last_processed_key(queue, start_key), Some(encode(&ts)?));
    Ok(())
}
