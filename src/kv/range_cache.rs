//! Gateway-side cache of range descriptors and their leaseholders, filled
//! from the meta directory on a miss.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::kvpb::{Key, RangeDescriptor, ReplicaDescriptor};
use crate::storage::MetaDirectory;
use crate::utils::{KvError, RwLockExt};

/// Cached routing information of one range.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeCacheEntry {
    pub desc: RangeDescriptor,

    /// Replica last known to hold the lease.
    pub lease_holder: Option<ReplicaDescriptor>,
}

pub struct RangeCache {
    meta: Arc<MetaDirectory>,

    /// Entries keyed by start key; never overlapping.
    entries: RwLock<BTreeMap<Key, RangeCacheEntry>>,
}

impl RangeCache {
    pub fn new(meta: Arc<MetaDirectory>) -> Self {
        RangeCache {
            meta,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Entry of the range containing `key`, or with `reverse` the range
    /// containing the key just before `key`.
    pub fn lookup(&self, key: &[u8], reverse: bool) -> Result<RangeCacheEntry, KvError> {
        if let Some(entry) = self.cached(key, reverse) {
            return Ok(entry);
        }
        let desc = if reverse {
            self.meta.lookup_reverse(key)
        } else {
            self.meta.lookup(key)
        };
        let desc = desc.ok_or_else(|| {
            KvError::msg(format!("no range descriptor for key {:?}", Key::copy_from_slice(key)))
        })?;
        self.insert(desc.clone());
        Ok(RangeCacheEntry {
            desc,
            lease_holder: None,
        })
    }

    fn cached(&self, key: &[u8], reverse: bool) -> Option<RangeCacheEntry> {
        let entries = self.entries.read_locked();
        if reverse {
            entries
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
                .next_back()
                .map(|(_, e)| e)
                .filter(|e| key <= e.desc.end_key.as_ref())
                .cloned()
        } else {
            entries
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
                .next_back()
                .map(|(_, e)| e)
                .filter(|e| e.desc.contains_key(key))
                .cloned()
        }
    }

    /// Installs a descriptor, dropping every entry it overlaps. An entry of
    /// the same range and generation keeps its leaseholder.
    pub fn insert(&self, desc: RangeDescriptor) {
        let mut entries = self.entries.write_locked();
        let overlapping: Vec<Key> = entries
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(desc.end_key.as_ref())))
            .rev()
            .take_while(|(_, e)| e.desc.end_key > desc.start_key)
            .map(|(k, _)| k.clone())
            .collect();
        let mut lease_holder = None;
        for key in overlapping {
            if let Some(old) = entries.remove(&key) {
                if old.desc.range_id == desc.range_id
                    && old.desc.generation == desc.generation
                {
                    lease_holder = old.lease_holder;
                }
            }
        }
        entries.insert(
            desc.start_key.clone(),
            RangeCacheEntry { desc, lease_holder },
        );
    }

    /// Drops the entry of `desc` if the cache still holds that version.
    pub fn evict(&self, desc: &RangeDescriptor) {
        let mut entries = self.entries.write_locked();
        if entries.get(&desc.start_key).map_or(false, |e| e.desc == *desc) {
            entries.remove(&desc.start_key);
        }
    }

    /// Records a leaseholder hint for the cached version of `desc`.
    pub fn update_lease_holder(&self, desc: &RangeDescriptor, holder: ReplicaDescriptor) {
        let mut entries = self.entries.write_locked();
        if let Some(entry) = entries.get_mut(&desc.start_key) {
            if entry.desc.range_id == desc.range_id {
                entry.lease_holder = Some(holder);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read_locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod range_cache_tests {
    use super::*;
    use crate::kvpb::keys::{key_max, key_min};
    use bytes::Bytes;

    fn desc(range_id: u64, start: &'static [u8], end: Key, generation: u64) -> RangeDescriptor {
        RangeDescriptor {
            range_id,
            start_key: Bytes::from_static(start),
            end_key: end,
            replicas: vec![ReplicaDescriptor {
                node_id: 1,
                store_id: 1,
                replica_id: 1,
            }],
            next_replica_id: 2,
            generation,
        }
    }

    fn directory() -> Arc<MetaDirectory> {
        let meta = Arc::new(MetaDirectory::new());
        meta.bootstrap(vec![
            desc(1, b"", Bytes::from_static(b"m"), 0),
            desc(2, b"m", key_max(), 0),
        ])
        .unwrap();
        meta
    }

    #[test]
    fn lookup_fills_on_miss() -> Result<(), KvError> {
        let cache = RangeCache::new(directory());
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(b"c", false)?.desc.range_id, 1);
        assert_eq!(cache.lookup(b"m", false)?.desc.range_id, 2);
        assert_eq!(cache.len(), 2);
        // reverse lookups take the range ending at the key
        assert_eq!(cache.lookup(b"m", true)?.desc.range_id, 1);
        assert_eq!(cache.lookup(b"n", true)?.desc.range_id, 2);
        Ok(())
    }

    #[test]
    fn insert_replaces_overlapping() -> Result<(), KvError> {
        let cache = RangeCache::new(directory());
        cache.lookup(b"a", false)?;
        cache.lookup(b"z", false)?;
        let whole = desc(1, b"", key_max(), 1);
        cache.insert(whole.clone());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(b"z", false)?.desc, whole);
        assert_eq!(key_min(), whole.start_key);
        Ok(())
    }

    #[test]
    fn lease_holder_hints() -> Result<(), KvError> {
        let cache = RangeCache::new(directory());
        let entry = cache.lookup(b"a", false)?;
        assert!(entry.lease_holder.is_none());
        let holder = entry.desc.replicas[0];
        cache.update_lease_holder(&entry.desc, holder);
        assert_eq!(cache.lookup(b"a", false)?.lease_holder, Some(holder));

        // reinserting the same version keeps the hint; eviction drops it
        cache.insert(entry.desc.clone());
        assert_eq!(cache.lookup(b"a", false)?.lease_holder, Some(holder));
        cache.evict(&entry.desc);
        assert!(cache.lookup(b"a", false)?.lease_holder.is_none());
        Ok(())
    }
}
