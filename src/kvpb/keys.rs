//! Keys, spans, and the layout of the local (unversioned) keyspace.
//!
//! User keys are arbitrary byte strings ordered lexicographically. Range
//! state lives in a separate local keyspace of the engine whose keys are
//! formatted as `<kind>/<id-or-key>`.

use std::fmt;

use crate::kvpb::{RangeId, TxnId};

use bytes::{BufMut, Bytes, BytesMut};

use serde::{Deserialize, Serialize};

/// Versioned user key.
pub type Key = Bytes;

/// End of the system keyspace `[KEY_MIN, SYSTEM_MAX)`. Ranges inside it use
/// expiration-based leases.
pub const SYSTEM_MAX: &[u8] = b"\x04";

/// Upper bound of the whole keyspace.
pub const KEY_MAX: &[u8] = b"\xff\xff";

/// Prefix of scheduled job rows.
pub const SCHEDULED_JOBS_PREFIX: &[u8] = b"\x03jobs/scheduled/";

/// Sequence key handing out scheduled job ids.
pub const SCHEDULED_JOBS_SEQ: &[u8] = b"\x03jobs/seq";

pub fn key_min() -> Key {
    Bytes::new()
}

pub fn key_max() -> Key {
    Bytes::from_static(KEY_MAX)
}

/// Smallest key strictly greater than `key`.
pub fn next_key(key: &[u8]) -> Key {
    let mut buf = BytesMut::with_capacity(key.len() + 1);
    buf.put_slice(key);
    buf.put_u8(0);
    buf.freeze()
}

/// Smallest key greater than every key prefixed by `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Key {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Bytes::from(end);
        }
    }
    key_max()
}

pub fn range_descriptor_key(start_key: &[u8]) -> Vec<u8> {
    let mut k = b"range-descriptor/".to_vec();
    k.extend_from_slice(start_key);
    k
}

pub const RANGE_DESCRIPTOR_PREFIX: &[u8] = b"range-descriptor/";

pub fn range_lease_key(range_id: RangeId) -> Vec<u8> {
    format!("range-lease/{}", range_id).into_bytes()
}

pub fn range_applied_state_key(range_id: RangeId) -> Vec<u8> {
    format!("range-applied-state/{}", range_id).into_bytes()
}

pub fn range_truncated_state_key(range_id: RangeId) -> Vec<u8> {
    format!("range-truncated-state/{}", range_id).into_bytes()
}

pub fn raft_hard_state_key(range_id: RangeId) -> Vec<u8> {
    format!("raft-hard-state/{}", range_id).into_bytes()
}

/// Log entry keys zero-pad the index so byte order equals index order.
pub fn raft_log_key(range_id: RangeId, index: u64) -> Vec<u8> {
    format!("raft-log/{}/{:020}", range_id, index).into_bytes()
}

pub fn raft_log_prefix(range_id: RangeId) -> Vec<u8> {
    format!("raft-log/{}/", range_id).into_bytes()
}

pub fn queue_last_processed_key(queue: &str, start_key: &[u8]) -> Vec<u8> {
    let mut k = format!("queue-last-processed/{}/", queue).into_bytes();
    k.extend_from_slice(start_key);
    k
}

pub const TXN_RECORD_PREFIX: &[u8] = b"txn/";

/// Transaction record key. The anchor is hex-encoded so records sort by
/// anchor key and the id can be split off the tail.
pub fn transaction_key(anchor: &[u8], txn_id: TxnId) -> Vec<u8> {
    let mut k = TXN_RECORD_PREFIX.to_vec();
    k.extend_from_slice(hex_encode(anchor).as_bytes());
    k.push(b'/');
    k.extend_from_slice(txn_id.to_string().as_bytes());
    k
}

/// Bound of the records anchored at or after `anchor`; records anchored in
/// `[a, b)` lie between the bounds of `a` and `b`.
pub fn transaction_key_bound(anchor: &[u8]) -> Vec<u8> {
    let mut k = TXN_RECORD_PREFIX.to_vec();
    k.extend_from_slice(hex_encode(anchor).as_bytes());
    k
}

/// Recovers the anchor key from a transaction record key.
pub fn decode_transaction_key(key: &[u8]) -> Option<Key> {
    let rest = key.strip_prefix(TXN_RECORD_PREFIX)?;
    let slash = rest.iter().rposition(|&b| b == b'/')?;
    hex_decode(&rest[..slash]).map(Bytes::from)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &[u8]) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
        })
        .collect()
}

/// Key span `[key, end_key)`; an empty `end_key` denotes the single key.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub key: Key,
    pub end_key: Key,
}

impl Span {
    pub fn point(key: impl Into<Key>) -> Self {
        Span {
            key: key.into(),
            end_key: Bytes::new(),
        }
    }

    pub fn range(key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Span {
            key: key.into(),
            end_key: end_key.into(),
        }
    }

    #[inline]
    pub fn is_point(&self) -> bool {
        self.end_key.is_empty()
    }

    /// Exclusive end, materialized for point spans.
    pub fn end_exclusive(&self) -> Key {
        if self.is_point() {
            next_key(&self.key)
        } else {
            self.end_key.clone()
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        if self.is_point() {
            self.key.as_ref() == key
        } else {
            self.key.as_ref() <= key && key < self.end_key.as_ref()
        }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        let (a_end, b_end) = (self.end_exclusive(), other.end_exclusive());
        self.key < b_end && other.key < a_end
    }

    /// True if `other` lies entirely inside `self`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.key <= other.key && other.end_exclusive() <= self.end_exclusive()
    }

    /// Intersection with `[start, end)`, if any.
    pub fn intersect(&self, start: &[u8], end: &[u8]) -> Option<Span> {
        let key = if self.key.as_ref() < start {
            Bytes::copy_from_slice(start)
        } else {
            self.key.clone()
        };
        let my_end = self.end_exclusive();
        let end_key = if my_end.as_ref() > end {
            Bytes::copy_from_slice(end)
        } else {
            my_end
        };
        if key >= end_key {
            return None;
        }
        if self.is_point() {
            Some(Span::point(key))
        } else {
            Some(Span::range(key, end_key))
        }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_point() {
            write!(f, "{:?}", self.key)
        } else {
            write!(f, "[{:?}, {:?})", self.key, self.end_key)
        }
    }
}

#[cfg(test)]
mod keys_tests {
    use super::*;

    #[test]
    fn next_and_prefix_end() {
        assert_eq!(next_key(b"a").as_ref(), b"a\x00");
        assert_eq!(prefix_end(b"ab").as_ref(), b"ac");
        assert_eq!(prefix_end(b"a\xff").as_ref(), b"b");
        assert_eq!(prefix_end(b"\xff\xff").as_ref(), KEY_MAX);
    }

    #[test]
    fn span_overlap() {
        let ab = Span::range("a", "b");
        assert!(ab.overlaps(&Span::point("a")));
        assert!(!ab.overlaps(&Span::point("b")));
        assert!(ab.overlaps(&Span::range("a\x00", "z")));
        assert!(ab.contains_span(&Span::range("a1", "a9")));
        assert!(!ab.contains_span(&Span::range("a1", "c")));
        assert!(Span::point("k").contains_key(b"k"));
    }

    #[test]
    fn span_intersect() {
        let s = Span::range("a", "m");
        assert_eq!(s.intersect(b"c", b"z"), Some(Span::range("c", "m")));
        assert_eq!(s.intersect(b"m", b"z"), None);
        assert_eq!(Span::point("b").intersect(b"a", b"c"), Some(Span::point("b")));
    }

    #[test]
    fn txn_key_roundtrip() {
        let id = uuid::Uuid::new_v4();
        let k = transaction_key(b"a/b", id);
        assert_eq!(decode_transaction_key(&k).unwrap().as_ref(), b"a/b");
        assert!(raft_log_key(3, 9) < raft_log_key(3, 10));
    }
}
