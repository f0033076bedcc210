//! Closed timestamp messages and their stream framing.
//!
//! Every frame is one protobuf message preceded by its varint length. The
//! server sends `Entry`s, the client sends `Reaction`s.

use std::collections::HashMap;
use std::fmt;

use crate::hlc::Timestamp;
use crate::kvpb::RangeId;
use crate::utils::KvError;

use bytes::{Buf, BytesMut};

use prost::Message;

use serde::{Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this size are treated as stream corruption.
const MAX_FRAME_LEN: usize = 64 << 20;

/// Longest encoding of a varint length delimiter.
const MAX_DELIMITER_LEN: usize = 10;

/// A closed timestamp published by a node for one liveness epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub epoch: i64,
    pub closed_timestamp: Timestamp,

    /// Lease applied index a follower must reach before serving reads at
    /// `closed_timestamp`, per range.
    pub mlai: HashMap<RangeId, u64>,

    /// A complete snapshot for the epoch rather than an increment.
    pub full: bool,
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "entry(epoch={} closed={} full={} mlai=[",
            self.epoch, self.closed_timestamp, self.full
        )?;
        let mut ids: Vec<_> = self.mlai.iter().collect();
        ids.sort_unstable();
        for (i, (range_id, lai)) in ids.into_iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "r{}:{}", range_id, lai)?;
        }
        write!(f, "])")
    }
}

/// Client request to include the given ranges in the next entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub requested: Vec<RangeId>,
}

/// Protobuf forms of the stream messages.
#[derive(Clone, PartialEq, Message)]
pub struct TimestampPb {
    #[prost(int64, tag = "1")]
    wall_time: i64,
    #[prost(int32, tag = "2")]
    logical: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntryPb {
    #[prost(int64, tag = "1")]
    epoch: i64,
    #[prost(message, optional, tag = "2")]
    closed_timestamp: Option<TimestampPb>,
    #[prost(map = "uint64, uint64", tag = "3")]
    mlai: HashMap<u64, u64>,
    #[prost(bool, tag = "4")]
    full: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReactionPb {
    #[prost(uint64, repeated, tag = "1")]
    requested: Vec<u64>,
}

/// A message that travels on the closed timestamp stream.
pub trait WireMessage: Sized {
    type Pb: Message + Default;

    fn to_pb(&self) -> Self::Pb;

    fn from_pb(pb: Self::Pb) -> Self;
}

impl WireMessage for Entry {
    type Pb = EntryPb;

    fn to_pb(&self) -> EntryPb {
        EntryPb {
            epoch: self.epoch,
            closed_timestamp: Some(TimestampPb {
                wall_time: self.closed_timestamp.wall_time,
                logical: self.closed_timestamp.logical,
            }),
            mlai: self.mlai.clone(),
            full: self.full,
        }
    }

    fn from_pb(pb: EntryPb) -> Self {
        let ts = pb.closed_timestamp.unwrap_or_default();
        Entry {
            epoch: pb.epoch,
            closed_timestamp: Timestamp {
                wall_time: ts.wall_time,
                logical: ts.logical,
            },
            mlai: pb.mlai,
            full: pb.full,
        }
    }
}

impl WireMessage for Reaction {
    type Pb = ReactionPb;

    fn to_pb(&self) -> ReactionPb {
        ReactionPb {
            requested: self.requested.clone(),
        }
    }

    fn from_pb(pb: ReactionPb) -> Self {
        Reaction {
            requested: pb.requested,
        }
    }
}

/// Writes one length-delimited frame.
pub async fn write_frame<T, W>(conn: &mut W, msg: &T) -> Result<(), KvError>
where
    T: WireMessage,
    W: AsyncWrite + Unpin,
{
    let frame = msg.to_pb().encode_length_delimited_to_vec();
    conn.write_all(&frame).await?;
    conn.flush().await?;
    Ok(())
}

/// Parses the varint length delimiter at the front of `buf`. Returns
/// `None` while the delimiter is still incomplete.
fn peek_delimiter(buf: &[u8]) -> Result<Option<(usize, usize)>, KvError> {
    let complete = buf
        .iter()
        .take(MAX_DELIMITER_LEN)
        .any(|byte| byte & 0x80 == 0);
    if !complete {
        if buf.len() >= MAX_DELIMITER_LEN {
            return Err(KvError::msg("malformed frame length delimiter"));
        }
        return Ok(None);
    }
    let body_len = prost::decode_length_delimiter(buf)?;
    Ok(Some((prost::length_delimiter_len(body_len), body_len)))
}

/// Reads one length-delimited frame.
///
/// CANCELLATION SAFETY: bytes read before a cancellation stay in `read_buf`
/// and are consumed by the next call, so this may be used as a
/// `tokio::select!` branch.
pub async fn read_frame<T, R>(
    read_buf: &mut BytesMut,
    conn: &mut R,
) -> Result<T, KvError>
where
    T: WireMessage,
    R: AsyncReadExt + Unpin,
{
    let (delim_len, body_len) = loop {
        if let Some(delim) = peek_delimiter(&read_buf[..])? {
            break delim;
        }
        if conn.read_buf(read_buf).await? == 0 {
            return Err(KvError::unavailable("closed timestamp stream closed"));
        }
    };
    if body_len > MAX_FRAME_LEN {
        return Err(KvError::msg(format!("frame of {} bytes too large", body_len)));
    }

    let frame_end = delim_len + body_len;
    if read_buf.capacity() < frame_end {
        read_buf.reserve(frame_end - read_buf.len());
    }
    while read_buf.len() < frame_end {
        if conn.read_buf(read_buf).await? == 0 {
            return Err(KvError::unavailable("closed timestamp stream closed"));
        }
    }
    let pb = <T::Pb as Message>::decode_length_delimited(&read_buf[..frame_end])?;

    // no await past this point; drop the consumed frame
    read_buf.advance(frame_end);
    Ok(T::from_pb(pb))
}

#[cfg(test)]
mod ctpb_tests {
    use super::*;
    use tokio::time::{self, Duration};

    #[tokio::test]
    async fn frames_over_duplex() -> Result<(), KvError> {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let entry = Entry {
            epoch: 3,
            closed_timestamp: Timestamp::new(100, 2),
            mlai: HashMap::from([(1, 42), (7, 9)]),
            full: true,
        };
        write_frame(&mut a, &entry).await?;
        write_frame(&mut a, &Reaction { requested: vec![5, 6] }).await?;

        let mut buf = BytesMut::new();
        let got: Entry = read_frame(&mut buf, &mut b).await?;
        assert_eq!(got, entry);
        let got: Reaction = read_frame(&mut buf, &mut b).await?;
        assert_eq!(got.requested, vec![5, 6]);
        assert!(buf.is_empty());

        drop(a);
        assert!(read_frame::<Entry, _>(&mut buf, &mut b).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn reaction_wire_bytes() -> Result<(), KvError> {
        let mut out = Vec::new();
        write_frame(&mut out, &Reaction { requested: vec![5, 300] }).await?;
        // varint length, then field 1 packed: tag, length, 5, 300
        assert_eq!(out, vec![0x05, 0x0a, 0x03, 0x05, 0xac, 0x02]);
        Ok(())
    }

    #[tokio::test]
    async fn long_frame_delimiter() -> Result<(), KvError> {
        let entry = Entry {
            epoch: 1,
            closed_timestamp: Timestamp::new(7, 0),
            mlai: (1..=100).map(|id| (id, id * 1000)).collect(),
            full: true,
        };
        let mut out = Vec::new();
        write_frame(&mut out, &entry).await?;
        assert!(out[0] & 0x80 != 0);

        let mut buf = BytesMut::new();
        let got: Entry = read_frame(&mut buf, &mut out.as_slice()).await?;
        assert_eq!(got, entry);
        Ok(())
    }

    #[tokio::test]
    async fn truncated_frame() -> Result<(), KvError> {
        let entry = Entry {
            epoch: 2,
            closed_timestamp: Timestamp::new(50, 1),
            mlai: HashMap::from([(4, 8)]),
            full: false,
        };
        let mut frame = Vec::new();
        write_frame(&mut frame, &entry).await?;

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&frame[..frame.len() - 2]).await?;
        let mut buf = BytesMut::new();

        // a pending partial frame survives cancellation
        let res = time::timeout(
            Duration::from_millis(50),
            read_frame::<Entry, _>(&mut buf, &mut b),
        )
        .await;
        assert!(res.is_err());
        a.write_all(&frame[frame.len() - 2..]).await?;
        let got: Entry = read_frame(&mut buf, &mut b).await?;
        assert_eq!(got, entry);

        // the peer hanging up mid-frame is an error
        a.write_all(&frame[..3]).await?;
        drop(a);
        let err = read_frame::<Entry, _>(&mut buf, &mut b).await;
        assert!(err.is_err_and(|e| e.is_unavailable()));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_delimiter() {
        let junk = [0xffu8; 12];
        let mut buf = BytesMut::new();
        let res = read_frame::<Reaction, _>(&mut buf, &mut &junk[..]).await;
        assert!(res.is_err_and(|e| !e.is_unavailable()));
    }

    #[test]
    fn entry_display_sorted() {
        let entry = Entry {
            epoch: 1,
            closed_timestamp: Timestamp::new(5, 0),
            mlai: HashMap::from([(9, 1), (2, 4)]),
            full: false,
        };
        assert!(entry.to_string().ends_with("mlai=[r2:4 r9:1])"));
    }
}
