//! Order-preserving encoding of the partition key space.
//!
//! Every key starts with a one-byte kind followed by the big-endian partition
//! number, so a range read over `prefix(kind, partition)` returns exactly one
//! namespace of one partition:
//!
//! ```text
//! data:      'd' | partition:u32 | offset:u64 | count:u32 | parts:u32
//! source id: 's' | partition:u32 | source_id bytes
//! meta:      'm' | partition:u32
//! ```
//!
//! Big-endian integers sort numerically, so data keys come back ordered by
//! start offset and, for equal start offsets, narrower blocks first.

use super::{EncodingError, Key};
use crate::error::Result;

const KIND_DATA: u8 = b'd';
const KIND_META: u8 = b'm';
const KIND_SOURCE_ID: u8 = b's';

const PREFIX_LEN: usize = 5;
const DATA_KEY_LEN: usize = PREFIX_LEN + 8 + 4 + 4;

/// Storage key of one persisted body block covering `[offset, offset + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub partition: u32,
    pub offset: u64,
    /// Number of offsets (records) in the block
    pub count: u32,
    /// Number of stored record parts
    pub parts: u32,
}

impl BlockKey {
    pub fn new(partition: u32, offset: u64, count: u32, parts: u32) -> Self {
        Self {
            partition,
            offset,
            count,
            parts,
        }
    }

    /// One past the last offset covered by the block.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.count as u64
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end_offset()
    }

    /// True when `other` lies entirely within this block's range.
    pub fn covers(&self, other: &BlockKey) -> bool {
        other.offset >= self.offset && other.end_offset() <= self.end_offset()
    }
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "d{}:[{}..{})x{}",
            self.partition,
            self.offset,
            self.end_offset(),
            self.parts
        )
    }
}

/// Any key the partition writes through the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionKey {
    Data(BlockKey),
    SourceId { partition: u32, source_id: String },
    Meta { partition: u32 },
}

/// Key prefix of the data namespace of a partition.
pub fn data_prefix(partition: u32) -> Vec<u8> {
    prefix(KIND_DATA, partition)
}

/// Key prefix of the source-id namespace of a partition.
pub fn source_id_prefix(partition: u32) -> Vec<u8> {
    prefix(KIND_SOURCE_ID, partition)
}

/// The single metadata key of a partition.
pub fn meta_key(partition: u32) -> Vec<u8> {
    prefix(KIND_META, partition)
}

fn prefix(kind: u8, partition: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PREFIX_LEN);
    buf.push(kind);
    buf.extend_from_slice(&partition.to_be_bytes());
    buf
}

fn read_u32(bytes: &[u8]) -> Result<u32> {
    let arr: [u8; 4] = bytes.try_into().map_err(|_| EncodingError::Truncated("u32 field"))?;
    Ok(u32::from_be_bytes(arr))
}

fn read_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| EncodingError::Truncated("u64 field"))?;
    Ok(u64::from_be_bytes(arr))
}

impl Key for BlockKey {
    fn encode(&self) -> Vec<u8> {
        let mut buf = prefix(KIND_DATA, self.partition);
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(&self.count.to_be_bytes());
        buf.extend_from_slice(&self.parts.to_be_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        match PartitionKey::decode(bytes)? {
            PartitionKey::Data(key) => Ok(key),
            other => Err(EncodingError::Malformed(format!("not a data key: {:?}", other)).into()),
        }
    }
}

impl Key for PartitionKey {
    fn encode(&self) -> Vec<u8> {
        match self {
            PartitionKey::Data(key) => key.encode(),
            PartitionKey::SourceId {
                partition,
                source_id,
            } => {
                let mut buf = prefix(KIND_SOURCE_ID, *partition);
                buf.extend_from_slice(source_id.as_bytes());
                buf
            }
            PartitionKey::Meta { partition } => meta_key(*partition),
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PREFIX_LEN {
            return Err(EncodingError::Truncated("key prefix").into());
        }
        let partition = read_u32(&bytes[1..PREFIX_LEN])?;
        let rest = &bytes[PREFIX_LEN..];

        match bytes[0] {
            KIND_DATA => {
                if bytes.len() != DATA_KEY_LEN {
                    return Err(EncodingError::Malformed(format!(
                        "data key must be {} bytes, got {}",
                        DATA_KEY_LEN,
                        bytes.len()
                    ))
                    .into());
                }
                Ok(PartitionKey::Data(BlockKey {
                    partition,
                    offset: read_u64(&rest[0..8])?,
                    count: read_u32(&rest[8..12])?,
                    parts: read_u32(&rest[12..16])?,
                }))
            }
            KIND_SOURCE_ID => {
                let source_id = std::str::from_utf8(rest).map_err(|_| EncodingError::SourceIdNotUtf8)?;
                Ok(PartitionKey::SourceId {
                    partition,
                    source_id: source_id.to_string(),
                })
            }
            KIND_META if rest.is_empty() => Ok(PartitionKey::Meta { partition }),
            KIND_META => Err(EncodingError::Malformed("trailing bytes after meta key".into()).into()),
            other => Err(EncodingError::UnknownKind(other).into()),
        }
    }
}
