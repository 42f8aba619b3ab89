//! Formats raw storage keys and values for logs and error messages.

use itertools::Itertools as _;

use super::keycode::PartitionKey;
use super::{Key, Value};
use crate::partition::block::BlockHeader;
use crate::partition::meta::PartitionMeta;
use crate::partition::source_id::PersistedGroup;

/// Formats encoded keys and values.
pub trait Formatter {
    /// Formats a key.
    fn key(key: &[u8]) -> String;

    /// Formats a value. Also takes the key to determine the kind of value.
    fn value(key: &[u8], value: &[u8]) -> String;

    /// Formats a key/value pair.
    fn key_value(key: &[u8], value: &[u8]) -> String {
        format!("{} → {}", Self::key(key), Self::value(key, value))
    }
}

/// Formats raw byte slices without any decoding.
pub struct Raw;

impl Raw {
    /// Formats raw bytes as escaped ASCII strings.
    pub fn bytes(bytes: &[u8]) -> String {
        let escaped = bytes
            .iter()
            .copied()
            .flat_map(std::ascii::escape_default)
            .collect_vec();
        format!("\"{}\"", String::from_utf8_lossy(&escaped))
    }
}

impl Formatter for Raw {
    fn key(key: &[u8]) -> String {
        Self::bytes(key)
    }

    fn value(_key: &[u8], value: &[u8]) -> String {
        Self::bytes(value)
    }
}

/// Formats partition keys and values. Falls back to [`Raw`] for anything
/// that does not decode.
pub struct Partition;

impl Formatter for Partition {
    fn key(key: &[u8]) -> String {
        match PartitionKey::decode(key) {
            Ok(PartitionKey::Data(block)) => block.to_string(),
            Ok(PartitionKey::SourceId {
                partition,
                source_id,
            }) => format!("s{}:{}", partition, Raw::bytes(source_id.as_bytes())),
            Ok(PartitionKey::Meta { partition }) => format!("m{}", partition),
            Err(_) => Raw::key(key),
        }
    }

    fn value(key: &[u8], value: &[u8]) -> String {
        match PartitionKey::decode(key) {
            Ok(PartitionKey::Data(_)) => match BlockHeader::read(value) {
                Ok(header) => format!(
                    "block[{} records, {} parts, {} bytes]",
                    header.records,
                    header.parts,
                    value.len()
                ),
                Err(_) => Raw::bytes(value),
            },
            Ok(PartitionKey::SourceId { .. }) => match PersistedGroup::decode(value) {
                Ok(group) => format!("{:?}", group),
                Err(_) => Raw::bytes(value),
            },
            Ok(PartitionKey::Meta { .. }) => match PartitionMeta::decode(value) {
                Ok(meta) => format!(
                    "start={} head={} levels=[{}]",
                    meta.start_offset,
                    meta.head_offset,
                    meta.levels
                        .iter()
                        .map(|l| format!("{}:{}..{}", l.level, l.first_offset, l.end_offset))
                        .join(", ")
                ),
                Err(_) => Raw::bytes(value),
            },
            Err(_) => Raw::bytes(value),
        }
    }
}
