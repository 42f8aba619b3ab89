//! Byte encodings for everything a partition keeps in its blob store.
//!
//! Keys live in three namespaces per partition (data blocks, source id
//! groups and partition meta, see [`keycode`]) and must sort the way range
//! reads expect. Values are opaque to the store and go through [`bincode`].

pub mod bincode;
pub mod format;
pub mod keycode;

use crate::error::Result;

/// A blob store key. Encoded keys compare byte-wise in the same order as the
/// decoded keys, so a prefix read returns data blocks by offset.
pub trait Key {
    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// A blob store value. Order doesn't matter here.
pub trait Value {
    fn encode(&self) -> Result<Vec<u8>>;

    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// Failure to decode (or, for values, encode) a stored entry.
#[derive(Debug)]
pub enum EncodingError {
    /// The bytes don't describe a valid entry.
    Malformed(String),
    /// The key's first byte names no known namespace.
    UnknownKind(u8),
    /// Input ended inside the named field.
    Truncated(&'static str),
    SourceIdNotUtf8,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::Malformed(msg) => write!(f, "Malformed partition entry: {}", msg),
            EncodingError::UnknownKind(kind) => {
                write!(f, "Unknown partition key namespace {:#04x}", kind)
            }
            EncodingError::Truncated(field) => write!(f, "Truncated {}", field),
            EncodingError::SourceIdNotUtf8 => write!(f, "Source id key is not valid UTF-8"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for crate::Error {
    fn from(err: EncodingError) -> Self {
        crate::Error::InvalidData(err.to_string())
    }
}
