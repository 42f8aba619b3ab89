use std::io;
use std::sync::PoisonError;

use crate::encoding::format::{self, Formatter as _};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    ChecksumMismatch,
    MutexPoisoned,
    InvalidData(String),
    InvalidState(String),
    InvalidConfig(String),
    InvalidOperation(String),
    /// Transient storage failure; the operation is retried with identical content.
    StorageUnavailable(String),
    /// Permanent storage failure (capacity exhausted, corrupted tablet, ...).
    StorageFull(String),
    /// A block referenced by the index was not returned by storage.
    BlobMissing(Vec<u8>),
    PartitionFailed,
    OffsetOutOfRange { offset: u64, end_offset: u64 },
    UnknownGroup(String),
    /// The partition task has stopped and no longer accepts requests.
    Closed,
}

impl Error {
    /// Returns true when retrying the same storage request cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::StorageFull(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::StorageUnavailable(msg) => write!(f, "Storage unavailable: {}", msg),
            Error::StorageFull(msg) => write!(f, "Storage failed permanently: {}", msg),
            Error::BlobMissing(key) => {
                write!(f, "Blob missing from storage: {}", format::Partition::key(key))
            }
            Error::PartitionFailed => write!(f, "Partition is in failed state"),
            Error::OffsetOutOfRange { offset, end_offset } => write!(
                f,
                "Offset {} is beyond the end of the partition ({})",
                offset, end_offset
            ),
            Error::UnknownGroup(id) => write!(f, "Unknown message group: {}", id),
            Error::Closed => write!(f, "Partition is closed"),
        }
    }
}

impl std::error::Error for Error {}
