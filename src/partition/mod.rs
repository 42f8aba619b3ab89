//! A single log partition.
//!
//! Records are appended to the in-memory head, flushed into immutable body
//! blocks through a [`crate::store::BlobStore`], and merged by leveled
//! compaction. [`Partition`] holds all of this as a synchronous state
//! machine; [`crate::actor`] drives it on a tokio task.

pub mod block;
pub mod compaction;
pub mod data_keys;
pub mod head;
pub mod meta;
pub mod metrics;
pub mod quota;
pub mod read;
pub mod record;
pub mod recovery;
pub mod request;
pub mod source_id;
pub mod state;

pub use data_keys::{BlockLevel, DataKey, DataKeyIndex, LevelStats};
pub use metrics::PartitionStatus;
pub use quota::QuotaDecision;
pub use record::Record;
pub use request::{
    Cookie, GroupOutcome, PendingRequest, ReadOutcome, ReadRequest, RejectReason, Reply,
    WriteOutcome, WriteRequest,
};
pub use source_id::{GroupRegistration, KeyRange, SplitRequest, INITIAL_SEQ_NO};
pub use state::{Effect, IoId, Partition, PartitionState};
