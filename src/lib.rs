pub mod actor;
pub mod config;
pub mod encoding;
pub mod error;
pub mod partition;
pub mod rate_limiter;
pub mod store;

pub use actor::PartitionHandle;
pub use config::{AckPolicy, CompactionConfig, PartitionConfig, QuotaConfig, RetentionConfig};
pub use error::{Error, Result};
pub use partition::{
    GroupOutcome, GroupRegistration, Partition, PartitionState, PartitionStatus, ReadOutcome,
    ReadRequest, Record, RejectReason, WriteOutcome, WriteRequest,
};
pub use rate_limiter::{QuotaGrant, RateLimiter, TokenBucketLimiter};
pub use store::{BlobStore, LogStore, MemoryStore, WriteBatch};
