//! Requests accepted by a partition and the outcomes they are answered with.
//!
//! Duplicates, throttling, empty reads and trimmed reads are ordinary
//! outcomes, not errors.

use std::fmt;
use std::time::Duration;

use super::record::Record;
use super::source_id::{GroupRegistration, SplitRequest};

/// Caller-chosen token identifying a request in replies.
pub type Cookie = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub source_id: String,
    pub seq_no: u64,
    pub parts: Vec<Vec<u8>>,
    /// How long the write may wait for quota before it is rejected. Without
    /// a timeout a throttled write is answered `Throttled` immediately.
    pub timeout: Option<Duration>,
    /// Quota reservation the write consumes instead of the shared window.
    pub reservation: Option<u64>,
    /// Wall-clock write time; defaults to the partition's clock.
    pub write_time_ms: Option<u64>,
}

impl WriteRequest {
    pub fn new(source_id: impl Into<String>, seq_no: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            source_id: source_id.into(),
            seq_no,
            parts: vec![data.into()],
            timeout: None,
            reservation: None,
            write_time_ms: None,
        }
    }

    /// A write made of several payload parts forming one record.
    pub fn with_parts(source_id: impl Into<String>, seq_no: u64, parts: Vec<Vec<u8>>) -> Self {
        Self {
            parts,
            ..Self::new(source_id, seq_no, Vec::new())
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn reservation(mut self, reservation: u64) -> Self {
        self.reservation = Some(reservation);
        self
    }

    pub fn write_time_ms(mut self, write_time_ms: u64) -> Self {
        self.write_time_ms = Some(write_time_ms);
        self
    }

    pub fn size(&self) -> u64 {
        self.parts.iter().map(|p| p.len() as u64).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub offset: u64,
    pub part_no: u16,
    pub max_count: usize,
    pub max_size: usize,
    /// How long a read at the end of the partition waits for new data.
    pub timeout: Option<Duration>,
}

impl ReadRequest {
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            part_no: 0,
            max_count: usize::MAX,
            max_size: usize::MAX,
            timeout: None,
        }
    }

    pub fn part_no(mut self, part_no: u16) -> Self {
        self.part_no = part_no;
        self
    }

    pub fn max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count.max(1);
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Mutating requests, evaluated strictly in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequest {
    Write(WriteRequest),
    RegisterGroup(GroupRegistration),
    DeregisterGroup { source_id: String },
    SplitGroup(SplitRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Unknown producer with a non-initial sequence number
    UnknownProducer,
    /// Sequence number at or below a registered group's start, with no
    /// offset to report as a duplicate
    StaleSequence,
    UnknownGroup,
    PartitionFailed,
    DeadlineExceeded,
    EmptyPayload,
    QueueOverflow,
    InvalidRequest,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RejectReason::UnknownProducer => "unknown producer",
            RejectReason::StaleSequence => "sequence number already used",
            RejectReason::UnknownGroup => "unknown message group",
            RejectReason::PartitionFailed => "partition failed",
            RejectReason::DeadlineExceeded => "deadline exceeded",
            RejectReason::EmptyPayload => "empty payload",
            RejectReason::QueueOverflow => "request queue full",
            RejectReason::InvalidRequest => "invalid request",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted { offset: u64 },
    Duplicate { offset: u64, max_seq_no: u64 },
    Throttled { retry_after: Duration },
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<Record>),
    /// No record at or after the requested offset (yet)
    Empty,
    /// The requested offset was removed by retention
    Trimmed { start_offset: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    Registered,
    Deregistered,
    /// The group still has unflushed writes; it is removed once they are durable
    DeregistrationDeferred,
    Split,
    Rejected(RejectReason),
}

/// Reply produced by the partition for the request identified by a cookie.
#[derive(Debug)]
pub enum Reply {
    Write(WriteOutcome),
    Read(crate::error::Result<ReadOutcome>),
    Group(GroupOutcome),
}
