//! The partition state machine.
//!
//! [`Partition`] is a synchronous, single-owner core: every method takes
//! `&mut self` and the current time, mutates state, and queues [`Effect`]s
//! (storage requests and replies) for the driver to carry out. Completions
//! of storage requests come back through [`Partition::on_write_complete`] and
//! [`Partition::on_read_complete`].
//!
//! # States
//!
//! ```text
//!  Initializing ──recover──▶ Idle ◀──────▶ Flushing
//!                              │              │
//!                              └──permanent───┴──▶ Failed
//! ```
//!
//! - **Initializing**: requests are queued until recovery finished
//! - **Idle**: requests are evaluated immediately; a write batch is started
//!   when the head should be flushed or compaction, retention or group
//!   changes need persisting
//! - **Flushing**: exactly one write batch is in flight; writes keep being
//!   buffered behind it
//! - **Failed**: storage failed permanently; writes are rejected, durable
//!   data can still be read
//!
//! Each write batch atomically carries the new level-0 block, a merged block,
//! deletions of superseded and trimmed blocks, message-group state and the
//! metadata key. A batch that fails transiently is resent unchanged.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::block;
use super::compaction::{Compactor, MergedBlock};
use super::data_keys::DataKeyIndex;
use super::head::HeadBuffer;
use super::meta::{LevelSummary, PartitionMeta};
use super::metrics::PartitionStatus;
use super::quota::{QuotaDecision, WriteQuotaTracker};
use super::read::{self, ReadPlan, Resolution};
use super::record::{part_count, split_parts};
use super::recovery::Recovered;
use super::request::{
    Cookie, GroupOutcome, PendingRequest, ReadOutcome, ReadRequest, RejectReason, Reply,
    WriteOutcome, WriteRequest,
};
use super::source_id::{Admission, Deregistration, PreparedGroups, SourceIdTracker};
use crate::config::{AckPolicy, PartitionConfig};
use crate::encoding::keycode::{self, BlockKey};
use crate::encoding::Key;
use crate::error::{Error, Result};
use crate::store::{Entry, WriteBatch};

/// Identifies a storage request issued by the partition.
pub type IoId = u64;

const MAX_READ_ATTEMPTS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Initializing,
    Idle,
    Flushing,
    Failed,
}

impl PartitionState {
    pub fn name(&self) -> &'static str {
        match self {
            PartitionState::Initializing => "initializing",
            PartitionState::Idle => "idle",
            PartitionState::Flushing => "flushing",
            PartitionState::Failed => "failed",
        }
    }
}

/// Work the driver must carry out on behalf of the partition.
#[derive(Debug)]
pub enum Effect {
    Write { id: IoId, batch: WriteBatch },
    Read { id: IoId, keys: Vec<Vec<u8>> },
    Reply { cookie: Cookie, reply: Reply },
}

#[derive(Debug)]
struct FlushedBlock {
    key: BlockKey,
    size: u64,
    write_time_ms: u64,
}

#[derive(Debug)]
struct PreparedBatch {
    id: IoId,
    number: u64,
    batch: WriteBatch,
    flushed: Option<FlushedBlock>,
    merged: Option<MergedBlock>,
    trimmed: usize,
    start_offset: u64,
    groups: PreparedGroups,
}

#[derive(Debug)]
enum PendingRead {
    Client {
        cookie: Cookie,
        request: ReadRequest,
        plan: ReadPlan,
        attempts: u8,
    },
    Merge,
}

#[derive(Debug)]
struct ParkedRead {
    cookie: Cookie,
    request: ReadRequest,
    deadline: Instant,
}

#[derive(Debug)]
struct QueuedRequest {
    cookie: Cookie,
    request: PendingRequest,
    deadline: Option<Instant>,
}

/// Maps monotonic time onto wall-clock milliseconds.
#[derive(Debug, Clone, Copy)]
struct WallClock {
    anchor: Instant,
    anchor_ms: u64,
}

impl WallClock {
    fn new(now: Instant) -> Self {
        let anchor_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            anchor: now,
            anchor_ms,
        }
    }

    fn millis(&self, now: Instant) -> u64 {
        self.anchor_ms + now.saturating_duration_since(self.anchor).as_millis() as u64
    }

    /// Monotonic time at which the wall clock reads `millis`.
    fn instant_at(&self, millis: u64, now: Instant) -> Instant {
        now + Duration::from_millis(millis.saturating_sub(self.millis(now)))
    }
}

pub struct Partition {
    config: PartitionConfig,
    state: PartitionState,
    start_offset: u64,
    index: DataKeyIndex,
    head: HeadBuffer,
    compactor: Compactor,
    sources: SourceIdTracker,
    quota: WriteQuotaTracker,
    clock: WallClock,

    queue: VecDeque<QueuedRequest>,
    throttled_until: Option<Instant>,
    parked: Vec<ParkedRead>,
    deferred_reads: Vec<(Cookie, ReadRequest, Option<Instant>)>,
    reads: HashMap<IoId, PendingRead>,
    merge_retry_at: Option<Instant>,
    source_expiry_at: Option<Instant>,

    in_flight: Option<PreparedBatch>,
    retry: Option<(PreparedBatch, Instant)>,
    meta_dirty: bool,
    batches_started: u64,
    batches_committed: u64,
    durable_acks: VecDeque<(u64, Cookie)>,
    group_acks: VecDeque<(u64, Cookie, GroupOutcome)>,

    next_io_id: IoId,
    effects: Vec<Effect>,
}

impl Partition {
    /// Creates a partition in the `Initializing` state.
    pub fn new(config: PartitionConfig, now: Instant) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            compactor: Compactor::new(config.partition_id, &config.compaction)?,
            quota: WriteQuotaTracker::new(&config.quota, now),
            clock: WallClock::new(now),
            state: PartitionState::Initializing,
            start_offset: 0,
            index: DataKeyIndex::new(),
            head: HeadBuffer::new(0),
            sources: SourceIdTracker::new(),
            queue: VecDeque::new(),
            throttled_until: None,
            parked: Vec::new(),
            deferred_reads: Vec::new(),
            reads: HashMap::new(),
            merge_retry_at: None,
            source_expiry_at: None,
            in_flight: None,
            retry: None,
            meta_dirty: false,
            batches_started: 0,
            batches_committed: 0,
            durable_acks: VecDeque::new(),
            group_acks: VecDeque::new(),
            next_io_id: 1,
            effects: Vec::new(),
            config,
        })
    }

    /// Installs recovered state and starts serving.
    pub fn recover(&mut self, recovered: Recovered, now: Instant) -> Result<()> {
        if self.state != PartitionState::Initializing {
            return Err(Error::InvalidState(format!(
                "cannot recover a partition in state {}",
                self.state.name()
            )));
        }

        self.start_offset = recovered.start_offset;
        self.index = recovered.index;
        self.head = HeadBuffer::new(recovered.head_offset);
        self.sources = recovered.groups;
        self.compactor.supersede(recovered.obsolete);
        self.state = PartitionState::Idle;
        self.expire_sources(now);

        tracing::info!(
            partition = self.config.partition_id,
            start_offset = self.start_offset,
            head_offset = self.head.head_offset(),
            blocks = self.index.len(),
            queued = self.queue.len(),
            "Partition ready"
        );

        self.process_queue(now);
        for (cookie, request, deadline) in std::mem::take(&mut self.deferred_reads) {
            self.start_read(cookie, request, deadline, 0, now);
        }
        self.promote();
        self.maybe_start_batch(now);
        Ok(())
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn head_offset(&self) -> u64 {
        self.head.head_offset()
    }

    pub fn end_offset(&self) -> u64 {
        self.head.end_offset()
    }

    pub fn index(&self) -> &DataKeyIndex {
        &self.index
    }

    pub fn sources(&self) -> &SourceIdTracker {
        &self.sources
    }

    /// Drains the effects queued since the last call.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Queues a mutating request. Requests are evaluated in arrival order.
    pub fn submit(&mut self, cookie: Cookie, request: PendingRequest, now: Instant) {
        if self.queue.len() >= self.config.max_pending_requests {
            self.reject(cookie, &request, RejectReason::QueueOverflow);
            return;
        }
        let deadline = match &request {
            PendingRequest::Write(write) => write.timeout.map(|t| now + t),
            _ => None,
        };
        self.queue.push_back(QueuedRequest {
            cookie,
            request,
            deadline,
        });
        self.process_queue(now);
        self.maybe_start_batch(now);
    }

    pub fn write(&mut self, cookie: Cookie, request: WriteRequest, now: Instant) {
        self.submit(cookie, PendingRequest::Write(request), now);
    }

    pub fn read(&mut self, cookie: Cookie, request: ReadRequest, now: Instant) {
        let deadline = request.timeout.map(|t| now + t);
        self.start_read(cookie, request, deadline, 0, now);
    }

    /// Highest accepted sequence number of each source id.
    pub fn max_seq_nos(&self, source_ids: &[String]) -> Vec<(String, Option<u64>)> {
        self.sources
            .max_seq_nos(source_ids.iter().map(String::as_str))
    }

    /// First offset holding a record written at or after `timestamp_ms`, or
    /// the end offset if there is none.
    pub fn offset_for_timestamp(&self, timestamp_ms: u64) -> u64 {
        self.index
            .offset_for_timestamp(timestamp_ms)
            .or_else(|| self.head.offset_for_timestamp(timestamp_ms))
            .unwrap_or_else(|| self.end_offset())
            .max(self.start_offset)
    }

    pub fn reserve_bytes(&mut self, reservation: u64, bytes: u64, now: Instant) -> QuotaDecision {
        self.quota.reserve(reservation, bytes, now)
    }

    pub fn release_reservation(&mut self, reservation: u64) -> bool {
        self.quota.release(reservation)
    }

    /// Runs the promotion check now instead of after the next flush.
    pub fn force_compaction(&mut self, now: Instant) {
        if self.state == PartitionState::Idle || self.state == PartitionState::Flushing {
            self.promote();
            self.maybe_start_batch(now);
        }
    }

    pub fn set_level_ceilings(&mut self, ceilings: Vec<u64>) -> Result<()> {
        self.compactor.set_ceilings(ceilings)?;
        self.config.compaction.level_ceilings = self.compactor.ceilings().to_vec();
        Ok(())
    }

    pub fn status(&self) -> PartitionStatus {
        PartitionStatus {
            partition_id: self.config.partition_id,
            state: self.state,
            start_offset: self.start_offset,
            head_offset: self.head.head_offset(),
            end_offset: self.head.end_offset(),
            head_records: self.head.len(),
            head_bytes: self.head.bytes(),
            body_blocks: self.index.len(),
            body_bytes: self.index.total_size(),
            levels: self.index.level_stats(),
            source_ids: self.sources.len(),
            queued_requests: self.queue.len(),
            parked_reads: self.parked.len(),
            pending_reads: self.reads.len(),
            superseded_blocks: self.compactor.superseded().len(),
        }
    }

    /// Earliest time at which [`Partition::on_tick`] has work to do.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let mut wakeups: Vec<Instant> = self.parked.iter().map(|p| p.deadline).collect();
        if let Some(front) = self.queue.front() {
            wakeups.extend(self.throttled_until);
            wakeups.extend(front.deadline);
        }
        match (&self.retry, self.state) {
            (Some((_, at)), PartitionState::Idle) => wakeups.push(*at),
            (None, PartitionState::Idle) => {
                wakeups.extend(self.head.flush_deadline(self.config.flush_max_age))
            }
            _ => {}
        }
        wakeups.extend(self.merge_retry_at);
        wakeups.extend(self.source_expiry_at);
        wakeups.extend(self.quota.next_expiry());
        wakeups.into_iter().min()
    }

    /// Handles timers: read and write deadlines, throttling, flush age and
    /// retries, reservation and message-group expiry, retention.
    pub fn on_tick(&mut self, now: Instant) {
        let (expired, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|p| now >= p.deadline);
        self.parked = waiting;
        for read in expired {
            self.reply(read.cookie, Reply::Read(Ok(ReadOutcome::Empty)));
        }

        self.quota.used(now);
        self.process_queue(now);

        if matches!(self.merge_retry_at, Some(at) if now >= at) {
            self.merge_retry_at = None;
            self.issue_merge_read();
        }
        if matches!(self.source_expiry_at, Some(at) if now >= at) {
            self.expire_sources(now);
        }
        self.maybe_start_batch(now);
    }

    pub fn on_write_complete(&mut self, id: IoId, result: Result<()>, now: Instant) {
        let prepared = match self.in_flight.take() {
            Some(prepared) if prepared.id == id => prepared,
            other => {
                self.in_flight = other;
                tracing::warn!(id, "Completion for unknown write batch");
                return;
            }
        };

        match result {
            Ok(()) => {
                self.commit_batch(prepared);
                self.expire_sources(now);
            }
            Err(e) if e.is_permanent() => {
                self.fail(e);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    partition = self.config.partition_id,
                    batch = prepared.number,
                    error = %e,
                    backoff_ms = self.config.flush_retry_backoff.as_millis() as u64,
                    "Write batch failed, retrying"
                );
                self.state = PartitionState::Idle;
                self.retry = Some((prepared, now + self.config.flush_retry_backoff));
            }
        }
        self.maybe_start_batch(now);
    }

    pub fn on_read_complete(&mut self, id: IoId, result: Result<Vec<Entry>>, now: Instant) {
        match self.reads.remove(&id) {
            None => tracing::warn!(id, "Completion for unknown read"),
            Some(PendingRead::Merge) => {
                let outcome = result.and_then(|blobs| self.compactor.on_sources_read(blobs));
                match outcome {
                    Ok(()) => {}
                    Err(e @ Error::BlobMissing(_))
                    | Err(e @ Error::ChecksumMismatch)
                    | Err(e @ Error::InvalidData(_)) => {
                        tracing::error!(
                            partition = self.config.partition_id,
                            error = %e,
                            "Cannot merge blocks"
                        );
                        self.compactor.abort();
                    }
                    Err(e) => {
                        tracing::warn!(
                            partition = self.config.partition_id,
                            error = %e,
                            "Reading merge sources failed, retrying"
                        );
                        if self.compactor.reading().is_some() {
                            self.merge_retry_at = Some(now + self.config.flush_retry_backoff);
                        }
                    }
                }
            }
            Some(PendingRead::Client {
                cookie,
                request,
                plan,
                attempts,
            }) => {
                self.compactor.unpin(&plan.blocks);
                match result.and_then(|blobs| read::complete(plan, blobs)) {
                    // Blocks were merged or trimmed under the read.
                    Err(Error::BlobMissing(_)) if attempts + 1 < MAX_READ_ATTEMPTS => {
                        let deadline = request.timeout.map(|t| now + t);
                        self.start_read(cookie, request, deadline, attempts + 1, now);
                    }
                    outcome => self.reply(cookie, Reply::Read(outcome)),
                }
            }
        }
        self.maybe_start_batch(now);
    }

    fn next_id(&mut self) -> IoId {
        let id = self.next_io_id;
        self.next_io_id += 1;
        id
    }

    fn reply(&mut self, cookie: Cookie, reply: Reply) {
        self.effects.push(Effect::Reply { cookie, reply });
    }

    fn reject(&mut self, cookie: Cookie, request: &PendingRequest, reason: RejectReason) {
        let reply = match request {
            PendingRequest::Write(_) => Reply::Write(WriteOutcome::Rejected(reason)),
            _ => Reply::Group(GroupOutcome::Rejected(reason)),
        };
        self.reply(cookie, reply);
    }

    fn process_queue(&mut self, now: Instant) {
        if self.state == PartitionState::Initializing {
            return;
        }
        self.throttled_until = None;
        let mut appended = false;

        while let Some(queued) = self.queue.pop_front() {
            if self.state == PartitionState::Failed {
                self.reject(queued.cookie, &queued.request, RejectReason::PartitionFailed);
                continue;
            }
            match queued.request {
                PendingRequest::Write(write) => {
                    match self.admit_write(queued.cookie, write, queued.deadline, now) {
                        Ok(did_append) => appended |= did_append,
                        Err((write, wait_until)) => {
                            self.throttled_until = Some(wait_until);
                            self.queue.push_front(QueuedRequest {
                                cookie: queued.cookie,
                                request: PendingRequest::Write(write),
                                deadline: queued.deadline,
                            });
                            break;
                        }
                    }
                }
                request => {
                    let outcome = self.apply_group(request);
                    self.answer_group(queued.cookie, outcome);
                }
            }
        }

        if appended {
            self.wake_parked(now);
        }
    }

    /// Evaluates one write. Returns whether a record was appended, or hands
    /// the write back with the time it must wait for quota.
    fn admit_write(
        &mut self,
        cookie: Cookie,
        write: WriteRequest,
        deadline: Option<Instant>,
        now: Instant,
    ) -> std::result::Result<bool, (WriteRequest, Instant)> {
        if write.parts.iter().all(Vec::is_empty) {
            self.reply(cookie, Reply::Write(WriteOutcome::Rejected(RejectReason::EmptyPayload)));
            return Ok(false);
        }
        if write.source_id.len() > u16::MAX as usize {
            self.reply(cookie, Reply::Write(WriteOutcome::Rejected(RejectReason::InvalidRequest)));
            return Ok(false);
        }

        match self.sources.admit(&write.source_id, write.seq_no) {
            Admission::Accepted => {}
            Admission::Duplicate { offset, max_seq_no } => {
                self.reply(cookie, Reply::Write(WriteOutcome::Duplicate { offset, max_seq_no }));
                return Ok(false);
            }
            Admission::Rejected(reason) => {
                self.reply(cookie, Reply::Write(WriteOutcome::Rejected(reason)));
                return Ok(false);
            }
        }

        if part_count(&write.parts, self.config.max_part_size) > u16::MAX as usize {
            self.reply(cookie, Reply::Write(WriteOutcome::Rejected(RejectReason::InvalidRequest)));
            return Ok(false);
        }

        let bytes = write.size();
        let decision = match write
            .reservation
            .and_then(|r| self.quota.consume(r, bytes, now))
        {
            Some(decision) => decision,
            None => self.quota.try_admit(bytes, now),
        };
        if let QuotaDecision::Throttled(retry_after) = decision {
            let outcome = match deadline {
                Some(deadline) if now < deadline => {
                    return Err((write, (now + retry_after).min(deadline)));
                }
                Some(_) => WriteOutcome::Rejected(RejectReason::DeadlineExceeded),
                None => WriteOutcome::Throttled { retry_after },
            };
            self.reply(cookie, Reply::Write(outcome));
            return Ok(false);
        }

        let parts = split_parts(write.parts, self.config.max_part_size);
        let now_ms = self.clock.millis(now);
        let write_time_ms = write.write_time_ms.unwrap_or(now_ms);
        let offset = self
            .head
            .append(&write.source_id, write.seq_no, write_time_ms, parts, now);
        self.sources
            .record_write(&write.source_id, write.seq_no, offset, now_ms);

        match self.config.ack_policy {
            AckPolicy::Admitted => {
                self.reply(cookie, Reply::Write(WriteOutcome::Accepted { offset }))
            }
            AckPolicy::Durable => self.durable_acks.push_back((offset, cookie)),
        }
        Ok(true)
    }

    fn apply_group(&mut self, request: PendingRequest) -> GroupOutcome {
        let head_offset = self.head.head_offset();
        let result = match request {
            PendingRequest::RegisterGroup(registration) => {
                tracing::debug!(source_id = %registration.source_id, "Registering message group");
                self.sources.register(registration);
                Ok(GroupOutcome::Registered)
            }
            PendingRequest::DeregisterGroup { source_id } => self
                .sources
                .deregister(&source_id, head_offset)
                .map(|d| match d {
                    Deregistration::Removed => GroupOutcome::Deregistered,
                    Deregistration::Deferred => GroupOutcome::DeregistrationDeferred,
                }),
            PendingRequest::SplitGroup(split) => self
                .sources
                .split(split, head_offset)
                .map(|()| GroupOutcome::Split),
            PendingRequest::Write(_) => Err(Error::InvalidOperation("not a group request".into())),
        };
        match result {
            Ok(outcome) => outcome,
            Err(Error::UnknownGroup(_)) => GroupOutcome::Rejected(RejectReason::UnknownGroup),
            Err(_) => GroupOutcome::Rejected(RejectReason::InvalidRequest),
        }
    }

    fn answer_group(&mut self, cookie: Cookie, outcome: GroupOutcome) {
        match (&outcome, self.config.ack_policy) {
            (GroupOutcome::Rejected(_), _) | (_, AckPolicy::Admitted) => {
                self.reply(cookie, Reply::Group(outcome))
            }
            // Answered once a batch started after this change is durable.
            (_, AckPolicy::Durable) => {
                self.group_acks
                    .push_back((self.batches_started + 1, cookie, outcome))
            }
        }
    }

    fn start_read(
        &mut self,
        cookie: Cookie,
        request: ReadRequest,
        deadline: Option<Instant>,
        attempts: u8,
        now: Instant,
    ) {
        if self.state == PartitionState::Initializing {
            self.deferred_reads.push((cookie, request, deadline));
            return;
        }
        // Only durable records are served once the partition failed.
        let end_offset = match self.state {
            PartitionState::Failed => self.head.head_offset(),
            _ => self.head.end_offset(),
        };

        let resolution = read::resolve(
            &request,
            self.start_offset,
            end_offset,
            &self.index,
            &self.head,
        );
        match resolution {
            Err(e) => self.reply(cookie, Reply::Read(Err(e))),
            Ok(Resolution::Done(outcome)) => self.reply(cookie, Reply::Read(Ok(outcome))),
            Ok(Resolution::Wait) => match deadline {
                Some(deadline) if now < deadline && self.state != PartitionState::Failed => {
                    self.parked.push(ParkedRead {
                        cookie,
                        request,
                        deadline,
                    })
                }
                _ => self.reply(cookie, Reply::Read(Ok(ReadOutcome::Empty))),
            },
            Ok(Resolution::Fetch(plan)) if plan.blocks.is_empty() => {
                self.reply(cookie, Reply::Read(read::complete(plan, Vec::new())))
            }
            Ok(Resolution::Fetch(plan)) => {
                let id = self.next_id();
                let keys = plan.keys();
                self.compactor.pin(&plan.blocks);
                self.reads.insert(
                    id,
                    PendingRead::Client {
                        cookie,
                        request,
                        plan,
                        attempts,
                    },
                );
                self.effects.push(Effect::Read { id, keys });
            }
        }
    }

    /// Re-evaluates parked reads after new records arrived.
    fn wake_parked(&mut self, now: Instant) {
        for parked in std::mem::take(&mut self.parked) {
            if now >= parked.deadline {
                self.reply(parked.cookie, Reply::Read(Ok(ReadOutcome::Empty)));
                continue;
            }
            self.start_read(parked.cookie, parked.request, Some(parked.deadline), 0, now);
        }
    }

    fn promote(&mut self) {
        match self.compactor.maybe_promote(&mut self.index) {
            Ok(promotion) => {
                self.meta_dirty |= promotion.relabelled;
                if promotion.job.is_some() {
                    self.issue_merge_read();
                }
            }
            Err(e) => tracing::error!(
                partition = self.config.partition_id,
                error = %e,
                "Promotion check failed"
            ),
        }
    }

    fn issue_merge_read(&mut self) {
        let keys = match self.compactor.reading() {
            Some(job) => job.keys(),
            None => return,
        };
        let id = self.next_id();
        self.reads.insert(id, PendingRead::Merge);
        self.effects.push(Effect::Read { id, keys });
    }

    /// Number of oldest blocks retention removes now.
    fn retention_trim(&self, now: Instant) -> usize {
        if !self.compactor.is_idle() {
            return 0;
        }
        let retention = &self.config.retention;
        let by_size = retention
            .max_bytes
            .map_or(0, |max| self.index.excess_by_size(max));
        let by_age = retention.max_age.map_or(0, |age| {
            let cutoff = self.clock.millis(now).saturating_sub(age.as_millis() as u64);
            self.index.expired_by_age(cutoff)
        });
        self.index
            .iter()
            .take(by_size.max(by_age))
            .take_while(|k| !self.compactor.is_pinned(&k.key))
            .count()
    }

    fn batch_needed(&self, now: Instant) -> bool {
        self.head
            .should_flush(now, self.config.flush_size_threshold, self.config.flush_max_age)
            || self.compactor.has_ready()
            || self.compactor.has_deletable()
            || self.sources.has_changes()
            || self.meta_dirty
            || self.retention_trim(now) > 0
    }

    fn maybe_start_batch(&mut self, now: Instant) {
        if self.state != PartitionState::Idle {
            return;
        }
        if let Some((_, at)) = &self.retry {
            if now < *at {
                return;
            }
            if let Some((prepared, _)) = self.retry.take() {
                tracing::debug!(batch = prepared.number, "Resending write batch");
                self.emit_batch(prepared);
            }
            return;
        }
        if !self.batch_needed(now) {
            return;
        }
        match self.prepare_batch(now) {
            Ok(prepared) => self.emit_batch(prepared),
            Err(e) => self.fail(e),
        }
    }

    fn prepare_batch(&mut self, now: Instant) -> Result<PreparedBatch> {
        let partition = self.config.partition_id;
        let mut batch = WriteBatch::new();

        // Retention only runs while no merge is in progress.
        let trimmed = self.retention_trim(now);

        let snapshot = if self.head.should_flush(
            now,
            self.config.flush_size_threshold,
            self.config.flush_max_age,
        ) {
            self.head.snapshot()
        } else {
            None
        };

        let mut flushed = None;
        if let Some(snapshot) = &snapshot {
            let blob = block::encode(&snapshot.parts)?;
            let header = block::BlockHeader::read(&blob)?;
            let key = BlockKey::new(
                partition,
                snapshot.from,
                (snapshot.to - snapshot.from) as u32,
                header.parts,
            );
            flushed = Some(FlushedBlock {
                key,
                size: blob.len() as u64,
                write_time_ms: header.max_write_time_ms,
            });
            batch.put(key.encode(), blob);
        }

        let groups = self
            .sources
            .prepare(snapshot.as_ref().map_or(&[][..], |s| &s.parts[..]));
        groups.write_into(partition, &mut batch)?;

        let mut merged = self.compactor.take_ready();
        if let Some(merged) = merged.as_mut() {
            batch.put(merged.key.key.encode(), std::mem::take(&mut merged.blob));
        }

        for key in self.compactor.take_deletable() {
            batch.delete(key.encode());
        }
        let mut start_offset = self.start_offset;
        for key in self.index.iter().take(trimmed) {
            batch.delete(key.key.encode());
            start_offset = key.key.end_offset();
        }

        // Metadata describes the partition as it will be once the batch lands.
        let mut preview = self.index.clone();
        if let Some(merged) = &merged {
            preview.replace(&merged.sources, merged.key.clone());
        }
        preview.trim_front(trimmed);
        if let Some(flushed) = &flushed {
            preview.push(flushed.key, flushed.size, flushed.write_time_ms)?;
        }
        let head_offset = snapshot.as_ref().map_or(self.head.head_offset(), |s| s.to);
        let meta = PartitionMeta {
            start_offset,
            head_offset,
            end_offset: head_offset,
            levels: preview.level_stats().iter().map(LevelSummary::from).collect(),
        };
        batch.put(keycode::meta_key(partition), meta.encode()?);
        self.meta_dirty = false;

        self.batches_started += 1;
        Ok(PreparedBatch {
            id: 0,
            number: self.batches_started,
            batch,
            flushed,
            merged,
            trimmed,
            start_offset,
            groups,
        })
    }

    fn emit_batch(&mut self, mut prepared: PreparedBatch) {
        prepared.id = self.next_id();
        tracing::debug!(
            partition = self.config.partition_id,
            batch = prepared.number,
            puts = prepared.batch.puts.len(),
            deletes = prepared.batch.deletes.len(),
            bytes = prepared.batch.size(),
            "Writing batch"
        );
        self.effects.push(Effect::Write {
            id: prepared.id,
            batch: prepared.batch.clone(),
        });
        self.in_flight = Some(prepared);
        self.state = PartitionState::Flushing;
    }

    fn commit_batch(&mut self, prepared: PreparedBatch) {
        if let Some(merged) = prepared.merged {
            self.compactor.commit(merged, &mut self.index);
        }
        if prepared.trimmed > 0 {
            let removed = self.index.trim_front(prepared.trimmed);
            tracing::info!(
                partition = self.config.partition_id,
                blocks = removed.len(),
                start_offset = prepared.start_offset,
                "Trimmed body blocks"
            );
            self.start_offset = prepared.start_offset;
        }
        if let Some(flushed) = prepared.flushed {
            if let Err(e) = self
                .index
                .push(flushed.key, flushed.size, flushed.write_time_ms)
            {
                self.fail(e);
                return;
            }
            self.head.commit(flushed.key.end_offset());
            tracing::debug!(
                partition = self.config.partition_id,
                block = %flushed.key,
                head_offset = self.head.head_offset(),
                "Flushed head"
            );
        }
        self.sources.commit(&prepared.groups);
        self.batches_committed = prepared.number;
        self.state = PartitionState::Idle;

        let head_offset = self.head.head_offset();
        while let Some((offset, cookie)) = self.durable_acks.front().copied() {
            if offset >= head_offset {
                break;
            }
            self.durable_acks.pop_front();
            self.reply(cookie, Reply::Write(WriteOutcome::Accepted { offset }));
        }
        while matches!(self.group_acks.front(), Some((n, _, _)) if *n <= self.batches_committed) {
            if let Some((_, cookie, outcome)) = self.group_acks.pop_front() {
                self.reply(cookie, Reply::Group(outcome));
            }
        }

        for source_id in self.sources.finalize_deregistrations(head_offset) {
            tracing::debug!(source_id = %source_id, "Message group deregistered");
        }
        self.promote();
    }

    /// Drops expired message groups and schedules the next expiry check.
    fn expire_sources(&mut self, now: Instant) {
        if !matches!(self.state, PartitionState::Idle | PartitionState::Flushing) {
            self.source_expiry_at = None;
            return;
        }
        let now_ms = self.clock.millis(now);
        let head_offset = self.head.head_offset();
        let retention = &self.config.retention;
        let expired = self.sources.expire(retention, now_ms, head_offset);
        if !expired.is_empty() {
            tracing::debug!(
                partition = self.config.partition_id,
                groups = expired.len(),
                remaining = self.sources.len(),
                "Expired message groups"
            );
        }
        self.source_expiry_at = self
            .sources
            .next_expiry_ms(retention, head_offset)
            .map(|millis| self.clock.instant_at(millis, now));
    }

    fn fail(&mut self, error: Error) {
        tracing::error!(
            partition = self.config.partition_id,
            error = %error,
            head_offset = self.head.head_offset(),
            end_offset = self.head.end_offset(),
            "Partition failed permanently"
        );
        self.state = PartitionState::Failed;
        self.in_flight = None;
        self.retry = None;
        self.source_expiry_at = None;
        self.head.abort_flush();
        self.compactor.abort();

        for (_, cookie) in std::mem::take(&mut self.durable_acks) {
            self.reply(cookie, Reply::Write(WriteOutcome::Rejected(RejectReason::PartitionFailed)));
        }
        for (_, cookie, _) in std::mem::take(&mut self.group_acks) {
            self.reply(cookie, Reply::Group(GroupOutcome::Rejected(RejectReason::PartitionFailed)));
        }
        for queued in std::mem::take(&mut self.queue) {
            self.reject(queued.cookie, &queued.request, RejectReason::PartitionFailed);
        }
        for parked in std::mem::take(&mut self.parked) {
            self.reply(parked.cookie, Reply::Read(Ok(ReadOutcome::Empty)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompactionConfig, QuotaConfig, RetentionConfig};
    use crate::encoding::keycode::data_prefix;
    use crate::partition::data_keys::BlockLevel;
    use crate::partition::recovery::{self, Snapshot};
    use crate::partition::source_id::GroupRegistration;
    use crate::store::memory::{Fault, MemoryStore};
    use crate::store::BlobStore;
    use std::sync::Arc;
    use std::time::Duration;

    /// Runs a partition against a store, carrying out effects synchronously.
    struct Harness {
        partition: Partition,
        store: Arc<MemoryStore>,
        now: Instant,
        replies: HashMap<Cookie, Reply>,
        next_cookie: Cookie,
        writes: Vec<WriteBatch>,
    }

    impl Harness {
        async fn open(config: PartitionConfig, store: Arc<MemoryStore>) -> Result<Self> {
            let now = Instant::now();
            let mut partition = Partition::new(config, now)?;
            let snapshot = recovery::load(store.as_ref(), partition.config().partition_id).await?;
            let recovered = recovery::rebuild(partition.config(), snapshot)?;
            partition.recover(recovered, now)?;
            let mut harness = Self {
                partition,
                store,
                now,
                replies: HashMap::new(),
                next_cookie: 1,
                writes: Vec::new(),
            };
            harness.run().await;
            Ok(harness)
        }

        async fn run(&mut self) {
            loop {
                let effects = self.partition.take_effects();
                if effects.is_empty() {
                    return;
                }
                for effect in effects {
                    match effect {
                        Effect::Write { id, batch } => {
                            self.writes.push(batch.clone());
                            let result = self.store.write(batch).await;
                            self.partition.on_write_complete(id, result, self.now);
                        }
                        Effect::Read { id, keys } => {
                            let result = self.store.read(keys).await;
                            self.partition.on_read_complete(id, result, self.now);
                        }
                        Effect::Reply { cookie, reply } => {
                            self.replies.insert(cookie, reply);
                        }
                    }
                }
            }
        }

        async fn advance(&mut self, by: Duration) {
            self.now += by;
            self.partition.on_tick(self.now);
            self.run().await;
        }

        fn cookie(&mut self) -> Cookie {
            self.next_cookie += 1;
            self.next_cookie
        }

        async fn submit_write(&mut self, request: WriteRequest) -> Cookie {
            let cookie = self.cookie();
            self.partition.write(cookie, request, self.now);
            self.run().await;
            cookie
        }

        async fn write(&mut self, source_id: &str, seq_no: u64, data: &str) -> Option<WriteOutcome> {
            let cookie = self
                .submit_write(WriteRequest::new(source_id, seq_no, data))
                .await;
            self.write_reply(cookie)
        }

        fn write_reply(&mut self, cookie: Cookie) -> Option<WriteOutcome> {
            match self.replies.remove(&cookie)? {
                Reply::Write(outcome) => Some(outcome),
                other => panic!("expected a write reply, got {:?}", other),
            }
        }

        async fn submit_read(&mut self, request: ReadRequest) -> Cookie {
            let cookie = self.cookie();
            self.partition.read(cookie, request, self.now);
            self.run().await;
            cookie
        }

        fn read_reply(&mut self, cookie: Cookie) -> Option<Result<ReadOutcome>> {
            match self.replies.remove(&cookie)? {
                Reply::Read(outcome) => Some(outcome),
                other => panic!("expected a read reply, got {:?}", other),
            }
        }

        async fn read_all(&mut self, offset: u64) -> Vec<String> {
            let cookie = self.submit_read(ReadRequest::new(offset)).await;
            match self.read_reply(cookie) {
                Some(Ok(ReadOutcome::Data(records))) => records
                    .into_iter()
                    .map(|r| String::from_utf8(r.data).unwrap())
                    .collect(),
                other => panic!("expected data, got {:?}", other),
            }
        }

        async fn group(&mut self, request: PendingRequest) -> Option<GroupOutcome> {
            let cookie = self.cookie();
            self.partition.submit(cookie, request, self.now);
            self.run().await;
            match self.replies.remove(&cookie)? {
                Reply::Group(outcome) => Some(outcome),
                other => panic!("expected a group reply, got {:?}", other),
            }
        }

        fn assert_invariants(&self) {
            let p = &self.partition;
            assert!(p.start_offset() <= p.head_offset());
            assert!(p.head_offset() <= p.end_offset());
            p.index().verify().unwrap();
            if let Some(end) = p.index().end_offset() {
                assert_eq!(end, p.head_offset());
            }
            if let Some(first) = p.index().first() {
                assert!(first.key.contains(p.start_offset()) || first.key.offset == p.start_offset());
            }
        }

        fn data_keys(&self) -> Vec<BlockKey> {
            self.store
                .keys(&data_prefix(0))
                .unwrap()
                .iter()
                .map(|k| BlockKey::decode(k).unwrap())
                .collect()
        }
    }

    /// Flushes after every record.
    fn eager() -> PartitionConfig {
        PartitionConfig::new(0).flush_size_threshold(1)
    }

    async fn open(config: PartitionConfig) -> Harness {
        Harness::open(config, Arc::new(MemoryStore::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_write_returns_first_offset() {
        let mut h = open(eager()).await;

        assert_eq!(
            h.write("p1", 1, "a").await,
            Some(WriteOutcome::Accepted { offset: 0 })
        );
        assert_eq!(
            h.write("p1", 1, "a").await,
            Some(WriteOutcome::Duplicate {
                offset: 0,
                max_seq_no: 1
            })
        );
        assert_eq!(h.partition.end_offset(), 1);
        h.assert_invariants();
    }

    #[tokio::test]
    async fn test_read_returns_writes_in_order() {
        let mut h = open(eager()).await;
        h.write("p1", 1, "a").await;
        h.write("p1", 2, "b").await;

        assert_eq!(h.read_all(0).await, vec!["a", "b"]);
        let cookie = h
            .submit_read(ReadRequest::new(0).max_count(10))
            .await;
        assert!(matches!(
            h.read_reply(cookie),
            Some(Ok(ReadOutcome::Data(records))) if records.len() == 2 && records[1].seq_no == 2
        ));
    }

    #[tokio::test]
    async fn test_per_producer_offsets_increase() {
        let mut h = open(PartitionConfig::new(0).ack_policy(AckPolicy::Admitted)).await;
        let mut offsets: HashMap<&str, Vec<u64>> = HashMap::new();
        for seq_no in 1..=5 {
            for producer in ["a", "b"] {
                match h.write(producer, seq_no, "x").await {
                    Some(WriteOutcome::Accepted { offset }) => {
                        offsets.entry(producer).or_default().push(offset)
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
        for list in offsets.values() {
            assert!(list.windows(2).all(|w| w[0] < w[1]));
        }
        // Stale sequence numbers never receive a new offset.
        assert!(matches!(
            h.write("a", 3, "x").await,
            Some(WriteOutcome::Duplicate { offset: 8, max_seq_no: 5 })
        ));
    }

    #[tokio::test]
    async fn test_durable_ack_waits_for_flush() {
        let config = PartitionConfig::new(0).flush_max_age(Duration::from_millis(50));
        let mut h = open(config).await;

        let cookie = h.submit_write(WriteRequest::new("p", 1, "late")).await;
        assert!(h.write_reply(cookie).is_none());
        // Visible to readers before it is durable.
        assert_eq!(h.read_all(0).await, vec!["late"]);

        assert_eq!(
            h.partition.next_wakeup(),
            Some(h.now + Duration::from_millis(50))
        );
        h.advance(Duration::from_millis(50)).await;
        assert_eq!(h.write_reply(cookie), Some(WriteOutcome::Accepted { offset: 0 }));
        assert_eq!(h.partition.head_offset(), 1);
    }

    #[tokio::test]
    async fn test_unknown_producer_rejected() {
        let mut h = open(eager()).await;
        assert_eq!(
            h.write("stranger", 42, "x").await,
            Some(WriteOutcome::Rejected(RejectReason::UnknownProducer))
        );
        assert_eq!(
            h.write("p", 1, "").await,
            Some(WriteOutcome::Rejected(RejectReason::EmptyPayload))
        );
        assert_eq!(h.partition.end_offset(), 0);
    }

    #[tokio::test]
    async fn test_flush_and_merge_then_recover() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut h = Harness::open(eager(), store.clone()).await?;

        for seq_no in 1..=3 {
            h.write("p1", seq_no, &format!("record-{}", seq_no)).await;
        }
        assert_eq!(h.partition.index().len(), 3);
        assert!(h
            .partition
            .index()
            .iter()
            .all(|k| k.level == BlockLevel::Level(0) && k.key.count == 1));
        assert_eq!(h.data_keys().len(), 3);

        let block_size = h.partition.index().get(0).unwrap().size;
        h.partition
            .set_level_ceilings(vec![2 * block_size, 1 << 20, 2 << 20, 4 << 20])?;
        h.partition.force_compaction(h.now);
        h.run().await;

        let keys: Vec<_> = h.partition.index().iter().cloned().collect();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key.offset, 0);
        assert_eq!(keys[0].key.count, 3);
        assert_eq!(keys[0].level, BlockLevel::Level(1));
        // The superseded blocks were deleted by a later batch.
        assert_eq!(h.data_keys(), vec![keys[0].key]);
        h.assert_invariants();
        assert_eq!(
            h.read_all(1).await,
            vec!["record-2", "record-3"]
        );

        let before = (
            h.partition.start_offset(),
            h.partition.head_offset(),
            h.partition.end_offset(),
            h.partition.index().clone(),
        );
        drop(h);

        let h = Harness::open(eager(), store).await?;
        let after = (
            h.partition.start_offset(),
            h.partition.head_offset(),
            h.partition.end_offset(),
            h.partition.index().clone(),
        );
        assert_eq!(before, after);
        assert_eq!(h.partition.state(), PartitionState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn test_interrupted_merge_is_cleaned_up_on_recovery() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut h = Harness::open(eager(), store.clone()).await?;
        for seq_no in 1..=2 {
            h.write("p", seq_no, "x").await;
        }
        let block_size = h.partition.index().get(0).unwrap().size;
        h.partition.set_level_ceilings(vec![block_size, 1 << 20, 2 << 20, 4 << 20])?;

        // The batch deleting the merge sources never lands.
        h.partition.force_compaction(h.now);
        let effects = h.partition.take_effects();
        let (id, keys) = match effects.into_iter().next() {
            Some(Effect::Read { id, keys }) => (id, keys),
            other => panic!("expected a merge read, got {:?}", other),
        };
        let blobs = store.read(keys).await?;
        h.partition.on_read_complete(id, Ok(blobs), h.now);
        match h.partition.take_effects().into_iter().next() {
            Some(Effect::Write { batch, .. }) => store.write(batch).await?,
            other => panic!("expected the merge batch, got {:?}", other),
        }
        assert_eq!(h.data_keys().len(), 3);
        drop(h);

        let mut h = Harness::open(eager(), store).await?;
        assert_eq!(h.partition.index().len(), 1);
        assert_eq!(h.partition.index().get(0).unwrap().level, BlockLevel::Level(1));
        h.run().await;
        assert_eq!(h.data_keys().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_quota_throttles_and_recovers() {
        let config = eager().quota(QuotaConfig::default().bytes_per_second(100));
        let mut h = open(config).await;

        let big = "x".repeat(101);
        match h.write("p", 1, &big).await {
            Some(WriteOutcome::Throttled { retry_after }) => assert!(retry_after > Duration::ZERO),
            other => panic!("expected throttling, got {:?}", other),
        }
        assert_eq!(h.partition.end_offset(), 0);

        h.advance(Duration::from_secs(1)).await;
        assert_eq!(
            h.write("p", 1, &big).await,
            Some(WriteOutcome::Accepted { offset: 0 })
        );
    }

    #[tokio::test]
    async fn test_throttled_write_waits_until_deadline() {
        let config = eager().quota(QuotaConfig::default().bytes_per_second(100));
        let mut h = open(config).await;
        h.write("p", 1, &"x".repeat(100)).await;

        // Waits in the queue and is admitted once the window drained.
        let waiting = h
            .submit_write(WriteRequest::new("p", 2, "y".repeat(10)).timeout(Duration::from_secs(5)))
            .await;
        // Queued behind it, even though it would fit on its own.
        let behind = h
            .submit_write(WriteRequest::new("q", 1, "z").timeout(Duration::from_secs(5)))
            .await;
        assert!(h.write_reply(waiting).is_none());
        assert!(h.write_reply(behind).is_none());

        let wake = h.partition.next_wakeup().unwrap();
        assert_eq!(wake, h.now + Duration::from_secs(1));
        h.advance(Duration::from_secs(1)).await;
        assert_eq!(h.write_reply(waiting), Some(WriteOutcome::Accepted { offset: 1 }));
        assert_eq!(h.write_reply(behind), Some(WriteOutcome::Accepted { offset: 2 }));

        // A deadline shorter than the throttle rejects the write.
        h.write("p", 3, &"x".repeat(88)).await;
        let doomed = h
            .submit_write(WriteRequest::new("p", 4, "w".repeat(50)).timeout(Duration::from_millis(10)))
            .await;
        h.advance(Duration::from_millis(10)).await;
        assert_eq!(
            h.write_reply(doomed),
            Some(WriteOutcome::Rejected(RejectReason::DeadlineExceeded))
        );
    }

    #[tokio::test]
    async fn test_reserved_write() {
        let config = eager().quota(QuotaConfig::default().bytes_per_second(100));
        let mut h = open(config).await;

        assert_eq!(h.partition.reserve_bytes(9, 80, h.now), QuotaDecision::Admitted);
        assert!(matches!(
            h.write("other", 1, &"o".repeat(30)).await,
            Some(WriteOutcome::Throttled { .. })
        ));
        let cookie = h
            .submit_write(WriteRequest::new("p", 1, "r".repeat(80)).reservation(9))
            .await;
        assert_eq!(h.write_reply(cookie), Some(WriteOutcome::Accepted { offset: 0 }));
        assert!(!h.partition.release_reservation(9));
    }

    #[tokio::test]
    async fn test_reservation_covers_only_reserved_bytes() {
        let config = eager().quota(QuotaConfig::default().bytes_per_second(100));
        let mut h = open(config).await;

        assert_eq!(h.partition.reserve_bytes(7, 10, h.now), QuotaDecision::Admitted);
        let cookie = h
            .submit_write(WriteRequest::new("p", 1, "r".repeat(5000)).reservation(7))
            .await;
        assert!(matches!(
            h.write_reply(cookie),
            Some(WriteOutcome::Throttled { .. })
        ));
        assert_eq!(h.partition.end_offset(), 0);

        // The reservation survived the throttled write; the excess fits the window.
        let cookie = h
            .submit_write(WriteRequest::new("p", 1, "r".repeat(50)).reservation(7))
            .await;
        assert_eq!(h.write_reply(cookie), Some(WriteOutcome::Accepted { offset: 0 }));
        assert!(!h.partition.release_reservation(7));
    }

    #[tokio::test]
    async fn test_rejected_write_keeps_quota() {
        let config = PartitionConfig::new(0)
            .ack_policy(AckPolicy::Admitted)
            .max_part_size(1)
            .quota(QuotaConfig::default().bytes_per_second(100_000));
        let mut h = open(config).await;

        // 70_000 one-byte parts exceed the part numbering.
        let cookie = h
            .submit_write(WriteRequest::new("p", 1, vec![b'x'; 70_000]))
            .await;
        assert_eq!(
            h.write_reply(cookie),
            Some(WriteOutcome::Rejected(RejectReason::InvalidRequest))
        );

        let cookie = h
            .submit_write(WriteRequest::new("p", 1, vec![b'y'; 60_000]))
            .await;
        assert_eq!(h.write_reply(cookie), Some(WriteOutcome::Accepted { offset: 0 }));
    }

    #[tokio::test]
    async fn test_parked_read_times_out_empty() {
        let mut h = open(eager()).await;
        let cookie = h
            .submit_read(ReadRequest::new(0).timeout(Duration::from_millis(100)))
            .await;
        assert!(h.read_reply(cookie).is_none());
        assert_eq!(h.partition.next_wakeup(), Some(h.now + Duration::from_millis(100)));

        h.advance(Duration::from_millis(99)).await;
        assert!(h.read_reply(cookie).is_none());
        h.advance(Duration::from_millis(1)).await;
        assert!(matches!(h.read_reply(cookie), Some(Ok(ReadOutcome::Empty))));
    }

    #[tokio::test]
    async fn test_parked_read_wakes_on_append() {
        let mut h = open(eager()).await;
        let cookie = h
            .submit_read(ReadRequest::new(0).timeout(Duration::from_secs(10)))
            .await;
        h.write("p", 1, "hello").await;
        match h.read_reply(cookie) {
            Some(Ok(ReadOutcome::Data(records))) => assert_eq!(records[0].data, b"hello".to_vec()),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_boundaries() {
        let mut h = open(eager()).await;
        h.write("p", 1, "a").await;

        let at_end = h.submit_read(ReadRequest::new(1)).await;
        assert!(matches!(h.read_reply(at_end), Some(Ok(ReadOutcome::Empty))));
        let beyond = h.submit_read(ReadRequest::new(2)).await;
        assert!(matches!(
            h.read_reply(beyond),
            Some(Err(Error::OffsetOutOfRange { offset: 2, end_offset: 1 }))
        ));
    }

    #[tokio::test]
    async fn test_split_record_reassembled() {
        let mut h = open(eager().max_part_size(4)).await;
        let cookie = h
            .submit_write(WriteRequest::with_parts(
                "p",
                1,
                vec![b"0123456789".to_vec(), b"ab".to_vec()],
            ))
            .await;
        assert_eq!(h.write_reply(cookie), Some(WriteOutcome::Accepted { offset: 0 }));
        assert_eq!(h.partition.index().get(0).unwrap().key.parts, 4);
        assert_eq!(h.read_all(0).await, vec!["0123456789ab"]);

        let cookie = h.submit_read(ReadRequest::new(0).part_no(2)).await;
        match h.read_reply(cookie) {
            Some(Ok(ReadOutcome::Data(records))) => {
                assert_eq!(records[0].part_no, 2);
                assert_eq!(records[0].data, b"89ab".to_vec());
            }
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retries_identical_batch() {
        let store = Arc::new(MemoryStore::new());
        let mut h = Harness::open(eager(), store.clone()).await.unwrap();
        store.inject_faults(Fault::Transient, 2).unwrap();

        let cookie = h.submit_write(WriteRequest::new("p", 1, "a")).await;
        assert!(h.write_reply(cookie).is_none());
        assert_eq!(h.partition.head_offset(), 0);
        assert_eq!(h.partition.state(), PartitionState::Idle);

        // Writes keep being buffered while the flush is retried.
        let second = h.submit_write(WriteRequest::new("p", 2, "b")).await;
        h.advance(Duration::from_millis(100)).await;
        assert_eq!(h.partition.head_offset(), 0);
        h.advance(Duration::from_millis(100)).await;

        assert_eq!(h.write_reply(cookie), Some(WriteOutcome::Accepted { offset: 0 }));
        assert_eq!(h.write_reply(second), Some(WriteOutcome::Accepted { offset: 1 }));
        assert_eq!(h.writes[0], h.writes[1]);
        assert_eq!(h.writes[1], h.writes[2]);
        assert_eq!(h.partition.head_offset(), 2);
        h.assert_invariants();
    }

    #[tokio::test]
    async fn test_permanent_failure() {
        let store = Arc::new(MemoryStore::new());
        let mut h = Harness::open(eager(), store.clone()).await.unwrap();
        h.write("p", 1, "durable").await;

        store.inject_faults(Fault::Permanent, 1).unwrap();
        let lost = h.submit_write(WriteRequest::new("p", 2, "lost")).await;
        assert_eq!(h.partition.state(), PartitionState::Failed);
        assert_eq!(
            h.write_reply(lost),
            Some(WriteOutcome::Rejected(RejectReason::PartitionFailed))
        );
        assert_eq!(
            h.write("p", 3, "later").await,
            Some(WriteOutcome::Rejected(RejectReason::PartitionFailed))
        );
        assert_eq!(h.read_all(0).await, vec!["durable"]);
        let cookie = h.submit_read(ReadRequest::new(1)).await;
        assert!(matches!(h.read_reply(cookie), Some(Ok(ReadOutcome::Empty))));
    }

    #[tokio::test]
    async fn test_group_lifecycle() {
        let mut h = open(PartitionConfig::new(0)).await;

        assert_eq!(
            h.group(PendingRequest::RegisterGroup(GroupRegistration::new("g", 5)))
                .await,
            Some(GroupOutcome::Registered)
        );
        assert_eq!(
            h.partition.max_seq_nos(&["g".to_string(), "x".to_string()]),
            vec![("g".to_string(), Some(5)), ("x".to_string(), None)]
        );

        // Unflushed write: deregistration waits for the flush.
        let cookie = h.submit_write(WriteRequest::new("g", 6, "data")).await;
        assert_eq!(
            h.group(PendingRequest::DeregisterGroup {
                source_id: "g".into()
            })
            .await,
            None
        );
        assert!(h.partition.sources().get("g").unwrap().deregistering);

        h.advance(Duration::from_millis(50)).await;
        assert_eq!(h.write_reply(cookie), Some(WriteOutcome::Accepted { offset: 0 }));
        assert!(h.partition.sources().get("g").is_none());
        assert_eq!(
            h.group(PendingRequest::DeregisterGroup {
                source_id: "g".into()
            })
            .await,
            Some(GroupOutcome::Rejected(RejectReason::UnknownGroup))
        );
    }

    #[tokio::test]
    async fn test_split_group() {
        let mut h = open(eager().ack_policy(AckPolicy::Admitted)).await;
        h.group(PendingRequest::RegisterGroup(GroupRegistration::new("g", 0)))
            .await;
        h.write("g", 1, "x").await;

        let plan = h.partition.sources().split_plan("g", b"m").unwrap();
        assert_eq!(
            h.group(PendingRequest::SplitGroup(plan)).await,
            Some(GroupOutcome::Split)
        );
        assert!(h.partition.sources().get("g").is_none());
        assert_eq!(
            h.write("g#0", 2, "y").await,
            Some(WriteOutcome::Accepted { offset: 1 })
        );
        assert_eq!(
            h.write("g", 2, "z").await,
            Some(WriteOutcome::Rejected(RejectReason::UnknownProducer))
        );
    }

    #[tokio::test]
    async fn test_groups_survive_restart() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut h = Harness::open(eager(), store.clone()).await?;
        h.write("p", 1, "a").await;
        h.write("p", 2, "b").await;
        h.group(PendingRequest::RegisterGroup(GroupRegistration::new("idle", 7)))
            .await;
        drop(h);

        let mut h = Harness::open(eager(), store).await?;
        assert_eq!(
            h.write("p", 2, "b").await,
            Some(WriteOutcome::Duplicate {
                offset: 1,
                max_seq_no: 2
            })
        );
        assert_eq!(
            h.write("idle", 8, "c").await,
            Some(WriteOutcome::Accepted { offset: 2 })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_idle_implicit_group_expires() -> Result<()> {
        let retention = RetentionConfig::default().source_id_max_age(Duration::from_secs(60));
        let mut h = open(eager().retention(retention)).await;
        h.write("p", 1, "a").await;
        h.write("p", 2, "b").await;
        h.group(PendingRequest::RegisterGroup(GroupRegistration::new("g", 5)))
            .await;

        let key = keycode::PartitionKey::SourceId {
            partition: 0,
            source_id: "p".into(),
        }
        .encode();
        assert_eq!(h.store.read(vec![key.clone()]).await?.len(), 1);
        assert_eq!(h.partition.next_wakeup(), Some(h.now + Duration::from_secs(60)));

        h.advance(Duration::from_secs(59)).await;
        assert!(h.partition.sources().get("p").is_some());
        h.advance(Duration::from_secs(1)).await;
        assert!(h.partition.sources().get("p").is_none());
        assert!(h.store.read(vec![key]).await?.is_empty());
        assert!(h.partition.sources().get("g").is_some());

        // The producer starts over as a new group.
        assert_eq!(
            h.write("p", 1, "again").await,
            Some(WriteOutcome::Accepted { offset: 2 })
        );
        h.assert_invariants();
        Ok(())
    }

    #[tokio::test]
    async fn test_retention_by_size() {
        let config = eager().retention(RetentionConfig::default().max_bytes(1));
        let mut h = open(config).await;
        h.write("p", 1, "a").await;
        h.write("p", 2, "b").await;

        // Every block but those written by the last batch is over budget.
        assert!(h.partition.start_offset() >= 1);
        h.assert_invariants();
        let cookie = h.submit_read(ReadRequest::new(0)).await;
        assert!(matches!(
            h.read_reply(cookie),
            Some(Ok(ReadOutcome::Trimmed { .. }))
        ));
        assert!(h.data_keys().len() <= 1);
    }

    #[tokio::test]
    async fn test_offset_for_timestamp() {
        let mut h = open(eager()).await;
        for (seq_no, ts) in [(1, 100), (2, 200), (3, 300)] {
            let cookie = h
                .submit_write(WriteRequest::new("p", seq_no, "x").write_time_ms(ts))
                .await;
            h.write_reply(cookie);
        }
        assert_eq!(h.partition.offset_for_timestamp(0), 0);
        assert_eq!(h.partition.offset_for_timestamp(150), 1);
        assert_eq!(h.partition.offset_for_timestamp(300), 2);
        assert_eq!(h.partition.offset_for_timestamp(301), 3);
    }

    #[tokio::test]
    async fn test_offset_for_timestamp_with_producer_clocks() {
        let mut h = open(eager()).await;
        for (seq_no, ts) in [(1, 300), (2, 100), (3, 200)] {
            let cookie = h
                .submit_write(WriteRequest::new("p", seq_no, "x").write_time_ms(ts))
                .await;
            h.write_reply(cookie);
        }
        assert_eq!(h.partition.offset_for_timestamp(150), 0);
        assert_eq!(h.partition.offset_for_timestamp(250), 0);
        assert_eq!(h.partition.offset_for_timestamp(301), 3);
    }

    #[tokio::test]
    async fn test_requests_wait_for_recovery() -> Result<()> {
        let now = Instant::now();
        let mut partition = Partition::new(PartitionConfig::new(0).ack_policy(AckPolicy::Admitted), now)?;
        partition.write(1, WriteRequest::new("p", 1, "early"), now);
        partition.read(2, ReadRequest::new(0), now);
        assert_eq!(partition.state(), PartitionState::Initializing);
        assert!(partition.take_effects().is_empty());

        partition.recover(recovery::rebuild(partition.config(), Snapshot::default())?, now)?;
        let replies: Vec<_> = partition
            .take_effects()
            .into_iter()
            .filter_map(|e| match e {
                Effect::Reply { cookie, reply } => Some((cookie, reply)),
                _ => None,
            })
            .collect();
        assert!(matches!(
            replies[0],
            (1, Reply::Write(WriteOutcome::Accepted { offset: 0 }))
        ));
        assert!(matches!(&replies[1], (2, Reply::Read(Ok(ReadOutcome::Data(r)))) if r.len() == 1));
        Ok(())
    }

    #[tokio::test]
    async fn test_queue_overflow() {
        let config = eager()
            .max_pending_requests(1)
            .quota(QuotaConfig::default().bytes_per_second(10));
        let mut h = open(config).await;
        h.write("p", 1, &"x".repeat(10)).await;

        let waiting = h
            .submit_write(WriteRequest::new("p", 2, "y").timeout(Duration::from_secs(5)))
            .await;
        assert!(h.write_reply(waiting).is_none());
        assert_eq!(
            h.write("q", 1, "z").await,
            Some(WriteOutcome::Rejected(RejectReason::QueueOverflow))
        );
    }

    #[test]
    fn test_status() -> Result<()> {
        let now = Instant::now();
        let mut partition = Partition::new(
            PartitionConfig::new(3).compaction(CompactionConfig::default()),
            now,
        )?;
        partition.recover(recovery::rebuild(partition.config(), Snapshot::default())?, now)?;
        let status = partition.status();
        assert_eq!(status.partition_id, 3);
        assert_eq!(status.state, PartitionState::Idle);
        assert_eq!(status.end_offset, 0);
        assert!(partition.recover(recovery::rebuild(partition.config(), Snapshot::default())?, now).is_err());
        Ok(())
    }
}
