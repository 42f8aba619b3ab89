//! The head: records above `head_offset` that are not durable yet.
//!
//! Records are appended at `end_offset` and stay in the buffer until the write
//! batch carrying them succeeds. A flush snapshots every complete record in
//! `[head_offset, end_offset)`; appends continue behind the snapshot while it
//! is in flight.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::record::RecordPart;

/// Records taken by one flush.
#[derive(Debug, Clone)]
pub struct FlushSnapshot {
    pub from: u64,
    pub to: u64,
    pub parts: Vec<RecordPart>,
}

#[derive(Debug)]
pub struct HeadBuffer {
    parts: VecDeque<RecordPart>,
    /// Append time of each buffered record, by offset
    arrivals: VecDeque<(u64, Instant)>,
    head_offset: u64,
    end_offset: u64,
    bytes: usize,
    /// End of the snapshot currently being flushed
    flushing_to: Option<u64>,
    flushing_bytes: usize,
}

impl HeadBuffer {
    pub fn new(offset: u64) -> Self {
        Self {
            parts: VecDeque::new(),
            arrivals: VecDeque::new(),
            head_offset: offset,
            end_offset: offset,
            bytes: 0,
            flushing_to: None,
            flushing_bytes: 0,
        }
    }

    pub fn head_offset(&self) -> u64 {
        self.head_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// Buffered records.
    pub fn len(&self) -> usize {
        (self.end_offset - self.head_offset) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end_offset == self.head_offset
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Bytes not covered by an in-flight flush.
    pub fn unflushed_bytes(&self) -> usize {
        self.bytes - self.flushing_bytes
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing_to.is_some()
    }

    /// Appends one record made of `payload` parts and returns its offset.
    pub fn append(
        &mut self,
        source_id: &str,
        seq_no: u64,
        write_time_ms: u64,
        payload: Vec<Vec<u8>>,
        now: Instant,
    ) -> u64 {
        let offset = self.end_offset;
        let total_parts = payload.len() as u16;
        for (part_no, data) in payload.into_iter().enumerate() {
            let part = RecordPart {
                offset,
                part_no: part_no as u16,
                total_parts,
                source_id: source_id.to_string(),
                seq_no,
                write_time_ms,
                data,
            };
            self.bytes += part.size();
            self.parts.push_back(part);
        }
        self.arrivals.push_back((offset, now));
        self.end_offset += 1;
        offset
    }

    fn first_unflushed_arrival(&self) -> Option<Instant> {
        let from = self.flushing_to.unwrap_or(self.head_offset);
        self.arrivals
            .iter()
            .find(|(offset, _)| *offset >= from)
            .map(|(_, at)| *at)
    }

    /// Time at which the oldest record outside a flush reaches `max_age`.
    pub fn flush_deadline(&self, max_age: Duration) -> Option<Instant> {
        self.first_unflushed_arrival().map(|at| at + max_age)
    }

    pub fn should_flush(&self, now: Instant, size_threshold: usize, max_age: Duration) -> bool {
        if self.is_flushing() || self.is_empty() {
            return false;
        }
        self.unflushed_bytes() >= size_threshold
            || self.flush_deadline(max_age).map_or(false, |at| at <= now)
    }

    /// Snapshots all buffered records for a flush.
    pub fn snapshot(&mut self) -> Option<FlushSnapshot> {
        if self.is_flushing() || self.is_empty() {
            return None;
        }
        self.flushing_to = Some(self.end_offset);
        self.flushing_bytes = self.bytes;
        Some(FlushSnapshot {
            from: self.head_offset,
            to: self.end_offset,
            parts: self.parts.iter().cloned().collect(),
        })
    }

    /// Drops records below `to` once they are durable.
    pub fn commit(&mut self, to: u64) {
        while let Some(part) = self.parts.front() {
            if part.offset >= to {
                break;
            }
            self.bytes -= part.size();
            self.parts.pop_front();
        }
        while matches!(self.arrivals.front(), Some((offset, _)) if *offset < to) {
            self.arrivals.pop_front();
        }
        self.head_offset = self.head_offset.max(to);
        self.flushing_to = None;
        self.flushing_bytes = 0;
    }

    /// Forgets an in-flight flush without committing it.
    pub fn abort_flush(&mut self) {
        self.flushing_to = None;
        self.flushing_bytes = 0;
    }

    /// Parts at or after `(offset, part_no)`, in order.
    pub fn parts_from(&self, offset: u64, part_no: u16) -> impl Iterator<Item = &RecordPart> {
        let start = self
            .parts
            .partition_point(|p| (p.offset, p.part_no) < (offset, part_no));
        self.parts.range(start..)
    }

    /// Offset of the first buffered record written at or after `timestamp_ms`.
    pub fn offset_for_timestamp(&self, timestamp_ms: u64) -> Option<u64> {
        self.parts
            .iter()
            .find(|p| p.write_time_ms >= timestamp_ms)
            .map(|p| p.offset)
    }
}
