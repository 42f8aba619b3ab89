//! Read resolution across body blocks and the head.
//!
//! Reads are two-phase. [`resolve`] decides which body blocks must be fetched
//! (and snapshots the head records the read will need); once storage returned
//! the blobs, [`complete`] stitches everything into records in offset order.

use std::collections::HashMap;

use super::block;
use super::data_keys::DataKeyIndex;
use super::head::HeadBuffer;
use super::record::{assemble, RecordPart};
use super::request::{ReadOutcome, ReadRequest};
use crate::encoding::keycode::BlockKey;
use crate::encoding::Key;
use crate::error::{Error, Result};
use crate::store::Entry;

#[derive(Debug, Clone)]
pub struct ReadPlan {
    pub offset: u64,
    pub part_no: u16,
    pub max_count: usize,
    pub max_size: usize,
    /// Body blocks to fetch, in offset order
    pub blocks: Vec<BlockKey>,
    /// Head parts following the blocks
    pub head: Vec<RecordPart>,
}

impl ReadPlan {
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.blocks.iter().map(Key::encode).collect()
    }
}

#[derive(Debug)]
pub enum Resolution {
    Done(ReadOutcome),
    /// Nothing to read yet; the read may wait for new records.
    Wait,
    Fetch(ReadPlan),
}

/// Plans a read of `request` against a partition whose readable records are
/// `[start_offset, end_offset)`.
pub fn resolve(
    request: &ReadRequest,
    start_offset: u64,
    end_offset: u64,
    index: &DataKeyIndex,
    head: &HeadBuffer,
) -> Result<Resolution> {
    let offset = request.offset;
    if offset < start_offset {
        return Ok(Resolution::Done(ReadOutcome::Trimmed { start_offset }));
    }
    if offset > end_offset {
        return Err(Error::OffsetOutOfRange { offset, end_offset });
    }
    if offset == end_offset {
        return Ok(Resolution::Wait);
    }

    let mut blocks = Vec::new();
    let mut records = 0u64;
    let mut bytes = 0u64;
    let mut body_exhausted = true;

    if offset < head.head_offset() {
        if let Some(first) = index.find(offset) {
            for key in index.iter().skip(first) {
                if records >= request.max_count as u64 || bytes >= request.max_size as u64 {
                    body_exhausted = false;
                    break;
                }
                // Only part of the first block is wanted.
                let from = offset.max(key.key.offset);
                let wanted = key.key.end_offset() - from;
                records += wanted;
                bytes += key.size * wanted / u64::from(key.key.count.max(1));
                blocks.push(key.key);
            }
        }
    }

    let mut head_parts = Vec::new();
    if body_exhausted {
        let (from, part_no) = if offset >= head.head_offset() {
            (offset, request.part_no)
        } else {
            (head.head_offset(), 0)
        };
        let mut last_offset = None;
        for part in head.parts_from(from, part_no) {
            if part.offset >= end_offset {
                break;
            }
            if last_offset != Some(part.offset) {
                if records >= request.max_count as u64 || bytes >= request.max_size as u64 {
                    break;
                }
                records += 1;
                last_offset = Some(part.offset);
            }
            bytes += part.data.len() as u64;
            head_parts.push(part.clone());
        }
    }

    let plan = ReadPlan {
        offset,
        part_no: request.part_no,
        max_count: request.max_count,
        max_size: request.max_size,
        blocks,
        head: head_parts,
    };
    if plan.blocks.is_empty() && plan.head.is_empty() {
        return Ok(Resolution::Done(ReadOutcome::Empty));
    }
    Ok(Resolution::Fetch(plan))
}

/// Builds the read result from the fetched blobs of `plan`.
pub fn complete(plan: ReadPlan, blobs: Vec<Entry>) -> Result<ReadOutcome> {
    let mut blobs: HashMap<Vec<u8>, Vec<u8>> = blobs.into_iter().collect();
    let mut parts = Vec::new();
    for key in &plan.blocks {
        let encoded = key.encode();
        let blob = blobs
            .remove(&encoded)
            .ok_or_else(|| Error::BlobMissing(encoded.clone()))?;
        let (_, block_parts) = block::decode(&blob)?;
        parts.extend(block_parts);
    }
    parts.extend(plan.head);

    let start = (plan.offset, plan.part_no);
    let records = assemble(
        parts
            .into_iter()
            .filter(|p| (p.offset, p.part_no) >= start),
    );

    let mut out = Vec::new();
    let mut size = 0usize;
    for record in records {
        size += record.data.len();
        out.push(record);
        if out.len() >= plan.max_count || size >= plan.max_size {
            break;
        }
    }

    if out.is_empty() {
        return Ok(ReadOutcome::Empty);
    }
    Ok(ReadOutcome::Data(out))
}
