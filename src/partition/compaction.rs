//! Leveled compaction of body blocks.
//!
//! Freshly flushed blocks enter level 0. Each level `i` has a byte ceiling
//! `C_i`; once the blocks of a level reach it, the whole run is merged into a
//! single block one level up, or into the body after the last level. Because
//! levels are contiguous runs ordered from highest to lowest along the offset
//! axis, the run of a level is always its oldest contiguous run.
//!
//! # Merge lifecycle
//!
//! ```text
//!  Idle ──plan──▶ Reading ──blobs──▶ Ready ──batch──▶ Committing ──ok──▶ Idle
//! ```
//!
//! - A single-block run is relabelled in place; nothing is rewritten
//! - Source blobs are read through storage and re-serialized in offset order
//! - The merged block is written in the next write batch; only after that
//!   batch succeeds do the sources leave the index
//! - Superseded sources are deleted in a later batch, and only once no
//!   in-flight read pins them

use std::collections::HashMap;

use super::block;
use super::data_keys::{BlockLevel, DataKey, DataKeyIndex};
use crate::config::CompactionConfig;
use crate::encoding::keycode::BlockKey;
use crate::encoding::Key;
use crate::error::{Error, Result};
use crate::store::Entry;

/// Sources of one merge and the level they are promoted into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeJob {
    pub sources: Vec<BlockKey>,
    pub target: BlockLevel,
}

impl MergeJob {
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.sources.iter().map(Key::encode).collect()
    }
}

/// A merged block waiting to be committed.
#[derive(Debug, Clone)]
pub struct MergedBlock {
    pub sources: Vec<BlockKey>,
    pub key: DataKey,
    pub blob: Vec<u8>,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Reading(MergeJob),
    Ready(MergedBlock),
    Committing,
}

/// Outcome of a promotion check.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Promotion {
    /// Blocks were relabelled in place; the metadata key is stale.
    pub relabelled: bool,
    /// A merge needs its sources read from storage.
    pub job: Option<MergeJob>,
}

#[derive(Debug)]
pub struct Compactor {
    partition: u32,
    ceilings: Vec<u64>,
    phase: Phase,
    superseded: Vec<BlockKey>,
    pins: HashMap<BlockKey, usize>,
}

impl Compactor {
    pub fn new(partition: u32, config: &CompactionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            partition,
            ceilings: config.level_ceilings.clone(),
            phase: Phase::Idle,
            superseded: Vec::new(),
            pins: HashMap::new(),
        })
    }

    pub fn levels(&self) -> usize {
        self.ceilings.len()
    }

    pub fn ceilings(&self) -> &[u64] {
        &self.ceilings
    }

    /// Replaces the level ceilings. The number of levels may not change.
    pub fn set_ceilings(&mut self, ceilings: Vec<u64>) -> Result<()> {
        let config = CompactionConfig::default().level_ceilings(ceilings);
        config.validate()?;
        if config.level_ceilings.len() != self.ceilings.len() {
            return Err(Error::InvalidConfig(format!(
                "expected {} level ceilings, got {}",
                self.ceilings.len(),
                config.level_ceilings.len()
            )));
        }
        self.ceilings = config.level_ceilings;
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    pub fn has_ready(&self) -> bool {
        matches!(self.phase, Phase::Ready(_))
    }

    /// The merge currently waiting for its source blobs.
    pub fn reading(&self) -> Option<&MergeJob> {
        match &self.phase {
            Phase::Reading(job) => Some(job),
            _ => None,
        }
    }

    /// Promotes every level that reached its ceiling, lowest first.
    /// Single-block runs are relabelled; the first multi-block run becomes a
    /// merge job and stops the walk until it commits.
    pub fn maybe_promote(&mut self, index: &mut DataKeyIndex) -> Result<Promotion> {
        let mut promotion = Promotion::default();
        if !self.is_idle() {
            return Ok(promotion);
        }

        for (i, ceiling) in self.ceilings.iter().enumerate() {
            let level = BlockLevel::Level(i as u8);
            let size = index.level_size(level);
            if size < *ceiling {
                continue;
            }
            let (from, to) = match index.level_run(level) {
                Some(run) => run,
                None => continue,
            };
            let target = level.next(self.ceilings.len());

            if to - from == 1 {
                index.relabel(from, target)?;
                tracing::debug!(
                    partition = self.partition,
                    block = %index.get(from).map(|k| k.key.to_string()).unwrap_or_default(),
                    from = %level,
                    to = %target,
                    "Relabelled block"
                );
                promotion.relabelled = true;
                continue;
            }

            let sources: Vec<BlockKey> = (from..to)
                .filter_map(|j| index.get(j).map(|k| k.key))
                .collect();
            tracing::info!(
                partition = self.partition,
                level = %level,
                target = %target,
                blocks = sources.len(),
                bytes = size,
                "Starting level merge"
            );
            let job = MergeJob { sources, target };
            self.phase = Phase::Reading(job.clone());
            promotion.job = Some(job);
            break;
        }
        Ok(promotion)
    }

    /// Builds the merged block from the fetched source blobs.
    pub fn on_sources_read(&mut self, blobs: Vec<Entry>) -> Result<()> {
        let job = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Reading(job) => job,
            other => {
                self.phase = other;
                return Err(Error::InvalidState("no merge is reading".into()));
            }
        };

        let merged = self.merge(&job, blobs)?;
        tracing::info!(
            partition = self.partition,
            block = %merged.key.key,
            level = %merged.key.level,
            size = merged.key.size,
            "Merged blocks"
        );
        self.phase = Phase::Ready(merged);
        Ok(())
    }

    fn merge(&self, job: &MergeJob, blobs: Vec<Entry>) -> Result<MergedBlock> {
        let mut blobs: HashMap<Vec<u8>, Vec<u8>> = blobs.into_iter().collect();
        let mut builder = block::Builder::new();
        let mut write_time_ms = 0;

        for source in &job.sources {
            let encoded = source.encode();
            let blob = blobs
                .remove(&encoded)
                .ok_or_else(|| Error::BlobMissing(encoded.clone()))?;
            let (header, parts) = block::decode(&blob)?;
            write_time_ms = write_time_ms.max(header.max_write_time_ms);
            for part in &parts {
                builder.add(part)?;
            }
        }

        let (first, last) = match (job.sources.first(), job.sources.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(Error::InvalidState("merge without sources".into())),
        };
        let count = last.end_offset() - first.offset;
        if builder.record_count() as u64 != count {
            return Err(Error::InvalidData(format!(
                "merge of {} blocks holds {} records, expected {}",
                job.sources.len(),
                builder.record_count(),
                count
            )));
        }

        let key = BlockKey::new(self.partition, first.offset, count as u32, builder.part_count());
        let blob = builder.finish()?;
        Ok(MergedBlock {
            sources: job.sources.clone(),
            key: DataKey {
                key,
                size: blob.len() as u64,
                write_time_ms,
                cumulative_size: 0,
                level: job.target,
            },
            blob,
        })
    }

    /// Hands the merged block to the next write batch.
    pub fn take_ready(&mut self) -> Option<MergedBlock> {
        match std::mem::replace(&mut self.phase, Phase::Committing) {
            Phase::Ready(merged) => Some(merged),
            other => {
                self.phase = other;
                None
            }
        }
    }

    /// Called once the batch carrying `merged` is durable: swaps the sources
    /// for the merged block and marks them superseded.
    pub fn commit(&mut self, merged: MergedBlock, index: &mut DataKeyIndex) {
        self.phase = Phase::Idle;
        if index.replace(&merged.sources, merged.key.clone()) {
            self.superseded.extend(merged.sources);
        } else {
            tracing::warn!(
                partition = self.partition,
                block = %merged.key.key,
                "Merge sources left the index, discarding merged block"
            );
            self.superseded.push(merged.key.key);
        }
    }

    /// Drops the current merge; it will be planned again on the next check.
    pub fn abort(&mut self) {
        if !matches!(self.phase, Phase::Idle) {
            tracing::warn!(partition = self.partition, "Aborting level merge");
        }
        self.phase = Phase::Idle;
    }

    /// Marks blocks for deletion in a later batch.
    pub fn supersede(&mut self, keys: impl IntoIterator<Item = BlockKey>) {
        self.superseded.extend(keys);
    }

    pub fn has_deletable(&self) -> bool {
        self.superseded.iter().any(|k| !self.is_pinned(k))
    }

    /// Removes and returns superseded blocks that no read pins.
    pub fn take_deletable(&mut self) -> Vec<BlockKey> {
        let (pinned, free): (Vec<_>, Vec<_>) = self
            .superseded
            .drain(..)
            .partition(|k| self.pins.contains_key(k));
        self.superseded = pinned;
        free
    }

    pub fn superseded(&self) -> &[BlockKey] {
        &self.superseded
    }

    pub fn pin(&mut self, keys: &[BlockKey]) {
        for key in keys {
            *self.pins.entry(*key).or_insert(0) += 1;
        }
    }

    pub fn unpin(&mut self, keys: &[BlockKey]) {
        for key in keys {
            if let Some(count) = self.pins.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    self.pins.remove(key);
                }
            }
        }
    }

    pub fn is_pinned(&self, key: &BlockKey) -> bool {
        self.pins.contains_key(key)
    }
}
