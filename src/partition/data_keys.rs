//! Ordered index of the persisted body blocks of a partition.
//!
//! Blocks are kept sorted by offset and are always contiguous: every block
//! starts where the previous one ends. Compaction levels form runs along the
//! offset axis, highest level first:
//!
//! ```text
//! | Body ... | L(n-1) ... | ... | L1 ... | L0 ... |
//! ^ start_offset                            head_offset ^
//! ```

use std::collections::VecDeque;
use std::fmt;

use crate::encoding::keycode::BlockKey;
use crate::error::{Error, Result};

/// Compaction tier of a block. `Body` blocks are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockLevel {
    Level(u8),
    Body,
}

impl BlockLevel {
    const BODY_TAG: u8 = u8::MAX;

    pub fn to_tag(self) -> u8 {
        match self {
            BlockLevel::Level(i) => i,
            BlockLevel::Body => Self::BODY_TAG,
        }
    }

    pub fn from_tag(tag: u8) -> Self {
        match tag {
            Self::BODY_TAG => BlockLevel::Body,
            i => BlockLevel::Level(i),
        }
    }

    /// The level blocks are promoted into, given the number of levels.
    pub fn next(self, levels: usize) -> Self {
        match self {
            BlockLevel::Level(i) if (i as usize) + 1 < levels => BlockLevel::Level(i + 1),
            _ => BlockLevel::Body,
        }
    }
}

impl fmt::Display for BlockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockLevel::Level(i) => write!(f, "L{}", i),
            BlockLevel::Body => write!(f, "body"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataKey {
    pub key: BlockKey,
    /// Blob size in bytes
    pub size: u64,
    /// Newest write time of any record in the block
    pub write_time_ms: u64,
    /// Bytes of this block and every block before it
    pub cumulative_size: u64,
    pub level: BlockLevel,
}

/// Per-level block count and bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelStats {
    pub level: BlockLevel,
    pub first_offset: u64,
    pub end_offset: u64,
    pub blocks: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataKeyIndex {
    keys: VecDeque<DataKey>,
}

impl DataKeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index from blocks sorted by offset, verifying that they are
    /// contiguous and that levels never increase along the offset axis.
    pub fn from_blocks(blocks: Vec<DataKey>) -> Result<Self> {
        let mut index = Self {
            keys: blocks.into(),
        };
        index.rebuild_cumulative(0);
        index.verify()?;
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataKey> {
        self.keys.iter()
    }

    pub fn get(&self, i: usize) -> Option<&DataKey> {
        self.keys.get(i)
    }

    pub fn first(&self) -> Option<&DataKey> {
        self.keys.front()
    }

    pub fn last(&self) -> Option<&DataKey> {
        self.keys.back()
    }

    /// One past the last persisted offset, if any block exists.
    pub fn end_offset(&self) -> Option<u64> {
        self.keys.back().map(|k| k.key.end_offset())
    }

    pub fn total_size(&self) -> u64 {
        self.keys.back().map(|k| k.cumulative_size).unwrap_or(0)
    }

    /// Appends a freshly flushed block at level 0.
    pub fn push(&mut self, key: BlockKey, size: u64, write_time_ms: u64) -> Result<()> {
        if let Some(end) = self.end_offset() {
            if key.offset != end {
                return Err(Error::InvalidState(format!(
                    "block {} does not continue the index at {}",
                    key, end
                )));
            }
        }
        self.keys.push_back(DataKey {
            key,
            size,
            write_time_ms,
            cumulative_size: self.total_size() + size,
            level: BlockLevel::Level(0),
        });
        Ok(())
    }

    /// Position of the block containing `offset`.
    pub fn find(&self, offset: u64) -> Option<usize> {
        let i = self.keys.partition_point(|k| k.key.end_offset() <= offset);
        match self.keys.get(i) {
            Some(k) if k.key.contains(offset) => Some(i),
            _ => None,
        }
    }

    /// Position of a block by exact key.
    pub fn position(&self, key: &BlockKey) -> Option<usize> {
        let i = self.keys.partition_point(|k| k.key.offset < key.offset);
        match self.keys.get(i) {
            Some(k) if k.key == *key => Some(i),
            _ => None,
        }
    }

    /// Blocks at `level`, as the contiguous run `[from, to)` of positions.
    pub fn level_run(&self, level: BlockLevel) -> Option<(usize, usize)> {
        let from = self.keys.iter().position(|k| k.level == level)?;
        let len = self.keys.iter().skip(from).take_while(|k| k.level == level).count();
        Some((from, from + len))
    }

    pub fn level_size(&self, level: BlockLevel) -> u64 {
        self.keys
            .iter()
            .filter(|k| k.level == level)
            .map(|k| k.size)
            .sum()
    }

    pub fn relabel(&mut self, i: usize, level: BlockLevel) -> Result<()> {
        let key = self
            .keys
            .get_mut(i)
            .ok_or_else(|| Error::InvalidState(format!("no block at position {}", i)))?;
        key.level = level;
        Ok(())
    }

    /// Replaces the run of `sources` by a single block covering them.
    /// Returns false when the sources are no longer in the index.
    pub fn replace(&mut self, sources: &[BlockKey], merged: DataKey) -> bool {
        let (first, last) = match (sources.first(), sources.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return false,
        };
        let from = match self.position(first) {
            Some(i) => i,
            None => return false,
        };
        let to = from + sources.len();
        if to > self.keys.len()
            || self.keys[to - 1].key != *last
            || merged.key.offset != first.offset
            || merged.key.end_offset() != last.end_offset()
        {
            return false;
        }

        self.keys.drain(from..to);
        self.keys.insert(from, merged);
        self.rebuild_cumulative(from);
        true
    }

    /// Removes the `count` oldest blocks.
    pub fn trim_front(&mut self, count: usize) -> Vec<DataKey> {
        let removed: Vec<_> = self.keys.drain(..count.min(self.keys.len())).collect();
        self.rebuild_cumulative(0);
        removed
    }

    /// Number of oldest blocks whose removal keeps the index within `max_bytes`.
    pub fn excess_by_size(&self, max_bytes: u64) -> usize {
        let total = self.total_size();
        self.keys
            .iter()
            .take_while(|k| total - k.cumulative_size + k.size > max_bytes)
            .count()
    }

    /// Number of oldest blocks whose newest record was written before `cutoff_ms`.
    pub fn expired_by_age(&self, cutoff_ms: u64) -> usize {
        self.keys
            .iter()
            .take_while(|k| k.write_time_ms < cutoff_ms)
            .count()
    }

    /// First offset of the first block holding a record written at or after
    /// `timestamp_ms`. Write times come from producers and need not increase
    /// along the offset axis, so every block is checked.
    pub fn offset_for_timestamp(&self, timestamp_ms: u64) -> Option<u64> {
        self.keys
            .iter()
            .find(|k| k.write_time_ms >= timestamp_ms)
            .map(|k| k.key.offset)
    }

    pub fn level_stats(&self) -> Vec<LevelStats> {
        let mut stats: Vec<LevelStats> = Vec::new();
        for key in &self.keys {
            match stats.last_mut() {
                Some(last) if last.level == key.level => {
                    last.end_offset = key.key.end_offset();
                    last.blocks += 1;
                    last.bytes += key.size;
                }
                _ => stats.push(LevelStats {
                    level: key.level,
                    first_offset: key.key.offset,
                    end_offset: key.key.end_offset(),
                    blocks: 1,
                    bytes: key.size,
                }),
            }
        }
        stats
    }

    pub fn verify(&self) -> Result<()> {
        for (prev, next) in self.keys.iter().zip(self.keys.iter().skip(1)) {
            if next.key.offset != prev.key.end_offset() {
                return Err(Error::InvalidData(format!(
                    "body blocks are not contiguous: {} followed by {}",
                    prev.key, next.key
                )));
            }
            if next.level > prev.level {
                return Err(Error::InvalidData(format!(
                    "block {} at {} follows block {} at {}",
                    next.key, next.level, prev.key, prev.level
                )));
            }
        }
        Ok(())
    }

    fn rebuild_cumulative(&mut self, from: usize) {
        let mut total = match from {
            0 => 0,
            i => self.keys[i - 1].cumulative_size,
        };
        for key in self.keys.iter_mut().skip(from) {
            total += key.size;
            key.cumulative_size = total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(sizes: &[(u32, u64)]) -> DataKeyIndex {
        let mut index = DataKeyIndex::new();
        let mut offset = 0;
        for (i, (count, size)) in sizes.iter().enumerate() {
            index
                .push(BlockKey::new(0, offset, *count, *count), *size, 100 * i as u64)
                .unwrap();
            offset += *count as u64;
        }
        index
    }

    #[test]
    fn test_find() {
        let index = index_of(&[(2, 10), (3, 10), (1, 10)]);
        assert_eq!(index.find(0), Some(0));
        assert_eq!(index.find(1), Some(0));
        assert_eq!(index.find(2), Some(1));
        assert_eq!(index.find(4), Some(1));
        assert_eq!(index.find(5), Some(2));
        assert_eq!(index.find(6), None);
        assert_eq!(index.end_offset(), Some(6));
        assert_eq!(index.total_size(), 30);
    }

    #[test]
    fn test_push_rejects_gaps() {
        let mut index = index_of(&[(2, 10)]);
        assert!(index.push(BlockKey::new(0, 5, 1, 1), 1, 0).is_err());
        assert!(index.push(BlockKey::new(0, 2, 1, 1), 1, 0).is_ok());
    }

    #[test]
    fn test_replace_run() {
        let mut index = index_of(&[(1, 10), (1, 10), (1, 10), (1, 5)]);
        let sources: Vec<_> = index.iter().take(3).map(|k| k.key).collect();
        let merged = DataKey {
            key: BlockKey::new(0, 0, 3, 3),
            size: 25,
            write_time_ms: 200,
            cumulative_size: 0,
            level: BlockLevel::Level(1),
        };

        assert!(index.replace(&sources, merged));
        assert_eq!(index.len(), 2);
        assert_eq!(index.total_size(), 30);
        assert_eq!(index.get(0).unwrap().cumulative_size, 25);
        assert_eq!(index.find(2), Some(0));
        assert!(index.verify().is_ok());

        // Stale sources no longer match.
        let stale = DataKey {
            key: BlockKey::new(0, 0, 3, 3),
            size: 1,
            write_time_ms: 0,
            cumulative_size: 0,
            level: BlockLevel::Body,
        };
        assert!(!index.replace(&sources, stale));
    }

    #[test]
    fn test_levels_must_not_increase() {
        let mut index = index_of(&[(1, 10), (1, 10)]);
        index.relabel(1, BlockLevel::Level(2)).unwrap();
        assert!(index.verify().is_err());
        index.relabel(0, BlockLevel::Body).unwrap();
        assert!(index.verify().is_ok());

        let stats = index.level_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].level, BlockLevel::Body);
        assert_eq!(index.level_run(BlockLevel::Level(2)), Some((1, 2)));
        assert_eq!(index.level_run(BlockLevel::Level(0)), None);
    }

    #[test]
    fn test_retention_accounting() {
        let mut index = index_of(&[(1, 10), (1, 20), (1, 30)]);
        assert_eq!(index.excess_by_size(60), 0);
        assert_eq!(index.excess_by_size(50), 1);
        assert_eq!(index.excess_by_size(30), 2);
        assert_eq!(index.excess_by_size(29), 3);
        assert_eq!(index.expired_by_age(150), 2);

        let removed = index.trim_front(1);
        assert_eq!(removed[0].key.offset, 0);
        assert_eq!(index.total_size(), 50);
        assert_eq!(index.first().unwrap().cumulative_size, 20);
    }

    #[test]
    fn test_offset_for_timestamp() {
        let index = index_of(&[(2, 10), (2, 10), (2, 10)]);
        assert_eq!(index.offset_for_timestamp(0), Some(0));
        assert_eq!(index.offset_for_timestamp(50), Some(2));
        assert_eq!(index.offset_for_timestamp(200), Some(4));
        assert_eq!(index.offset_for_timestamp(201), None);
    }

    #[test]
    fn test_offset_for_timestamp_out_of_order() {
        let mut index = DataKeyIndex::new();
        for (offset, write_time_ms) in [(0, 300), (1, 100), (2, 200)] {
            index
                .push(BlockKey::new(0, offset, 1, 1), 10, write_time_ms)
                .unwrap();
        }
        assert_eq!(index.offset_for_timestamp(150), Some(0));
        assert_eq!(index.offset_for_timestamp(301), None);
    }

    #[test]
    fn test_level_tags() {
        assert_eq!(BlockLevel::from_tag(BlockLevel::Body.to_tag()), BlockLevel::Body);
        assert_eq!(BlockLevel::from_tag(3), BlockLevel::Level(3));
        assert_eq!(BlockLevel::Level(0).next(2), BlockLevel::Level(1));
        assert_eq!(BlockLevel::Level(1).next(2), BlockLevel::Body);
        assert!(BlockLevel::Body > BlockLevel::Level(200));
    }
}
