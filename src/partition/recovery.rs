//! Rebuilds partition state from its persisted namespaces.
//!
//! Recovery reads the metadata key, every body block and every source-id key
//! of the partition, then:
//!
//! 1. Drops blocks below the start offset and blocks covered by a wider
//!    block (sources of a merge whose deletion never ran); both are
//!    scheduled for deletion
//! 2. Verifies the remaining blocks are contiguous and agree with the
//!    offsets recorded in the metadata
//! 3. Restores compaction levels from the metadata summaries
//!
//! Unflushed head records are not durable, so the recovered end offset is
//! the head offset.

use super::block::BlockHeader;
use super::data_keys::{BlockLevel, DataKey, DataKeyIndex};
use super::meta::PartitionMeta;
use super::source_id::{PersistedGroup, SourceIdTracker};
use crate::config::PartitionConfig;
use crate::encoding::keycode::{self, BlockKey, PartitionKey};
use crate::encoding::{Key, Value};
use crate::error::{Error, Result};
use crate::store::{BlobStore, Entry};

/// Raw contents of the partition namespaces.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub meta: Option<Vec<u8>>,
    pub data: Vec<Entry>,
    pub source_ids: Vec<Entry>,
}

#[derive(Debug)]
pub struct Recovered {
    pub start_offset: u64,
    pub head_offset: u64,
    pub index: DataKeyIndex,
    pub groups: SourceIdTracker,
    /// Blocks left behind by interrupted compactions or trims
    pub obsolete: Vec<BlockKey>,
}

/// Reads the partition namespaces from storage.
pub async fn load(store: &dyn BlobStore, partition: u32) -> Result<Snapshot> {
    let meta_key = keycode::meta_key(partition);
    let meta = store
        .read(vec![meta_key.clone()])
        .await?
        .into_iter()
        .find(|(key, _)| *key == meta_key)
        .map(|(_, value)| value);
    let data = store.read_range(keycode::data_prefix(partition)).await?;
    let source_ids = store.read_range(keycode::source_id_prefix(partition)).await?;

    Ok(Snapshot {
        meta,
        data,
        source_ids,
    })
}

/// Rebuilds in-memory state from a snapshot.
pub fn rebuild(config: &PartitionConfig, snapshot: Snapshot) -> Result<Recovered> {
    let partition = config.partition_id;
    let meta = snapshot.meta.as_deref().map(PartitionMeta::decode).transpose()?;
    let meta_start = meta.as_ref().map_or(0, |m| m.start_offset);

    let mut blocks = Vec::with_capacity(snapshot.data.len());
    for (key, blob) in &snapshot.data {
        let key = BlockKey::decode(key)?;
        let header = BlockHeader::read(blob)?;
        if key.partition != partition
            || header.first_offset != key.offset
            || header.records != key.count
            || header.parts != key.parts
        {
            return Err(Error::InvalidData(format!(
                "block {} does not match its header {:?}",
                key, header
            )));
        }
        blocks.push((key, blob.len() as u64, header.max_write_time_ms));
    }
    blocks.sort_by_key(|(key, _, _)| (key.offset, key.count));

    let mut obsolete = Vec::new();
    let mut kept: Vec<(BlockKey, u64, u64)> = Vec::with_capacity(blocks.len());
    for block in blocks {
        if block.0.end_offset() <= meta_start {
            obsolete.push(block.0);
            continue;
        }
        while matches!(kept.last(), Some(last) if block.0.covers(&last.0)) {
            if let Some(last) = kept.pop() {
                obsolete.push(last.0);
            }
        }
        if matches!(kept.last(), Some(last) if last.0.covers(&block.0)) {
            obsolete.push(block.0);
            continue;
        }
        kept.push(block);
    }

    let levels = config.compaction.level_ceilings.len();
    let data_keys = kept
        .iter()
        .map(|(key, size, write_time_ms)| {
            let level = meta
                .as_ref()
                .and_then(|m| m.level_of(key.offset, key.end_offset()))
                .map(|level| match level {
                    BlockLevel::Level(i) if (i as usize) >= levels => BlockLevel::Body,
                    level => level,
                })
                .unwrap_or(BlockLevel::Level(0));
            DataKey {
                key: *key,
                size: *size,
                write_time_ms: *write_time_ms,
                cumulative_size: 0,
                level,
            }
        })
        .collect();
    let index = DataKeyIndex::from_blocks(data_keys)?;

    let head_offset = match (index.end_offset(), &meta) {
        (Some(end), Some(meta)) if end != meta.head_offset => {
            return Err(Error::InvalidState(format!(
                "body ends at {} but metadata records head offset {}",
                end, meta.head_offset
            )));
        }
        (Some(end), _) => end,
        (None, Some(meta)) => meta.head_offset,
        (None, None) => 0,
    };
    let start_offset = match index.first() {
        Some(first) if first.key.offset > meta_start => {
            tracing::warn!(
                partition,
                meta_start,
                first_block = first.key.offset,
                "Body starts after recorded start offset"
            );
            first.key.offset
        }
        _ if meta.is_none() => index.first().map_or(head_offset, |k| k.key.offset),
        _ => meta_start,
    };
    if start_offset > head_offset {
        return Err(Error::InvalidState(format!(
            "start offset {} is beyond head offset {}",
            start_offset, head_offset
        )));
    }

    let mut groups = Vec::with_capacity(snapshot.source_ids.len());
    for (key, value) in &snapshot.source_ids {
        match PartitionKey::decode(key)? {
            PartitionKey::SourceId { source_id, .. } => {
                groups.push((source_id, PersistedGroup::decode(value)?));
            }
            other => {
                return Err(Error::InvalidData(format!(
                    "unexpected key in source-id namespace: {:?}",
                    other
                )))
            }
        }
    }

    tracing::info!(
        partition,
        start_offset,
        head_offset,
        blocks = index.len(),
        body_bytes = index.total_size(),
        groups = groups.len(),
        obsolete = obsolete.len(),
        "Recovered partition state"
    );

    Ok(Recovered {
        start_offset,
        head_offset,
        index,
        groups: SourceIdTracker::restore(groups),
        obsolete,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompactionConfig;
    use crate::partition::block;
    use crate::partition::meta::LevelSummary;
    use crate::partition::record::RecordPart;

    fn block_entry(offset: u64, count: u64) -> Entry {
        let parts: Vec<_> = (offset..offset + count)
            .map(|o| RecordPart {
                offset: o,
                part_no: 0,
                total_parts: 1,
                source_id: "p".into(),
                seq_no: o + 1,
                write_time_ms: o,
                data: vec![1, 2, 3],
            })
            .collect();
        let key = BlockKey::new(0, offset, count as u32, count as u32);
        (key.encode(), block::encode(&parts).unwrap())
    }

    fn config() -> PartitionConfig {
        PartitionConfig::new(0).compaction(CompactionConfig::default().level_ceilings(vec![10, 20]))
    }

    fn meta(start: u64, head: u64, levels: Vec<LevelSummary>) -> Option<Vec<u8>> {
        Some(
            PartitionMeta {
                start_offset: start,
                head_offset: head,
                end_offset: head,
                levels,
            }
            .encode()
            .unwrap(),
        )
    }

    #[test]
    fn test_empty_partition() -> Result<()> {
        let recovered = rebuild(&config(), Snapshot::default())?;
        assert_eq!((recovered.start_offset, recovered.head_offset), (0, 0));
        assert!(recovered.index.is_empty());
        Ok(())
    }

    #[test]
    fn test_covered_blocks_are_dropped() -> Result<()> {
        let snapshot = Snapshot {
            meta: meta(
                0,
                4,
                vec![LevelSummary {
                    level: BlockLevel::Level(1),
                    first_offset: 0,
                    end_offset: 3,
                    blocks: 1,
                    bytes: 100,
                }],
            ),
            data: vec![
                block_entry(0, 1),
                block_entry(0, 3),
                block_entry(1, 1),
                block_entry(2, 1),
                block_entry(3, 1),
            ],
            source_ids: Vec::new(),
        };

        let recovered = rebuild(&config(), snapshot)?;
        let keys: Vec<_> = recovered.index.iter().map(|k| (k.key.offset, k.key.count, k.level)).collect();
        assert_eq!(
            keys,
            vec![(0, 3, BlockLevel::Level(1)), (3, 1, BlockLevel::Level(0))]
        );
        assert_eq!(recovered.obsolete.len(), 3);
        assert_eq!(recovered.head_offset, 4);
        Ok(())
    }

    #[test]
    fn test_trimmed_blocks_are_dropped() -> Result<()> {
        let snapshot = Snapshot {
            meta: meta(2, 4, Vec::new()),
            data: vec![block_entry(0, 2), block_entry(2, 2)],
            source_ids: Vec::new(),
        };
        let recovered = rebuild(&config(), snapshot)?;
        assert_eq!(recovered.start_offset, 2);
        assert_eq!(recovered.index.len(), 1);
        assert_eq!(recovered.obsolete, vec![BlockKey::new(0, 0, 2, 2)]);
        Ok(())
    }

    #[test]
    fn test_gap_is_an_error() {
        let snapshot = Snapshot {
            meta: meta(0, 4, Vec::new()),
            data: vec![block_entry(0, 1), block_entry(2, 2)],
            source_ids: Vec::new(),
        };
        assert!(rebuild(&config(), snapshot).is_err());
    }

    #[test]
    fn test_head_mismatch_is_an_error() {
        let snapshot = Snapshot {
            meta: meta(0, 9, Vec::new()),
            data: vec![block_entry(0, 2)],
            source_ids: Vec::new(),
        };
        assert!(matches!(
            rebuild(&config(), snapshot),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_source_ids_restored() -> Result<()> {
        let key = PartitionKey::SourceId {
            partition: 0,
            source_id: "producer".into(),
        }
        .encode();
        let value = PersistedGroup {
            seq_no: 5,
            offset: Some(1),
            explicit: false,
            key_range: None,
            last_write_ms: 1_000,
        }
        .encode()?;
        let snapshot = Snapshot {
            meta: meta(0, 2, Vec::new()),
            data: vec![block_entry(0, 2)],
            source_ids: vec![(key, value)],
        };

        let recovered = rebuild(&config(), snapshot)?;
        let group = recovered.groups.get("producer").unwrap();
        assert_eq!((group.seq_no, group.last_write_ms), (5, 1_000));
        Ok(())
    }
}
