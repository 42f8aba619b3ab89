use super::data_keys::LevelStats;
use super::state::PartitionState;

/// Point-in-time view of a partition, reported by the metrics tick and
/// returned by status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatus {
    pub partition_id: u32,
    pub state: PartitionState,
    pub start_offset: u64,
    pub head_offset: u64,
    pub end_offset: u64,
    pub head_records: usize,
    pub head_bytes: usize,
    pub body_blocks: usize,
    pub body_bytes: u64,
    pub levels: Vec<LevelStats>,
    pub source_ids: usize,
    pub queued_requests: usize,
    pub parked_reads: usize,
    pub pending_reads: usize,
    pub superseded_blocks: usize,
}

impl PartitionStatus {
    pub fn log(&self) {
        let level_blocks: Vec<_> = self
            .levels
            .iter()
            .map(|l| (l.level.to_string(), l.blocks, l.bytes))
            .collect();

        tracing::info!(
            partition = self.partition_id,
            state = self.state.name(),
            start_offset = self.start_offset,
            head_offset = self.head_offset,
            end_offset = self.end_offset,
            head_records = self.head_records,
            head_bytes = self.head_bytes,
            body_blocks = self.body_blocks,
            body_bytes = self.body_bytes,
            source_ids = self.source_ids,
            queued_requests = self.queued_requests,
            parked_reads = self.parked_reads,
            pending_reads = self.pending_reads,
            superseded_blocks = self.superseded_blocks,
            ?level_blocks,
            "Partition metrics"
        );
    }
}
