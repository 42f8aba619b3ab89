/// One stored part of a record. Every part of a record shares the record's
/// offset and carries its producer metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPart {
    pub offset: u64,
    pub part_no: u16,
    pub total_parts: u16,
    pub source_id: String,
    pub seq_no: u64,
    pub write_time_ms: u64,
    pub data: Vec<u8>,
}

impl RecordPart {
    pub fn is_last(&self) -> bool {
        self.part_no + 1 == self.total_parts
    }

    /// Approximate in-memory and on-disk footprint.
    pub fn size(&self) -> usize {
        self.data.len() + self.source_id.len() + 32
    }
}

/// A record as handed to readers, reassembled from its parts.
///
/// `part_no` is the first part included; it is non-zero only for the first
/// record of a read that started in the middle of a split record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    pub part_no: u16,
    pub source_id: String,
    pub seq_no: u64,
    pub write_time_ms: u64,
    pub data: Vec<u8>,
}

/// Splits write payload parts so that no stored part exceeds `max_part_size`.
/// Empty parts are dropped.
pub fn split_parts(parts: Vec<Vec<u8>>, max_part_size: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        if part.len() <= max_part_size {
            if !part.is_empty() {
                out.push(part);
            }
            continue;
        }
        out.extend(part.chunks(max_part_size).map(<[u8]>::to_vec));
    }
    out
}

/// Number of parts [`split_parts`] would produce.
pub fn part_count(parts: &[Vec<u8>], max_part_size: usize) -> usize {
    let max_part_size = max_part_size.max(1);
    parts
        .iter()
        .map(|part| (part.len() + max_part_size - 1) / max_part_size)
        .sum()
}

/// Folds consecutive parts into records, in offset order.
///
/// Parts of one offset must be adjacent and in part order; the first record
/// may start at any part number.
pub fn assemble(parts: impl IntoIterator<Item = RecordPart>) -> Vec<Record> {
    let mut records: Vec<Record> = Vec::new();
    for part in parts {
        match records.last_mut() {
            Some(last) if last.offset == part.offset => last.data.extend_from_slice(&part.data),
            _ => records.push(Record {
                offset: part.offset,
                part_no: part.part_no,
                source_id: part.source_id,
                seq_no: part.seq_no,
                write_time_ms: part.write_time_ms,
                data: part.data,
            }),
        }
    }
    records
}
