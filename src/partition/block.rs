//! Serialized body blocks.
//!
//! A block holds the parts of a contiguous run of records in offset order:
//!
//! ```text
//! +--------------------------------------------------------------+
//! | magic:u32 | version:u16 | parts:u32 | records:u32            |
//! | first_offset:u64 | max_write_time_ms:u64                     |
//! +--------------------------------------------------------------+
//! | offset:u64 | part_no:u16 | total_parts:u16 | seq_no:u64      |
//! | write_time_ms:u64 | source_len:u16 | source | data_len:u32   |
//! | data                                                         |  x parts
//! +--------------------------------------------------------------+
//! | crc32:u32 (over everything above)                            |
//! +--------------------------------------------------------------+
//! ```
//!
//! The header alone is enough to rebuild the block index on recovery.

use std::io::{self, Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::record::RecordPart;
use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const MAGIC: u32 = 0x4153_4842; // "ASHB"
const VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 30;
const TRAILER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub parts: u32,
    pub records: u32,
    pub first_offset: u64,
    pub max_write_time_ms: u64,
}

impl BlockHeader {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u32::<BigEndian>(MAGIC)?;
        buf.write_u16::<BigEndian>(VERSION)?;
        buf.write_u32::<BigEndian>(self.parts)?;
        buf.write_u32::<BigEndian>(self.records)?;
        buf.write_u64::<BigEndian>(self.first_offset)?;
        buf.write_u64::<BigEndian>(self.max_write_time_ms)?;
        Ok(())
    }

    /// Reads the header without verifying the rest of the block.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + TRAILER_SIZE {
            return Err(Error::Decode(
                "block header",
                io::Error::new(io::ErrorKind::UnexpectedEof, "Data too short"),
            ));
        }
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(Error::InvalidData(format!(
                "Invalid block magic: {:#010x}",
                magic
            )));
        }
        let version = cursor.read_u16::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::InvalidData(format!(
                "Unsupported block version: {}",
                version
            )));
        }
        Ok(Self {
            parts: cursor.read_u32::<BigEndian>()?,
            records: cursor.read_u32::<BigEndian>()?,
            first_offset: cursor.read_u64::<BigEndian>()?,
            max_write_time_ms: cursor.read_u64::<BigEndian>()?,
        })
    }
}

/// Accumulates record parts into a block blob.
pub struct Builder {
    buffer: Vec<u8>,
    parts: u32,
    records: u32,
    first_offset: Option<u64>,
    last_offset: Option<u64>,
    max_write_time_ms: u64,
}

impl Builder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            parts: 0,
            records: 0,
            first_offset: None,
            last_offset: None,
            max_write_time_ms: 0,
        }
    }

    pub fn add(&mut self, part: &RecordPart) -> Result<()> {
        if let Some(last) = self.last_offset {
            if part.offset < last {
                return Err(Error::InvalidOperation(format!(
                    "block parts out of order: {} after {}",
                    part.offset, last
                )));
            }
        }
        if self.last_offset != Some(part.offset) {
            self.records += 1;
        }
        self.first_offset.get_or_insert(part.offset);
        self.last_offset = Some(part.offset);
        self.parts += 1;
        self.max_write_time_ms = self.max_write_time_ms.max(part.write_time_ms);

        let source = part.source_id.as_bytes();
        if source.len() > u16::MAX as usize {
            return Err(Error::Encode(
                "record source id",
                io::Error::new(io::ErrorKind::InvalidInput, "source id too long"),
            ));
        }

        self.buffer.write_u64::<BigEndian>(part.offset)?;
        self.buffer.write_u16::<BigEndian>(part.part_no)?;
        self.buffer.write_u16::<BigEndian>(part.total_parts)?;
        self.buffer.write_u64::<BigEndian>(part.seq_no)?;
        self.buffer.write_u64::<BigEndian>(part.write_time_ms)?;
        self.buffer.write_u16::<BigEndian>(source.len() as u16)?;
        self.buffer.extend_from_slice(source);
        self.buffer.write_u32::<BigEndian>(part.data.len() as u32)?;
        self.buffer.extend_from_slice(&part.data);
        Ok(())
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let header = BlockHeader {
            parts: self.parts,
            records: self.records,
            first_offset: self.first_offset.unwrap_or_default(),
            max_write_time_ms: self.max_write_time_ms,
        };
        let mut blob = Vec::with_capacity(HEADER_SIZE + self.buffer.len() + TRAILER_SIZE);
        header.encode_into(&mut blob)?;
        blob.extend_from_slice(&self.buffer);
        let checksum = CRC32.checksum(&blob);
        blob.write_u32::<BigEndian>(checksum)?;
        Ok(blob)
    }

    pub fn part_count(&self) -> u32 {
        self.parts
    }

    pub fn record_count(&self) -> u32 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.parts == 0
    }
}

/// Verifies and decodes a whole block.
pub fn decode(bytes: &[u8]) -> Result<(BlockHeader, Vec<RecordPart>)> {
    let header = BlockHeader::read(bytes)?;

    let (body, trailer) = bytes.split_at(bytes.len() - TRAILER_SIZE);
    let stored = (&trailer[..]).read_u32::<BigEndian>()?;
    if CRC32.checksum(body) != stored {
        return Err(Error::ChecksumMismatch);
    }

    let mut cursor = Cursor::new(&body[HEADER_SIZE..]);
    let mut parts = Vec::with_capacity(header.parts as usize);
    for _ in 0..header.parts {
        parts.push(decode_part(&mut cursor).map_err(|e| Error::Decode("block part", e))?);
    }
    if (cursor.position() as usize) != body.len() - HEADER_SIZE {
        return Err(Error::InvalidData("trailing bytes in block".into()));
    }
    Ok((header, parts))
}

fn decode_part(cursor: &mut Cursor<&[u8]>) -> io::Result<RecordPart> {
    let offset = cursor.read_u64::<BigEndian>()?;
    let part_no = cursor.read_u16::<BigEndian>()?;
    let total_parts = cursor.read_u16::<BigEndian>()?;
    let seq_no = cursor.read_u64::<BigEndian>()?;
    let write_time_ms = cursor.read_u64::<BigEndian>()?;

    let source_len = cursor.read_u16::<BigEndian>()? as usize;
    let mut source = vec![0u8; source_len];
    cursor.read_exact(&mut source)?;
    let source_id = String::from_utf8(source)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let data_len = cursor.read_u32::<BigEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if data_len > remaining {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "part data exceeds block",
        ));
    }
    let mut data = vec![0u8; data_len];
    cursor.read_exact(&mut data)?;

    Ok(RecordPart {
        offset,
        part_no,
        total_parts,
        source_id,
        seq_no,
        write_time_ms,
        data,
    })
}

/// Serializes parts into a block blob.
pub fn encode(parts: &[RecordPart]) -> Result<Vec<u8>> {
    let mut builder = Builder::new();
    for part in parts {
        builder.add(part)?;
    }
    builder.finish()
}
