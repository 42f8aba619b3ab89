//! The metadata key of a partition.
//!
//! ```text
//! +---------------------------------------------------------------+
//! | magic:u32 | version:u16                                       |
//! | start_offset:u64 | head_offset:u64 | end_offset:u64           |
//! | level_count:u32                                               |
//! |   level:u8 | first_offset:u64 | end_offset:u64                |
//! |   blocks:u32 | bytes:u64                         x level_count |
//! | crc32:u32                                                     |
//! +---------------------------------------------------------------+
//! ```

use std::io::{self, Cursor};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::data_keys::{BlockLevel, LevelStats};
use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const MAGIC: u32 = 0x4153_484D; // "ASHM"
const VERSION: u16 = 1;

/// Summary of one level run along the offset axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelSummary {
    pub level: BlockLevel,
    pub first_offset: u64,
    pub end_offset: u64,
    pub blocks: u32,
    pub bytes: u64,
}

impl LevelSummary {
    pub fn covers(&self, offset: u64, end_offset: u64) -> bool {
        offset >= self.first_offset && end_offset <= self.end_offset
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_u8(self.level.to_tag())?;
        buf.write_u64::<BigEndian>(self.first_offset)?;
        buf.write_u64::<BigEndian>(self.end_offset)?;
        buf.write_u32::<BigEndian>(self.blocks)?;
        buf.write_u64::<BigEndian>(self.bytes)?;
        Ok(())
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> io::Result<Self> {
        Ok(Self {
            level: BlockLevel::from_tag(cursor.read_u8()?),
            first_offset: cursor.read_u64::<BigEndian>()?,
            end_offset: cursor.read_u64::<BigEndian>()?,
            blocks: cursor.read_u32::<BigEndian>()?,
            bytes: cursor.read_u64::<BigEndian>()?,
        })
    }
}

impl From<&LevelStats> for LevelSummary {
    fn from(stats: &LevelStats) -> Self {
        Self {
            level: stats.level,
            first_offset: stats.first_offset,
            end_offset: stats.end_offset,
            blocks: stats.blocks as u32,
            bytes: stats.bytes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionMeta {
    pub start_offset: u64,
    pub head_offset: u64,
    pub end_offset: u64,
    pub levels: Vec<LevelSummary>,
}

impl PartitionMeta {
    /// Level recorded for the block `[offset, end_offset)`, if any run covers it.
    pub fn level_of(&self, offset: u64, end_offset: u64) -> Option<BlockLevel> {
        self.levels
            .iter()
            .find(|l| l.covers(offset, end_offset))
            .map(|l| l.level)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(34 + self.levels.len() * 29 + 4);
        self.encode_body(&mut buf)
            .map_err(|e| Error::Encode("partition meta", e))?;
        let checksum = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(checksum)?;
        Ok(buf)
    }

    fn encode_body(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_u32::<BigEndian>(MAGIC)?;
        buf.write_u16::<BigEndian>(VERSION)?;
        buf.write_u64::<BigEndian>(self.start_offset)?;
        buf.write_u64::<BigEndian>(self.head_offset)?;
        buf.write_u64::<BigEndian>(self.end_offset)?;
        buf.write_u32::<BigEndian>(self.levels.len() as u32)?;
        for level in &self.levels {
            level.encode_into(buf)?;
        }
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::Decode(
                "partition meta",
                io::Error::new(io::ErrorKind::UnexpectedEof, "Data too short"),
            ));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = (&trailer[..]).read_u32::<BigEndian>()?;
        if CRC32.checksum(body) != stored {
            return Err(Error::ChecksumMismatch);
        }

        let mut cursor = Cursor::new(body);
        Self::decode_body(&mut cursor).map_err(|e| Error::Decode("partition meta", e))
    }

    fn decode_body(cursor: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid magic {:#010x}", magic),
            ));
        }
        let version = cursor.read_u16::<BigEndian>()?;
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported version {}", version),
            ));
        }
        let start_offset = cursor.read_u64::<BigEndian>()?;
        let head_offset = cursor.read_u64::<BigEndian>()?;
        let end_offset = cursor.read_u64::<BigEndian>()?;
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let mut levels = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            levels.push(LevelSummary::decode_from(cursor)?);
        }
        Ok(Self {
            start_offset,
            head_offset,
            end_offset,
            levels,
        })
    }
}
