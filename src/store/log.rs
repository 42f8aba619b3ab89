//! File-backed [`BlobStore`]: an append-only log of write batches.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (16 bytes)|   magic "ASHQLOG\0" | version:u32 | reserved:u32
//! +------------------+
//! | Frame 1          |
//! +------------------+
//! | Frame 2          |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Frame Format
//!
//! Each frame holds exactly one [`WriteBatch`], which makes batches atomic:
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | encoded batch    |crc32:u32  |
//! +-----------+------------------+-----------+
//! ```
//!
//! On open the log is replayed into an in-memory map. A frame that is cut short
//! or fails its checksum marks the end of the valid log (a write torn by a
//! crash) and the file is truncated there. When the file grows well beyond the
//! live data it is checkpointed: the live map is written as a single frame to
//! a temporary file that atomically replaces the log.
//!
//! File writes, syncs and map copies run on tokio's blocking pool.

use super::{prefix_range, BlobStore, Entry, WriteBatch};
use crate::error::{Error, Result};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const MAGIC: &[u8; 8] = b"ASHQLOG\0";
const VERSION: u32 = 1;
const HEADER_SIZE: u64 = 16;
const LOG_FILE: &str = "blobs.log";
const CHECKPOINT_FILE: &str = "blobs.log.tmp";
/// Checkpoint once the log is this many times larger than the live data
const CHECKPOINT_RATIO: u64 = 4;
const MIN_CHECKPOINT_SIZE: u64 = 4 << 20;
// ENOSPC / EDQUOT on Linux
const NO_SPACE_ERRNOS: [i32; 2] = [28, 122];

struct Inner {
    file: File,
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    file_len: u64,
    live_bytes: u64,
}

pub struct LogStore {
    dir: PathBuf,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore").field("dir", &self.dir).finish()
    }
}

impl LogStore {
    /// Opens (or creates) the store in `dir`, replaying the existing log.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            write_header(&mut file)?;
            file.sync_all()?;
        } else {
            read_header(&mut file)?;
        }

        let (data, valid_len) = replay(&file)?;
        let actual_len = file.metadata()?.len();
        if valid_len < actual_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                actual_len,
                "Truncating torn tail of blob log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        let live_bytes = live_size(&data);
        tracing::info!(
            path = %path.display(),
            entries = data.len(),
            live_bytes,
            "Opened blob log"
        );

        Ok(Self {
            dir,
            inner: Arc::new(Mutex::new(Inner {
                file,
                data,
                file_len: valid_len,
                live_bytes,
            })),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Runs `f` against the locked log on the blocking pool.
    async fn with_inner<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Inner, &Path) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock()?;
            f(&mut guard, &dir)
        })
        .await
        .map_err(|e| Error::StorageUnavailable(format!("blob log task failed: {}", e)))?
    }
}

impl Inner {
    fn append(&mut self, dir: &Path, batch: WriteBatch) -> Result<()> {
        let frame = encode_frame(&encode_batch(&batch));
        let start = self.file_len;
        if let Err(e) = self.file.write_all(&frame).and_then(|_| self.file.sync_data()) {
            // Leave no partial frame behind so later appends stay readable.
            let _ = self.file.set_len(start);
            let _ = self.file.seek(SeekFrom::Start(start));
            return Err(classify(e));
        }
        self.file_len += frame.len() as u64;

        for key in batch.deletes {
            if let Some(value) = self.data.remove(&key) {
                self.live_bytes -= (key.len() + value.len()) as u64;
            }
        }
        for (key, value) in batch.puts {
            let added = (key.len() + value.len()) as u64;
            if let Some(old) = self.data.insert(key.clone(), value) {
                self.live_bytes -= (key.len() + old.len()) as u64;
            }
            self.live_bytes += added;
        }

        if self.file_len > MIN_CHECKPOINT_SIZE
            && self.file_len > self.live_bytes.saturating_mul(CHECKPOINT_RATIO)
        {
            if let Err(e) = self.checkpoint(dir) {
                // The log itself is intact; the next append tries again.
                tracing::warn!(error = %e, "Blob log checkpoint failed");
            }
        }
        Ok(())
    }

    fn checkpoint(&mut self, dir: &Path) -> Result<()> {
        let tmp_path = dir.join(CHECKPOINT_FILE);
        let mut tmp = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp_path)?;

        let snapshot = WriteBatch {
            puts: self
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            deletes: Vec::new(),
        };
        write_header(&mut tmp)?;
        let frame = encode_frame(&encode_batch(&snapshot));
        tmp.write_all(&frame)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, dir.join(LOG_FILE))?;
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }

        let old_len = self.file_len;
        self.file_len = HEADER_SIZE + frame.len() as u64;
        self.file = tmp;
        tracing::info!(
            old_len,
            new_len = self.file_len,
            entries = self.data.len(),
            "Checkpointed blob log"
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobStore for LogStore {
    async fn write(&self, batch: WriteBatch) -> Result<()> {
        self.with_inner(move |inner, dir| inner.append(dir, batch)).await
    }

    async fn read(&self, keys: Vec<Vec<u8>>) -> Result<Vec<Entry>> {
        self.with_inner(move |inner, _| {
            Ok(keys
                .into_iter()
                .filter_map(|key| inner.data.get(&key).cloned().map(|value| (key, value)))
                .collect())
        })
        .await
    }

    async fn read_range(&self, prefix: Vec<u8>) -> Result<Vec<Entry>> {
        self.with_inner(move |inner, _| {
            Ok(inner
                .data
                .range(prefix_range(&prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        })
        .await
    }
}

fn classify(err: io::Error) -> Error {
    match err.raw_os_error() {
        Some(code) if NO_SPACE_ERRNOS.contains(&code) => Error::StorageFull(err.to_string()),
        _ => Error::StorageUnavailable(err.to_string()),
    }
}

fn live_size(data: &BTreeMap<Vec<u8>, Vec<u8>>) -> u64 {
    data.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum()
}

fn write_header(file: &mut File) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
    buf.extend_from_slice(MAGIC);
    buf.write_u32::<BigEndian>(VERSION)?;
    buf.write_u32::<BigEndian>(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    Ok(())
}

fn read_header(file: &mut File) -> Result<()> {
    let mut buf = [0u8; HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)
        .map_err(|e| Error::Decode("blob log header", e))?;
    if &buf[0..8] != MAGIC {
        return Err(Error::InvalidData("Invalid blob log magic number".into()));
    }
    let version = (&buf[8..12]).read_u32::<BigEndian>()?;
    if version != VERSION {
        return Err(Error::InvalidData(format!(
            "Unsupported blob log version: {}",
            version
        )));
    }
    Ok(())
}

/// Replays all intact frames, returning the resulting map and the length of
/// the valid prefix of the file.
fn replay(file: &File) -> Result<(BTreeMap<Vec<u8>, Vec<u8>>, u64)> {
    let mut reader = BufReader::new(file.try_clone()?);
    reader.seek(SeekFrom::Start(HEADER_SIZE))?;

    let mut data = BTreeMap::new();
    let mut valid_len = HEADER_SIZE;

    loop {
        let payload = match read_frame(&mut reader)? {
            Some(payload) => payload,
            None => break,
        };
        let batch = match decode_batch(&payload) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(offset = valid_len, error = %e, "Undecodable blob log frame");
                break;
            }
        };
        for key in batch.deletes {
            data.remove(&key);
        }
        for (key, value) in batch.puts {
            data.insert(key, value);
        }
        valid_len += 8 + payload.len() as u64;
    }

    Ok((data, valid_len))
}

/// Reads one frame. Returns `None` at end of file or at the first torn or
/// corrupted frame.
fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let stored_checksum = match reader.read_u32::<BigEndian>() {
        Ok(checksum) => checksum,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if CRC32.checksum(&payload) != stored_checksum {
        tracing::warn!(len, "Checksum mismatch in blob log frame");
        return Ok(None);
    }
    Ok(Some(payload))
}

fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&CRC32.checksum(payload).to_be_bytes());
    frame
}

fn encode_batch(batch: &WriteBatch) -> Vec<u8> {
    let mut buf = Vec::with_capacity(batch.size() + 16);
    buf.extend_from_slice(&(batch.deletes.len() as u32).to_be_bytes());
    for key in &batch.deletes {
        buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
        buf.extend_from_slice(key);
    }
    buf.extend_from_slice(&(batch.puts.len() as u32).to_be_bytes());
    for (key, value) in &batch.puts {
        buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        buf.extend_from_slice(value);
    }
    buf
}

fn decode_batch(bytes: &[u8]) -> Result<WriteBatch> {
    fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
        let len = cursor.read_u32::<BigEndian>()? as usize;
        let remaining = cursor.get_ref().len() - cursor.position() as usize;
        if len > remaining {
            return Err(Error::Decode(
                "blob log entry",
                io::Error::new(io::ErrorKind::UnexpectedEof, "length exceeds frame"),
            ));
        }
        let mut buf = vec![0u8; len];
        cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    let mut cursor = Cursor::new(bytes);
    let mut batch = WriteBatch::new();

    let deletes = cursor.read_u32::<BigEndian>()?;
    for _ in 0..deletes {
        batch.deletes.push(read_bytes(&mut cursor)?);
    }
    let puts = cursor.read_u32::<BigEndian>()?;
    for _ in 0..puts {
        let key = read_bytes(&mut cursor)?;
        let value = read_bytes(&mut cursor)?;
        batch.puts.push((key, value));
    }
    Ok(batch)
}

/// Returns true when `dir` already holds a blob log.
pub fn exists(dir: &Path) -> bool {
    dir.join(LOG_FILE).exists()
}
