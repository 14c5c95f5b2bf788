use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::{dir_size, remove_location, with_location, Store};
use crate::error::{Error, Result};
use crate::flock::FileLock;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const LOG_FILE: &str = "data.log";
const COMPACT_FILE: &str = "data.log.compact";

/// op (1) + key length (4) + value length (4)
const HEADER_SIZE: u64 = 9;
const TRAILER_SIZE: u64 = 4;

/// Dead bytes tolerated before a compaction is considered.
pub const COMPACTION_FLOOR: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Op {
    Put = 1,
    Delete = 2,
}

impl TryFrom<u8> for Op {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Op::Put),
            2 => Ok(Op::Delete),
            other => Err(Error::Corrupted(format!("unknown log record op {}", other))),
        }
    }
}

/// Location of a live value inside the log.
#[derive(Debug, Clone, Copy)]
struct Pointer {
    value_offset: u64,
    value_len: u32,
    record_len: u64,
}

fn record_len(key_len: usize, value_len: usize) -> u64 {
    HEADER_SIZE + key_len as u64 + value_len as u64 + TRAILER_SIZE
}

/// Record layout: op | key_len | value_len | key | value | crc32, integers
/// big endian. The checksum covers every preceding byte of the record.
fn encode_record(op: Op, key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
    let key_len = u32::try_from(key.len())
        .map_err(|_| Error::Encode("log record", format!("key of {} bytes", key.len())))?;
    let value_len = u32::try_from(value.len())
        .map_err(|_| Error::Encode("log record", format!("value of {} bytes", value.len())))?;

    let mut buf = Vec::with_capacity(record_len(key.len(), value.len()) as usize);
    buf.write_u8(op as u8)?;
    buf.write_u32::<BigEndian>(key_len)?;
    buf.write_u32::<BigEndian>(value_len)?;
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    let crc = CRC32.checksum(&buf);
    buf.write_u32::<BigEndian>(crc)?;
    Ok(buf)
}

enum Record {
    Complete {
        op: Op,
        key: Vec<u8>,
        value_len: u32,
        len: u64,
    },
    /// The record runs past the end of the file or its checksum fails and
    /// nothing follows it. Left behind by an interrupted append.
    Torn(String),
}

fn read_record<R: Read>(reader: &mut R, offset: u64, file_len: u64) -> Result<Record> {
    let remaining = file_len - offset;
    if remaining < HEADER_SIZE {
        return Ok(Record::Torn(format!("{} byte header", remaining)));
    }

    let mut header = [0u8; HEADER_SIZE as usize];
    reader.read_exact(&mut header)?;
    let mut cursor = &header[..];
    let op_byte = cursor.read_u8()?;
    let key_len = cursor.read_u32::<BigEndian>()?;
    let value_len = cursor.read_u32::<BigEndian>()?;

    let len = record_len(key_len as usize, value_len as usize);
    if len > remaining {
        // Only the last append can be cut short. If an intact record follows,
        // the length field itself is damaged.
        let mut rest = vec![0u8; (remaining - HEADER_SIZE) as usize];
        reader.read_exact(&mut rest)?;
        if let Some(at) = find_intact_record(&header, &rest) {
            return Err(Error::Corrupted(format!(
                "log record at offset {} claims {} bytes but an intact record starts at offset {}",
                offset,
                len,
                offset + at as u64
            )));
        }
        return Ok(Record::Torn(format!(
            "record of {} bytes with {} remaining",
            len, remaining
        )));
    }

    let mut body = vec![0u8; key_len as usize + value_len as usize];
    reader.read_exact(&mut body)?;
    let stored = reader.read_u32::<BigEndian>()?;

    let mut digest = CRC32.digest();
    digest.update(&header);
    digest.update(&body);
    let computed = digest.finalize();

    if computed != stored {
        if offset + len == file_len {
            return Ok(Record::Torn("checksum mismatch in last record".to_string()));
        }
        return Err(Error::Corrupted(format!(
            "log record at offset {}: {}",
            offset,
            Error::ChecksumMismatch { computed, stored }
        )));
    }

    let op = Op::try_from(op_byte)?;
    body.truncate(key_len as usize);
    Ok(Record::Complete {
        op,
        key: body,
        value_len,
        len,
    })
}

/// Returns the position, relative to the start of `header`, of the first
/// checksum-valid record beginning after it.
fn find_intact_record(header: &[u8], rest: &[u8]) -> Option<usize> {
    let mut bytes = Vec::with_capacity(header.len() + rest.len());
    bytes.extend_from_slice(header);
    bytes.extend_from_slice(rest);
    (1..bytes.len()).find(|&at| is_intact_record(&bytes[at..]))
}

fn is_intact_record(bytes: &[u8]) -> bool {
    if (bytes.len() as u64) < HEADER_SIZE + TRAILER_SIZE || Op::try_from(bytes[0]).is_err() {
        return false;
    }
    let key_len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let value_len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
    let len = record_len(key_len as usize, value_len as usize);
    if len > bytes.len() as u64 {
        return false;
    }
    let body_end = (len - TRAILER_SIZE) as usize;
    let stored = u32::from_be_bytes([
        bytes[body_end],
        bytes[body_end + 1],
        bytes[body_end + 2],
        bytes[body_end + 3],
    ]);
    CRC32.checksum(&bytes[..body_end]) == stored
}

#[derive(Default)]
struct Replay {
    index: HashMap<Vec<u8>, Pointer>,
    end: u64,
    live_bytes: u64,
    dead_bytes: u64,
}

impl Replay {
    fn apply(&mut self, op: Op, key: Vec<u8>, value_len: u32, offset: u64, len: u64) {
        match op {
            Op::Put => {
                let pointer = Pointer {
                    value_offset: offset + HEADER_SIZE + key.len() as u64,
                    value_len,
                    record_len: len,
                };
                if let Some(old) = self.index.insert(key, pointer) {
                    self.live_bytes -= old.record_len;
                    self.dead_bytes += old.record_len;
                }
                self.live_bytes += len;
            }
            Op::Delete => {
                if let Some(old) = self.index.remove(&key) {
                    self.live_bytes -= old.record_len;
                    self.dead_bytes += old.record_len;
                }
                self.dead_bytes += len;
            }
        }
        self.end = offset + len;
    }
}

/// Rebuilds the index from the log, truncating a torn tail.
fn replay(file: &File, path: &Path) -> Result<Replay> {
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(0))?;

    let mut replay = Replay::default();
    while replay.end < file_len {
        let offset = replay.end;
        match read_record(&mut reader, offset, file_len)? {
            Record::Complete {
                op,
                key,
                value_len,
                len,
            } => replay.apply(op, key, value_len, offset, len),
            Record::Torn(reason) => {
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    dropped = file_len - offset,
                    reason = %reason,
                    "Truncating torn log tail"
                );
                file.set_len(offset)?;
                file.sync_all()?;
                break;
            }
        }
    }
    Ok(replay)
}

fn open_log(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?)
}

/// Append-only record log with an in-memory index of live values.
///
/// Every mutation appends one record; a delete appends a tombstone. Reads
/// seek straight to the value. Once dead records outweigh live ones (and
/// exceed `COMPACTION_FLOOR`) the live entries are rewritten to a new file
/// that replaces the old one.
pub struct LogStore {
    dir: PathBuf,
    file: File,
    index: HashMap<Vec<u8>, Pointer>,
    end: u64,
    live_bytes: u64,
    dead_bytes: u64,
    compaction_floor: u64,
    delete_on_close: bool,
    lock: Option<FileLock>,
}

impl LogStore {
    pub fn open(dir: &Path, delete_on_close: bool) -> Result<Self> {
        with_location(dir, |dir| {
            let lock = FileLock::acquire(dir)?;

            let leftover = dir.join(COMPACT_FILE);
            if leftover.exists() {
                fs::remove_file(&leftover)?;
            }

            let path = dir.join(LOG_FILE);
            let file = open_log(&path)?;
            let replay = replay(&file, &path)?;

            tracing::debug!(
                dir = %dir.display(),
                entries = replay.index.len(),
                live_bytes = replay.live_bytes,
                dead_bytes = replay.dead_bytes,
                "Opened log store"
            );

            Ok(Self {
                dir: dir.to_path_buf(),
                file,
                index: replay.index,
                end: replay.end,
                live_bytes: replay.live_bytes,
                dead_bytes: replay.dead_bytes,
                compaction_floor: COMPACTION_FLOOR,
                delete_on_close,
                lock: Some(lock),
            })
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends a record and returns its offset.
    fn append(&mut self, op: Op, key: &[u8], value: &[u8]) -> Result<u64> {
        let record = encode_record(op, key, value)?;
        if let Err(e) = self.file.write_all(&record) {
            // Drop a partial record so later appends stay readable.
            let _ = self.file.set_len(self.end);
            return Err(e.into());
        }
        let offset = self.end;
        self.end += record.len() as u64;
        Ok(offset)
    }

    fn read_value(&self, pointer: &Pointer) -> Result<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(pointer.value_offset))?;
        let mut value = vec![0u8; pointer.value_len as usize];
        file.read_exact(&mut value)?;
        Ok(value)
    }

    fn maybe_compact(&mut self) -> Result<()> {
        if self.dead_bytes > self.live_bytes && self.dead_bytes > self.compaction_floor {
            self.compact()?;
        }
        Ok(())
    }

    /// Rewrites the live entries into a fresh log and swaps it in.
    fn compact(&mut self) -> Result<()> {
        let tmp = self.dir.join(COMPACT_FILE);
        let result = self.write_compacted(&tmp);
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        let (index, end) = result?;

        // Open before the rename so a failure leaves the old log in place.
        let file = match open_log(&tmp) {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        let path = self.dir.join(LOG_FILE);
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        self.file = file;

        tracing::debug!(
            dir = %self.dir.display(),
            reclaimed = self.dead_bytes,
            live_bytes = end,
            "Compacted log store"
        );

        self.index = index;
        self.end = end;
        self.live_bytes = end;
        self.dead_bytes = 0;
        Ok(())
    }

    fn write_compacted(&self, tmp: &Path) -> Result<(HashMap<Vec<u8>, Pointer>, u64)> {
        let mut writer = BufWriter::new(File::create(tmp)?);
        let mut index = HashMap::with_capacity(self.index.len());
        let mut end = 0;

        for (key, pointer) in &self.index {
            let value = self.read_value(pointer)?;
            let record = encode_record(Op::Put, key, &value)?;
            writer.write_all(&record)?;
            index.insert(
                key.clone(),
                Pointer {
                    value_offset: end + HEADER_SIZE + key.len() as u64,
                    value_len: pointer.value_len,
                    record_len: record.len() as u64,
                },
            );
            end += record.len() as u64;
        }

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok((index, end))
    }
}

impl Store for LogStore {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let offset = self.append(Op::Put, key, value)?;
        let len = record_len(key.len(), value.len());
        let pointer = Pointer {
            value_offset: offset + HEADER_SIZE + key.len() as u64,
            value_len: value.len() as u32,
            record_len: len,
        };
        if let Some(old) = self.index.insert(key.to_vec(), pointer) {
            self.live_bytes -= old.record_len;
            self.dead_bytes += old.record_len;
        }
        self.live_bytes += len;
        self.maybe_compact()
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.index.get(key) {
            Some(pointer) => Ok(Some(self.read_value(pointer)?)),
            None => Ok(None),
        }
    }

    fn remove(&mut self, key: &[u8]) -> Result<bool> {
        if !self.index.contains_key(key) {
            return Ok(false);
        }
        self.append(Op::Delete, key, &[])?;
        if let Some(old) = self.index.remove(key) {
            self.live_bytes -= old.record_len;
            self.dead_bytes += old.record_len;
        }
        self.dead_bytes += record_len(key.len(), 0);
        self.maybe_compact()?;
        Ok(true)
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.index.contains_key(key))
    }

    fn clear(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.index.clear();
        self.end = 0;
        self.live_bytes = 0;
        self.dead_bytes = 0;
        Ok(())
    }

    fn size_on_disk(&self) -> Result<u64> {
        dir_size(&self.dir)
    }

    fn close(&mut self) -> Result<()> {
        if self.lock.is_none() {
            return Ok(());
        }
        self.file.sync_all()?;
        self.lock = None;
        tracing::debug!(dir = %self.dir.display(), entries = self.index.len(), "Closed log store");

        if self.delete_on_close {
            remove_location(&self.dir)?;
        }
        Ok(())
    }
}
