//! Bloom filter with a persistable snapshot.
//!
//! # Bit positions
//!
//! A key is fed through its `Hash` impl into a seeded XXH3 hasher. The 128-bit
//! digest is split into two 64-bit halves `h1`, `h2`, and hash `i` sets
//! bit `(h1 + i * h2) mod num_bits`. The seed is part of the snapshot, so a
//! filter restored in another process checks the same bits.
//!
//! Integers reach the hasher as little-endian bytes, with `usize` and `isize`
//! widened to 64 bits, so bit positions do not depend on the target's endianness or
//! pointer width. A snapshot is only portable for keys whose `Hash` impl is
//! deterministic: integers, strings, byte slices and derived impls over them
//! qualify; keys hashing pointers or per-process random state do not.
//!
//! # Snapshot Format
//!
//! ```text
//! +------------------------+
//! | magic "TMAPBLM\0" (8)  |
//! | version: u32           |
//! | seed: u64              |
//! | num_bits: u64          |
//! | num_hashes: u32        |
//! | expected_elements: u64 |
//! | fp_probability: f64    |
//! | count: u64             |
//! +------------------------+
//! | words: [u64]           |  ← ceil(num_bits / 64) words
//! +------------------------+
//! | crc32: u32             |  ← over everything above
//! +------------------------+
//! ```
//!
//! All integers are big-endian.

use crate::error::{Error, Result};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::f64::consts::LN_2;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::Xxh3;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MAGIC: &[u8; 8] = b"TMAPBLM\0";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 8 + 4 + 8 + 8 + 4 + 8 + 8 + 8;
const DEFAULT_SEED: u64 = 0x5350_4144_455f_4246;

#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    seed: u64,
    expected_elements: u64,
    false_positive_probability: f64,
    count: u64,
}

impl BloomFilter {
    /// Creates an empty filter sized for `expected_elements` insertions at the
    /// given false positive rate.
    pub fn new(expected_elements: u64, false_positive_probability: f64) -> Self {
        let n = expected_elements.max(1);
        let num_bits = optimal_num_bits(n, false_positive_probability);
        let num_hashes = optimal_num_hashes(num_bits, n);
        let mut filter = Self::with_size(num_bits, num_hashes);
        filter.expected_elements = n;
        filter.false_positive_probability = false_positive_probability;
        filter
    }

    /// Creates an empty filter with an explicit bit budget.
    pub fn with_size(num_bits: u64, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(1);
        Self {
            words: vec![0; words_for(num_bits)],
            num_bits,
            num_hashes: num_hashes.max(1),
            seed: DEFAULT_SEED,
            expected_elements: 0,
            false_positive_probability: 0.0,
            count: 0,
        }
    }

    pub fn insert<T: Hash + ?Sized>(&mut self, item: &T) {
        let (h1, h2) = self.hash_pair(item);
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.count = self.count.saturating_add(1);
    }

    pub fn contains<T: Hash + ?Sized>(&self, item: &T) -> bool {
        let (h1, h2) = self.hash_pair(item);
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_index(h1, h2, i);
            self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
        self.count = 0;
    }

    /// Number of insertions, duplicates included.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn expected_elements(&self) -> u64 {
        self.expected_elements
    }

    pub fn false_positive_probability(&self) -> f64 {
        self.false_positive_probability
    }

    /// False positive rate predicted from the current insertion count.
    pub fn current_false_positive_probability(&self) -> f64 {
        let k = self.num_hashes as f64;
        let exponent = -k * self.count as f64 / self.num_bits as f64;
        (1.0 - exponent.exp()).powf(k)
    }

    fn hash_pair<T: Hash + ?Sized>(&self, item: &T) -> (u64, u64) {
        let mut hasher = LeHasher(Xxh3::with_seed(self.seed));
        item.hash(&mut hasher);
        let digest = hasher.0.digest128();
        // An odd step visits distinct bits whenever num_bits is a power of two.
        (digest as u64, (digest >> 64) as u64 | 1)
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.words.len() * 8 + 4);
        buf.extend_from_slice(MAGIC);
        // Writes into a Vec cannot fail.
        let _ = buf.write_u32::<BigEndian>(VERSION);
        let _ = buf.write_u64::<BigEndian>(self.seed);
        let _ = buf.write_u64::<BigEndian>(self.num_bits);
        let _ = buf.write_u32::<BigEndian>(self.num_hashes);
        let _ = buf.write_u64::<BigEndian>(self.expected_elements);
        let _ = buf.write_f64::<BigEndian>(self.false_positive_probability);
        let _ = buf.write_u64::<BigEndian>(self.count);
        for word in &self.words {
            let _ = buf.write_u64::<BigEndian>(*word);
        }
        let checksum = CRC32.checksum(&buf);
        let _ = buf.write_u32::<BigEndian>(checksum);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + 4 {
            return Err(Error::Corrupted(format!(
                "bloom snapshot: {} bytes is shorter than the header",
                bytes.len()
            )));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = CRC32.checksum(body);
        if stored != computed {
            return Err(Error::ChecksumMismatch { computed, stored });
        }

        let mut cursor = Cursor::new(body);
        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if magic != *MAGIC {
            return Err(Error::Corrupted("bloom snapshot: invalid magic".to_string()));
        }
        let version = cursor.read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::Corrupted(format!(
                "bloom snapshot: unsupported version {}",
                version
            )));
        }
        let seed = cursor.read_u64::<BigEndian>()?;
        let num_bits = cursor.read_u64::<BigEndian>()?;
        let num_hashes = cursor.read_u32::<BigEndian>()?;
        let expected_elements = cursor.read_u64::<BigEndian>()?;
        let false_positive_probability = cursor.read_f64::<BigEndian>()?;
        let count = cursor.read_u64::<BigEndian>()?;

        if num_bits == 0 || num_hashes == 0 {
            return Err(Error::Corrupted(format!(
                "bloom snapshot: num_bits = {}, num_hashes = {}",
                num_bits, num_hashes
            )));
        }
        let num_words = words_for(num_bits);
        if body.len() - HEADER_SIZE != num_words * 8 {
            return Err(Error::Corrupted(format!(
                "bloom snapshot: expected {} words, found {} bytes",
                num_words,
                body.len() - HEADER_SIZE
            )));
        }
        let mut words = Vec::with_capacity(num_words);
        for _ in 0..num_words {
            words.push(cursor.read_u64::<BigEndian>()?);
        }

        Ok(Self {
            words,
            num_bits,
            num_hashes,
            seed,
            expected_elements,
            false_positive_probability,
            count,
        })
    }

    /// Writes a snapshot to `path`, replacing any previous one atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = temp_path(path)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&self.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::decode(&bytes)
    }
}

/// Hasher fed to XXH3 with fixed-width little-endian integers.
struct LeHasher(Xxh3);

impl Hasher for LeHasher {
    fn finish(&self) -> u64 {
        self.0.digest()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn write_u8(&mut self, i: u8) {
        self.write(&[i]);
    }

    fn write_u16(&mut self, i: u16) {
        self.write(&i.to_le_bytes());
    }

    fn write_u32(&mut self, i: u32) {
        self.write(&i.to_le_bytes());
    }

    fn write_u64(&mut self, i: u64) {
        self.write(&i.to_le_bytes());
    }

    fn write_u128(&mut self, i: u128) {
        self.write(&i.to_le_bytes());
    }

    fn write_usize(&mut self, i: usize) {
        self.write_u64(i as u64);
    }

    fn write_i8(&mut self, i: i8) {
        self.write_u8(i as u8);
    }

    fn write_i16(&mut self, i: i16) {
        self.write_u16(i as u16);
    }

    fn write_i32(&mut self, i: i32) {
        self.write_u32(i as u32);
    }

    fn write_i64(&mut self, i: i64) {
        self.write_u64(i as u64);
    }

    fn write_i128(&mut self, i: i128) {
        self.write_u128(i as u128);
    }

    fn write_isize(&mut self, i: isize) {
        self.write_i64(i as i64);
    }
}

/// `<name>.tmp` beside `path`, unique per snapshot file name.
fn temp_path(path: &Path) -> Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        Error::Config(format!(
            "bloom snapshot path has no file name: {}",
            path.display()
        ))
    })?;
    let mut tmp = name.to_os_string();
    tmp.push(".tmp");
    Ok(path.with_file_name(tmp))
}

fn words_for(num_bits: u64) -> usize {
    num_bits.div_ceil(64) as usize
}

fn optimal_num_bits(n: u64, p: f64) -> u64 {
    let bits = -(n as f64) * p.ln() / (LN_2 * LN_2);
    (bits.ceil() as u64).max(1)
}

fn optimal_num_hashes(num_bits: u64, n: u64) -> u32 {
    let k = (num_bits as f64 / n as f64) * LN_2;
    (k.round() as u32).max(1)
}
