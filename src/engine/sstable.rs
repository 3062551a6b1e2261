//! CONCLAVE - SSTable (Sorted String Table)
//! Immutable on-disk segment produced by a flush or a compaction.
//!
//! ## File Format
//! Newline-delimited records in ascending key order, one line per key,
//! encoded with [`codec`]. Segment files are named `<stem>.<generation>`;
//! `<stem>.<generation>-0` is an in-progress write that becomes a segment
//! only once renamed.
//!
//! ## Sparse Index
//! Built lazily on the first lookup. The first line is always sampled;
//! after that a line is sampled once its offset lies more than
//! `floor(file_len * ratio)` bytes past the previous sample. A lookup
//! binary-searches the samples and scans only the bracketed byte range.

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ConclaveError, Result};
use crate::types::{Lookup, Presence, Record};

use super::codec;

/// Suffix appended to a segment name while it is being written.
const PENDING_SUFFIX: &str = "-0";

/// What a file name in a data directory means for a given stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFile {
    /// A complete segment with its generation number.
    Segment(u64),
    /// Output of an interrupted flush or compaction.
    Pending(u64),
}

impl SegmentFile {
    /// Classify `file_name` relative to the engine stem. Returns `None` for
    /// the WAL itself and for files belonging to other stems.
    pub fn parse(stem: &str, file_name: &str) -> Option<Self> {
        let suffix = file_name.strip_prefix(stem)?.strip_prefix('.')?;
        let (digits, pending) = match suffix.strip_suffix(PENDING_SUFFIX) {
            Some(digits) => (digits, true),
            None => (suffix, false),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let generation = digits.parse().ok()?;
        Some(if pending {
            SegmentFile::Pending(generation)
        } else {
            SegmentFile::Segment(generation)
        })
    }

    /// File name of a complete segment.
    pub fn segment_name(stem: &str, generation: u64) -> String {
        format!("{stem}.{generation}")
    }

    /// File name of the temporary output for `generation`.
    pub fn pending_name(stem: &str, generation: u64) -> String {
        format!("{stem}.{generation}{PENDING_SUFFIX}")
    }
}

/// One sample of the sparse index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: String,
    /// Byte offset of the start of the sampled line.
    pub offset: u64,
    pub tombstone: bool,
}

/// Immutable handle on one segment file.
///
/// The file is opened once; the handle keeps working after the path is
/// replaced by a compaction, so readers holding an older registry snapshot
/// still see consistent data.
#[derive(Debug)]
pub struct SSTable {
    path: PathBuf,
    generation: u64,
    file_len: u64,
    ratio: f64,
    reader: Mutex<BufReader<File>>,
    index: Mutex<Option<Arc<Vec<IndexEntry>>>>,
}

impl SSTable {
    /// Open an existing segment file.
    pub fn open(path: impl Into<PathBuf>, generation: u64, ratio: f64) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            path,
            generation,
            file_len,
            ratio,
            reader: Mutex::new(BufReader::new(file)),
            index: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Size of the segment file in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_len
    }

    fn reader(&self) -> MutexGuard<'_, BufReader<File>> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The sparse index, built on first use and cached for the lifetime
    /// of this handle.
    pub fn index(&self) -> Result<Arc<Vec<IndexEntry>>> {
        let mut slot = self.index.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(index) = slot.as_ref() {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(self.build_index()?);
        log::debug!(
            "built index for {:?}: {} samples over {} bytes",
            self.path,
            index.len(),
            self.file_len
        );
        *slot = Some(Arc::clone(&index));
        Ok(index)
    }

    fn build_index(&self) -> Result<Vec<IndexEntry>> {
        let step = (self.file_len as f64 * self.ratio).floor() as u64;
        let mut reader = self.reader();
        reader.seek(SeekFrom::Start(0))?;

        let mut index = Vec::new();
        let mut last: Option<u64> = None;
        let mut offset = 0u64;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }
            let sample = match last {
                None => true,
                Some(prev) => offset > prev + step,
            };
            if sample {
                let (key, tombstone) = codec::decode_key(&line)?;
                index.push(IndexEntry {
                    key,
                    offset,
                    tombstone,
                });
                last = Some(offset);
            }
            offset += read as u64;
        }
        Ok(index)
    }

    /// Point lookup.
    pub fn lookup(&self, key: &str) -> Result<Lookup> {
        let found = self.seek_line(key, |line| {
            let (_, record) = codec::decode_line(line)?;
            Ok(match record {
                Record::Value(value) => Lookup::Value(value),
                Record::Tombstone => Lookup::Tombstone,
            })
        })?;
        Ok(found.unwrap_or(Lookup::Absent))
    }

    /// Existence check that never decodes a value.
    pub fn contains_key(&self, key: &str) -> Result<Presence> {
        let index = self.index()?;
        if let Ok(at) = index.binary_search_by(|entry| entry.key.as_str().cmp(key)) {
            return Ok(presence(index[at].tombstone));
        }
        let found = self.seek_line(key, |line| {
            let (_, tombstone) = codec::decode_key(line)?;
            Ok(presence(tombstone))
        })?;
        Ok(found.unwrap_or(Presence::Absent))
    }

    /// Locate the line holding `key` and hand it to `decode`.
    fn seek_line<T>(&self, key: &str, decode: impl Fn(&[u8]) -> Result<T>) -> Result<Option<T>> {
        let index = self.index()?;
        let (start, end) = match index.binary_search_by(|entry| entry.key.as_str().cmp(key)) {
            Ok(at) => {
                let mut reader = self.reader();
                let line = read_line_at(&mut reader, index[at].offset)?;
                return decode(&line).map(Some);
            }
            // Smaller than the first key in the file.
            Err(0) => return Ok(None),
            Err(at) => (
                index[at - 1].offset,
                index.get(at).map_or(self.file_len, |entry| entry.offset),
            ),
        };

        let mut reader = self.reader();
        reader.seek(SeekFrom::Start(start))?;
        let mut offset = start;
        let mut line = Vec::new();
        while offset < end {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }
            offset += read as u64;
            let (line_key, _) = codec::decode_key(&line)?;
            match line_key.as_str().cmp(key) {
                Ordering::Less => continue,
                Ordering::Equal => return decode(&line).map(Some),
                Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Write sorted records to `path`, replacing any existing file.
    /// Returns the number of records written.
    pub fn write<'a, I>(path: &Path, records: I) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a String, &'a Record)>,
    {
        let mut writer = SSTableWriter::create(path)?;
        for (key, record) in records {
            writer.append(key, record)?;
        }
        writer.finish()
    }
}

fn presence(tombstone: bool) -> Presence {
    if tombstone {
        Presence::Tombstone
    } else {
        Presence::Present
    }
}

fn read_line_at(reader: &mut BufReader<File>, offset: u64) -> Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    Ok(line)
}

/// Streaming writer enforcing strictly ascending keys.
pub struct SSTableWriter {
    path: PathBuf,
    out: BufWriter<File>,
    last_key: Option<String>,
    count: usize,
}

impl SSTableWriter {
    /// Create (or truncate) the output file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            last_key: None,
            count: 0,
        })
    }

    pub fn append(&mut self, key: &str, record: &Record) -> Result<()> {
        if let Some(last) = &self.last_key {
            if last.as_str() >= key {
                return Err(ConclaveError::Corruption(format!(
                    "segment {:?}: key {:?} written after {:?}",
                    self.path, key, last
                )));
            }
        }
        self.out.write_all(codec::encode(key, record).as_bytes())?;
        self.last_key = Some(key.to_string());
        self.count += 1;
        Ok(())
    }

    /// Flush and fsync the file. Returns the number of records written.
    pub fn finish(self) -> Result<usize> {
        let file = self
            .out
            .into_inner()
            .map_err(|e| ConclaveError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(self.count)
    }
}

/// Sequential reader over every record of a segment file.
pub struct SegmentIter {
    reader: BufReader<File>,
    line: Vec<u8>,
}

impl SegmentIter {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            line: Vec::new(),
        })
    }
}

impl Iterator for SegmentIter {
    type Item = Result<(String, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.line.clear();
        match self.reader.read_until(b'\n', &mut self.line) {
            Ok(0) => None,
            Ok(_) => Some(codec::decode_line(&self.line)),
            Err(e) => Some(Err(e.into())),
        }
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
