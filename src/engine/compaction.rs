//! CONCLAVE - Compaction
//! Merges sorted segments so lookups touch fewer files.
//!
//! ## Merge
//! A linear two-way merge of two already sorted segments. For a key present
//! in both inputs the newer segment's record wins; tombstones are carried
//! over so they keep shadowing anything older.
//!
//! ## Strategy
//! The engine repeatedly asks its strategy for the next pair and merges it
//! until the strategy has nothing left to select.

use std::cmp::Ordering;
use std::iter::Peekable;
use std::path::{Path, PathBuf};

use crate::error::{ConclaveError, Result};
use crate::types::Record;

use super::sstable::{SSTableWriter, SegmentIter};

/// Trait defining a compaction strategy.
pub trait CompactionStrategy: Send + Sync {
    /// Pick the `(older, newer)` pair to merge next, as indices into `segments`.
    fn select_compaction(&self, segments: &[SegmentInfo]) -> Option<(usize, usize)>;

    /// Returns the human-readable name of this strategy.
    fn name(&self) -> &str;
}

/// Metadata about a segment file.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub generation: u64,
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// Folds all segments into one, always merging the two oldest generations.
#[derive(Debug, Default)]
pub struct OldestPairCompaction;

impl CompactionStrategy for OldestPairCompaction {
    fn select_compaction(&self, segments: &[SegmentInfo]) -> Option<(usize, usize)> {
        if segments.len() < 2 {
            return None;
        }
        let mut order: Vec<usize> = (0..segments.len()).collect();
        order.sort_by_key(|&i| segments[i].generation);
        Some((order[0], order[1]))
    }

    fn name(&self) -> &str {
        "oldest-pair"
    }
}

/// Merge `older` and `newer` into `output`. Returns the number of records written.
pub fn merge_segments(older: &Path, newer: &Path, output: &Path) -> Result<usize> {
    let mut old = SegmentIter::open(older)?.peekable();
    let mut new = SegmentIter::open(newer)?.peekable();
    let mut writer = SSTableWriter::create(output)?;

    loop {
        let order = match (old.peek(), new.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(Ok((a, _))), Some(Ok((b, _)))) => a.cmp(b),
            // Surface the read error from whichever side has it.
            (Some(Err(_)), _) => Ordering::Less,
            (_, Some(Err(_))) => Ordering::Greater,
        };
        let (key, record) = match order {
            Ordering::Less => next(&mut old)?,
            Ordering::Greater => next(&mut new)?,
            Ordering::Equal => {
                next(&mut old)?;
                next(&mut new)?
            }
        };
        writer.append(&key, &record)?;
    }
    writer.finish()
}

fn next(iter: &mut Peekable<SegmentIter>) -> Result<(String, Record)> {
    match iter.next() {
        Some(item) => item,
        None => Err(ConclaveError::Corruption(
            "segment ended while merging".to_string(),
        )),
    }
}
