//! CONCLAVE - Storage Engine Module
//! LSM-Tree engine: a lazily opened WAL, an in-memory table and immutable
//! sorted segments on disk, plus the directory mapping namespaces to engines.
//!
//! ## Files
//! ```text
//! <data_dir>/<stem>        live WAL
//! <data_dir>/<stem>.<N>    segment of generation N (higher is newer)
//! <data_dir>/<stem>.<N>-0  unfinished flush/compaction output, purged on open
//! ```

pub mod codec;
pub mod compaction;
pub mod directory;
pub mod memtable;
pub mod metrics;
pub mod sstable;
pub mod wal;

use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::Config;
use crate::error::{ConclaveError, Result};
use crate::types::{Lookup, Presence, Record};

use self::compaction::{merge_segments, CompactionStrategy, OldestPairCompaction, SegmentInfo};
use self::memtable::MemTable;
use self::metrics::EngineMetrics;
use self::sstable::{remove_if_exists, SSTable, SegmentFile};
use self::wal::WriteAheadLog;

/// One logical key space backed by a WAL and a set of segments.
///
/// All methods take `&self`; the engine is meant to be shared behind an `Arc`.
/// Lock order is `segment_lock` → `wal` → `segments` → `memtable`.
pub struct LsmTree {
    config: Config,
    stem: String,
    memtable: RwLock<MemTable>,
    wal: Mutex<WriteAheadLog>,
    /// Newest generation first.
    segments: RwLock<Vec<Arc<SSTable>>>,
    /// Serializes flush and compaction.
    segment_lock: Mutex<()>,
    strategy: Box<dyn CompactionStrategy>,
    metrics: EngineMetrics,
}

impl LsmTree {
    /// Open or create the engine whose files use `stem` inside `config.data_dir`.
    pub fn open(config: Config, stem: &str) -> Result<Self> {
        if stem.is_empty() {
            return Err(ConclaveError::Config("engine stem must not be empty".into()));
        }
        config.ensure_dirs()?;

        let mut segments = Vec::new();
        for entry in fs::read_dir(&config.data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match SegmentFile::parse(stem, name) {
                Some(SegmentFile::Segment(generation)) => {
                    segments.push(Arc::new(SSTable::open(
                        entry.path(),
                        generation,
                        config.index_ratio,
                    )?));
                }
                Some(SegmentFile::Pending(_)) => {
                    log::warn!("removing unfinished segment output {:?}", entry.path());
                    remove_if_exists(&entry.path())?;
                }
                None => {}
            }
        }
        segments.sort_by(|a, b| b.generation().cmp(&a.generation()));

        let wal_path = config.data_dir.join(stem);
        let (memtable, replayed) = WriteAheadLog::recover(&wal_path)?;
        let metrics = EngineMetrics::new();
        metrics.record_replay(replayed);

        log::info!(
            "engine {:?} opened at {:?} ({} segments, {} WAL records replayed)",
            stem,
            config.data_dir,
            segments.len(),
            replayed
        );

        Ok(Self {
            wal: Mutex::new(WriteAheadLog::new(wal_path, config.sync_writes)),
            stem: stem.to_string(),
            memtable: RwLock::new(memtable),
            segments: RwLock::new(segments),
            segment_lock: Mutex::new(()),
            strategy: Box::new(OldestPairCompaction),
            metrics,
            config,
        })
    }

    /// Stems owning a WAL or a complete segment in `config.data_dir`, from
    /// one directory scan. A name like `users.3` counts both as a WAL stem
    /// and as segment 3 of `users`.
    pub fn stems_on_disk(config: &Config) -> Result<HashSet<String>> {
        let mut stems = HashSet::new();
        let entries = match fs::read_dir(&config.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stems),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match name
                .rsplit_once('.')
                .and_then(|(stem, _)| SegmentFile::parse(stem, name).map(|file| (stem, file)))
            {
                Some((_, SegmentFile::Pending(_))) => continue,
                Some((stem, SegmentFile::Segment(_))) => {
                    stems.insert(stem.to_string());
                }
                None => {}
            }
            stems.insert(name.to_string());
        }
        Ok(stems)
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Number of segments currently registered.
    pub fn segment_count(&self) -> usize {
        self.read_segments().len()
    }

    /// Generations of the registered segments, newest first.
    pub fn generations(&self) -> Vec<u64> {
        self.read_segments().iter().map(|s| s.generation()).collect()
    }

    /// Number of records (tombstones included) waiting in memory.
    pub fn memtable_len(&self) -> usize {
        self.read_memtable().len()
    }

    /// Full lookup: tombstones are reported rather than hidden.
    pub fn lookup(&self, key: &str) -> Result<Lookup> {
        if let Some(record) = self.read_memtable().get(key) {
            return Ok(match record {
                Record::Value(value) => Lookup::Value(value.clone()),
                Record::Tombstone => Lookup::Tombstone,
            });
        }
        for segment in self.snapshot() {
            match segment.lookup(key)? {
                Lookup::Absent => continue,
                found => return Ok(found),
            }
        }
        Ok(Lookup::Absent)
    }

    /// Read a key; deleted and unknown keys are both `None`.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let value = match self.lookup(key)? {
            Lookup::Value(value) => Some(value),
            Lookup::Tombstone | Lookup::Absent => None,
        };
        self.metrics.record_get(value.as_ref().map(String::len));
        Ok(value)
    }

    /// Existence check that never decodes a stored value.
    pub fn contains_key(&self, key: &str) -> Result<bool> {
        if let Some(record) = self.read_memtable().get(key) {
            return Ok(!record.is_tombstone());
        }
        for segment in self.snapshot() {
            match segment.contains_key(key)? {
                Presence::Absent => continue,
                Presence::Tombstone => return Ok(false),
                Presence::Present => return Ok(true),
            }
        }
        Ok(false)
    }

    /// Store a value. The WAL record is durable before this returns.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.write(key, Record::Value(value.to_string()))?;
        self.metrics.record_put(key.len(), value.len());
        Ok(())
    }

    /// Delete a key by recording a tombstone.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.write(key, Record::Tombstone)?;
        self.metrics.record_remove();
        Ok(())
    }

    fn write(&self, key: &str, record: Record) -> Result<()> {
        if key.is_empty() {
            return Err(ConclaveError::InvalidKey("key must not be empty".into()));
        }
        // Holding the WAL lock across the memtable update keeps both in the same order.
        let mut wal = self.lock_wal();
        wal.append(key, &record)?;
        self.write_memtable().apply(key.to_string(), record);
        Ok(())
    }

    /// Write the memtable to a new segment and discard the WAL.
    /// Returns the new generation, or `None` if there was nothing to flush.
    pub fn flush(&self) -> Result<Option<u64>> {
        let _guard = lock(&self.segment_lock);
        let mut wal = self.lock_wal();

        if self.read_memtable().is_empty() {
            wal.discard()?;
            return Ok(None);
        }

        let generation = self.read_segments().first().map_or(1, |s| s.generation() + 1);
        let pending = self
            .config
            .data_dir
            .join(SegmentFile::pending_name(&self.stem, generation));
        let target = self
            .config
            .data_dir
            .join(SegmentFile::segment_name(&self.stem, generation));

        let written = SSTable::write(&pending, self.read_memtable().iter())?;
        fs::rename(&pending, &target)?;
        let segment = Arc::new(SSTable::open(&target, generation, self.config.index_ratio)?);

        // Register before clearing so readers always find the data somewhere.
        self.write_segments().insert(0, segment);
        self.write_memtable().clear();
        wal.discard()?;

        self.metrics.record_flush();
        log::info!(
            "flushed {} records of {:?} to generation {}",
            written,
            self.stem,
            generation
        );
        Ok(Some(generation))
    }

    /// Merge segments pairwise (oldest first) until at most one remains.
    /// Returns the number of merges performed.
    pub fn compact(&self) -> Result<usize> {
        let _guard = lock(&self.segment_lock);
        let mut merges = 0;

        loop {
            let current = self.snapshot();
            let infos: Vec<SegmentInfo> = current
                .iter()
                .map(|s| SegmentInfo {
                    generation: s.generation(),
                    path: s.path().to_path_buf(),
                    size: s.file_size(),
                })
                .collect();
            let Some((older_at, newer_at)) = self.strategy.select_compaction(&infos) else {
                break;
            };
            let older = &current[older_at];
            let newer = &current[newer_at];

            let pending = self
                .config
                .data_dir
                .join(SegmentFile::pending_name(&self.stem, newer.generation()));
            let records = merge_segments(older.path(), newer.path(), &pending)?;
            fs::rename(&pending, newer.path())?;
            let merged = Arc::new(SSTable::open(
                newer.path(),
                newer.generation(),
                self.config.index_ratio,
            )?);

            {
                let mut segments = self.write_segments();
                segments.retain(|s| {
                    s.generation() != older.generation() && s.generation() != newer.generation()
                });
                segments.push(merged);
                segments.sort_by(|a, b| b.generation().cmp(&a.generation()));
            }
            remove_if_exists(older.path())?;

            merges += 1;
            self.metrics.record_compaction();
            log::info!(
                "compacted {:?} generations {} + {} -> {} ({} records, strategy {})",
                self.stem,
                older.generation(),
                newer.generation(),
                newer.generation(),
                records,
                self.strategy.name()
            );
        }
        Ok(merges)
    }

    /// Sync and release the WAL handle. Does not flush the memtable to a segment.
    pub fn close(&self) -> Result<()> {
        self.lock_wal().close()
    }

    fn snapshot(&self) -> Vec<Arc<SSTable>> {
        self.read_segments().clone()
    }

    fn lock_wal(&self) -> MutexGuard<'_, WriteAheadLog> {
        lock(&self.wal)
    }

    fn read_memtable(&self) -> RwLockReadGuard<'_, MemTable> {
        self.memtable.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_memtable(&self) -> RwLockWriteGuard<'_, MemTable> {
        self.memtable.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_segments(&self) -> RwLockReadGuard<'_, Vec<Arc<SSTable>>> {
        self.segments.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_segments(&self) -> RwLockWriteGuard<'_, Vec<Arc<SSTable>>> {
        self.segments.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("closing engine {:?}: {}", self.stem, e);
        }
    }
}
