//! CONCLAVE - Engine Metrics
//! Lock-free counters for one LSM engine instance, kept with `AtomicU64`
//! so recording never contends with the read and write paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Operation counters. `Relaxed` ordering is enough: nothing synchronizes on them.
#[derive(Debug)]
pub struct EngineMetrics {
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    pub removes: AtomicU64,
    /// MemTable → segment flushes.
    pub flushes: AtomicU64,
    /// Individual two-segment merges.
    pub compactions: AtomicU64,
    /// Key and value bytes accepted by `put`.
    pub bytes_written: AtomicU64,
    /// Value bytes returned by `get`.
    pub bytes_read: AtomicU64,
    /// Records replayed from the WAL at open.
    pub wal_replayed: AtomicU64,
    opened_at: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            wal_replayed: AtomicU64::new(0),
            opened_at: Instant::now(),
        }
    }

    pub fn record_put(&self, key_size: usize, value_size: usize) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add((key_size + value_size) as u64, Ordering::Relaxed);
    }

    /// Record a get; `value_size` is `None` on a miss.
    pub fn record_get(&self, value_size: Option<usize>) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(size) = value_size {
            self.bytes_read.fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self, records: usize) {
        self.wal_replayed.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    /// puts + gets + removes.
    pub fn total_ops(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
            + self.gets.load(Ordering::Relaxed)
            + self.removes.load(Ordering::Relaxed)
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        format!(
            "operations: puts={} gets={} removes={}\n\
             maintenance: flushes={} compactions={}\n\
             io: written={}B read={}B\n\
             recovery: wal records replayed={}\n\
             uptime: {:.2}s",
            self.puts.load(Ordering::Relaxed),
            self.gets.load(Ordering::Relaxed),
            self.removes.load(Ordering::Relaxed),
            self.flushes.load(Ordering::Relaxed),
            self.compactions.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
            self.bytes_read.load(Ordering::Relaxed),
            self.wal_replayed.load(Ordering::Relaxed),
            self.uptime_secs(),
        )
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_operations() {
        let m = EngineMetrics::new();
        m.record_put(5, 10);
        m.record_put(3, 7);
        m.record_get(Some(10));
        m.record_get(None);
        m.record_remove();
        m.record_flush();
        m.record_compaction();
        m.record_replay(4);

        assert_eq!(m.puts.load(Ordering::Relaxed), 2);
        assert_eq!(m.gets.load(Ordering::Relaxed), 2);
        assert_eq!(m.removes.load(Ordering::Relaxed), 1);
        assert_eq!(m.flushes.load(Ordering::Relaxed), 1);
        assert_eq!(m.compactions.load(Ordering::Relaxed), 1);
        assert_eq!(m.bytes_written.load(Ordering::Relaxed), 25);
        assert_eq!(m.bytes_read.load(Ordering::Relaxed), 10);
        assert_eq!(m.wal_replayed.load(Ordering::Relaxed), 4);
        assert_eq!(m.total_ops(), 5);
    }

    #[test]
    fn test_report_format() {
        let m = EngineMetrics::default();
        m.record_put(10, 20);
        let report = m.report();
        assert!(report.contains("puts=1"));
        assert!(report.contains("written=30B"));
    }
}
