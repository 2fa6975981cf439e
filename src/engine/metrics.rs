//! zonekv - Engine Metrics & Observability
//! Provides atomic counters for tracking engine operations
//! in a lock-free, thread-safe manner using `AtomicU64`.
//!
//! Foreground calls and background jobs both record here; the report is
//! served through the `zonekv.metrics` property.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic operation counters for the zonekv engine.
///
/// All counters use `Ordering::Relaxed`: they are only read for reporting.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Total number of `put` operations.
    pub puts: AtomicU64,
    /// Total number of `get` operations.
    pub gets: AtomicU64,
    /// Total number of `delete` operations.
    pub deletes: AtomicU64,
    /// Total number of iterators handed out.
    pub scans: AtomicU64,
    /// Total bytes written (keys + values).
    pub bytes_written: AtomicU64,
    /// Total bytes read (values returned by get).
    pub bytes_read: AtomicU64,
    /// WAL appends, each carrying one or more coalesced batches.
    pub group_commits: AtomicU64,
    /// MemTables written to level 0.
    pub flushes: AtomicU64,
    /// Compactions that merged files, excluding trivial moves.
    pub compactions: AtomicU64,
    /// Files moved down a level without rewriting.
    pub trivial_moves: AtomicU64,
    /// Sorted files split after running out of space.
    pub table_splits: AtomicU64,
    /// Table zones reset by defragmentation.
    pub zones_reclaimed: AtomicU64,
    /// Values rewritten out of sparse value files.
    pub values_moved: AtomicU64,
    /// Value files deleted after every record was dropped.
    pub value_files_reclaimed: AtomicU64,
    /// Writes delayed by the level-0 slowdown trigger.
    pub write_slowdowns: AtomicU64,
    /// Writes that waited for a flush or for level 0 to shrink.
    pub write_stalls: AtomicU64,
    /// Number of WAL files replayed at open.
    pub wal_recoveries: AtomicU64,
    /// Background errors recorded.
    pub background_errors: AtomicU64,
    /// Timestamp when the engine was opened.
    engine_started: Instant,
}

impl EngineMetrics {
    /// Create a new metrics instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            scans: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            group_commits: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            trivial_moves: AtomicU64::new(0),
            table_splits: AtomicU64::new(0),
            zones_reclaimed: AtomicU64::new(0),
            values_moved: AtomicU64::new(0),
            value_files_reclaimed: AtomicU64::new(0),
            write_slowdowns: AtomicU64::new(0),
            write_stalls: AtomicU64::new(0),
            wal_recoveries: AtomicU64::new(0),
            background_errors: AtomicU64::new(0),
            engine_started: Instant::now(),
        }
    }

    /// Record a put operation.
    pub fn record_put(&self, key_size: usize, value_size: usize) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add((key_size + value_size) as u64, Ordering::Relaxed);
    }

    /// Record a get operation.
    pub fn record_get(&self, value_size: Option<usize>) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(size) = value_size {
            self.bytes_read.fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    /// Record a delete operation.
    pub fn record_delete(&self, key_size: usize) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(key_size as u64, Ordering::Relaxed);
    }

    /// Record a new iterator.
    pub fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_group_commit(&self) {
        self.group_commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a flush event.
    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction(&self, trivial: bool) {
        if trivial {
            self.trivial_moves.fetch_add(1, Ordering::Relaxed);
        } else {
            self.compactions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_split(&self) {
        self.table_splits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_zones_reclaimed(&self, zones: usize) {
        self.zones_reclaimed.fetch_add(zones as u64, Ordering::Relaxed);
    }

    pub fn record_values_moved(&self, values: u64) {
        self.values_moved.fetch_add(values, Ordering::Relaxed);
    }

    pub fn record_value_file_reclaimed(&self) {
        self.value_files_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slowdown(&self) {
        self.write_slowdowns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.write_stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a WAL recovery.
    pub fn record_recovery(&self) {
        self.wal_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_background_error(&self) {
        self.background_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get engine uptime in seconds.
    pub fn uptime_secs(&self) -> f64 {
        self.engine_started.elapsed().as_secs_f64()
    }

    /// Get total number of operations (puts + gets + deletes + scans).
    pub fn total_ops(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
            + self.gets.load(Ordering::Relaxed)
            + self.deletes.load(Ordering::Relaxed)
            + self.scans.load(Ordering::Relaxed)
    }

    /// Get operations per second since engine start.
    pub fn ops_per_sec(&self) -> f64 {
        let uptime = self.uptime_secs();
        if uptime < 0.001 {
            return 0.0;
        }
        self.total_ops() as f64 / uptime
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        format!(
            "\n═══ zonekv Engine Metrics ═══\n\
             Operations:\n\
               puts:      {}\n\
               gets:      {}\n\
               deletes:   {}\n\
               scans:     {}\n\
             Throughput:\n\
               total ops: {}\n\
               ops/sec:   {:.2}\n\
               group commits: {}\n\
             I/O:\n\
               written:   {} bytes\n\
               read:      {} bytes\n\
             Background:\n\
               flushes:        {}\n\
               compactions:    {}\n\
               trivial moves:  {}\n\
               table splits:   {}\n\
               zones reclaimed: {}\n\
               values moved:   {}\n\
               value files reclaimed: {}\n\
               errors:         {}\n\
             Backpressure:\n\
               slowdowns: {}\n\
               stalls:    {}\n\
             Recovery:\n\
               wal recoveries: {}\n\
             Uptime: {:.2}s",
            load(&self.puts),
            load(&self.gets),
            load(&self.deletes),
            load(&self.scans),
            self.total_ops(),
            self.ops_per_sec(),
            load(&self.group_commits),
            load(&self.bytes_written),
            load(&self.bytes_read),
            load(&self.flushes),
            load(&self.compactions),
            load(&self.trivial_moves),
            load(&self.table_splits),
            load(&self.zones_reclaimed),
            load(&self.values_moved),
            load(&self.value_files_reclaimed),
            load(&self.background_errors),
            load(&self.write_slowdowns),
            load(&self.write_stalls),
            load(&self.wal_recoveries),
            self.uptime_secs(),
        )
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
