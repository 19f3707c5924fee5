//! Process-wide transaction statistics
//!
//! Lock-free atomic counters for monitoring commit throughput, abort
//! causes, and epoch reclamation. All hot-path updates are a single
//! relaxed increment; counters are cache-line aligned to avoid false
//! sharing between threads.

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;

use crate::Error;

/// Aligned counter to avoid false sharing between atomic counters.
#[repr(align(64))]
struct AlignedCounter(AtomicU64);

impl AlignedCounter {
    const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

// ============================================================================
// Global stats singleton
// ============================================================================

static STATS: Lazy<TxnStats> = Lazy::new(TxnStats::new);

/// Get the global transaction statistics.
pub fn stats() -> &'static TxnStats {
    &STATS
}

/// Transaction and reclamation counters.
pub struct TxnStats {
    /// Transactions committed
    commits: AlignedCounter,
    /// Transactions aborted (any cause)
    aborts: AlignedCounter,
    /// Aborts due to a cell invalidated by another transaction
    conflicts_invalid: AlignedCounter,
    /// Aborts due to a read-snapshot counter mismatch
    conflicts_version: AlignedCounter,
    /// Aborts due to an absence-witness leaf version change
    conflicts_node: AlignedCounter,
    /// Aborts due to a read cell locked by another writer
    conflicts_locked: AlignedCounter,
    /// Cells reclaimed by the epoch manager after a committed delete
    cells_retired: AlignedCounter,
    /// Buffers reclaimed by the epoch manager after a resize
    buffers_retired: AlignedCounter,
}

impl TxnStats {
    fn new() -> Self {
        Self {
            commits: AlignedCounter::new(),
            aborts: AlignedCounter::new(),
            conflicts_invalid: AlignedCounter::new(),
            conflicts_version: AlignedCounter::new(),
            conflicts_node: AlignedCounter::new(),
            conflicts_locked: AlignedCounter::new(),
            cells_retired: AlignedCounter::new(),
            buffers_retired: AlignedCounter::new(),
        }
    }

    /// Record a successful commit.
    #[inline]
    pub fn record_commit(&self) {
        self.commits.add(1);
    }

    /// Record an abort.
    #[inline]
    pub fn record_abort(&self) {
        self.aborts.add(1);
    }

    /// Record the conflict kind that doomed a transaction.
    pub fn record_conflict(&self, err: &Error) {
        match err {
            Error::Invalid => self.conflicts_invalid.add(1),
            Error::VersionMismatch => self.conflicts_version.add(1),
            Error::NodeVersionMismatch => self.conflicts_node.add(1),
            Error::LockedByOther => self.conflicts_locked.add(1),
            Error::Aborted => {}
        }
    }

    /// Record a cell reclaimed after a committed delete.
    #[inline]
    pub fn record_cell_retired(&self) {
        self.cells_retired.add(1);
    }

    /// Record a buffer reclaimed after a resize.
    #[inline]
    pub fn record_buffer_retired(&self) {
        self.buffers_retired.add(1);
    }

    /// Take a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commits: self.commits.get(),
            aborts: self.aborts.get(),
            conflicts_invalid: self.conflicts_invalid.get(),
            conflicts_version: self.conflicts_version.get(),
            conflicts_node: self.conflicts_node.get(),
            conflicts_locked: self.conflicts_locked.get(),
            cells_retired: self.cells_retired.get(),
            buffers_retired: self.buffers_retired.get(),
        }
    }

    /// Reset all counters (for tests).
    pub fn reset(&self) {
        self.commits.reset();
        self.aborts.reset();
        self.conflicts_invalid.reset();
        self.conflicts_version.reset();
        self.conflicts_node.reset();
        self.conflicts_locked.reset();
        self.cells_retired.reset();
        self.buffers_retired.reset();
    }
}

/// Point-in-time snapshot of [`TxnStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub commits: u64,
    pub aborts: u64,
    pub conflicts_invalid: u64,
    pub conflicts_version: u64,
    pub conflicts_node: u64,
    pub conflicts_locked: u64,
    pub cells_retired: u64,
    pub buffers_retired: u64,
}

// ============================================================================
// Tests
// ============================================================================
