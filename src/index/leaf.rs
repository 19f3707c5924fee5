//! Concurrent ordered leaf directory
//!
//! The index keeps its entries in a flat directory of versioned leaves.
//! Each leaf owns a sorted run of `(key, cell)` entries and a full-version
//! stamp that changes on every entry insert, entry remove, and split —
//! but not on value replacement, which does not change the key set. The
//! stamps are what transactions witness to prove absence of keys and
//! stability of scanned ranges without holding locks across operations.
//!
//! Latching: a directory `RwLock` orders structural changes (splits) with
//! lookups, and a per-leaf `RwLock` orders entry mutation with reads.
//! Non-splitting inserts take the directory lock shared; splits escalate
//! to exclusive. Leaves are never merged or deallocated while referenced:
//! an empty leaf still witnesses absence for its key range.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cell::ValueCell;
use crate::config::LEAF_FANOUT;

// ============================================================================
// Leaf
// ============================================================================

/// One leaf: a sorted run of entries plus the version stamp transactions
/// witness.
pub struct Leaf<C: ValueCell> {
    id: u64,
    version: AtomicU64,
    /// Inclusive lower bound of the leaf's key range; the first leaf's is
    /// empty.
    low: Box<[u8]>,
    entries: RwLock<Vec<(Box<[u8]>, Arc<C>)>>,
}

impl<C: ValueCell> Leaf<C> {
    fn new(id: u64, low: Box<[u8]>, entries: Vec<(Box<[u8]>, Arc<C>)>) -> Self {
        Self {
            id,
            version: AtomicU64::new(1),
            low,
            entries: RwLock::new(entries),
        }
    }

    /// Stable leaf identifier.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current full version.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Bump the version. Caller holds the entries write lock.
    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Operation results
// ============================================================================

/// Result of an unlocked point lookup.
pub enum Lookup<C: ValueCell> {
    /// The key is present.
    Found(Arc<C>),
    /// The key is absent; the leaf that would hold it, and its version at
    /// lookup time, witness the absence.
    Absent { leaf: Arc<Leaf<C>>, version: u64 },
}

/// Result of an insert cursor.
pub enum Insert<C: ValueCell> {
    /// The key was already present.
    Existing(Arc<C>),
    /// A new cell was spliced in.
    Inserted {
        cell: Arc<C>,
        /// The leaf the key landed in (before any split).
        leaf: Arc<Leaf<C>>,
        /// The leaf's version just before the insert.
        prev_version: u64,
        /// The leaf's version after the insert (and split, if any).
        new_version: u64,
        /// Leaves born of a split, with their birth versions.
        new_leaves: Vec<(Arc<Leaf<C>>, u64)>,
    },
}

// ============================================================================
// LeafMap
// ============================================================================

/// The concurrent ordered map of leaves the transactional adaptor drives.
pub struct LeafMap<C: ValueCell> {
    leaves: RwLock<Vec<Arc<Leaf<C>>>>,
    next_leaf_id: AtomicU64,
}

impl<C: ValueCell> LeafMap<C> {
    pub fn new() -> Self {
        let first = Arc::new(Leaf::new(0, Box::default(), Vec::new()));
        Self {
            leaves: RwLock::new(vec![first]),
            next_leaf_id: AtomicU64::new(1),
        }
    }

    /// Index of the leaf covering `key`: the last leaf whose lower bound
    /// is not greater than the key.
    fn locate(leaves: &[Arc<Leaf<C>>], key: &[u8]) -> usize {
        leaves
            .partition_point(|leaf| leaf.low.as_ref() <= key)
            .saturating_sub(1)
    }

    /// Unlocked point lookup. "Unlocked" from the transaction's point of
    /// view: no cell lock is taken; the directory latch is held shared so
    /// a concurrent split cannot move the key mid-lookup.
    pub fn find_unlocked(&self, key: &[u8]) -> Lookup<C> {
        let leaves = self.leaves.read();
        let leaf = Arc::clone(&leaves[Self::locate(&leaves, key)]);
        let entries = leaf.entries.read();
        match entries.binary_search_by(|(k, _)| k.as_ref().cmp(key)) {
            Ok(i) => Lookup::Found(Arc::clone(&entries[i].1)),
            Err(_) => {
                // version sampled under the entries lock: no mutation can
                // race the absence observation
                let version = leaf.version();
                drop(entries);
                Lookup::Absent { leaf, version }
            }
        }
    }

    /// Insert cursor: splice a new cell for `key` unless one exists.
    /// `make` is called at most once, only when the key is absent.
    pub fn find_insert(&self, key: &[u8], make: impl FnOnce() -> Arc<C>) -> Insert<C> {
        // fast path: no split needed, directory lock held shared
        {
            let leaves = self.leaves.read();
            let leaf = Arc::clone(&leaves[Self::locate(&leaves, key)]);
            let mut entries = leaf.entries.write();
            match entries.binary_search_by(|(k, _)| k.as_ref().cmp(key)) {
                Ok(i) => return Insert::Existing(Arc::clone(&entries[i].1)),
                Err(pos) if entries.len() < LEAF_FANOUT => {
                    let prev_version = leaf.version();
                    let cell = make();
                    entries.insert(pos, (key.into(), Arc::clone(&cell)));
                    leaf.bump();
                    let new_version = leaf.version();
                    drop(entries);
                    return Insert::Inserted {
                        cell,
                        leaf,
                        prev_version,
                        new_version,
                        new_leaves: Vec::new(),
                    };
                }
                Err(_) => {}
            }
        }

        // slow path: the leaf is full, escalate to the directory write lock
        let mut leaves = self.leaves.write();
        let li = Self::locate(&leaves, key);
        let leaf = Arc::clone(&leaves[li]);
        let mut entries = leaf.entries.write();
        match entries.binary_search_by(|(k, _)| k.as_ref().cmp(key)) {
            Ok(i) => Insert::Existing(Arc::clone(&entries[i].1)),
            Err(pos) => {
                let prev_version = leaf.version();
                let cell = make();
                entries.insert(pos, (key.into(), Arc::clone(&cell)));

                let mut new_leaves = Vec::new();
                if entries.len() > LEAF_FANOUT {
                    let split_at = entries.len() / 2;
                    let right_entries = entries.split_off(split_at);
                    let right_low = right_entries[0].0.clone();
                    let right = Arc::new(Leaf::new(
                        self.next_leaf_id.fetch_add(1, Ordering::Relaxed),
                        right_low,
                        right_entries,
                    ));
                    leaves.insert(li + 1, Arc::clone(&right));
                    let birth = right.version();
                    new_leaves.push((right, birth));
                }

                leaf.bump();
                let new_version = leaf.version();
                drop(entries);
                Insert::Inserted {
                    cell,
                    leaf,
                    prev_version,
                    new_version,
                    new_leaves,
                }
            }
        }
    }

    /// Swap the cell stored for `key`. Does not bump the leaf version:
    /// the key set is unchanged. Returns false if the key is absent.
    pub fn replace(&self, key: &[u8], new_cell: Arc<C>) -> bool {
        let leaves = self.leaves.read();
        let leaf = &leaves[Self::locate(&leaves, key)];
        let mut entries = leaf.entries.write();
        match entries.binary_search_by(|(k, _)| k.as_ref().cmp(key)) {
            Ok(i) => {
                entries[i].1 = new_cell;
                true
            }
            Err(_) => false,
        }
    }

    /// Remove the entry for `key`, bumping the leaf version.
    pub fn remove(&self, key: &[u8]) -> Option<Arc<C>> {
        let leaves = self.leaves.read();
        let leaf = &leaves[Self::locate(&leaves, key)];
        let mut entries = leaf.entries.write();
        match entries.binary_search_by(|(k, _)| k.as_ref().cmp(key)) {
            Ok(i) => {
                let (_, cell) = entries.remove(i);
                leaf.bump();
                Some(cell)
            }
            Err(_) => None,
        }
    }

    /// Forward scan over `[lo, hi)`.
    ///
    /// For every leaf traversed, `visit` receives the leaf, its version
    /// (sampled while the entry lock was held), and the in-range entries;
    /// returning false stops the scan. The leaf containing `lo` is always
    /// visited even when the range is empty, so the caller can witness it.
    pub fn scan<F>(&self, lo: &[u8], hi: &[u8], mut visit: F)
    where
        F: FnMut(&Arc<Leaf<C>>, u64, &[(Box<[u8]>, Arc<C>)]) -> bool,
    {
        let leaves: Vec<Arc<Leaf<C>>> = self.leaves.read().clone();
        let start = Self::locate(&leaves, lo);
        for (i, leaf) in leaves.iter().enumerate().skip(start) {
            // a leaf whose whole range is past `hi` is not traversed
            if i > start && !leaf.low.is_empty() && leaf.low.as_ref() >= hi {
                break;
            }
            let (version, chunk, exhausted) = {
                let entries = leaf.entries.read();
                let version = leaf.version();
                let chunk: Vec<_> = entries
                    .iter()
                    .filter(|(k, _)| k.as_ref() >= lo && k.as_ref() < hi)
                    .cloned()
                    .collect();
                let exhausted = entries.iter().any(|(k, _)| k.as_ref() >= hi);
                (version, chunk, exhausted)
            };
            if !visit(leaf, version, &chunk) || exhausted {
                return;
            }
        }
    }

    /// Reverse scan over `[lo, hi)`: leaves and entries are visited in
    /// descending key order.
    pub fn rscan<F>(&self, lo: &[u8], hi: &[u8], mut visit: F)
    where
        F: FnMut(&Arc<Leaf<C>>, u64, &[(Box<[u8]>, Arc<C>)]) -> bool,
    {
        if lo > hi {
            return;
        }
        let leaves: Vec<Arc<Leaf<C>>> = self.leaves.read().clone();
        let start = Self::locate(&leaves, lo);
        let end = Self::locate(&leaves, hi);
        for leaf in leaves[start..=end].iter().rev() {
            let (version, chunk) = {
                let entries = leaf.entries.read();
                let version = leaf.version();
                let chunk: Vec<_> = entries
                    .iter()
                    .rev()
                    .filter(|(k, _)| k.as_ref() >= lo && k.as_ref() < hi)
                    .cloned()
                    .collect();
                (version, chunk)
            };
            if !visit(leaf, version, &chunk) {
                return;
            }
        }
    }

    /// Number of keys currently stored.
    pub fn key_count(&self) -> usize {
        let leaves = self.leaves.read();
        leaves.iter().map(|leaf| leaf.entries.read().len()).sum()
    }
}

impl<C: ValueCell> Default for LeafMap<C> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
