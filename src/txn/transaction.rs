//! Transaction coordinator
//!
//! A [`Transaction`] collects the working set produced by index operations
//! and runs the two-phase validate-then-install commit:
//!
//! 1. Sort the write permutation into the global lock order `(shared, key)`.
//! 2. Lock every write item in that order (collapsing duplicates).
//! 3. Validate every read item in insertion order.
//! 4. Install every write item from the first write onward.
//! 5. Unlock, mirroring the lock pass.
//! 6. On success run post-commit hooks and release buffers; on failure
//!    abort, rolling back speculative inserts.
//!
//! A validation failure anywhere surfaces as an abort of this transaction
//! only; locks taken so far are released in the unlock pass and the
//! client re-runs the transaction.

use std::any::Any;
use std::sync::Arc;

use crate::config::{INIT_SET_SIZE, NOSORT, READ_MY_WRITES};
use crate::epoch::epoch_manager;
use crate::stats::stats;
use crate::{Error, Result};

use super::item::{ItemKey, ReadSnapshot, TransItem};
use super::shared::Shared;

/// A transaction: private working set plus the commit pipeline.
///
/// Construction is the implicit begin. Each thread runs at most one
/// transaction at a time; the transaction publishes the thread's epoch for
/// the epoch manager while it is in flight.
pub struct Transaction {
    set: Vec<TransItem>,
    /// Indices of write items, sorted into lock order at commit.
    perm: Vec<usize>,
    /// Smallest index holding a write, if any.
    first_write: Option<usize>,
    /// True while every item was added through the de-duplicating path,
    /// so the working set holds no duplicate keys.
    read_my_writes_only: bool,
    aborted: bool,
    finished: bool,
}

impl Transaction {
    /// Begin a transaction.
    pub fn new() -> Self {
        epoch_manager().enter();
        Self {
            set: Vec::with_capacity(INIT_SET_SIZE),
            perm: Vec::new(),
            first_write: None,
            read_my_writes_only: true,
            aborted: false,
            finished: false,
        }
    }

    /// Whether the transaction has aborted.
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Error out if the transaction already aborted; operations on an
    /// aborted transaction are no-ops.
    pub fn ensure_open(&self) -> Result<()> {
        if self.aborted {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Working-set construction
    // ========================================================================

    /// Append an item without checking for an existing one with the same
    /// key. Duplicates become possible, so commit-time duplicate collapse
    /// is armed.
    pub fn add_item(&mut self, shared: Arc<dyn Shared>, key: ItemKey) -> usize {
        self.read_my_writes_only = false;
        self.push_item(shared, key)
    }

    /// Append an item whose key is provably not yet in the working set
    /// (a freshly allocated cell or leaf). Skips the lookup without
    /// arming duplicate collapse.
    pub fn add_item_fresh(&mut self, shared: Arc<dyn Shared>, key: ItemKey) -> usize {
        self.push_item(shared, key)
    }

    /// Find the existing item for `(shared, key)` or append one.
    ///
    /// With read-my-writes disabled the lookup is skipped and every call
    /// appends (the original working set never observes its own writes).
    pub fn item(&mut self, shared: &Arc<dyn Shared>, key: &ItemKey) -> usize {
        if let Some(idx) = self.has_item(shared, key) {
            return idx;
        }
        if READ_MY_WRITES {
            self.push_item(Arc::clone(shared), key.clone())
        } else {
            self.add_item(Arc::clone(shared), key.clone())
        }
    }

    /// Find an existing item for `(shared, key)`. Always absent when
    /// read-my-writes is disabled.
    pub fn has_item(&self, shared: &Arc<dyn Shared>, key: &ItemKey) -> Option<usize> {
        if !READ_MY_WRITES {
            return None;
        }
        let addr = Arc::as_ptr(shared) as *const () as usize;
        let key_addr = key.addr();
        let is_node = key.is_node();
        self.set.iter().position(|it| {
            it.shared_addr() == addr && it.key().addr() == key_addr && it.key().is_node() == is_node
        })
    }

    fn push_item(&mut self, shared: Arc<dyn Shared>, key: ItemKey) -> usize {
        self.set.push(TransItem::new(shared, key));
        self.set.len() - 1
    }

    /// The item at `idx`.
    pub fn item_ref(&self, idx: usize) -> &TransItem {
        &self.set[idx]
    }

    pub(crate) fn item_mut(&mut self, idx: usize) -> &mut TransItem {
        &mut self.set[idx]
    }

    /// Record a read snapshot on the item, replacing any previous one.
    pub fn add_read(&mut self, idx: usize, snapshot: ReadSnapshot) {
        self.set[idx].set_read(snapshot);
    }

    /// Record a write payload on the item, replacing any previous one.
    pub fn add_write(&mut self, idx: usize, data: Box<dyn Any + Send>) {
        match self.first_write {
            Some(first) if first <= idx => {}
            _ => self.first_write = Some(idx),
        }
        if !self.set[idx].has_write() {
            self.perm.push(idx);
        }
        self.set[idx].set_write(data);
    }

    /// Mark the item as a speculative insert to be rolled back on abort.
    pub fn add_undo(&mut self, idx: usize) {
        self.set[idx].set_undo();
    }

    /// Arm the post-commit hook for the item.
    pub fn add_after_commit(&mut self, idx: usize) {
        self.set[idx].set_after_commit();
    }

    /// Whether the transaction itself writes the state `item` refers to —
    /// during validation a self-locked cell is not a conflict.
    ///
    /// Binary-searches the permutation, which is valid because commit
    /// sorted it into the same `(shared, key)` order; with sorting
    /// disabled it falls back to a linear scan.
    pub fn check_for_write(&self, item: &TransItem) -> bool {
        if item.has_write() {
            return true;
        }
        let key = item.sort_key();
        if NOSORT {
            self.perm.iter().any(|&i| self.set[i].sort_key() == key)
        } else {
            self.perm
                .binary_search_by(|&i| self.set[i].sort_key().cmp(&key))
                .is_ok()
        }
    }

    // ========================================================================
    // Commit / abort
    // ========================================================================

    /// Run the commit protocol. Returns false iff the transaction aborted,
    /// either before commit or during validation.
    pub fn commit(mut self) -> bool {
        if self.aborted {
            return false;
        }
        let success = self.run_commit();
        if success {
            self.commit_success();
        } else {
            self.do_abort();
        }
        self.finished = true;
        success
    }

    fn run_commit(&mut self) -> bool {
        // Phase 0: establish the global lock order
        if !NOSORT {
            let set = &self.set;
            self.perm
                .sort_by(|&a, &b| set[a].sort_key().cmp(&set[b].sort_key()));
        }

        // Phase 1: lock writes
        let mut i = 0;
        while i < self.perm.len() {
            let idx = self.perm[i];
            let shared = Arc::clone(self.set[idx].shared());
            shared.lock(&self.set[idx]);
            i += 1;
            if !self.read_my_writes_only {
                while i < self.perm.len() && self.set[self.perm[i]].same_item(&self.set[idx]) {
                    i += 1;
                }
            }
        }

        // Phase 2: validate reads, in insertion order
        let mut success = true;
        for item in &self.set {
            if item.has_read() && !Arc::clone(item.shared()).check(item, self) {
                success = false;
                break;
            }
        }

        // Phase 3: install writes
        if success {
            let first = self.first_write.unwrap_or(self.set.len());
            for idx in first..self.set.len() {
                if self.set[idx].has_write() {
                    let shared = Arc::clone(self.set[idx].shared());
                    shared.install(&mut self.set[idx]);
                }
            }
        }

        // Phase 4: unlock, mirroring phase 1
        let mut i = 0;
        while i < self.perm.len() {
            let idx = self.perm[i];
            let shared = Arc::clone(self.set[idx].shared());
            shared.unlock(&self.set[idx]);
            i += 1;
            if !self.read_my_writes_only {
                while i < self.perm.len() && self.set[self.perm[i]].same_item(&self.set[idx]) {
                    i += 1;
                }
            }
        }

        success
    }

    /// Phase 5: post-commit hooks, then buffer release.
    fn commit_success(&mut self) {
        for idx in 0..self.set.len() {
            let shared = Arc::clone(self.set[idx].shared());
            if self.set[idx].has_after_commit() {
                shared.after_commit(&mut self.set[idx]);
            }
            shared.cleanup(&mut self.set[idx]);
        }
        stats().record_commit();
    }

    /// Abort the transaction: roll back speculative inserts, release
    /// buffers. Idempotent; operations after abort are no-ops.
    pub fn abort(&mut self) {
        self.do_abort();
    }

    /// Record the conflict that dooms this transaction and abort. Returns
    /// the error for `?` propagation out of the detecting operation.
    pub fn abort_with(&mut self, err: Error) -> Error {
        stats().record_conflict(&err);
        self.do_abort();
        err
    }

    fn do_abort(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        for idx in 0..self.set.len() {
            if self.set[idx].has_undo() {
                let shared = Arc::clone(self.set[idx].shared());
                shared.undo(&mut self.set[idx]);
            }
        }
        for idx in 0..self.set.len() {
            let shared = Arc::clone(self.set[idx].shared());
            shared.cleanup(&mut self.set[idx]);
        }
        stats().record_abort();
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // dropping an open transaction aborts it so speculative inserts
        // cannot leak into the index
        if !self.finished && !self.aborted {
            self.do_abort();
        }
        epoch_manager().exit();
    }
}

// ============================================================================
// Tests
// ============================================================================
