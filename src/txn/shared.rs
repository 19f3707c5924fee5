//! Shared-object contract
//!
//! Any data structure that wants its state to participate in transactions
//! implements [`Shared`]. The transaction coordinator drives the contract
//! during commit: lock the write set, check the read set, install the
//! writes, unlock, then run post-commit hooks and release buffers. On
//! abort it runs `undo` for speculative inserts and `cleanup` for every
//! item.

use super::item::TransItem;
use super::transaction::Transaction;

/// Capability contract for transactional participation.
pub trait Shared: Send + Sync + 'static {
    /// Acquire exclusive write permission for the state named by
    /// `item.key()`. May spin. Re-entrant locking is not required.
    fn lock(&self, item: &TransItem);

    /// Release the permission taken by [`lock`](Shared::lock).
    fn unlock(&self, item: &TransItem);

    /// Validate the item's read snapshot against current state. Must
    /// return false on any violation and must not block. `txn` is
    /// available to distinguish self-locked items from foreign locks.
    fn check(&self, item: &TransItem, txn: &Transaction) -> bool;

    /// Apply the item's write payload under the lock taken in the lock
    /// phase, including the version bump. May not fail.
    fn install(&self, item: &mut TransItem);

    /// Roll back a speculative insert; invoked only for items with the
    /// undo flag. Must be idempotent on the abort path.
    fn undo(&self, item: &mut TransItem);

    /// Release transient resources attached to the item.
    fn cleanup(&self, item: &mut TransItem) {
        let _ = item.take_write();
    }

    /// Optional post-commit hook for items with the after-commit flag.
    fn after_commit(&self, item: &mut TransItem) {
        let _ = item;
    }
}
