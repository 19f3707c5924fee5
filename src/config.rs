//! Compile-time configuration knobs
//!
//! These are fixed at build time; changing them requires a rebuild. They
//! correspond to the tuning switches of the commit protocol, the working
//! set, and the epoch manager. The three protocol knobs are flipped per
//! build through cargo features (`no-read-my-writes`, `nosort`,
//! `abort-on-write-read-conflict`), and each alternate configuration has
//! its own feature-gated tests.

use std::time::Duration;

/// Size of the process-wide thread descriptor array.
///
/// Every thread that runs transactions is assigned a slot on first use;
/// slots are never recycled, and exceeding the limit panics at thread
/// registration.
pub const MAX_THREADS: usize = 128;

/// Initial working-set capacity reserved by each transaction.
pub const INIT_SET_SIZE: usize = 512;

/// Whether reads may observe writes made earlier in the same transaction.
///
/// When enabled, a `get` of a key written in the same transaction returns
/// the pending value, deleting a key inserted in the same transaction
/// cancels the insert, and the working set de-duplicates items by key.
/// When disabled (the `no-read-my-writes` feature), reads see pre-write
/// state and patterns like insert-then-delete of the same key are not
/// supported.
#[cfg(not(feature = "no-read-my-writes"))]
pub const READ_MY_WRITES: bool = true;
#[cfg(feature = "no-read-my-writes")]
pub const READ_MY_WRITES: bool = false;

/// Whether a `put` that collides with the transaction's own earlier
/// absence witness (because the insert structurally changed a witnessed
/// leaf that some other transaction had already modified) aborts right
/// away instead of leaving the stale witness to fail validation at
/// commit. Enabled by the `abort-on-write-read-conflict` feature.
#[cfg(not(feature = "abort-on-write-read-conflict"))]
pub const ABORT_ON_WRITE_READ_CONFLICT: bool = false;
#[cfg(feature = "abort-on-write-read-conflict")]
pub const ABORT_ON_WRITE_READ_CONFLICT: bool = true;

/// Disables commit-time sorting of the write set (the `nosort` feature).
///
/// Safe only when all concurrently committing transactions touch disjoint
/// keys; with overlapping writers, deadlock is possible.
#[cfg(not(feature = "nosort"))]
pub const NOSORT: bool = false;
#[cfg(feature = "nosort")]
pub const NOSORT: bool = true;

/// Interval between background epoch advances.
pub const EPOCH_TICK: Duration = Duration::from_millis(100);

/// Maximum number of entries per index leaf before it splits.
pub const LEAF_FANOUT: usize = 15;
