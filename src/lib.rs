//! Opal — transactional in-memory ordered key-value store
//!
//! An embedded storage core built on optimistic concurrency control: a
//! transaction coordinator layered over a concurrent ordered index whose
//! slots hold versioned value cells. Clients group reads, writes, inserts,
//! deletes and range scans into transactions; commit performs a global
//! validate-then-install over per-cell version words, publishing all
//! writes atomically or aborting.
//!
//! ```
//! use opal::{Transaction, ValueMap};
//!
//! let map = ValueMap::<u64>::new();
//!
//! let mut txn = Transaction::new();
//! map.put(&mut txn, b"answer", &42)?;
//! assert!(txn.commit());
//!
//! let mut txn = Transaction::new();
//! assert_eq!(map.get(&mut txn, b"answer")?, Some(42));
//! assert!(txn.commit());
//! # Ok::<(), opal::Error>(())
//! ```
//!
//! Conflicts are detected at commit (or earlier, when an operation trips
//! over another transaction's in-flight state); either way the transaction
//! aborts and the caller re-runs it. There is no durability, replication,
//! or snapshot isolation: commits are serializable, in memory, in process.

pub mod cell;
pub mod config;
pub mod epoch;
pub mod index;
pub mod stats;
pub mod txn;
pub mod vstr;

// Re-export the main types
pub use cell::{ValueCell, Version, VersionedCell};
pub use index::TransMap;
pub use stats::{stats, StatsSnapshot};
pub use txn::{ItemKey, ReadSnapshot, Shared, TransItem, Transaction};
pub use vstr::VersionedStr;

/// Transactional map over fixed-layout values.
pub type ValueMap<V> = TransMap<VersionedCell<V>>;

/// Transactional map over resizable byte strings.
pub type BytesMap = TransMap<VersionedStr>;

/// Why a transaction aborted.
///
/// Every variant is fatal to the current transaction only: the abort has
/// already rolled back speculative inserts and released buffers by the
/// time the error reaches the caller, and re-running the transaction is
/// the expected response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("cell was invalidated by a concurrent transaction")]
    Invalid,

    #[error("read snapshot no longer matches the cell version")]
    VersionMismatch,

    #[error("index leaf changed since the absence witness was recorded")]
    NodeVersionMismatch,

    #[error("cell is locked by another transaction")]
    LockedByOther,

    #[error("transaction has already aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, Error>;
