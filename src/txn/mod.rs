//! Transaction layer — working sets and the OCC commit pipeline
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  Transaction                                     │
//! │  - Private working set (reads, writes, witnesses)│
//! │  - Write permutation in global lock order        │
//! │  - Commit: lock → validate → install → unlock    │
//! ├──────────────────────────────────────────────────┤
//! │  TransItem                                       │
//! │  - One working-set entry: shared object + key    │
//! │  - Read snapshot / write payload / flag bits     │
//! ├──────────────────────────────────────────────────┤
//! │  Shared (contract)                               │
//! │  - lock / check / install / undo                 │
//! │  - cleanup / after_commit                        │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Any structure implementing [`Shared`] can participate in a transaction;
//! the ordered index adaptor in [`crate::index`] is the built-in
//! participant.

pub mod item;
pub mod shared;
pub mod transaction;

pub use item::{ItemKey, ReadSnapshot, TransItem};
pub use shared::Shared;
pub use transaction::Transaction;
