//! Versioned value cells and the version-word protocol
//!
//! Every slot in the index holds a cell whose first word is a packed
//! version: a lock bit, an invalid bit, and a monotonic counter. The word
//! doubles as a mutex (writers spin on the lock bit) and as the OCC
//! read-validation token (readers snapshot the counter and re-check it at
//! commit).
//!
//! Layout of the 32-bit version word, from the most significant bit:
//!
//! ```text
//! ┌──────┬─────────┬───────────────┬──────────────────────────┐
//! │ LOCK │ INVALID │ VALIDITY_ONLY │ counter (29 bits)        │
//! └──────┴─────────┴───────────────┴──────────────────────────┘
//! ```
//!
//! `VALIDITY_ONLY` is never stored on a cell; the read set models that
//! state as its own snapshot variant. The bit is reserved so the counter
//! width matches the layout above.
//!
//! # Atomic payload reads
//!
//! `atomic_read` uses the retry protocol: snapshot the version, spin while
//! the lock bit is set, read the payload, then re-read the version and
//! retry on any change. Payload writes happen only while the lock bit is
//! held, so a stable version pair brackets an untorn payload.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

// ============================================================================
// Version word
// ============================================================================

/// Packed per-cell version word.
pub type Version = u32;

/// Set iff some thread owns the cell for writing.
pub const LOCK_BIT: Version = 1 << 31;

/// Set iff the cell was inserted speculatively or has been logically removed.
pub const INVALID_BIT: Version = 1 << 30;

/// Reserved; never stored on a cell (see module docs).
pub const VALIDITY_ONLY_BIT: Version = 1 << 29;

/// Mask selecting the monotonic counter.
pub const COUNTER_MASK: Version = VALIDITY_ONLY_BIT - 1;

/// Whether the lock bit is set.
#[inline]
pub fn is_locked(v: Version) -> bool {
    v & LOCK_BIT != 0
}

/// Whether the invalid bit is set.
#[inline]
pub fn is_invalid(v: Version) -> bool {
    v & INVALID_BIT != 0
}

/// Whether two version snapshots agree on the counter.
#[inline]
pub fn version_match(a: Version, b: Version) -> bool {
    (a ^ b) & COUNTER_MASK == 0
}

/// Exponential backoff for spin loops.
///
/// Each call to `spin()` executes `count + 1` CPU pause hints, then
/// doubles the count, capped at 15: 0 → 1 → 3 → 7 → 15.
pub(crate) struct Backoff {
    count: u32,
}

impl Backoff {
    #[inline]
    pub(crate) const fn new() -> Self {
        Self { count: 0 }
    }

    #[inline]
    pub(crate) fn spin(&mut self) {
        for _ in 0..=self.count {
            std::hint::spin_loop();
        }
        self.count = ((self.count << 1) | 1) & 15;
    }
}

/// Acquire the cell lock, spinning until the lock bit can be set.
pub fn lock_version(word: &AtomicU32) {
    let mut backoff = Backoff::new();
    loop {
        let cur = word.load(Ordering::Relaxed);
        if !is_locked(cur)
            && word
                .compare_exchange_weak(cur, cur | LOCK_BIT, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }
        backoff.spin();
    }
}

/// Release the cell lock.
pub fn unlock_version(word: &AtomicU32) {
    debug_assert!(is_locked(word.load(Ordering::Relaxed)));
    word.fetch_and(!LOCK_BIT, Ordering::Release);
}

/// Mark the cell invalid. Caller must hold the cell lock.
pub fn set_invalid(word: &AtomicU32) {
    debug_assert!(is_locked(word.load(Ordering::Relaxed)));
    word.fetch_or(INVALID_BIT, Ordering::SeqCst);
}

/// Bump the counter and clear the invalid bit. Caller must hold the cell
/// lock; the lock bit is preserved.
pub fn inc_version(word: &AtomicU32) {
    let v = word.load(Ordering::Relaxed);
    debug_assert!(is_locked(v));
    let counter = (v & COUNTER_MASK).wrapping_add(1) & COUNTER_MASK;
    let next = counter | (v & !COUNTER_MASK & !INVALID_BIT);
    word.store(next, Ordering::Release);
}

// ============================================================================
// Cell shape seam
// ============================================================================

/// A versioned value cell: the shape of payload stored in index slots.
///
/// Two shapes exist: [`VersionedCell`] for fixed-layout values and
/// [`crate::vstr::VersionedStr`] for length-prefixed byte strings. Both
/// put the version word in the same protocol position so the transaction
/// layer treats them uniformly.
pub trait ValueCell: Send + Sync + Sized + 'static {
    /// Payload type handed to and returned from the transactional API.
    type Value: Clone + Send + Sync + 'static;

    /// Allocate a cell holding `value` with the given initial version word.
    fn with_value(value: &Self::Value, init: Version) -> Arc<Self>;

    /// The cell's version word.
    fn version_word(&self) -> &AtomicU32;

    /// Whether storing `new` requires reallocating the cell.
    fn needs_resize(&self, new: &Self::Value) -> bool;

    /// Allocate a replacement cell sized for `new`, carrying over the
    /// current contents and version word. Called only when
    /// [`needs_resize`](ValueCell::needs_resize) returned true.
    fn resized(&self, new: &Self::Value) -> Arc<Self>;

    /// Raw payload read. Coherent only under [`atomic_read`] or while the
    /// cell lock is held (or while the cell is invalid and owned by the
    /// reading transaction).
    fn read_raw(&self) -> Self::Value;

    /// Overwrite the payload. Caller must hold the cell lock, or own the
    /// cell exclusively (a speculative insert before it becomes visible).
    fn write_raw(&self, value: &Self::Value);
}

/// Consistent `(version, payload)` snapshot of a cell.
///
/// Retry protocol: see the module docs. The returned version never has the
/// lock bit set.
pub fn atomic_read<C: ValueCell>(cell: &C) -> (Version, C::Value) {
    let word = cell.version_word();
    let mut backoff = Backoff::new();
    loop {
        let v0 = word.load(Ordering::Acquire);
        if is_locked(v0) {
            backoff.spin();
            continue;
        }
        let value = cell.read_raw();
        fence(Ordering::Acquire);
        let v1 = word.load(Ordering::Acquire);
        if v0 == v1 {
            return (v0, value);
        }
        backoff.spin();
    }
}

// ============================================================================
// Fixed-layout cell
// ============================================================================

/// A versioned cell holding a fixed-layout value.
///
/// `V: Copy` keeps the speculative read in the retry protocol a plain
/// memory copy; variable-length payloads use
/// [`VersionedStr`](crate::vstr::VersionedStr) instead.
pub struct VersionedCell<V: Copy> {
    version: AtomicU32,
    value: UnsafeCell<V>,
}

// Payload access follows the version-word protocol: writes only under the
// lock bit, reads validated by the version pair.
unsafe impl<V: Copy + Send + Sync> Sync for VersionedCell<V> {}
unsafe impl<V: Copy + Send + Sync> Send for VersionedCell<V> {}

impl<V: Copy + Send + Sync + 'static> VersionedCell<V> {
    /// Create a cell with an explicit initial version word.
    pub fn new(value: V, init: Version) -> Self {
        Self {
            version: AtomicU32::new(init),
            value: UnsafeCell::new(value),
        }
    }
}

impl<V: Copy + Send + Sync + 'static> ValueCell for VersionedCell<V> {
    type Value = V;

    fn with_value(value: &V, init: Version) -> Arc<Self> {
        Arc::new(Self::new(*value, init))
    }

    #[inline]
    fn version_word(&self) -> &AtomicU32 {
        &self.version
    }

    #[inline]
    fn needs_resize(&self, _new: &V) -> bool {
        false
    }

    fn resized(&self, _new: &V) -> Arc<Self> {
        unreachable!("fixed-layout cells never resize")
    }

    #[inline]
    fn read_raw(&self) -> V {
        unsafe { std::ptr::read_volatile(self.value.get()) }
    }

    #[inline]
    fn write_raw(&self, value: &V) {
        unsafe { std::ptr::write_volatile(self.value.get(), *value) }
    }
}

// ============================================================================
// Tests
// ============================================================================
