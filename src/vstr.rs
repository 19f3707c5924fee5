//! Resizable byte-string cells
//!
//! A [`VersionedStr`] is the variable-length counterpart of
//! [`VersionedCell`](crate::cell::VersionedCell): a length-prefixed byte
//! buffer sharing the version-word protocol, so both shapes go through
//! the same lock/validation logic. Capacity is fixed at allocation;
//! growth allocates a replacement cell that the index splices over the
//! old one while the old one is invalid. Capacities never shrink.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cell::{ValueCell, Version};

/// Smallest buffer capacity handed out.
const MIN_CAPACITY: usize = 16;

/// A versioned, length-prefixed byte string with a fixed-capacity buffer.
pub struct VersionedStr {
    version: AtomicU32,
    len: AtomicUsize,
    buf: Box<[UnsafeCell<u8>]>,
}

// Byte mutation follows the version-word protocol: writes only under the
// lock bit, reads validated by the version pair.
unsafe impl Sync for VersionedStr {}
unsafe impl Send for VersionedStr {}

impl VersionedStr {
    /// Allocate a cell with at least `capacity` bytes of storage.
    pub fn with_capacity(capacity: usize, init: Version) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        let buf = (0..capacity)
            .map(|_| UnsafeCell::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            version: AtomicU32::new(init),
            len: AtomicUsize::new(0),
            buf,
        }
    }

    /// Buffer capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Current logical length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the current value is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ValueCell for VersionedStr {
    type Value = Vec<u8>;

    fn with_value(value: &Vec<u8>, init: Version) -> Arc<Self> {
        let cell = Self::with_capacity(value.len(), init);
        cell.write_raw(value);
        Arc::new(cell)
    }

    #[inline]
    fn version_word(&self) -> &AtomicU32 {
        &self.version
    }

    #[inline]
    fn needs_resize(&self, new: &Vec<u8>) -> bool {
        self.capacity() < new.len()
    }

    fn resized(&self, new: &Vec<u8>) -> Arc<Self> {
        let capacity = new.len().max(self.capacity() * 2);
        let word = self.version.load(Ordering::Acquire);
        let cell = Self::with_capacity(capacity, word & !crate::cell::LOCK_BIT);
        // carry over the current contents; the old cell is invalid at this
        // point so no writer can race the copy
        cell.write_raw(&self.read_raw());
        Arc::new(cell)
    }

    fn read_raw(&self) -> Vec<u8> {
        let n = self.len().min(self.capacity());
        let mut out = vec![0u8; n];
        unsafe {
            std::ptr::copy_nonoverlapping(self.buf.as_ptr().cast::<u8>(), out.as_mut_ptr(), n);
        }
        out
    }

    fn write_raw(&self, value: &Vec<u8>) {
        debug_assert!(value.len() <= self.capacity());
        let n = value.len().min(self.capacity());
        unsafe {
            std::ptr::copy_nonoverlapping(value.as_ptr(), self.buf.as_ptr() as *mut u8, n);
        }
        self.len.store(n, Ordering::Relaxed);
    }
}

// ============================================================================
// Tests
// ============================================================================
