//! Working-set entries
//!
//! A [`TransItem`] is one entry in a transaction's private working set: a
//! reference to the shared object that owns the state, an opaque key
//! identifying a cell or an index leaf within it, an optional read
//! snapshot, an optional write payload, and flag bits. Items live exactly
//! one transaction.

use std::any::Any;
use std::sync::Arc;

use crate::cell::Version;

use super::shared::Shared;

// ============================================================================
// Keys
// ============================================================================

/// Opaque reference to state owned by a shared object.
///
/// Two kinds coexist in one working set: references to value cells, and
/// references to index leaves used as node-version witnesses. The variant
/// tag discriminates where the original design stole a pointer bit.
#[derive(Clone)]
pub enum ItemKey {
    /// A versioned value cell.
    Cell(Arc<dyn Any + Send + Sync>),
    /// An index leaf witnessed for phantom protection.
    Node(Arc<dyn Any + Send + Sync>),
}

impl ItemKey {
    /// Whether this key names an index leaf rather than a cell.
    #[inline]
    pub fn is_node(&self) -> bool {
        matches!(self, ItemKey::Node(_))
    }

    /// Stable address of the referenced object, used for ordering and
    /// identity.
    #[inline]
    pub(crate) fn addr(&self) -> usize {
        match self {
            ItemKey::Cell(a) | ItemKey::Node(a) => Arc::as_ptr(a) as *const () as usize,
        }
    }

    /// Downcast the referenced object to its concrete type.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        match self {
            ItemKey::Cell(a) | ItemKey::Node(a) => Arc::clone(a).downcast::<T>().ok(),
        }
    }
}

// ============================================================================
// Read snapshots
// ============================================================================

/// What a transaction relied on when it read an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSnapshot {
    /// The cell's full counter at read time; validation requires the
    /// counter to be unchanged.
    Version(Version),
    /// Only the cell's validity was relied on, not its contents.
    ValidityOnly,
    /// An index leaf's full version at witness time; validation requires
    /// it to be unchanged (phantom protection).
    NodeVersion(u64),
}

// ============================================================================
// TransItem
// ============================================================================

/// One entry in a transaction's working set.
pub struct TransItem {
    shared: Arc<dyn Shared>,
    key: ItemKey,
    read: Option<ReadSnapshot>,
    write: Option<Box<dyn Any + Send>>,
    has_undo: bool,
    has_after_commit: bool,
    deleted: bool,
}

impl TransItem {
    pub(crate) fn new(shared: Arc<dyn Shared>, key: ItemKey) -> Self {
        Self {
            shared,
            key,
            read: None,
            write: None,
            has_undo: false,
            has_after_commit: false,
            deleted: false,
        }
    }

    /// The shared object this item belongs to.
    #[inline]
    pub fn shared(&self) -> &Arc<dyn Shared> {
        &self.shared
    }

    /// The item's key.
    #[inline]
    pub fn key(&self) -> &ItemKey {
        &self.key
    }

    /// Whether a read snapshot was recorded.
    #[inline]
    pub fn has_read(&self) -> bool {
        self.read.is_some()
    }

    /// Whether a write payload was recorded.
    #[inline]
    pub fn has_write(&self) -> bool {
        self.write.is_some()
    }

    /// Whether this item's insert must be rolled back on abort.
    #[inline]
    pub fn has_undo(&self) -> bool {
        self.has_undo
    }

    /// Whether the post-commit hook runs for this item.
    #[inline]
    pub fn has_after_commit(&self) -> bool {
        self.has_after_commit
    }

    /// Whether the item is marked for deletion at commit.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// The recorded read snapshot, if any.
    #[inline]
    pub fn read_snapshot(&self) -> Option<ReadSnapshot> {
        self.read
    }

    /// The recorded write payload, downcast to its concrete type.
    pub fn write_value<T: 'static>(&self) -> Option<&T> {
        self.write.as_ref()?.downcast_ref::<T>()
    }

    /// Remove and return the write payload (buffer release in `cleanup`).
    pub fn take_write(&mut self) -> Option<Box<dyn Any + Send>> {
        self.write.take()
    }

    pub(crate) fn set_read(&mut self, snapshot: ReadSnapshot) {
        self.read = Some(snapshot);
    }

    pub(crate) fn set_write(&mut self, data: Box<dyn Any + Send>) {
        self.write = Some(data);
    }

    pub(crate) fn set_undo(&mut self) {
        self.has_undo = true;
    }

    pub(crate) fn set_after_commit(&mut self) {
        self.has_after_commit = true;
    }

    pub(crate) fn set_deleted(&mut self) {
        self.deleted = true;
    }

    pub(crate) fn clear_deleted(&mut self) {
        self.deleted = false;
    }

    /// Re-key the item at a replacement cell (resize splices a new cell
    /// over the old one; the item follows it).
    pub(crate) fn rekey(&mut self, key: ItemKey) {
        self.key = key;
    }

    /// Stable address of the owning shared object.
    #[inline]
    pub(crate) fn shared_addr(&self) -> usize {
        Arc::as_ptr(&self.shared) as *const () as usize
    }

    /// Total order over `(shared, key)`: the global lock order.
    #[inline]
    pub(crate) fn sort_key(&self) -> (usize, usize) {
        (self.shared_addr(), self.key.addr())
    }

    /// Whether two items reference the same state.
    #[inline]
    pub(crate) fn same_item(&self, other: &TransItem) -> bool {
        self.shared_addr() == other.shared_addr()
            && self.key.addr() == other.key.addr()
            && self.key.is_node() == other.key.is_node()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::Transaction;

    struct Noop;
    impl Shared for Noop {
        fn lock(&self, _item: &TransItem) {}
        fn unlock(&self, _item: &TransItem) {}
        fn check(&self, _item: &TransItem, _txn: &Transaction) -> bool {
            true
        }
        fn install(&self, _item: &mut TransItem) {}
        fn undo(&self, _item: &mut TransItem) {}
    }

    fn cell_key(v: u32) -> ItemKey {
        ItemKey::Cell(Arc::new(v))
    }

    #[test]
    fn test_key_downcast() {
        let key = cell_key(7);
        assert_eq!(*key.downcast::<u32>().unwrap(), 7);
        assert!(key.downcast::<u64>().is_none());
        assert!(!key.is_node());
    }

    #[test]
    fn test_same_item_distinguishes_kind_and_target() {
        let shared: Arc<dyn Shared> = Arc::new(Noop);
        let target: Arc<dyn Any + Send + Sync> = Arc::new(1u32);
        let a = TransItem::new(Arc::clone(&shared), ItemKey::Cell(Arc::clone(&target)));
        let b = TransItem::new(Arc::clone(&shared), ItemKey::Cell(Arc::clone(&target)));
        let c = TransItem::new(Arc::clone(&shared), ItemKey::Node(target));
        let d = TransItem::new(shared, cell_key(1));
        assert!(a.same_item(&b));
        assert!(!a.same_item(&c));
        assert!(!a.same_item(&d));
    }

    #[test]
    fn test_write_payload_round_trip() {
        let shared: Arc<dyn Shared> = Arc::new(Noop);
        let mut item = TransItem::new(shared, cell_key(0));
        assert!(!item.has_write());
        item.set_write(Box::new(String::from("payload")));
        assert!(item.has_write());
        assert_eq!(item.write_value::<String>().unwrap(), "payload");
        assert!(item.write_value::<u32>().is_none());
        assert!(item.take_write().is_some());
        assert!(!item.has_write());
    }

    #[test]
    fn test_sort_key_orders_by_shared_then_key() {
        let s1: Arc<dyn Shared> = Arc::new(Noop);
        let k1 = cell_key(1);
        let k2 = cell_key(2);
        let a = TransItem::new(Arc::clone(&s1), k1);
        let b = TransItem::new(s1, k2);
        assert_eq!(a.sort_key().0, b.sort_key().0);
        assert_ne!(a.sort_key().1, b.sort_key().1);
    }
}
