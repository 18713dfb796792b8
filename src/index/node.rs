//! Leaf and inner nodes.
//!
//! Both node kinds share one field prefix (`parent`, `highkey`, `keys`,
//! `right_link`, `version`), so level-generic code (right-link walks, highkey
//! propagation) behaves the same on either. Leaves live in PM and are
//! initialized in place inside an allocator block; inner nodes are plain
//! host-memory boxes, rebuilt from the log after a crash.
//!
//! Every slot is an `AtomicU64` holding a raw pointer (or, for values, the
//! bits of a [`PolymorphicPointer`]). Writers mutate slots only under the
//! node's version lock; readers validate their version sample around any
//! multi-slot read, so torn logical states are never observed.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::index::version::VersionLock;
use crate::pointer::PolymorphicPointer;

/// Key slots per node in release builds (tree degree 64).
///
/// Deterministic structure tests instantiate nodes with 3 slots instead;
/// the count is a const generic so the persistent layout never depends on
/// the build profile.
pub const DEFAULT_KEYS: usize = 63;

// ============================================================================
//  NodePtr
// ============================================================================

/// A tagged pointer to either node kind.
///
/// Bit 0 distinguishes leaves from inner nodes; both kinds are at least
/// 8-byte aligned so the bit is free. Stored raw in inner-node child slots
/// and in the tree's root word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodePtr(u64);

const LEAF_TAG: u64 = 1;

impl NodePtr {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub fn leaf<const N: usize>(ptr: *mut LeafNode<N>) -> Self {
        debug_assert_eq!(ptr as u64 & LEAF_TAG, 0);
        Self(ptr as u64 | LEAF_TAG)
    }

    #[inline]
    #[must_use]
    pub fn inner<const N: usize>(ptr: *mut InnerNode<N>) -> Self {
        debug_assert_eq!(ptr as u64 & LEAF_TAG, 0);
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        !self.is_null() && self.0 & LEAF_TAG != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_inner(self) -> bool {
        !self.is_null() && self.0 & LEAF_TAG == 0
    }

    /// Untagged leaf pointer. Only meaningful when [`is_leaf`](Self::is_leaf).
    #[inline]
    #[must_use]
    pub const fn as_leaf<const N: usize>(self) -> *mut LeafNode<N> {
        (self.0 & !LEAF_TAG) as *mut LeafNode<N>
    }

    /// Untagged inner pointer. Only meaningful when [`is_inner`](Self::is_inner).
    #[inline]
    #[must_use]
    pub const fn as_inner<const N: usize>(self) -> *mut InnerNode<N> {
        self.0 as *mut InnerNode<N>
    }
}

// ============================================================================
//  LeafNode
// ============================================================================

/// A leaf: sorted key-record pointers plus parallel value slots.
///
/// `keys[0..n)` are strictly increasing record pointers, left-packed with
/// trailing nulls. `values[i]`/`value_sizes[i]` belong to `keys[i]`.
#[repr(C)]
pub struct LeafNode<const N: usize = 63> {
    parent: AtomicU64,
    highkey: AtomicU64,
    keys: [AtomicU64; N],
    right_link: AtomicU64,
    pub(crate) version: VersionLock,
    values: [AtomicU64; N],
    value_sizes: [AtomicU64; N],
}

impl<const N: usize> LeafNode<N> {
    /// Size of a leaf in its PM block.
    #[must_use]
    pub const fn bytes() -> usize {
        size_of::<Self>()
    }

    /// Initialize a leaf in place inside a PM block.
    ///
    /// The block may be recycled, so every byte is zeroed first; the all-zero
    /// image is a valid empty, unlocked leaf. The caller persists it.
    ///
    /// # Safety
    ///
    /// `addr` must be 8-byte aligned and valid for [`bytes`](Self::bytes)
    /// bytes of writes.
    pub unsafe fn init_at(addr: *mut u8) -> *mut Self {
        // SAFETY: caller guarantees the block.
        unsafe { std::ptr::write_bytes(addr, 0, Self::bytes()) };
        addr.cast()
    }

    #[inline]
    pub fn parent(&self) -> *mut InnerNode<N> {
        self.parent.load(Ordering::Acquire) as *mut InnerNode<N>
    }

    #[inline]
    pub fn set_parent(&self, parent: *mut InnerNode<N>) {
        self.parent.store(parent as u64, Ordering::Release);
    }

    #[inline]
    pub fn highkey(&self) -> *const u8 {
        self.highkey.load(Ordering::Acquire) as *const u8
    }

    #[inline]
    pub fn set_highkey(&self, record: *const u8) {
        self.highkey.store(record as u64, Ordering::Release);
    }

    #[inline]
    pub fn right_link(&self) -> *mut Self {
        self.right_link.load(Ordering::Acquire) as *mut Self
    }

    #[inline]
    pub fn set_right_link(&self, sibling: *mut Self) {
        self.right_link.store(sibling as u64, Ordering::Release);
    }

    /// Address of the right-link word, for the split's single persisted
    /// publication store.
    #[inline]
    pub(crate) fn right_link_cell(&self) -> *const u8 {
        std::ptr::from_ref(&self.right_link).cast()
    }

    #[inline]
    pub fn key(&self, index: usize) -> *const u8 {
        self.keys[index].load(Ordering::Acquire) as *const u8
    }

    #[inline]
    pub fn set_key(&self, index: usize, record: *const u8) {
        self.keys[index].store(record as u64, Ordering::Release);
    }

    #[inline]
    pub fn value(&self, index: usize) -> PolymorphicPointer {
        PolymorphicPointer::from_bits(self.values[index].load(Ordering::Acquire))
    }

    #[inline]
    pub fn value_size(&self, index: usize) -> usize {
        self.value_sizes[index].load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn set_value(&self, index: usize, value: PolymorphicPointer, size: usize) {
        self.values[index].store(value.raw_bits(), Ordering::Release);
        self.value_sizes[index].store(size as u64, Ordering::Release);
    }

    /// Occupied key slots.
    #[must_use]
    pub fn key_count(&self) -> usize {
        (0..N).find(|&i| self.key(i).is_null()).unwrap_or(N)
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        !self.key(N - 1).is_null()
    }
}

// ============================================================================
//  InnerNode
// ============================================================================

/// An inner routing node: sorted separators and child pointers.
///
/// A node with `n` keys has `n + 1` children; subtree `i` holds keys
/// `<= keys[i]` and the last child holds keys `> keys[n-1]`. The child one
/// past the key array lives in `last_child` (an `N + 1` array would need
/// unstable const arithmetic).
#[repr(C)]
pub struct InnerNode<const N: usize = 63> {
    parent: AtomicU64,
    highkey: AtomicU64,
    keys: [AtomicU64; N],
    right_link: AtomicU64,
    pub(crate) version: VersionLock,
    children: [AtomicU64; N],
    last_child: AtomicU64,
}

impl<const N: usize> InnerNode<N> {
    /// A fresh inner node in host memory: no keys, no children.
    #[must_use]
    pub fn new_box() -> Box<Self> {
        Box::new(Self {
            parent: AtomicU64::new(0),
            highkey: AtomicU64::new(0),
            keys: std::array::from_fn(|_| AtomicU64::new(0)),
            right_link: AtomicU64::new(0),
            version: VersionLock::new(),
            children: std::array::from_fn(|_| AtomicU64::new(0)),
            last_child: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn parent(&self) -> *mut Self {
        self.parent.load(Ordering::Acquire) as *mut Self
    }

    #[inline]
    pub fn set_parent(&self, parent: *mut Self) {
        self.parent.store(parent as u64, Ordering::Release);
    }

    #[inline]
    pub fn highkey(&self) -> *const u8 {
        self.highkey.load(Ordering::Acquire) as *const u8
    }

    #[inline]
    pub fn set_highkey(&self, record: *const u8) {
        self.highkey.store(record as u64, Ordering::Release);
    }

    #[inline]
    pub fn right_link(&self) -> *mut Self {
        self.right_link.load(Ordering::Acquire) as *mut Self
    }

    #[inline]
    pub fn set_right_link(&self, sibling: *mut Self) {
        self.right_link.store(sibling as u64, Ordering::Release);
    }

    #[inline]
    pub fn key(&self, index: usize) -> *const u8 {
        self.keys[index].load(Ordering::Acquire) as *const u8
    }

    #[inline]
    pub fn set_key(&self, index: usize, record: *const u8) {
        self.keys[index].store(record as u64, Ordering::Release);
    }

    /// Child `index`, where `index == N` addresses the slot past the keys.
    #[inline]
    pub fn child(&self, index: usize) -> NodePtr {
        debug_assert!(index <= N);
        if index < N {
            NodePtr::from_raw(self.children[index].load(Ordering::Acquire))
        } else {
            NodePtr::from_raw(self.last_child.load(Ordering::Acquire))
        }
    }

    #[inline]
    pub fn set_child(&self, index: usize, child: NodePtr) {
        debug_assert!(index <= N);
        if index < N {
            self.children[index].store(child.raw(), Ordering::Release);
        } else {
            self.last_child.store(child.raw(), Ordering::Release);
        }
    }

    /// The rightmost non-null child and its index.
    #[must_use]
    pub fn rightmost_child(&self) -> (usize, NodePtr) {
        for index in (0..=N).rev() {
            let child = self.child(index);
            if !child.is_null() {
                return (index, child);
            }
        }
        (0, NodePtr::NULL)
    }

    /// Occupied key slots.
    #[must_use]
    pub fn key_count(&self) -> usize {
        (0..N).find(|&i| self.key(i).is_null()).unwrap_or(N)
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        !self.key(N - 1).is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ptr_tags_round_trip() {
        let mut leaf_backing = [0u64; 64];
        let leaf = leaf_backing.as_mut_ptr().cast::<LeafNode<3>>();
        let tagged = NodePtr::leaf(leaf);
        assert!(tagged.is_leaf());
        assert!(!tagged.is_inner());
        assert_eq!(tagged.as_leaf::<3>(), leaf);

        let inner = Box::into_raw(InnerNode::<3>::new_box());
        let tagged = NodePtr::inner(inner);
        assert!(tagged.is_inner());
        assert!(!tagged.is_leaf());
        assert_eq!(tagged.as_inner::<3>(), inner);
        // SAFETY: freshly leaked above.
        drop(unsafe { Box::from_raw(inner) });

        assert!(NodePtr::NULL.is_null());
        assert!(!NodePtr::NULL.is_leaf());
        assert!(!NodePtr::NULL.is_inner());
    }

    #[test]
    fn zeroed_block_is_an_empty_leaf() {
        let mut backing = vec![0xa5u8; LeafNode::<3>::bytes() + 8];
        let base = backing.as_mut_ptr();
        let aligned = ((base as usize + 7) & !7) as *mut u8;
        // SAFETY: backing has room for the leaf plus alignment slack.
        let leaf = unsafe { &*LeafNode::<3>::init_at(aligned) };

        assert_eq!(leaf.key_count(), 0);
        assert!(!leaf.is_full());
        assert!(leaf.parent().is_null());
        assert!(leaf.highkey().is_null());
        assert!(leaf.right_link().is_null());
        assert!(leaf.value(0).is_null());
        assert!(!leaf.version.is_locked());
    }

    #[test]
    fn inner_child_slot_past_keys() {
        let inner = InnerNode::<3>::new_box();
        assert_eq!(inner.key_count(), 0);

        let probe = NodePtr::from_raw(0x100);
        inner.set_child(3, probe);
        assert_eq!(inner.child(3), probe);
        assert_eq!(inner.rightmost_child(), (3, probe));

        inner.set_child(0, NodePtr::from_raw(0x200));
        assert_eq!(inner.rightmost_child(), (3, probe));
    }

    #[test]
    fn leaf_and_inner_share_field_prefix() {
        // The level-generic walks read parent/highkey/right_link through
        // either type; the common prefix must line up.
        assert_eq!(std::mem::offset_of!(LeafNode<3>, parent), std::mem::offset_of!(InnerNode<3>, parent));
        assert_eq!(std::mem::offset_of!(LeafNode<3>, highkey), std::mem::offset_of!(InnerNode<3>, highkey));
        assert_eq!(std::mem::offset_of!(LeafNode<3>, keys), std::mem::offset_of!(InnerNode<3>, keys));
        assert_eq!(
            std::mem::offset_of!(LeafNode<3>, right_link),
            std::mem::offset_of!(InnerNode<3>, right_link)
        );
        assert_eq!(
            std::mem::offset_of!(LeafNode<3>, version),
            std::mem::offset_of!(InnerNode<3>, version)
        );
    }
}
