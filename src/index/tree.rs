//! The concurrent order-preserving index.
//!
//! A B⁺-tree with right-links between siblings at every level. Readers
//! descend without locks, validating a version sample across each child
//! selection; writers latch exactly the nodes they mutate. Because a split
//! publishes its new sibling through the right-link before the parent learns
//! about it, both readers and writers fall back to right-link chasing when a
//! key lies beyond a node's highkey. That drain is what makes the lag
//! between child publication and parent update harmless.
//!
//! Leaves and the key/value records they point at live in PM; inner nodes
//! are host memory and are rebuilt from the write-ahead log after a crash.
//! Every structural mutation is bracketed by a log entry: reserve, allocate
//! (the allocator writes the block address straight into the entry),
//! publish, commit.

use std::cmp::Ordering as Cmp;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::alloc::Allocator;
use crate::error::IndexError;
use crate::index::node::{InnerNode, LeafNode, NodePtr};
use crate::index::version::VersionGuard;
use crate::pmem::persist;
use crate::pointer::PolymorphicPointer;
use crate::record::{ByteRecord, KvLayout};
use crate::tracelog::{debug_log, trace_log, warn_log};
use crate::wal::{LogOp, Logger};

/// Compare the record at `rec` against a probe key.
#[inline]
fn rec_cmp(rec: *const u8, probe: &[u8]) -> Cmp {
    debug_assert!(!rec.is_null());
    // SAFETY: node slots only ever hold published, immutable records.
    unsafe { ByteRecord::compare(rec, probe) }
}

/// Payload of the record at `rec`.
#[inline]
fn rec_bytes<'a>(rec: *const u8) -> &'a [u8] {
    debug_assert!(!rec.is_null());
    // SAFETY: node slots only ever hold published, immutable records.
    unsafe { ByteRecord::bytes(rec) }
}

// ============================================================================
//  SearchHit
// ============================================================================

/// A successful point lookup.
///
/// Holds the value's [`PolymorphicPointer`] and its size. The borrow ties
/// the hit to the index, whose records stay live for its whole lifetime.
#[derive(Debug, Clone, Copy)]
pub struct SearchHit<'a> {
    /// Where the value lives; possibly on another cluster node.
    pub ptr: PolymorphicPointer,

    /// Value size in bytes.
    pub size: usize,

    _index: PhantomData<&'a ()>,
}

impl<'a> SearchHit<'a> {
    /// The value payload, or `None` for a remote value (which this node
    /// must not dereference).
    #[must_use]
    pub fn value_bytes(&self) -> Option<&'a [u8]> {
        self.ptr.is_local().then(|| rec_bytes(self.ptr.as_local()))
    }
}

// ============================================================================
//  Index
// ============================================================================

/// A concurrent B⁺-tree over PM-resident leaves.
///
/// `N` is the number of key slots per node (degree `N + 1`). The release
/// default is 63; structure tests pin 3 for determinism.
pub struct Index<const N: usize = 63> {
    root: AtomicU64,
    alloc: Arc<Allocator>,
    logger: Arc<Logger>,
    /// Host-memory inner nodes, owned for teardown. Nodes are never freed
    /// while the index lives.
    inners: Mutex<Vec<*mut InnerNode<N>>>,
}

// SAFETY: all node state is behind atomics and version locks; the inner
// registry is behind a mutex.
unsafe impl<const N: usize> Send for Index<N> {}
unsafe impl<const N: usize> Sync for Index<N> {}

impl<const N: usize> Index<N> {
    /// Build an empty index whose root leaf lives in PM.
    ///
    /// The bootstrap allocation is bracketed by a `NodeSplit` entry, the
    /// same record a root-creating split writes.
    ///
    /// # Errors
    ///
    /// [`IndexError::NoMemory`] / [`IndexError::NoLog`] when the bootstrap
    /// allocation cannot be made.
    pub fn new(tid: usize, alloc: Arc<Allocator>, logger: Arc<Logger>) -> Result<Self, IndexError> {
        const { assert!(N >= 3, "an inner split needs at least three key slots") };

        let entry = logger.make_log(tid, LogOp::NodeSplit)?;
        alloc.allocate(tid, LeafNode::<N>::bytes(), entry.address_cell())?;
        let addr = entry.address();
        // SAFETY: the allocator returned an 8-aligned block of leaf size.
        let root = unsafe { LeafNode::<N>::init_at(addr as *mut u8) };
        // SAFETY: the block is mapped PM.
        unsafe { persist(addr as *const u8, LeafNode::<N>::bytes()) };
        entry.commit();

        Ok(Self {
            root: AtomicU64::new(NodePtr::leaf(root).raw()),
            alloc,
            logger,
            inners: Mutex::new(Vec::new()),
        })
    }

    // ========================================================================
    //  Search
    // ========================================================================

    /// Point lookup.
    ///
    /// Lock-free: the descent validates a version sample around each child
    /// selection, and the leaf scan re-validates before returning. A reader
    /// racing a split finds relocated keys through the right-link.
    #[must_use]
    pub fn search(&self, key: &[u8]) -> Option<SearchHit<'_>> {
        let mut leaf_ptr = self.descend(key);
        loop {
            // SAFETY: leaves are never destroyed while the index lives.
            let leaf = unsafe { &*leaf_ptr };
            let sample = leaf.version.read();
            if sample & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }

            let mut hit = None;
            for i in 0..N {
                let rec = leaf.key(i);
                if rec.is_null() {
                    break;
                }
                if rec_cmp(rec, key) == Cmp::Equal {
                    hit = Some(SearchHit {
                        ptr: leaf.value(i),
                        size: leaf.value_size(i),
                        _index: PhantomData,
                    });
                    break;
                }
            }
            let highkey = leaf.highkey();
            let right = leaf.right_link();

            if leaf.version.read() != sample {
                continue;
            }
            if hit.is_some() {
                return hit;
            }
            // The key may have moved right under us.
            if !right.is_null() && !highkey.is_null() && rec_cmp(highkey, key) == Cmp::Less {
                trace_log!("lookup chases right-link");
                leaf_ptr = right;
                continue;
            }
            return None;
        }
    }

    /// Optimistic descent to the leaf that should cover `key`.
    fn descend(&self, key: &[u8]) -> *mut LeafNode<N> {
        let mut current = NodePtr::from_raw(self.root.load(Ordering::Acquire));
        loop {
            if current.is_leaf() {
                return current.as_leaf();
            }
            // SAFETY: inner nodes are never destroyed while the index lives.
            let inner = unsafe { &*current.as_inner::<N>() };
            let sample = inner.version.read();
            if sample & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let next = Self::select_child(inner, key);
            if inner.version.read() != sample {
                // The node changed under the selection; retry it.
                continue;
            }
            if next.is_null() {
                // A consistent node never routes nowhere; be loud in debug
                // builds and restart the descent otherwise.
                debug_assert!(false, "descent selected a null child");
                warn_log!("descent selected a null child; restarting from root");
                current = NodePtr::from_raw(self.root.load(Ordering::Acquire));
                continue;
            }
            current = next;
        }
    }

    /// Route `key` one level down from `inner`.
    ///
    /// Keys equal to the node's highkey live in the rightmost subtree; keys
    /// beyond it belong to a right sibling. Inside the node, the scan takes
    /// the first slot whose separator is at least `key`; separators are the
    /// max of their subtree, so equality routes left.
    fn select_child(inner: &InnerNode<N>, key: &[u8]) -> NodePtr {
        let highkey = inner.highkey();
        if !highkey.is_null() {
            match rec_cmp(highkey, key) {
                Cmp::Equal => return inner.rightmost_child().1,
                Cmp::Less => {
                    let link = inner.right_link();
                    if !link.is_null() {
                        return NodePtr::inner(link);
                    }
                    return inner.rightmost_child().1;
                }
                Cmp::Greater => {}
            }
        }

        for i in 0..N {
            let rec = inner.key(i);
            if rec.is_null() || rec_cmp(rec, key) != Cmp::Less {
                return inner.child(i);
            }
        }
        inner.child(N)
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    /// Insert `key` → `value`, owned by thread slot `tid`.
    ///
    /// # Errors
    ///
    /// [`IndexError::RepeatInsert`] for a duplicate key (the stored value is
    /// untouched); [`IndexError::NoMemory`] when the records cannot be
    /// allocated; [`IndexError::NoLog`] when the slot's log region is stuck
    /// full. None of the error paths mutate the tree.
    pub fn insert(&self, tid: usize, key: &[u8], value: &[u8]) -> Result<(), IndexError> {
        let layout = KvLayout::new(key.len(), value.len());
        if layout.total > crate::alloc::MAX_ALLOC {
            return Err(IndexError::NoMemory);
        }

        let (leaf, guard) = self.lock_covering_leaf(key);

        for i in 0..N {
            let rec = leaf.key(i);
            if rec.is_null() {
                break;
            }
            if rec_cmp(rec, key) == Cmp::Equal {
                return Err(IndexError::RepeatInsert);
            }
        }

        if leaf.is_full() {
            let result = self.split_leaf(tid, leaf, key, value, layout);
            drop(guard);
            return result;
        }

        let entry = self.logger.make_log(tid, LogOp::Insert)?;
        self.alloc.allocate(tid, layout.total, entry.address_cell())?;
        let block = entry.address() as *mut u8;
        let (key_rec, value_rec) = write_kv(block, layout, key, value);

        Self::leaf_place(leaf, key_rec, value_rec, value.len());

        // A rightmost leaf tracks its own max so ancestors can keep their
        // highkeys exact.
        let mut raised_high = false;
        if leaf.right_link().is_null() {
            let highkey = leaf.highkey();
            if highkey.is_null() || rec_cmp(highkey, key) == Cmp::Less {
                leaf.set_highkey(key_rec);
                raised_high = true;
            }
        }

        // SAFETY: the leaf is a mapped PM block.
        unsafe { persist(std::ptr::from_ref(leaf).cast(), LeafNode::<N>::bytes()) };
        entry.commit();

        #[cfg(debug_assertions)]
        Self::debug_assert_sorted(leaf);

        let leaf_ptr = std::ptr::from_ref(leaf).cast_mut();
        drop(guard);
        if raised_high {
            self.update_highkeys(NodePtr::leaf(leaf_ptr));
        }
        Ok(())
    }

    /// Descend, latch the landing leaf, then move right while the right
    /// sibling's first key is at or below `key`, draining any split whose
    /// parent update we raced.
    fn lock_covering_leaf(&self, key: &[u8]) -> (&LeafNode<N>, VersionGuard<'_>) {
        // SAFETY: leaves are never destroyed while the index lives.
        let mut leaf: &LeafNode<N> = unsafe { &*self.descend(key) };
        let mut guard = leaf.version.lock();
        loop {
            let link = leaf.right_link();
            if link.is_null() {
                break;
            }
            // SAFETY: as above.
            let sibling: &LeafNode<N> = unsafe { &*link };
            let first = sibling.key(0);
            if first.is_null() || rec_cmp(first, key) == Cmp::Greater {
                break;
            }
            trace_log!("insert moves right");
            let next = sibling.version.lock();
            drop(guard);
            leaf = sibling;
            guard = next;
        }
        (leaf, guard)
    }

    /// Place a record pair into a non-full leaf, keeping keys sorted and
    /// left-packed. The value slots go in before the key pointer, so a
    /// validated reader never sees a keyed slot without its value.
    fn leaf_place(leaf: &LeafNode<N>, key_rec: *const u8, value_rec: *const u8, value_len: usize) {
        let count = leaf.key_count();
        debug_assert!(count < N);
        let key_bytes = rec_bytes(key_rec);

        let mut pos = count;
        for i in 0..count {
            if rec_cmp(leaf.key(i), key_bytes) == Cmp::Greater {
                pos = i;
                break;
            }
        }
        for i in (pos..count).rev() {
            leaf.set_value(i + 1, leaf.value(i), leaf.value_size(i));
            leaf.set_key(i + 1, leaf.key(i));
        }
        leaf.set_value(pos, PolymorphicPointer::local(value_rec), value_len);
        leaf.set_key(pos, key_rec);
    }

    // ========================================================================
    //  Split
    // ========================================================================

    /// Split a full leaf and insert the pending pair into the proper half.
    ///
    /// The caller holds the leaf's latch (and keeps holding it through the
    /// push-up, so the split chain is serialized bottom-to-top). Readers
    /// spin on the latch, so the leaf is never observed mid-carve; the
    /// persisted store of `right_link` is the durability linearization
    /// point.
    fn split_leaf(
        &self,
        tid: usize,
        leaf: &LeafNode<N>,
        key: &[u8],
        value: &[u8],
        layout: KvLayout,
    ) -> Result<(), IndexError> {
        // Two records are written below; room for both has to exist before
        // the first one is open, or the region cannot recycle between them.
        self.logger.ensure_capacity(tid, 2)?;
        let split_entry = self.logger.make_log(tid, LogOp::NodeSplit)?;
        self.alloc.allocate(tid, LeafNode::<N>::bytes(), split_entry.address_cell())?;
        // SAFETY: the allocator returned an 8-aligned block of leaf size.
        let new_leaf_ptr = unsafe { LeafNode::<N>::init_at(split_entry.address() as *mut u8) };
        // SAFETY: new_leaf_ptr was initialized just above.
        let new_leaf = unsafe { &*new_leaf_ptr };

        let kv_entry = self.logger.make_log(tid, LogOp::Insert)?;
        self.alloc.allocate(tid, layout.total, kv_entry.address_cell())?;
        let (key_rec, value_rec) = write_kv(kv_entry.address() as *mut u8, layout, key, value);

        // Upper half migrates; value pointer bits are copied verbatim.
        let mid = N.div_ceil(2);
        for (dst, src) in (mid..N).enumerate() {
            new_leaf.set_value(dst, leaf.value(src), leaf.value_size(src));
            new_leaf.set_key(dst, leaf.key(src));
        }
        let median = leaf.key(mid - 1);
        debug_log!(median = ?rec_bytes(median), "leaf split");

        let pending_right = rec_cmp(median, key) == Cmp::Less;
        if pending_right {
            Self::leaf_place(new_leaf, key_rec, value_rec, value.len());
        }

        new_leaf.set_right_link(leaf.right_link());
        new_leaf.set_highkey(leaf.highkey());
        new_leaf.set_parent(leaf.parent());
        if new_leaf.right_link().is_null() {
            // Rightmost leaf keeps a concrete max for highkey propagation.
            new_leaf.set_highkey(new_leaf.key(new_leaf.key_count() - 1));
        }
        // SAFETY: the new leaf is a mapped PM block.
        unsafe { persist(new_leaf_ptr.cast(), LeafNode::<N>::bytes()) };

        for i in mid..N {
            leaf.set_key(i, std::ptr::null());
            leaf.set_value(i, PolymorphicPointer::NULL, 0);
        }
        if !pending_right {
            Self::leaf_place(leaf, key_rec, value_rec, value.len());
        }
        leaf.set_highkey(median);
        // SAFETY: the leaf is a mapped PM block.
        unsafe { persist(std::ptr::from_ref(leaf).cast(), LeafNode::<N>::bytes()) };

        // Linearization: one persisted 8-byte store publishes the sibling.
        leaf.set_right_link(new_leaf_ptr);
        // SAFETY: the right-link word is mapped PM.
        unsafe { persist(leaf.right_link_cell(), 8) };

        kv_entry.commit();
        split_entry.commit();

        #[cfg(debug_assertions)]
        {
            Self::debug_assert_sorted(leaf);
            Self::debug_assert_sorted(new_leaf);
        }

        let leaf_ptr = std::ptr::from_ref(leaf).cast_mut();
        self.push_up(NodePtr::leaf(leaf_ptr), NodePtr::leaf(new_leaf_ptr), median);
        Ok(())
    }

    /// Propagate a split: hang `new_node` (everything right of `split_key`)
    /// off the parent of `left`, splitting ancestors as needed.
    ///
    /// The caller holds `left`'s latch, which pins `left`'s position in the
    /// tree; ancestor latches are taken child-before-parent, so concurrent
    /// push-ups cannot deadlock.
    fn push_up(&self, left: NodePtr, new_node: NodePtr, split_key: *const u8) {
        let split_bytes = rec_bytes(split_key);
        loop {
            let parent_ptr = Self::node_parent(left);
            if parent_ptr.is_null() {
                if self.try_make_root(left, new_node, split_key) {
                    return;
                }
                // Another thread is publishing a root above us; our parent
                // pointer appears as soon as it finishes.
                std::hint::spin_loop();
                continue;
            }

            // SAFETY: inner nodes are never destroyed while the index lives.
            let mut parent: &InnerNode<N> = unsafe { &*parent_ptr };
            let mut pguard = parent.version.lock();
            loop {
                let link = parent.right_link();
                if link.is_null() {
                    break;
                }
                // SAFETY: as above.
                let sibling: &InnerNode<N> = unsafe { &*link };
                let first = sibling.key(0);
                if first.is_null() || rec_cmp(first, split_bytes) == Cmp::Greater {
                    break;
                }
                trace_log!("push-up moves right");
                let next = sibling.version.lock();
                drop(pguard);
                parent = sibling;
                pguard = next;
            }
            let parent_ptr = std::ptr::from_ref(parent).cast_mut();

            if !parent.is_full() {
                Self::inner_place(parent, split_key, new_node);
                Self::node_set_parent(new_node, parent_ptr);

                let (_, rightmost) = parent.rightmost_child();
                let extended = rightmost == new_node;
                if extended {
                    parent.set_highkey(Self::node_highkey(new_node));
                }
                drop(pguard);
                if extended {
                    self.update_highkeys(NodePtr::inner(parent_ptr));
                }
                return;
            }

            let (new_inner, promoted) = self.split_inner(parent, split_key, new_node);
            // The recursion runs under this level's latch; pguard drops
            // only once every ancestor knows about the sibling.
            self.push_up(NodePtr::inner(parent_ptr), NodePtr::inner(new_inner), promoted);
            drop(pguard);
            return;
        }
    }

    /// Replace a split root with a fresh inner node over both halves.
    ///
    /// `left` is latched by the caller and was the root when its split
    /// began; losing the CAS means another thread just built a root whose
    /// subtree contains us, so the caller re-reads its parent pointer.
    fn try_make_root(&self, left: NodePtr, new_node: NodePtr, split_key: *const u8) -> bool {
        if self.root.load(Ordering::Acquire) != left.raw() {
            return false;
        }

        let root = InnerNode::<N>::new_box();
        root.set_key(0, split_key);
        root.set_child(0, left);
        root.set_child(1, new_node);
        root.set_highkey(Self::node_highkey(new_node));
        let root_ptr = Box::into_raw(root);

        match self.root.compare_exchange(
            left.raw(),
            NodePtr::inner(root_ptr).raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                debug_log!("new root published");
                Self::node_set_parent(left, root_ptr);
                Self::node_set_parent(new_node, root_ptr);
                // An insert that raised new_node's max before its parent
                // pointer existed had nowhere to propagate; re-reading the
                // highkey under the new root's latch picks it up, and any
                // later raise finds the parent pointer in place.
                {
                    // SAFETY: root_ptr was published above and stays live.
                    let root = unsafe { &*root_ptr };
                    let guard = root.version.lock();
                    root.set_highkey(Self::node_highkey(new_node));
                    drop(guard);
                }
                self.inners.lock().push(root_ptr);
                true
            }
            Err(_) => {
                // SAFETY: root_ptr was leaked above and never published.
                drop(unsafe { Box::from_raw(root_ptr) });
                false
            }
        }
    }

    /// Insert `(split_key, child)` into a non-full inner node, the child
    /// landing immediately right of the key.
    fn inner_place(inner: &InnerNode<N>, split_key: *const u8, child: NodePtr) {
        debug_assert!(!inner.is_full());
        let count = inner.key_count();
        let split_bytes = rec_bytes(split_key);

        let mut pos = count;
        for i in 0..count {
            if rec_cmp(inner.key(i), split_bytes) == Cmp::Greater {
                pos = i;
                break;
            }
        }
        for i in (pos..count).rev() {
            inner.set_key(i + 1, inner.key(i));
        }
        for i in ((pos + 1)..=count).rev() {
            inner.set_child(i + 1, inner.child(i));
        }
        inner.set_key(pos, split_key);
        inner.set_child(pos + 1, child);
    }

    /// Split a full inner node under its latch.
    ///
    /// Mirrors the leaf split with two differences: the halves live in host
    /// memory, and the promoted separator is removed from both halves. The
    /// pending pair goes into its half before the sibling link is published,
    /// so the unlatched new node is never reachable while incomplete.
    fn split_inner(
        &self,
        inner: &InnerNode<N>,
        pending_key: *const u8,
        pending_child: NodePtr,
    ) -> (*mut InnerNode<N>, *const u8) {
        let new_inner_box = InnerNode::<N>::new_box();
        let new_inner_ptr = Box::into_raw(new_inner_box);
        self.inners.lock().push(new_inner_ptr);
        // SAFETY: just leaked; registered for teardown.
        let new_inner = unsafe { &*new_inner_ptr };

        let mid = N.div_ceil(2);
        let promoted = inner.key(mid - 1);
        debug_log!(promoted = ?rec_bytes(promoted), "inner split");

        for (dst, src) in (mid..N).enumerate() {
            new_inner.set_key(dst, inner.key(src));
        }
        for (dst, src) in (mid..=N).enumerate() {
            let child = inner.child(src);
            new_inner.set_child(dst, child);
            Self::node_set_parent(child, new_inner_ptr);
        }
        new_inner.set_right_link(inner.right_link());
        new_inner.set_highkey(inner.highkey());
        new_inner.set_parent(inner.parent());
        if new_inner.right_link().is_null() {
            let (_, rightmost) = new_inner.rightmost_child();
            new_inner.set_highkey(Self::node_highkey(rightmost));
        }

        let inner_ptr = std::ptr::from_ref(inner).cast_mut();
        let pending_right = rec_cmp(promoted, rec_bytes(pending_key)) == Cmp::Less;
        if pending_right {
            Self::inner_place(new_inner, pending_key, pending_child);
            Self::node_set_parent(pending_child, new_inner_ptr);
        }

        // Prune the left half; the promoted key leaves both halves.
        for i in (mid - 1)..N {
            inner.set_key(i, std::ptr::null());
        }
        for i in mid..=N {
            inner.set_child(i, NodePtr::NULL);
        }
        inner.set_highkey(promoted);
        if !pending_right {
            Self::inner_place(inner, pending_key, pending_child);
            Self::node_set_parent(pending_child, inner_ptr);
        }

        inner.set_right_link(new_inner_ptr);
        (new_inner_ptr, promoted)
    }

    /// Walk up the rightmost spine refreshing ancestors' highkeys from the
    /// child that just grew its range. Stops at the first position that is
    /// not the parent's rightmost child.
    fn update_highkeys(&self, mut child: NodePtr) {
        loop {
            let parent_ptr = Self::node_parent(child);
            if parent_ptr.is_null() {
                return;
            }
            // SAFETY: inner nodes are never destroyed while the index lives.
            let parent = unsafe { &*parent_ptr };
            let guard = parent.version.lock();
            if Self::node_parent(child) != parent_ptr {
                // The child migrated (its level split) while we were
                // waiting; chase its current parent instead.
                drop(guard);
                continue;
            }
            if parent.rightmost_child().1 != child {
                return;
            }
            parent.set_highkey(Self::node_highkey(child));
            drop(guard);
            child = NodePtr::inner(parent_ptr);
        }
    }

    // ========================================================================
    //  Kind dispatch over the shared node prefix
    // ========================================================================

    fn node_parent(node: NodePtr) -> *mut InnerNode<N> {
        // SAFETY: nodes are never destroyed while the index lives.
        unsafe {
            if node.is_leaf() {
                (*node.as_leaf::<N>()).parent()
            } else {
                (*node.as_inner::<N>()).parent()
            }
        }
    }

    fn node_set_parent(node: NodePtr, parent: *mut InnerNode<N>) {
        // SAFETY: as above.
        unsafe {
            if node.is_leaf() {
                (*node.as_leaf::<N>()).set_parent(parent);
            } else {
                (*node.as_inner::<N>()).set_parent(parent);
            }
        }
    }

    fn node_highkey(node: NodePtr) -> *const u8 {
        // SAFETY: as above.
        unsafe {
            if node.is_leaf() {
                (*node.as_leaf::<N>()).highkey()
            } else {
                (*node.as_inner::<N>()).highkey()
            }
        }
    }

    // ========================================================================
    //  Introspection (quiesced callers only)
    // ========================================================================

    /// Levels below the root.
    #[must_use]
    pub fn height(&self) -> usize {
        let mut node = NodePtr::from_raw(self.root.load(Ordering::Acquire));
        let mut height = 0;
        while node.is_inner() {
            // SAFETY: inner nodes are never destroyed while the index lives.
            node = unsafe { (*node.as_inner::<N>()).child(0) };
            height += 1;
        }
        height
    }

    /// The root's key bytes, whichever kind it is.
    #[must_use]
    pub fn root_keys(&self) -> Vec<Vec<u8>> {
        let root = NodePtr::from_raw(self.root.load(Ordering::Acquire));
        let mut keys = Vec::new();
        for i in 0..N {
            let rec = if root.is_leaf() {
                // SAFETY: the root is never destroyed while the index lives.
                unsafe { (*root.as_leaf::<N>()).key(i) }
            } else {
                // SAFETY: as above.
                unsafe { (*root.as_inner::<N>()).key(i) }
            };
            if rec.is_null() {
                break;
            }
            keys.push(rec_bytes(rec).to_vec());
        }
        keys
    }

    /// Every key in leaf order, by walking the leftmost leaf's right-links.
    #[must_use]
    pub fn scan_leaves(&self) -> Vec<Vec<u8>> {
        let mut node = NodePtr::from_raw(self.root.load(Ordering::Acquire));
        while node.is_inner() {
            // SAFETY: inner nodes are never destroyed while the index lives.
            node = unsafe { (*node.as_inner::<N>()).child(0) };
        }
        let mut keys = Vec::new();
        let mut leaf_ptr = node.as_leaf::<N>();
        while !leaf_ptr.is_null() {
            // SAFETY: leaves are never destroyed while the index lives.
            let leaf = unsafe { &*leaf_ptr };
            for i in 0..N {
                let rec = leaf.key(i);
                if rec.is_null() {
                    break;
                }
                keys.push(rec_bytes(rec).to_vec());
            }
            leaf_ptr = leaf.right_link();
        }
        keys
    }

    /// Check the structural invariants, panicking on the first violation:
    /// sorted left-packed keys, subtree key ranges against their
    /// separators, highkey coverage, and an ascending right-link walk.
    pub fn verify(&self) {
        let root = NodePtr::from_raw(self.root.load(Ordering::Acquire));
        self.verify_node(root);

        let keys = self.scan_leaves();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1], "right-link walk out of order");
        }
    }

    /// Returns the subtree's max key bytes.
    fn verify_node(&self, node: NodePtr) -> Option<Vec<u8>> {
        if node.is_leaf() {
            // SAFETY: leaves are never destroyed while the index lives.
            let leaf = unsafe { &*node.as_leaf::<N>() };
            let count = leaf.key_count();
            for i in count..N {
                assert!(leaf.key(i).is_null(), "leaf keys not left-packed");
            }
            let mut last: Option<&[u8]> = None;
            for i in 0..count {
                let bytes = rec_bytes(leaf.key(i));
                if let Some(prev) = last {
                    assert!(prev < bytes, "leaf keys out of order");
                }
                assert!(!leaf.value(i).is_null(), "keyed slot without a value");
                last = Some(bytes);
            }
            let highkey = leaf.highkey();
            if !highkey.is_null()
                && let Some(max) = last
            {
                assert!(max <= rec_bytes(highkey), "leaf key above its highkey");
            }
            return last.map(<[u8]>::to_vec);
        }

        // SAFETY: inner nodes are never destroyed while the index lives.
        let inner = unsafe { &*node.as_inner::<N>() };
        let count = inner.key_count();
        assert!(count > 0, "inner node with no separators");

        let mut last: Option<Vec<u8>> = None;
        for i in 0..count {
            let separator = rec_bytes(inner.key(i)).to_vec();
            if let Some(prev) = &last {
                assert!(*prev < separator, "inner separators out of order");
            }
            let child = inner.child(i);
            assert!(!child.is_null(), "separator without a child");
            if let Some(max) = self.verify_node(child) {
                assert!(max <= separator, "subtree exceeds its separator");
            }
            last = Some(separator);
        }
        let rightmost = inner.child(count);
        assert!(!rightmost.is_null(), "inner node missing its last child");
        let right_max = self.verify_node(rightmost);
        if let (Some(max), Some(prev)) = (&right_max, &last) {
            assert!(max > prev, "last subtree not above the last separator");
        }
        let highkey = inner.highkey();
        if !highkey.is_null()
            && let Some(max) = &right_max
        {
            assert_eq!(
                max.as_slice(),
                rec_bytes(highkey),
                "highkey out of sync with the rightmost subtree"
            );
        }
        right_max.or(last)
    }

    #[cfg(debug_assertions)]
    fn debug_assert_sorted(leaf: &LeafNode<N>) {
        let count = leaf.key_count();
        for i in 1..count {
            debug_assert!(
                rec_bytes(leaf.key(i - 1)) < rec_bytes(leaf.key(i)),
                "leaf keys out of order after insert"
            );
        }
    }
}

impl<const N: usize> Drop for Index<N> {
    fn drop(&mut self) {
        for &ptr in self.inners.lock().iter() {
            // SAFETY: every pointer was leaked by this index and never
            // freed; leaves live in PM and are not ours to drop.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

/// Write the key and value records into one allocated block.
fn write_kv(block: *mut u8, layout: KvLayout, key: &[u8], value: &[u8]) -> (*const u8, *const u8) {
    debug_assert!(!block.is_null());
    // SAFETY: the block was sized by this layout and is 8-aligned.
    let (key_rec, value_rec) = unsafe {
        (
            ByteRecord::write_at(block.add(layout.key_offset), key),
            ByteRecord::write_at(block.add(layout.value_offset), value),
        )
    };
    // SAFETY: the block is mapped PM.
    unsafe { persist(block, layout.total) };
    (key_rec, value_rec)
}
