//! Page-granular persistent-memory allocator.
//!
//! A [`PmRegion`] is carved into 16 KiB pages. Fine-grained allocation is a
//! bump inside a per-thread *busy* page, so the hot path touches no shared
//! state. When the busy page runs out, the thread refills its private free
//! list with a batch of pages (from the global free list of reclaimed pages
//! if possible, otherwise by extending the global growth cursor) and
//! promotes one of them. Only the refill takes the process-wide lock.
//!
//! All allocator metadata lives in an `AllocatorHeader` at the region base
//! and is mutated with single 8-byte stores, each followed by a persist.
//! Recovery exploits that: after a crash, every in-flight transition is
//! identifiable by two fields aliasing the same page, and a handful of
//! overlapping repair passes put the header back into a consistent state.
//!
//! ```text
//! page:   0        8       15                       16 KiB
//!         ┌────────┬────────┬──...────────────────────┐
//!         │ header │  next  │         payload         │
//!         └────────┴────────┴──...────────────────────┘
//! header: records:8 | reserved:8 | cursor:48   (one u64, one store)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::AllocError;
use crate::pmem::{PAGE_MASK, PAGE_SIZE, PmRegion, align_up, fence, persist};
use crate::tracelog::{debug_log, warn_log};

/// Number of per-thread slots; also bounds concurrent writer threads.
pub const SLOT_COUNT: usize = 64;

/// Pages prefetched ahead of the one promoted to busy on a refill.
pub const PREALLOCATION: usize = 10;

/// Pages taken per refill: the preallocation batch plus the page promoted
/// right away.
const REFILL_BATCH: usize = PREALLOCATION + 1;

/// Identifies an initialized allocator in a region.
pub const ALLOCATOR_MAGIC: u64 = u64::from_le_bytes(*b"cairn.pm");

/// Bytes reserved at the head of every page.
pub const PAGE_HEADER_BYTES: usize = 16;

/// Largest single allocation a page can satisfy.
pub const MAX_ALLOC: usize = PAGE_SIZE - PAGE_HEADER_BYTES;

/// The packed record counter caps out at 8 bits.
const MAX_RECORDS: u64 = 0xff;

/// Outcome of [`Allocator::recover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    /// Header repaired (possibly a no-op) and usable.
    Ok,

    /// Magic present but the geometry is beyond repair. Fatal.
    Corrupted,

    /// No allocator in this region; a fresh one was initialized.
    NoAllocator,
}

// ============================================================================
//  Page
// ============================================================================

/// Packed page header: `records:8 | reserved:8 | cursor:48`.
///
/// Mutations build a new value in a register and publish it with a single
/// aligned store, so a crash never tears the counter apart from the cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PageHeader(u64);

impl PageHeader {
    const EMPTY: Self = Self::pack(0, PAGE_HEADER_BYTES as u64);

    const fn pack(records: u64, cursor: u64) -> Self {
        Self((records & 0xff) | (cursor << 16))
    }

    const fn records(self) -> u64 {
        self.0 & 0xff
    }

    const fn cursor(self) -> u64 {
        self.0 >> 16
    }

    const fn bumped(self, size: u64) -> Self {
        Self::pack(self.records() + 1, self.cursor() + size)
    }

    const fn released(self) -> Self {
        Self::pack(self.records() - 1, self.cursor())
    }
}

/// The first 16 bytes of a page. The payload follows in place.
#[repr(C)]
struct Page {
    header: AtomicU64,
    next: AtomicU64,
}

impl Page {
    /// Initialize an empty page linking to `next`. Persists the page head.
    fn init(&self, next: u64) {
        self.header.store(PageHeader::EMPTY.0, Ordering::Release);
        self.next.store(next, Ordering::Release);
        // SAFETY: self spans the first PAGE_HEADER_BYTES of a mapped page.
        unsafe { persist(self.base(), PAGE_HEADER_BYTES) };
    }

    #[inline]
    fn base(&self) -> *const u8 {
        std::ptr::from_ref(self).cast()
    }

    #[inline]
    fn addr(&self) -> u64 {
        self.base() as u64
    }

    #[inline]
    fn next_page(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    fn link_next(&self, next: u64) {
        self.next.store(next, Ordering::Release);
        // SAFETY: the next field lives inside the mapped page.
        unsafe { persist(std::ptr::from_ref(&self.next).cast(), 8) };
    }

    fn is_empty(&self) -> bool {
        PageHeader(self.header.load(Ordering::Acquire)).records() == 0
    }

    /// Bump-allocate `size` bytes, or `None` when the page cannot fit them.
    ///
    /// The record count and cursor advance together in one published store.
    fn bump(&self, size: usize) -> Option<u64> {
        let mut current = PageHeader(self.header.load(Ordering::Acquire));
        loop {
            if current.records() == MAX_RECORDS
                || current.cursor() + size as u64 > PAGE_SIZE as u64
            {
                return None;
            }
            let next = current.bumped(size as u64);
            match self
                .header
                .compare_exchange(current.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // SAFETY: the header field lives inside the mapped page.
                    unsafe { persist(self.base(), 8) };
                    return Some(self.addr() + current.cursor());
                }
                Err(observed) => current = PageHeader(observed),
            }
        }
    }

    /// Drop one record and return how many remain.
    ///
    /// Any thread may free into any page, so this contends with the owner's
    /// bump and goes through the same CAS.
    fn release_one(&self) -> u64 {
        let mut current = PageHeader(self.header.load(Ordering::Acquire));
        loop {
            if current.records() == 0 {
                warn_log!(page = self.addr(), "release on a page with no records");
                return 0;
            }
            let next = current.released();
            match self
                .header
                .compare_exchange(current.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // SAFETY: the header field lives inside the mapped page.
                    unsafe { persist(self.base(), 8) };
                    return next.records();
                }
                Err(observed) => current = PageHeader(observed),
            }
        }
    }

    /// Rewind the cursor of a drained page. Only the thread that drove the
    /// record count to zero calls this; nothing else references the page.
    fn reset(&self) {
        self.header.store(PageHeader::EMPTY.0, Ordering::Release);
        // SAFETY: the header field lives inside the mapped page.
        unsafe { persist(self.base(), 8) };
    }
}

// ============================================================================
//  AllocatorHeader
// ============================================================================

/// Process-wide allocator state at the base of the PM region.
///
/// The four per-slot arrays hold page addresses (`0` = none):
///
/// - `busy`: the page the slot is currently bumping into.
/// - `free`: head of the slot's prefetched free-page list.
/// - `pending`: the busy page parked by `unregister_thread`, picked up by a
///   future registration of the same slot.
/// - `to_be_freed`: single-slot breadcrumb making `free` crash-safe.
#[repr(C)]
struct AllocatorHeader {
    magic: u64,
    total_size: u64,
    base: u64,
    cursor: AtomicU64,
    freelist: AtomicU64,
    busy: [AtomicU64; SLOT_COUNT],
    free: [AtomicU64; SLOT_COUNT],
    pending: [AtomicU64; SLOT_COUNT],
    to_be_freed: [AtomicU64; SLOT_COUNT],
}

// ============================================================================
//  Allocator
// ============================================================================

/// The page allocator over one PM region.
///
/// Handles are cheap to share behind an `Arc`; the hot path is slot-local,
/// and only `freelist`/`cursor` refills plus registration go through the
/// global mutex.
pub struct Allocator {
    header: *mut AllocatorHeader,
    region_end: u64,
    /// Guards `freelist`, `cursor`, and the slot occupancy map.
    global: Mutex<[bool; SLOT_COUNT]>,
}

// SAFETY: all shared header fields are atomics; the mutex covers the rest.
unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
    /// Attach to a region: recover an existing allocator or format a fresh
    /// one.
    ///
    /// Returns the allocator and the recovery status; `Corrupted` means the
    /// header must not be used and the caller aborts startup.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when the region cannot hold the header
    /// plus at least one refill batch.
    pub fn attach(region: &PmRegion) -> Result<(Self, RecoveryStatus), AllocError> {
        let allocator = Self {
            header: region.base().cast(),
            region_end: region.base() as u64 + region.len() as u64,
            global: Mutex::new([false; SLOT_COUNT]),
        };

        let status = allocator.recover();
        if status == RecoveryStatus::NoAllocator {
            allocator.format(region)?;
        }
        Ok((allocator, status))
    }

    fn format(&self, region: &PmRegion) -> Result<(), AllocError> {
        let base =
            align_up(region.base() as usize + size_of::<AllocatorHeader>(), PAGE_SIZE) as u64;
        if base + (REFILL_BATCH * PAGE_SIZE) as u64 > self.region_end {
            return Err(AllocError::OutOfMemory);
        }

        let header = self.header_mut();
        header.total_size = region.len() as u64;
        header.base = base;
        header.cursor.store(base, Ordering::Release);
        header.freelist.store(0, Ordering::Release);
        for slot in 0..SLOT_COUNT {
            header.busy[slot].store(0, Ordering::Release);
            header.free[slot].store(0, Ordering::Release);
            header.pending[slot].store(0, Ordering::Release);
            header.to_be_freed[slot].store(0, Ordering::Release);
        }
        fence();
        // The magic goes last: a crash mid-format leaves a region that
        // still reads as NoAllocator.
        header.magic = ALLOCATOR_MAGIC;
        // SAFETY: the header lies at the base of the mapped region.
        unsafe { persist(self.header.cast(), size_of::<AllocatorHeader>()) };
        Ok(())
    }

    #[inline]
    fn header(&self) -> &AllocatorHeader {
        // SAFETY: header points at the base of the region the caller keeps
        // alive alongside this allocator.
        unsafe { &*self.header }
    }

    #[expect(clippy::mut_from_ref, reason = "only called during single-threaded format")]
    #[inline]
    fn header_mut(&self) -> &mut AllocatorHeader {
        // SAFETY: format runs before the allocator is shared.
        unsafe { &mut *self.header }
    }

    /// View the page at `addr`.
    ///
    /// `addr` must be an initialized page base inside the region; every
    /// caller obtains it from the header or by masking an allocation.
    #[inline]
    fn page(&self, addr: u64) -> &Page {
        debug_assert_eq!(addr & !PAGE_MASK, 0, "not a page base: {addr:#x}");
        debug_assert!(addr >= self.header().base && addr < self.region_end);
        // SAFETY: addr is a page inside the mapped region per the contract
        // above.
        unsafe { &*(addr as *const Page) }
    }

    // ========================================================================
    //  Registration
    // ========================================================================

    /// Claim an unused slot.
    ///
    /// A page parked by a previous `unregister_thread` of the same slot is
    /// promoted back to busy. Returns `None` when all slots are taken.
    pub fn register_thread(&self) -> Option<usize> {
        let mut occupied = self.global.lock();
        let slot = (0..SLOT_COUNT).find(|&s| !occupied[s])?;
        occupied[slot] = true;

        let header = self.header();
        let parked = header.pending[slot].load(Ordering::Acquire);
        if parked != 0 {
            header.busy[slot].store(parked, Ordering::Release);
            self.persist_cell(&header.busy[slot]);
            header.pending[slot].store(0, Ordering::Release);
            self.persist_cell(&header.pending[slot]);
        }
        Some(slot)
    }

    /// Release a slot, parking its busy page for the next registrant.
    ///
    /// The park is a single store; a crash between the two stores is
    /// repaired by the first recovery pass.
    pub fn unregister_thread(&self, slot: usize) {
        debug_assert!(slot < SLOT_COUNT);
        let mut occupied = self.global.lock();
        occupied[slot] = false;

        let header = self.header();
        let busy = header.busy[slot].load(Ordering::Acquire);
        if busy == 0 {
            return;
        }
        header.pending[slot].store(busy, Ordering::Release);
        self.persist_cell(&header.pending[slot]);
        header.busy[slot].store(0, Ordering::Release);
        self.persist_cell(&header.busy[slot]);
    }

    // ========================================================================
    //  Allocate / free
    // ========================================================================

    /// Allocate `size` bytes of PM for `slot`, publishing the address
    /// through `out`.
    ///
    /// The page header is bumped and persisted before the address goes out,
    /// so a logged address always refers to accounted storage. `out` is
    /// normally a WAL entry's address cell.
    ///
    /// # Errors
    ///
    /// [`AllocError::TooLarge`] for requests beyond a page payload;
    /// [`AllocError::OutOfMemory`] when the region is exhausted, with no
    /// state change.
    pub fn allocate(&self, slot: usize, size: usize, out: &AtomicU64) -> Result<(), AllocError> {
        debug_assert!(slot < SLOT_COUNT);
        let size = align_up(size, 8);
        if size == 0 || size > MAX_ALLOC {
            return Err(AllocError::TooLarge { size, max: MAX_ALLOC });
        }

        let header = self.header();
        let busy = header.busy[slot].load(Ordering::Acquire);
        if busy != 0
            && let Some(addr) = self.page(busy).bump(size)
        {
            self.publish(out, addr);
            return Ok(());
        }

        if header.free[slot].load(Ordering::Acquire) == 0 {
            self.refill(slot)?;
        }
        self.promote(slot);

        let busy = header.busy[slot].load(Ordering::Acquire);
        let addr = self
            .page(busy)
            .bump(size)
            .expect("a freshly promoted page fits any bounded allocation");
        self.publish(out, addr);
        Ok(())
    }

    /// Return `ptr`'s record to its owning page; reclaim the page when its
    /// record count reaches zero.
    ///
    /// The `to_be_freed` breadcrumb is persisted before the count moves, so
    /// a crash mid-splice is repaired by the final recovery pass.
    pub fn free(&self, slot: usize, ptr: u64) {
        debug_assert!(slot < SLOT_COUNT);
        if ptr == 0 {
            return;
        }

        let header = self.header();
        let page_addr = ptr & PAGE_MASK;
        header.to_be_freed[slot].store(page_addr, Ordering::Release);
        self.persist_cell(&header.to_be_freed[slot]);
        fence();

        let page = self.page(page_addr);
        if page.release_one() == 0 {
            // A drained busy page (any slot's) stays where it is with a
            // rewound cursor; splicing it into a free list while a bump can
            // still land in it would hand it out twice.
            page.reset();
            if !self.is_busy_anywhere(page_addr) {
                page.link_next(header.free[slot].load(Ordering::Acquire));
                fence();
                header.free[slot].store(page_addr, Ordering::Release);
                self.persist_cell(&header.free[slot]);
            }
        }

        header.to_be_freed[slot].store(0, Ordering::Release);
        self.persist_cell(&header.to_be_freed[slot]);
    }

    fn is_busy_anywhere(&self, page_addr: u64) -> bool {
        let header = self.header();
        (0..SLOT_COUNT).any(|s| header.busy[s].load(Ordering::Acquire) == page_addr)
    }

    /// Publish an allocated address through the caller's cell.
    fn publish(&self, out: &AtomicU64, addr: u64) {
        out.store(addr, Ordering::Release);
        // SAFETY: out is an 8-byte cell the caller keeps mapped.
        unsafe { persist(std::ptr::from_ref(out).cast(), 8) };
    }

    fn persist_cell(&self, cell: &AtomicU64) {
        // SAFETY: cell lives inside the mapped header.
        unsafe { persist(std::ptr::from_ref(cell).cast(), 8) };
    }

    /// Refill `free[slot]` with a batch of pages under the global lock.
    fn refill(&self, slot: usize) -> Result<(), AllocError> {
        let _guard = self.global.lock();
        let header = self.header();

        if header.free[slot].load(Ordering::Acquire) != 0 {
            return Ok(());
        }

        let freelist = header.freelist.load(Ordering::Acquire);
        if freelist != 0 {
            // Detach up to a batch from the global free list. Store order
            // matters: free[slot] first, so the in-flight window is
            // recognizable by free[slot] aliasing freelist.
            let mut end = freelist;
            let mut taken = 1;
            while taken < REFILL_BATCH {
                let next = self.page(end).next_page();
                if next == 0 {
                    break;
                }
                end = next;
                taken += 1;
            }
            debug_log!(slot, taken, "refill from global free list");
            header.free[slot].store(freelist, Ordering::Release);
            self.persist_cell(&header.free[slot]);
            fence();
            header.freelist.store(self.page(end).next_page(), Ordering::Release);
            self.persist_cell(&header.freelist);
            self.page(end).link_next(0);
            return Ok(());
        }

        // Carve a fresh batch at the growth cursor.
        let start = header.cursor.load(Ordering::Acquire);
        if start + (REFILL_BATCH * PAGE_SIZE) as u64 > self.region_end {
            return Err(AllocError::OutOfMemory);
        }

        let mut addr = start;
        for i in 0..REFILL_BATCH {
            let next = if i + 1 < REFILL_BATCH { addr + PAGE_SIZE as u64 } else { 0 };
            self.page(addr).init(next);
            addr += PAGE_SIZE as u64;
        }
        fence();
        debug_log!(slot, start, "refill by region growth");
        // free[slot] aliases the cursor until the cursor advances; recovery
        // advances the cursor when it finds them equal.
        header.free[slot].store(start, Ordering::Release);
        self.persist_cell(&header.free[slot]);
        fence();
        header.cursor.store(start + (REFILL_BATCH * PAGE_SIZE) as u64, Ordering::Release);
        self.persist_cell(&header.cursor);
        Ok(())
    }

    /// Promote the head of `free[slot]` to the busy page.
    fn promote(&self, slot: usize) {
        let header = self.header();
        let head = header.free[slot].load(Ordering::Acquire);
        debug_assert_ne!(head, 0, "promote with an empty free list");

        header.busy[slot].store(head, Ordering::Release);
        self.persist_cell(&header.busy[slot]);
        header.free[slot].store(self.page(head).next_page(), Ordering::Release);
        self.persist_cell(&header.free[slot]);
        fence();
        self.page(head).link_next(0);
        fence();
    }

    // ========================================================================
    //  Recovery
    // ========================================================================

    /// Repair the header after a crash.
    ///
    /// Each pass keys on two fields aliasing the same page, which is exactly
    /// the window between the two stores of the corresponding mutation. The
    /// preconditions deliberately overlap so any single crash point is
    /// absorbed; the unregister pass runs twice because other passes edit
    /// the lists it inspects.
    pub fn recover(&self) -> RecoveryStatus {
        let header = self.header();
        if header.magic != ALLOCATOR_MAGIC {
            return RecoveryStatus::NoAllocator;
        }

        let base = header.base;
        let cursor = header.cursor.load(Ordering::Acquire);
        let geometry_ok = header.total_size as usize % PAGE_SIZE == 0
            && base & !PAGE_MASK == 0
            && cursor & !PAGE_MASK == 0
            && base > self.header as u64
            && cursor >= base
            && cursor <= self.region_end;
        if !geometry_ok {
            warn_log!(base, cursor, "allocator header fails geometry checks");
            return RecoveryStatus::Corrupted;
        }

        self.repair_unregister();
        self.repair_growth();
        self.repair_freelist_refill();
        self.repair_promotion();
        self.repair_unregister();
        self.repair_frees();
        RecoveryStatus::Ok
    }

    /// An unregister parked the busy page but never cleared it. Fold the
    /// page into the slot's free list and finish both stores.
    fn repair_unregister(&self) {
        let header = self.header();
        for slot in 0..SLOT_COUNT {
            let parked = header.pending[slot].load(Ordering::Acquire);
            if parked != 0 && parked == header.busy[slot].load(Ordering::Acquire) {
                debug_log!(slot, parked, "repair: in-flight unregister");
                self.page(parked).link_next(header.free[slot].load(Ordering::Acquire));
                fence();
                header.free[slot].store(parked, Ordering::Release);
                self.persist_cell(&header.free[slot]);
                header.busy[slot].store(0, Ordering::Release);
                self.persist_cell(&header.busy[slot]);
                header.pending[slot].store(0, Ordering::Release);
                self.persist_cell(&header.pending[slot]);
            }
        }
    }

    /// A growth refill published `free[slot]` but never advanced the cursor
    /// past the carved batch.
    fn repair_growth(&self) {
        let header = self.header();
        for slot in 0..SLOT_COUNT {
            let free = header.free[slot].load(Ordering::Acquire);
            if free != 0 && free == header.cursor.load(Ordering::Acquire) {
                debug_log!(slot, free, "repair: in-flight region growth");
                header
                    .cursor
                    .store(free + (REFILL_BATCH * PAGE_SIZE) as u64, Ordering::Release);
                self.persist_cell(&header.cursor);
            }
        }
    }

    /// A free-list refill published `free[slot]` but never advanced the
    /// global free list past the detached batch.
    fn repair_freelist_refill(&self) {
        let header = self.header();
        for slot in 0..SLOT_COUNT {
            let free = header.free[slot].load(Ordering::Acquire);
            let freelist = header.freelist.load(Ordering::Acquire);
            if free != 0 && free == freelist {
                debug_log!(slot, free, "repair: in-flight free-list refill");
                let mut end = freelist;
                let mut taken = 1;
                while taken < REFILL_BATCH {
                    let next = self.page(end).next_page();
                    if next == 0 {
                        break;
                    }
                    end = next;
                    taken += 1;
                }
                header.freelist.store(self.page(end).next_page(), Ordering::Release);
                self.persist_cell(&header.freelist);
                self.page(end).link_next(0);
            }
        }
    }

    /// A promotion published the busy page but never advanced the slot's
    /// free list past it.
    fn repair_promotion(&self) {
        let header = self.header();
        for slot in 0..SLOT_COUNT {
            let busy = header.busy[slot].load(Ordering::Acquire);
            if busy != 0 && busy == header.free[slot].load(Ordering::Acquire) {
                debug_log!(slot, busy, "repair: in-flight promotion");
                header.free[slot].store(self.page(busy).next_page(), Ordering::Release);
                self.persist_cell(&header.free[slot]);
                self.page(busy).link_next(0);
            }
        }
    }

    /// A free left its breadcrumb. If the page was mid-splice (its next
    /// link is set), finish prepending it against the current list head;
    /// either way the breadcrumb is cleared so a later recovery cannot
    /// replay a stale one.
    fn repair_frees(&self) {
        let header = self.header();
        for slot in 0..SLOT_COUNT {
            let crumb = header.to_be_freed[slot].load(Ordering::Acquire);
            if crumb != 0 {
                if self.page(crumb).next_page() != 0 {
                    debug_log!(slot, crumb, "repair: in-flight free");
                    self.page(crumb).link_next(header.free[slot].load(Ordering::Acquire));
                    fence();
                    header.free[slot].store(crumb, Ordering::Release);
                    self.persist_cell(&header.free[slot]);
                }
                header.to_be_freed[slot].store(0, Ordering::Release);
                self.persist_cell(&header.to_be_freed[slot]);
            }
        }
    }

    // ========================================================================
    //  Introspection
    // ========================================================================

    /// Current growth cursor.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.header().cursor.load(Ordering::Acquire)
    }

    /// First page address.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.header().base
    }

    /// Pages ever carved out of the region.
    #[must_use]
    pub fn pages_opened(&self) -> usize {
        ((self.cursor() - self.base()) as usize) / PAGE_SIZE
    }

    /// Pages currently sitting on the global free list or any slot list,
    /// plus drained parked and busy pages. Everything else holds live
    /// records.
    #[must_use]
    pub fn idle_pages(&self) -> usize {
        let header = self.header();
        let mut count = self.chain_len(header.freelist.load(Ordering::Acquire));
        for slot in 0..SLOT_COUNT {
            count += self.chain_len(header.free[slot].load(Ordering::Acquire));
            let parked = header.pending[slot].load(Ordering::Acquire);
            if parked != 0 && self.page(parked).is_empty() {
                count += 1;
            }
            let busy = header.busy[slot].load(Ordering::Acquire);
            if busy != 0 && self.page(busy).is_empty() {
                count += 1;
            }
        }
        count
    }

    fn chain_len(&self, mut addr: u64) -> usize {
        let mut count = 0;
        while addr != 0 {
            count += 1;
            addr = self.page(addr).next_page();
        }
        count
    }
}
