//! Durable-memory primitives.
//!
//! Everything above this module treats persistent memory as a flat,
//! byte-addressable region carved into 16 KiB pages. This module owns the two
//! operations that make stores durable:
//!
//! - [`persist`]: flush the cache lines covering a byte range and fence, so
//!   the range survives power loss.
//! - [`fence`]: order a dependent store after everything written before it.
//!
//! The discipline used throughout the crate: write the payload, `persist` it,
//! then publish a pointer to it with a single 8-byte aligned store (itself
//! persisted). A reader that observes the pointer is guaranteed to observe
//! the payload, before and after a crash.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};

use crate::error::ConfigError;

/// Allocation granularity of the persistent region.
pub const PAGE_SIZE: usize = 16 * 1024;

/// Mask that maps any address inside a page to the page base.
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Cache-line granularity used by [`persist`].
pub const CACHE_LINE: usize = 64;

// ============================================================================
//  Persist / fence
// ============================================================================

/// Flush the cache lines covering `[addr, addr + len)` and fence.
///
/// After this returns, the covered bytes are recoverable across power loss.
///
/// # Safety
///
/// `addr..addr + len` must be a readable allocation. The flush itself never
/// writes, but flushing unmapped memory is undefined.
#[inline]
pub unsafe fn persist(addr: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let start = addr as usize & !(CACHE_LINE - 1);
        let end = addr as usize + len;
        let mut line = start;
        while line < end {
            // SAFETY: caller guarantees the range is mapped; clflush reads
            // nothing and writes nothing, it only evicts the line.
            unsafe { std::arch::x86_64::_mm_clflush(line as *const u8) };
            line += CACHE_LINE;
        }
        // SAFETY: sfence has no memory operands.
        unsafe { std::arch::x86_64::_mm_sfence() };
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (addr, len);
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Full memory fence.
///
/// Separates a dependent publication store from the stores before it when no
/// cache-line flush is needed yet (the flush comes with the final
/// [`persist`]).
#[inline]
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: mfence has no memory operands.
    unsafe {
        std::arch::x86_64::_mm_mfence()
    };

    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

// ============================================================================
//  PmRegion
// ============================================================================

/// An owned, page-aligned byte region standing in for a mapped PM device.
///
/// The base address is stable for the lifetime of the region, which is what
/// lets the allocator and the log keep raw intra-region pointers. A region is
/// zero-filled on creation, so a freshly created region always reads as
/// "no allocator here" (magic absent).
///
/// Restart testing reuses one region across several [`Allocator`] /
/// [`Logger`] attachments; nothing in the region refers to the `PmRegion`
/// handle itself.
///
/// [`Allocator`]: crate::alloc::Allocator
/// [`Logger`]: crate::wal::Logger
#[derive(Debug)]
pub struct PmRegion {
    base: *mut u8,
    len: usize,
}

// SAFETY: the region is a dumb byte range. All concurrent mutation goes
// through atomics inside the structures laid out on top of it; the handle
// itself is only read.
unsafe impl Send for PmRegion {}
unsafe impl Sync for PmRegion {}

impl PmRegion {
    /// Allocate a zeroed region of `len` bytes, aligned to [`PAGE_SIZE`].
    ///
    /// # Errors
    ///
    /// Fails when `len` is zero or not page-aligned.
    pub fn new(len: usize) -> Result<Self, ConfigError> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(ConfigError::BadRegionSize { bytes: len });
        }

        // Unwrap is fine: len and align were both validated above.
        let layout = Layout::from_size_align(len, PAGE_SIZE).expect("validated region layout");

        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }

        Ok(Self { base, len })
    }

    /// Base address of the region.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> *mut u8 {
        self.base
    }

    /// Total size in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True when the region holds no bytes. Never true for a constructed
    /// region; present for API completeness.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One-past-the-end address.
    #[inline]
    #[must_use]
    pub fn end(&self) -> *mut u8 {
        // SAFETY: base..base+len is one allocation.
        unsafe { self.base.add(self.len) }
    }

    /// True when `addr` points inside the region.
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base as u64 && addr < self.base as u64 + self.len as u64
    }
}

impl Drop for PmRegion {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, PAGE_SIZE).expect("validated region layout");

        // SAFETY: base was returned by alloc_zeroed with this exact layout.
        unsafe { dealloc(self.base, layout) };
    }
}

/// Round `n` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}
