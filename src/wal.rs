//! Per-thread write-ahead log.
//!
//! The log exists for exactly one purpose: making allocator and index
//! structural mutations recoverable. A mutation opens an entry tagged with
//! the operation, the allocator writes the block address straight into the
//! entry's address cell, the mutation publishes its pointers, and the entry
//! is committed. A crash anywhere in that chain is bounded: recovery hands
//! every unresolved entry to a driver-supplied action that either replays a
//! committed record or releases the storage behind an uncommitted one.
//!
//! Layout on PM, little-endian throughout:
//!
//! ```text
//! [ magic ][ region 0 ][ region 1 ] … [ region 63 ]
//! region:  { checkpointed: u64, cursor: u64, entries[4096] }
//! entry:   { address: u64, op: u8, status: u8, pad: [u8; 6] }
//! ```
//!
//! Entries below `checkpointed` are all Committed; entries in
//! `[checkpointed, cursor)` are Uncommitted or Committed; entries at or
//! above `cursor` are None. Each region belongs to one thread slot, so the
//! only cross-thread traffic is recovery, which runs single-threaded.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::alloc::SLOT_COUNT;
use crate::error::{ConfigError, LogError};
use crate::pmem::{PmRegion, persist};
use crate::tracelog::{debug_log, warn_log};

/// One log region per thread slot, mirroring the allocator.
pub const REGION_COUNT: usize = SLOT_COUNT;

/// Entries per region.
pub const REGION_ENTRIES: usize = 4096;

/// Identifies an initialized log in a region.
pub const LOG_MAGIC: u64 = u64::from_le_bytes(*b"cairn.wa");

/// Structural operation a log entry brackets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOp {
    Insert = 0,
    Update = 1,
    Delete = 2,
    /// Also covers root-node creation.
    NodeSplit = 3,
    Unknown = 4,
}

impl LogOp {
    #[must_use]
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Insert,
            1 => Self::Update,
            2 => Self::Delete,
            3 => Self::NodeSplit,
            _ => Self::Unknown,
        }
    }
}

/// Resolution state of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogStatus {
    None = 0,
    Uncommitted = 1,
    Committed = 2,
}

impl LogStatus {
    #[must_use]
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Uncommitted,
            2 => Self::Committed,
            _ => Self::None,
        }
    }
}

// ============================================================================
//  LogEntry / LogRegion
// ============================================================================

/// A 16-byte log record in PM.
#[repr(C)]
#[derive(Debug)]
pub struct LogEntry {
    address: AtomicU64,
    op: AtomicU8,
    status: AtomicU8,
    _pad: [u8; 6],
}

impl LogEntry {
    /// The PM address this entry protects; 0 until the allocator fills it.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address.load(Ordering::Acquire)
    }

    /// The cell [`Allocator::allocate`] publishes the block address through.
    ///
    /// [`Allocator::allocate`]: crate::alloc::Allocator::allocate
    #[must_use]
    pub fn address_cell(&self) -> &AtomicU64 {
        &self.address
    }

    #[must_use]
    pub fn op(&self) -> LogOp {
        LogOp::from_u8(self.op.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn status(&self) -> LogStatus {
        LogStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn reset(&self) {
        self.address.store(0, Ordering::Release);
        self.op.store(LogOp::Unknown as u8, Ordering::Release);
        self.status.store(LogStatus::None as u8, Ordering::Release);
    }

    fn persist_self(&self) {
        // SAFETY: the entry lives inside the mapped log region.
        unsafe { persist(std::ptr::from_ref(self).cast(), size_of::<Self>()) };
    }
}

/// One thread's slice of the log.
#[repr(C)]
struct LogRegion {
    checkpointed: AtomicU64,
    cursor: AtomicU64,
    entries: [LogEntry; REGION_ENTRIES],
}

impl LogRegion {
    fn reset(&self) {
        for entry in &self.entries {
            entry.reset();
        }
        // SAFETY: the entry array lives inside the mapped log region.
        unsafe {
            persist(self.entries.as_ptr().cast(), size_of::<[LogEntry; REGION_ENTRIES]>());
        }
        self.cursor.store(0, Ordering::Release);
        self.checkpointed.store(0, Ordering::Release);
        // SAFETY: both cursors sit at the head of the mapped region.
        unsafe { persist(std::ptr::from_ref(self).cast(), 16) };
    }
}

// ============================================================================
//  LogHandle
// ============================================================================

/// An open, uncommitted log entry.
///
/// Returned by [`Logger::make_log`]; the caller threads
/// [`address_cell`](Self::address_cell) into the allocator, publishes its
/// pointers, then calls [`commit`](Self::commit). If the handle is dropped
/// without committing (error path, panic), the entry stays Uncommitted and
/// recovery releases whatever the address cell points at.
#[must_use = "an uncommitted log entry only protects a mutation that commits it"]
#[derive(Debug)]
pub struct LogHandle<'a> {
    entry: &'a LogEntry,
}

impl LogHandle<'_> {
    /// The cell the allocator writes the block address into.
    #[must_use]
    pub fn address_cell(&self) -> &AtomicU64 {
        self.entry.address_cell()
    }

    /// The logged block address (0 until allocation).
    #[must_use]
    pub fn address(&self) -> u64 {
        self.entry.address()
    }

    /// Mark the bracketed mutation durable.
    pub fn commit(self) {
        self.entry.status.store(LogStatus::Committed as u8, Ordering::Release);
        self.entry.persist_self();
    }
}

// ============================================================================
//  Logger
// ============================================================================

/// The write-ahead log over one PM region.
pub struct Logger {
    base: *mut u8,
    in_use: Mutex<[bool; REGION_COUNT]>,
}

// SAFETY: region fields are atomics; the mutex covers slot bookkeeping.
unsafe impl Send for Logger {}
unsafe impl Sync for Logger {}

impl Logger {
    /// Bytes the magic plus all regions occupy.
    #[must_use]
    pub const fn layout_bytes() -> usize {
        size_of::<u64>() + REGION_COUNT * size_of::<LogRegion>()
    }

    /// Attach to a region, initializing it when no log is present.
    ///
    /// An existing log is left untouched so that [`recover`](Self::recover)
    /// can walk it; a fresh region is formatted to empty.
    ///
    /// # Errors
    ///
    /// [`ConfigError::WalTooSmall`] when the region cannot hold the layout.
    pub fn attach(region: &PmRegion) -> Result<Self, ConfigError> {
        if region.len() < Self::layout_bytes() {
            return Err(ConfigError::WalTooSmall {
                bytes: region.len(),
                required: Self::layout_bytes(),
            });
        }

        let logger = Self { base: region.base(), in_use: Mutex::new([false; REGION_COUNT]) };
        if logger.magic() != LOG_MAGIC {
            logger.format();
        }
        Ok(logger)
    }

    fn magic(&self) -> u64 {
        // SAFETY: base points at the mapped region; the magic is its first
        // word and only ever written single-threaded (attach/recover).
        unsafe { self.base.cast::<u64>().read() }
    }

    fn format(&self) {
        for slot in 0..REGION_COUNT {
            self.region(slot).reset();
        }
        // SAFETY: single-threaded attach/recover path.
        unsafe {
            self.base.cast::<u64>().write(LOG_MAGIC);
            persist(self.base, size_of::<u64>());
        }
    }

    /// View a slot's region.
    fn region(&self, slot: usize) -> &LogRegion {
        debug_assert!(slot < REGION_COUNT);
        // SAFETY: attach validated that the region array fits; slot is in
        // range.
        unsafe {
            &*self
                .base
                .add(size_of::<u64>() + slot * size_of::<LogRegion>())
                .cast::<LogRegion>()
        }
    }

    // ========================================================================
    //  Registration
    // ========================================================================

    /// Claim an unused region slot.
    pub fn register_thread(&self) -> Option<usize> {
        let mut in_use = self.in_use.lock();
        let slot = (0..REGION_COUNT).find(|&s| !in_use[s])?;
        in_use[slot] = true;
        Some(slot)
    }

    /// Release a region slot.
    pub fn unregister_thread(&self, slot: usize) {
        debug_assert!(slot < REGION_COUNT);
        self.in_use.lock()[slot] = false;
    }

    // ========================================================================
    //  Logging
    // ========================================================================

    /// Reserve the next entry in `slot`'s region as Uncommitted.
    ///
    /// A full region is checkpointed first; if that frees nothing the call
    /// fails with [`LogError::NoLog`].
    ///
    /// # Errors
    ///
    /// [`LogError::NoLog`] when the region stays full after checkpointing.
    pub fn make_log(&self, slot: usize, op: LogOp) -> Result<LogHandle<'_>, LogError> {
        let region = self.region(slot);
        let mut cursor = region.cursor.load(Ordering::Acquire) as usize;
        if cursor >= REGION_ENTRIES {
            self.checkpoint(slot);
            cursor = region.cursor.load(Ordering::Acquire) as usize;
            if cursor >= REGION_ENTRIES {
                return Err(LogError::NoLog);
            }
        }

        let entry = &region.entries[cursor];
        entry.address.store(0, Ordering::Release);
        entry.op.store(op as u8, Ordering::Release);
        entry.status.store(LogStatus::Uncommitted as u8, Ordering::Release);
        entry.persist_self();

        region.cursor.store(cursor as u64 + 1, Ordering::Release);
        // SAFETY: the cursor lives inside the mapped region.
        unsafe { persist(std::ptr::from_ref(&region.cursor).cast(), 8) };
        Ok(LogHandle { entry })
    }

    /// Make room for `n` upcoming reservations.
    ///
    /// A mutation that writes several entries calls this first; reserving
    /// them across the region boundary would leave the first entry open and
    /// block the recycle that the later reservations need.
    ///
    /// # Errors
    ///
    /// [`LogError::NoLog`] when the region cannot fit `n` more entries even
    /// after checkpointing.
    pub fn ensure_capacity(&self, slot: usize, n: usize) -> Result<(), LogError> {
        let region = self.region(slot);
        if region.cursor.load(Ordering::Acquire) as usize + n > REGION_ENTRIES {
            self.checkpoint(slot);
            if region.cursor.load(Ordering::Acquire) as usize + n > REGION_ENTRIES {
                return Err(LogError::NoLog);
            }
        }
        Ok(())
    }

    /// Commit the most recently reserved entry of `slot`.
    pub fn commit(&self, slot: usize) {
        let region = self.region(slot);
        let cursor = region.cursor.load(Ordering::Acquire) as usize;
        debug_assert!(cursor > 0, "commit with no open entry");
        let entry = &region.entries[cursor - 1];
        entry.status.store(LogStatus::Committed as u8, Ordering::Release);
        entry.persist_self();
    }

    /// Fold leading Committed entries into `checkpointed`; when every entry
    /// is resolved, recycle the region.
    pub fn checkpoint(&self, slot: usize) {
        let region = self.region(slot);
        let cursor = region.cursor.load(Ordering::Acquire) as usize;
        let mut checkpointed = region.checkpointed.load(Ordering::Acquire) as usize;

        while checkpointed < cursor
            && region.entries[checkpointed].status() == LogStatus::Committed
        {
            checkpointed += 1;
        }
        region.checkpointed.store(checkpointed as u64, Ordering::Release);
        // SAFETY: the checkpoint cursor lives inside the mapped region.
        unsafe { persist(std::ptr::from_ref(&region.checkpointed).cast(), 8) };

        if checkpointed == cursor && cursor > 0 {
            debug_log!(slot, resolved = cursor, "recycling log region");
            region.reset();
        }
    }

    // ========================================================================
    //  Recovery
    // ========================================================================

    /// Walk every unresolved entry through `action`, then reset the log.
    ///
    /// Entries are snapshotted before the reset, so `action` may itself
    /// append to the (fresh) log; a replay driver re-inserting committed
    /// records does exactly that. The storage an entry addresses is not
    /// touched here: it stays readable until the driver frees it or the
    /// allocator hands it out again.
    ///
    /// `action` returns true when the entry may be considered resolved.
    pub fn recover<F>(&self, mut action: F)
    where
        F: FnMut(&RecoveredEntry) -> bool,
    {
        let mut snapshot = Vec::new();
        if self.magic() == LOG_MAGIC {
            for slot in 0..REGION_COUNT {
                let region = self.region(slot);
                let checkpointed = region.checkpointed.load(Ordering::Acquire) as usize;
                let cursor =
                    (region.cursor.load(Ordering::Acquire) as usize).min(REGION_ENTRIES);
                for index in checkpointed..cursor {
                    let entry = &region.entries[index];
                    snapshot.push(RecoveredEntry {
                        slot,
                        address: entry.address(),
                        op: entry.op(),
                        status: entry.status(),
                    });
                }
            }
        }
        self.format();

        let mut unresolved = 0usize;
        for entry in &snapshot {
            if !action(entry) {
                unresolved += 1;
            }
        }
        if unresolved > 0 {
            warn_log!(unresolved, "log entries left unresolved by recovery action");
        }
    }
}

/// A log entry handed to a recovery action, detached from the (reset) log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredEntry {
    /// The region the entry came from.
    pub slot: usize,

    /// The PM block the entry protects (0 when the crash hit before
    /// allocation).
    pub address: u64,

    pub op: LogOp,
    pub status: LogStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::{PAGE_SIZE, align_up};

    fn wal_region() -> PmRegion {
        PmRegion::new(align_up(Logger::layout_bytes(), PAGE_SIZE)).unwrap()
    }

    #[test]
    fn entry_is_16_bytes() {
        assert_eq!(size_of::<LogEntry>(), 16);
        assert_eq!(size_of::<LogRegion>(), 16 + 16 * REGION_ENTRIES);
    }

    #[test]
    fn attach_formats_fresh_region() {
        let region = wal_region();
        let logger = Logger::attach(&region).unwrap();
        assert_eq!(logger.magic(), LOG_MAGIC);
        let r = logger.region(0);
        assert_eq!(r.cursor.load(Ordering::Acquire), 0);
        assert_eq!(r.checkpointed.load(Ordering::Acquire), 0);
    }

    #[test]
    fn attach_rejects_undersized_region() {
        let region = PmRegion::new(PAGE_SIZE).unwrap();
        assert!(matches!(
            Logger::attach(&region),
            Err(ConfigError::WalTooSmall { .. })
        ));
    }

    #[test]
    fn make_log_reserves_and_commit_resolves() {
        let region = wal_region();
        let logger = Logger::attach(&region).unwrap();
        let slot = logger.register_thread().unwrap();

        let handle = logger.make_log(slot, LogOp::Insert).unwrap();
        assert_eq!(handle.address(), 0);
        handle.address_cell().store(0xdead_beef, Ordering::Release);
        handle.commit();

        let entry = &logger.region(slot).entries[0];
        assert_eq!(entry.status(), LogStatus::Committed);
        assert_eq!(entry.op(), LogOp::Insert);
        assert_eq!(entry.address(), 0xdead_beef);
        assert_eq!(logger.region(slot).cursor.load(Ordering::Acquire), 1);
    }

    #[test]
    fn commit_by_slot_hits_latest_entry() {
        let region = wal_region();
        let logger = Logger::attach(&region).unwrap();
        let slot = logger.register_thread().unwrap();

        let _first = logger.make_log(slot, LogOp::NodeSplit).unwrap();
        let _second = logger.make_log(slot, LogOp::Insert).unwrap();
        logger.commit(slot);

        assert_eq!(logger.region(slot).entries[0].status(), LogStatus::Uncommitted);
        assert_eq!(logger.region(slot).entries[1].status(), LogStatus::Committed);
    }

    #[test]
    fn checkpoint_stops_at_first_uncommitted() {
        let region = wal_region();
        let logger = Logger::attach(&region).unwrap();
        let slot = logger.register_thread().unwrap();

        logger.make_log(slot, LogOp::Insert).unwrap().commit();
        let _open = logger.make_log(slot, LogOp::Insert).unwrap();
        logger.make_log(slot, LogOp::Insert).unwrap().commit();

        logger.checkpoint(slot);
        let r = logger.region(slot);
        assert_eq!(r.checkpointed.load(Ordering::Acquire), 1);
        assert_eq!(r.cursor.load(Ordering::Acquire), 3);
    }

    #[test]
    fn checkpoint_recycles_fully_resolved_region() {
        let region = wal_region();
        let logger = Logger::attach(&region).unwrap();
        let slot = logger.register_thread().unwrap();

        for _ in 0..4 {
            logger.make_log(slot, LogOp::Insert).unwrap().commit();
        }
        logger.checkpoint(slot);

        let r = logger.region(slot);
        assert_eq!(r.cursor.load(Ordering::Acquire), 0);
        assert_eq!(r.checkpointed.load(Ordering::Acquire), 0);
        assert_eq!(r.entries[0].status(), LogStatus::None);
    }

    #[test]
    fn full_region_of_uncommitted_entries_fails_no_log() {
        let region = wal_region();
        let logger = Logger::attach(&region).unwrap();
        let slot = logger.register_thread().unwrap();

        for _ in 0..REGION_ENTRIES {
            let _abandoned = logger.make_log(slot, LogOp::Insert).unwrap();
        }
        assert_eq!(logger.make_log(slot, LogOp::Insert).unwrap_err(), LogError::NoLog);
    }

    #[test]
    fn full_region_of_committed_entries_recycles_itself() {
        let region = wal_region();
        let logger = Logger::attach(&region).unwrap();
        let slot = logger.register_thread().unwrap();

        for _ in 0..REGION_ENTRIES {
            logger.make_log(slot, LogOp::Insert).unwrap().commit();
        }
        // The next reservation checkpoints, recycles, and succeeds.
        let handle = logger.make_log(slot, LogOp::Insert).unwrap();
        handle.commit();
        assert_eq!(logger.region(slot).cursor.load(Ordering::Acquire), 1);
    }

    #[test]
    fn ensure_capacity_recycles_when_resolved_and_fails_when_pinned() {
        let region = wal_region();
        let logger = Logger::attach(&region).unwrap();
        let slot = logger.register_thread().unwrap();

        for _ in 0..REGION_ENTRIES - 1 {
            logger.make_log(slot, LogOp::Insert).unwrap().commit();
        }
        // One slot left: a two-entry reservation must recycle first.
        logger.ensure_capacity(slot, 2).unwrap();
        let first = logger.make_log(slot, LogOp::NodeSplit).unwrap();
        let second = logger.make_log(slot, LogOp::Insert).unwrap();
        second.commit();
        first.commit();
        assert_eq!(logger.region(slot).cursor.load(Ordering::Acquire), 2);

        // An open entry at the end of a full region pins it: no room can
        // be made for a multi-entry reservation.
        for _ in 0..REGION_ENTRIES - 3 {
            logger.make_log(slot, LogOp::Insert).unwrap().commit();
        }
        let _open = logger.make_log(slot, LogOp::Insert).unwrap();
        assert_eq!(logger.ensure_capacity(slot, 2), Err(LogError::NoLog));
    }

    #[test]
    fn recover_visits_unresolved_entries_in_order_then_resets() {
        let region = wal_region();
        let logger = Logger::attach(&region).unwrap();
        let slot = logger.register_thread().unwrap();

        logger.make_log(slot, LogOp::Insert).unwrap().commit();
        let open = logger.make_log(slot, LogOp::NodeSplit).unwrap();
        open.address_cell().store(42, Ordering::Release);
        drop(open);

        let mut seen = Vec::new();
        logger.recover(|entry| {
            seen.push((entry.op, entry.status, entry.address));
            true
        });

        assert_eq!(
            seen,
            vec![
                (LogOp::Insert, LogStatus::Committed, 0),
                (LogOp::NodeSplit, LogStatus::Uncommitted, 42),
            ]
        );
        assert_eq!(logger.region(slot).cursor.load(Ordering::Acquire), 0);
        assert_eq!(logger.region(slot).entries[0].status(), LogStatus::None);
    }

    #[test]
    fn recover_skips_checkpointed_prefix() {
        let region = wal_region();
        let logger = Logger::attach(&region).unwrap();
        let slot = logger.register_thread().unwrap();

        logger.make_log(slot, LogOp::Insert).unwrap().commit();
        logger.make_log(slot, LogOp::Insert).unwrap().commit();
        let _open = logger.make_log(slot, LogOp::Update).unwrap();
        logger.checkpoint(slot);

        let mut seen = 0;
        logger.recover(|_| {
            seen += 1;
            true
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn slots_are_exclusive_until_released() {
        let region = wal_region();
        let logger = Logger::attach(&region).unwrap();
        let a = logger.register_thread().unwrap();
        let b = logger.register_thread().unwrap();
        assert_ne!(a, b);
        logger.unregister_thread(a);
        assert_eq!(logger.register_thread().unwrap(), a);
    }
}
