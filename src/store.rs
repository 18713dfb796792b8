//! The assembled engine: regions, allocator, log, and index under one roof.
//!
//! [`Store`] wires the pieces together and owns the startup lifecycle. A
//! fresh open formats both regions; a reopen repairs the allocator, drains
//! the write-ahead log, and rebuilds the index from it: committed inserts
//! are replayed into fresh storage, everything else is reclaimed. Inner
//! nodes live in host memory, so the tree itself is always rebuilt; the
//! log's committed records are the durable truth.

use std::sync::Arc;

use crate::alloc::{Allocator, RecoveryStatus};
use crate::config::StoreConfig;
use crate::error::{IndexError, StoreError};
use crate::index::{Index, SearchHit};
use crate::pmem::{PmRegion, align_up};
use crate::pointer::RemotePointer;
use crate::record::ByteRecord;
use crate::tracelog::{info_log, warn_log};
use crate::wal::{LogOp, LogStatus, Logger, RecoveredEntry};

/// One store instance over a data region and a log region.
///
/// Field order matters: the engine handles hold raw pointers into the
/// regions, so they drop first.
pub struct Store {
    index: Arc<Index>,
    logger: Arc<Logger>,
    alloc: Arc<Allocator>,
    /// Serializes paired registration so the allocator and log hand out the
    /// same slot id.
    registration: parking_lot::Mutex<()>,
    config: StoreConfig,
    pm: PmRegion,
    wal: PmRegion,
}

impl Store {
    /// Create a store over freshly allocated regions.
    ///
    /// # Errors
    ///
    /// Configuration or bootstrap failures; see [`StoreError`].
    pub fn create(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let pm = PmRegion::new(config.pm_bytes)?;
        let wal = PmRegion::new(config.wal_bytes)?;
        Self::open(config, pm, wal)
    }

    /// Open a store over existing regions, recovering whatever they hold.
    ///
    /// # Errors
    ///
    /// [`StoreError::Corrupted`] when the allocator header is present but
    /// unrepairable; otherwise configuration or bootstrap failures.
    pub fn open(config: StoreConfig, pm: PmRegion, wal: PmRegion) -> Result<Self, StoreError> {
        config.validate()?;

        let (alloc, status) = Allocator::attach(&pm)?;
        if status == RecoveryStatus::Corrupted {
            return Err(StoreError::Corrupted);
        }
        let alloc = Arc::new(alloc);
        let logger = Arc::new(Logger::attach(&wal)?);

        // Snapshot the unresolved log before anything appends to it; the
        // log is reset underneath.
        let mut backlog: Vec<RecoveredEntry> = Vec::new();
        logger.recover(|entry| {
            backlog.push(*entry);
            true
        });

        // Bootstrap slot: used for the root leaf and the replay, released
        // before workers arrive.
        let tid = alloc.register_thread().expect("slot 0 free at startup");
        let log_tid = logger.register_thread().expect("slot 0 free at startup");
        debug_assert_eq!(tid, log_tid);

        let index = Arc::new(Index::new(tid, Arc::clone(&alloc), Arc::clone(&logger))?);

        if status == RecoveryStatus::Ok {
            info_log!(entries = backlog.len(), "rebuilding index from the log");
            Self::replay(&index, &alloc, tid, &backlog);
        }

        alloc.unregister_thread(tid);
        logger.unregister_thread(log_tid);

        Ok(Self { index, logger, alloc, registration: parking_lot::Mutex::new(()), config, pm, wal })
    }

    /// Replay a recovered backlog: committed inserts are copied into fresh
    /// storage, then every logged block is handed back to the allocator.
    fn replay(index: &Index, alloc: &Allocator, tid: usize, backlog: &[RecoveredEntry]) {
        for entry in backlog {
            if entry.address == 0 {
                continue;
            }
            if entry.status == LogStatus::Committed && entry.op == LogOp::Insert {
                // SAFETY: committed insert entries address a live kv block;
                // nothing has reallocated it yet (its page is still
                // accounted).
                let (key, value) = unsafe { read_kv_block(entry.address) };
                match index.insert(tid, key, value) {
                    Ok(()) | Err(IndexError::RepeatInsert) => {}
                    Err(_err) => {
                        warn_log!(error = %_err, "replay insert failed; leaving block in place");
                        continue;
                    }
                }
            }
            // Uncommitted blocks were never published; committed ones were
            // just copied. Either way the old block is dead now.
            alloc.free(tid, entry.address);
        }
    }

    // ========================================================================
    //  Operations
    // ========================================================================

    /// Claim a thread slot valid for both the allocator and the log.
    ///
    /// Both registries hand out their lowest free slot, so pairing them
    /// under one lock keeps the ids identical.
    #[must_use]
    pub fn register_thread(&self) -> Option<usize> {
        let _guard = self.registration.lock();
        let tid = self.alloc.register_thread()?;
        match self.logger.register_thread() {
            Some(log_tid) if log_tid == tid => Some(tid),
            Some(log_tid) => {
                // Slots drifted apart (foreign registrations on one side);
                // back out rather than hand out a mismatched pair.
                self.logger.unregister_thread(log_tid);
                self.alloc.unregister_thread(tid);
                None
            }
            None => {
                self.alloc.unregister_thread(tid);
                None
            }
        }
    }

    /// Release a slot claimed by [`register_thread`](Self::register_thread).
    pub fn unregister_thread(&self, tid: usize) {
        let _guard = self.registration.lock();
        self.logger.unregister_thread(tid);
        self.alloc.unregister_thread(tid);
    }

    /// Insert `key` → `value` on thread slot `tid`.
    ///
    /// # Errors
    ///
    /// See [`Index::insert`].
    pub fn insert(&self, tid: usize, key: &[u8], value: &[u8]) -> Result<(), IndexError> {
        self.index.insert(tid, key, value)
    }

    /// Point lookup.
    #[must_use]
    pub fn search(&self, key: &[u8]) -> Option<SearchHit<'_>> {
        self.index.search(key)
    }

    /// A remote pointer carrying this store's node id.
    #[must_use]
    pub fn remote_pointer(&self, offset: u64) -> RemotePointer {
        RemotePointer::new(self.config.node_id, offset)
    }

    // ========================================================================
    //  Component access
    // ========================================================================

    #[must_use]
    pub fn index(&self) -> &Index {
        &self.index
    }

    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    #[must_use]
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Tear the store down and hand back its regions, e.g. to reopen them
    /// as a simulated restart.
    #[must_use]
    pub fn into_regions(self) -> (PmRegion, PmRegion) {
        let Self { index, logger, alloc, registration: _, config: _, pm, wal } = self;
        drop(index);
        drop(logger);
        drop(alloc);
        (pm, wal)
    }
}

/// Read the key and value records out of one insert's PM block.
///
/// # Safety
///
/// `addr` must be a block written by the insert path (key record first,
/// value record 8-aligned behind it) that is still live.
unsafe fn read_kv_block<'a>(addr: u64) -> (&'a [u8], &'a [u8]) {
    let key_rec = addr as *const u8;
    // SAFETY: caller guarantees the block shape.
    unsafe {
        let key_len = ByteRecord::len(key_rec);
        let value_rec = key_rec.add(align_up(ByteRecord::wire_size(key_len), 8));
        (ByteRecord::bytes(key_rec), ByteRecord::bytes(value_rec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::PAGE_SIZE;

    fn small_config() -> StoreConfig {
        StoreConfig { pm_bytes: 1024 * PAGE_SIZE, ..Default::default() }
    }

    #[test]
    fn create_insert_search() {
        let store = Store::create(small_config()).unwrap();
        let tid = store.register_thread().unwrap();

        store.insert(tid, b"k1", b"v1").unwrap();
        store.insert(tid, b"k2", b"v2").unwrap();
        assert_eq!(store.search(b"k1").unwrap().value_bytes().unwrap(), b"v1");
        assert_eq!(store.search(b"k2").unwrap().value_bytes().unwrap(), b"v2");
        assert!(store.search(b"k3").is_none());

        store.unregister_thread(tid);
    }

    #[test]
    fn reopen_replays_committed_inserts() {
        let config = small_config();
        let store = Store::create(config.clone()).unwrap();
        let tid = store.register_thread().unwrap();
        for i in 0..50u32 {
            let key = format!("key-{i:03}");
            let value = format!("value-{i:03}");
            store.insert(tid, key.as_bytes(), value.as_bytes()).unwrap();
        }
        store.unregister_thread(tid);

        let (pm, wal) = store.into_regions();
        let reopened = Store::open(config, pm, wal).unwrap();
        for i in 0..50u32 {
            let key = format!("key-{i:03}");
            let value = format!("value-{i:03}");
            let hit = reopened.search(key.as_bytes()).unwrap();
            assert_eq!(hit.value_bytes().unwrap(), value.as_bytes());
        }
        reopened.index().verify();
    }

    #[test]
    fn remote_pointer_carries_node_id() {
        let config = StoreConfig { node_id: 9, ..small_config() };
        let store = Store::create(config).unwrap();
        let remote = store.remote_pointer(0xabc);
        assert_eq!(remote.node_id(), 9);
        assert_eq!(remote.offset(), 0xabc);
    }

    #[test]
    fn invalid_config_refuses_to_create() {
        let config = StoreConfig { pm_bytes: 123, ..Default::default() };
        assert!(matches!(Store::create(config), Err(StoreError::Config(_))));
    }
}
