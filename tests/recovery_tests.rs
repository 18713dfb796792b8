//! Crash-shaped recovery scenarios.
//!
//! A "crash" here is a store torn down without any shutdown courtesy: the
//! regions are taken back and reopened cold, which runs allocator repair
//! and the log-driven index rebuild. Torn mutations are staged by driving
//! the allocator and log directly, exactly as a real crash would leave
//! them.

mod common;

use cairn::pmem::PAGE_SIZE;
use cairn::wal::LogOp;
use cairn::{IndexError, Store, StoreConfig};

fn config() -> StoreConfig {
    StoreConfig { pm_bytes: 2048 * PAGE_SIZE, ..Default::default() }
}

#[test]
fn committed_inserts_survive_reopen() {
    common::init_tracing();
    let store = Store::create(config()).unwrap();
    let tid = store.register_thread().unwrap();
    for i in 0..1000u32 {
        let key = format!("{i:05}");
        let value = format!("payload-{i}");
        store.insert(tid, key.as_bytes(), value.as_bytes()).unwrap();
    }
    // No unregister, no checkpoint: the process just dies.

    let (pm, wal) = store.into_regions();
    let reopened = Store::open(config(), pm, wal).unwrap();
    for i in 0..1000u32 {
        let key = format!("{i:05}");
        let value = format!("payload-{i}");
        let hit = reopened.search(key.as_bytes()).unwrap_or_else(|| panic!("lost key {key}"));
        assert_eq!(hit.value_bytes().unwrap(), value.as_bytes());
    }
    reopened.index().verify();
}

#[test]
fn uncommitted_insert_is_invisible_and_reclaimed() {
    common::init_tracing();
    let store = Store::create(config()).unwrap();
    let tid = store.register_thread().unwrap();

    for i in 0..100u32 {
        let key = format!("{i:04}");
        store.insert(tid, key.as_bytes(), key.as_bytes()).unwrap();
    }

    // A torn insert: log entry reserved, records allocated and written,
    // crash before the leaf slot or the commit.
    let torn = store.logger().make_log(tid, LogOp::Insert).unwrap();
    store.allocator().allocate(tid, 64, torn.address_cell()).unwrap();
    let torn_addr = torn.address();
    assert_ne!(torn_addr, 0);
    drop(torn);

    let (pm, wal) = store.into_regions();
    let reopened = Store::open(config(), pm, wal).unwrap();

    // The committed prefix is intact, the torn key never existed.
    for i in 0..100u32 {
        let key = format!("{i:04}");
        assert!(reopened.search(key.as_bytes()).is_some(), "lost key {key}");
    }
    assert!(reopened.search(b"torn-key").is_none());
    reopened.index().verify();

    // Allocator geometry stayed sane across the repair.
    let cursor = reopened.allocator().cursor();
    assert_eq!(cursor % PAGE_SIZE as u64, 0);
    assert!(cursor >= reopened.allocator().base());
}

#[test]
fn reopen_reclaims_superseded_pages() {
    common::init_tracing();
    let store = Store::create(config()).unwrap();
    let tid = store.register_thread().unwrap();
    for i in 0..500u32 {
        let key = format!("{i:05}");
        store.insert(tid, key.as_bytes(), &[0x77; 100]).unwrap();
    }
    let opened_before = store.allocator().pages_opened();

    let (pm, wal) = store.into_regions();
    let reopened = Store::open(config(), pm, wal).unwrap();

    // The rebuild copies every record into fresh blocks and frees the old
    // ones, so a reopen costs at most one extra refill batch instead of
    // re-growing the whole data set.
    let opened_after = reopened.allocator().pages_opened();
    let batch = cairn::alloc::PREALLOCATION + 1;
    assert!(
        opened_after <= opened_before + batch,
        "reopen leaked pages: {opened_before} -> {opened_after}"
    );
    assert!(reopened.allocator().idle_pages() > 0, "old pages never drained");
    for i in (0..500u32).step_by(41) {
        let key = format!("{i:05}");
        assert!(reopened.search(key.as_bytes()).is_some());
    }
    reopened.index().verify();
}

#[test]
fn double_reopen_is_stable() {
    common::init_tracing();
    let store = Store::create(config()).unwrap();
    let tid = store.register_thread().unwrap();
    for i in 0..200u32 {
        let key = format!("{i:04}");
        store.insert(tid, key.as_bytes(), key.as_bytes()).unwrap();
    }

    let (pm, wal) = store.into_regions();
    let once = Store::open(config(), pm, wal).unwrap();
    once.index().verify();
    let (pm, wal) = once.into_regions();
    let twice = Store::open(config(), pm, wal).unwrap();

    for i in 0..200u32 {
        let key = format!("{i:04}");
        let hit = twice.search(key.as_bytes()).unwrap_or_else(|| panic!("lost key {key}"));
        assert_eq!(hit.value_bytes().unwrap(), key.as_bytes());
    }
    twice.index().verify();
}

#[test]
fn reopened_store_accepts_new_writes() {
    common::init_tracing();
    let store = Store::create(config()).unwrap();
    let tid = store.register_thread().unwrap();
    for i in 0..100u32 {
        let key = format!("old-{i:03}");
        store.insert(tid, key.as_bytes(), b"old").unwrap();
    }

    let (pm, wal) = store.into_regions();
    let reopened = Store::open(config(), pm, wal).unwrap();
    let tid = reopened.register_thread().unwrap();
    for i in 0..100u32 {
        let key = format!("new-{i:03}");
        reopened.insert(tid, key.as_bytes(), b"new").unwrap();
    }
    // Replayed keys are real entries: re-inserting them reports the
    // duplicate instead of clobbering.
    assert_eq!(
        reopened.insert(tid, b"old-000", b"clobber").unwrap_err(),
        IndexError::RepeatInsert
    );

    for i in 0..100u32 {
        assert!(reopened.search(format!("old-{i:03}").as_bytes()).is_some());
        assert!(reopened.search(format!("new-{i:03}").as_bytes()).is_some());
    }
    reopened.index().verify();
}

#[test]
fn crash_during_concurrent_load_loses_only_torn_tail() {
    common::init_tracing();
    const PER_THREAD: usize = 1500;

    let store = Store::create(config()).unwrap();
    std::thread::scope(|scope| {
        for t in 0..2usize {
            let store = &store;
            scope.spawn(move || {
                let tid = store.register_thread().unwrap();
                for i in 0..PER_THREAD {
                    let key = format!("t{t}-{i:05}");
                    store.insert(tid, key.as_bytes(), key.as_bytes()).unwrap();
                }
                // Thread dies with its slot registered and one entry torn.
                let torn = store.logger().make_log(tid, LogOp::Insert).unwrap();
                store.allocator().allocate(tid, 128, torn.address_cell()).unwrap();
                drop(torn);
            });
        }
    });

    let (pm, wal) = store.into_regions();
    let reopened = Store::open(config(), pm, wal).unwrap();
    for t in 0..2usize {
        for i in 0..PER_THREAD {
            let key = format!("t{t}-{i:05}");
            assert!(reopened.search(key.as_bytes()).is_some(), "lost key {key}");
        }
    }
    reopened.index().verify();
}
