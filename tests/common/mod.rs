//! Shared test setup.
//!
//! Call `init_tracing()` at the top of a test to get log output when the
//! crate is built with the `tracing` feature:
//!
//! ```bash
//! RUST_LOG=cairn=debug cargo test --features tracing -- --nocapture
//! ```

#![allow(dead_code)]

use std::sync::{Arc, Once};

use cairn::alloc::Allocator;
use cairn::index::Index;
use cairn::pmem::{PAGE_SIZE, PmRegion, align_up};
use cairn::wal::Logger;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// An index with three key slots per node (degree 4) for deterministic
/// structure tests, plus the machinery underneath it.
///
/// Field order keeps the engine handles dropping before the regions they
/// point into.
pub struct SmallRig {
    pub index: Index<3>,
    pub alloc: Arc<Allocator>,
    pub logger: Arc<Logger>,
    pub tid: usize,
    pm: PmRegion,
    wal: PmRegion,
}

/// Build a [`SmallRig`] with one registered thread slot.
pub fn small_rig() -> SmallRig {
    small_rig_sized(2048 * PAGE_SIZE)
}

/// Build a [`SmallRig`] over a PM region of `pm_bytes`.
pub fn small_rig_sized(pm_bytes: usize) -> SmallRig {
    let pm = PmRegion::new(pm_bytes).unwrap();
    let wal = PmRegion::new(align_up(Logger::layout_bytes(), PAGE_SIZE)).unwrap();
    let (alloc, _) = Allocator::attach(&pm).unwrap();
    let alloc = Arc::new(alloc);
    let logger = Arc::new(Logger::attach(&wal).unwrap());

    let tid = alloc.register_thread().unwrap();
    assert_eq!(Some(tid), logger.register_thread());
    let index = Index::<3>::new(tid, Arc::clone(&alloc), Arc::clone(&logger)).unwrap();
    SmallRig { index, alloc, logger, tid, pm, wal }
}

/// Look a key up and clone the value payload.
pub fn lookup(index: &Index<3>, key: &[u8]) -> Option<Vec<u8>> {
    index.search(key).map(|hit| hit.value_bytes().unwrap().to_vec())
}

/// Install a fmt subscriber honoring `RUST_LOG`. Safe to call from every
/// test; only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .with_test_writer()
            .try_init();
    });
}
