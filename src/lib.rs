//! # Cairn
//!
//! The storage core of a distributed key-value engine: a page-granular
//! persistent-memory allocator, a per-thread write-ahead log that shields
//! it, and a concurrent order-preserving B⁺-tree whose leaves and records
//! live in persistent memory.
//!
//! ## Design
//!
//! - Readers descend the tree without locks, validating a per-node version
//!   sample around each step; writers latch only the nodes they mutate.
//! - Splits publish the new sibling through a right-link before the parent
//!   learns about it; anyone finding a key beyond a node's highkey chases
//!   the right-link instead of failing.
//! - Every structural mutation is bracketed by a write-ahead-log entry
//!   whose address cell the allocator fills directly, so a crash at any
//!   point is repairable from the log plus a handful of allocator passes.
//! - Value slots are 64-bit polymorphic pointers: local PM addresses or
//!   tagged references into another cluster node's memory. This crate
//!   stores and forwards remote pointers but never dereferences them.
//!
//! [`Store`] assembles the pieces; the components are also usable on their
//! own.

pub mod alloc;
pub mod config;
pub mod error;
pub mod index;
pub mod pmem;
pub mod pointer;
pub mod record;
pub mod store;
mod tracelog;
pub mod wal;

pub use crate::alloc::Allocator;
pub use crate::config::StoreConfig;
pub use crate::error::{AllocError, ConfigError, IndexError, LogError, StoreError};
pub use crate::index::{Index, SearchHit};
pub use crate::pmem::PmRegion;
pub use crate::pointer::{PolymorphicPointer, RemotePointer};
pub use crate::store::Store;
pub use crate::wal::Logger;
