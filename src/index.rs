//! The order-preserving index: nodes, version locks, and the tree itself.
//!
//! See [`tree::Index`] for the concurrency protocol. The submodules split
//! along the same lines as the on-memory structures: [`version`] holds the
//! per-node latch, [`node`] the leaf/inner layouts, [`tree`] the algorithms.

mod node;
mod tree;
mod version;

pub use node::{DEFAULT_KEYS, InnerNode, LeafNode, NodePtr};
pub use tree::{Index, SearchHit};
pub use version::{VersionGuard, VersionLock};
