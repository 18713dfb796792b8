//! Store configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pmem::{PAGE_SIZE, align_up};
use crate::pointer::MAX_NODE_ID;
use crate::wal::Logger;

/// Sizing and identity for one store instance.
///
/// Region sizes are page multiples; the WAL region must hold the full log
/// layout. `node_id` is this machine's identity inside remote pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Size of the persistent data region in bytes.
    pub pm_bytes: usize,

    /// Size of the write-ahead-log region in bytes.
    pub wal_bytes: usize,

    /// This node's cluster id (0–63).
    pub node_id: u8,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pm_bytes: 64 * 1024 * 1024,
            wal_bytes: align_up(Logger::layout_bytes(), PAGE_SIZE),
            node_id: 0,
        }
    }
}

impl StoreConfig {
    /// Check the geometry before any region is mapped.
    ///
    /// # Errors
    ///
    /// The first violated constraint: region sizes must be non-zero page
    /// multiples, the WAL must fit its layout, and the node id must fit the
    /// remote-pointer field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for bytes in [self.pm_bytes, self.wal_bytes] {
            if bytes == 0 || bytes % PAGE_SIZE != 0 {
                return Err(ConfigError::BadRegionSize { bytes });
            }
        }
        if self.wal_bytes < Logger::layout_bytes() {
            return Err(ConfigError::WalTooSmall {
                bytes: self.wal_bytes,
                required: Logger::layout_bytes(),
            });
        }
        if self.node_id > MAX_NODE_ID {
            return Err(ConfigError::NodeIdOutOfRange(self.node_id));
        }
        Ok(())
    }
}
