//! Error taxonomy.
//!
//! Transient conditions the tree resolves internally (optimistic-read
//! retries, node splits) never surface here; what callers see is the small
//! set below. Invariant violations are not errors: they panic, on the theory
//! that continuing after detected corruption only spreads it.

use thiserror::Error;

/// Failures of the persistent-memory allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Requested size exceeds what a single page can hold.
    #[error("allocation of {size} bytes exceeds the page payload ({max} bytes)")]
    TooLarge { size: usize, max: usize },

    /// The region has no unallocated pages left.
    #[error("persistent region exhausted")]
    OutOfMemory,

    /// All thread slots are taken.
    #[error("no free allocator slot")]
    NoSlot,
}

/// Failures of the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LogError {
    /// The thread's log region is full and checkpointing freed nothing.
    #[error("log region full")]
    NoLog,

    /// All log region slots are taken.
    #[error("no free log slot")]
    NoSlot,
}

/// Failures surfaced by index operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IndexError {
    /// The key is already present. Idempotent from the caller's view: the
    /// stored value is the one from the first insert.
    #[error("key already present")]
    RepeatInsert,

    /// The allocator could not satisfy the request. No log entry was
    /// committed and no node was mutated.
    #[error("out of persistent memory")]
    NoMemory,

    /// The write-ahead log rejected the record.
    #[error("write-ahead log full")]
    NoLog,
}

/// Configuration and region-geometry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Region sizes must be non-zero multiples of the page size.
    #[error("region size {bytes} is not a non-zero multiple of the page size")]
    BadRegionSize { bytes: usize },

    /// The WAL region cannot hold the magic word plus all log regions.
    #[error("WAL region of {bytes} bytes is smaller than the log layout ({required} bytes)")]
    WalTooSmall { bytes: usize, required: usize },

    /// Node ids ride in 6 bits of a remote pointer.
    #[error("node id {0} exceeds the maximum of 63")]
    NodeIdOutOfRange(u8),

    /// Attach found an allocator magic but an unrecoverable structure.
    #[error("persistent region is corrupted")]
    Corrupted,
}

/// Failures of store startup and recovery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Index(#[from] IndexError),

    /// The allocator header exists but cannot be repaired. Fatal.
    #[error("persistent region is corrupted")]
    Corrupted,
}

impl From<AllocError> for IndexError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::TooLarge { .. } | AllocError::OutOfMemory => Self::NoMemory,
            AllocError::NoSlot => Self::NoMemory,
        }
    }
}

impl From<LogError> for IndexError {
    fn from(_: LogError) -> Self {
        Self::NoLog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_error_display() {
        let err = AllocError::TooLarge { size: 1 << 20, max: 16368 };
        assert!(err.to_string().contains("1048576"));
        assert_eq!(AllocError::OutOfMemory.to_string(), "persistent region exhausted");
    }

    #[test]
    fn alloc_error_maps_to_no_memory() {
        assert_eq!(IndexError::from(AllocError::OutOfMemory), IndexError::NoMemory);
        assert_eq!(
            IndexError::from(AllocError::TooLarge { size: 1, max: 0 }),
            IndexError::NoMemory
        );
    }

    #[test]
    fn log_error_maps_to_no_log() {
        assert_eq!(IndexError::from(LogError::NoLog), IndexError::NoLog);
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AllocError>();
        assert_send_sync::<LogError>();
        assert_send_sync::<IndexError>();
        assert_send_sync::<ConfigError>();
    }
}
