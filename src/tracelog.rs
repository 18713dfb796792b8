//! Crate-local log macros.
//!
//! The engine logs structural events (splits, recovery repairs, region
//! growth) through these macros. With the `tracing` cargo feature enabled
//! they forward to the `tracing` crate, which multiplexes lines per thread;
//! without it they expand to nothing, so the sink can be disabled with zero
//! behavioral difference.
//!
//! ```bash
//! RUST_LOG=cairn=debug cargo test --features tracing
//! ```

#![allow(unused_macros, unused_imports)]

#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => { tracing::trace!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! warn_log {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_log {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! info_log {
    ($($arg:tt)*) => { tracing::info!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! info_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use info_log;
pub(crate) use trace_log;
pub(crate) use warn_log;
