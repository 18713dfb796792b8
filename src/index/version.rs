//! Per-node version lock for optimistic concurrency control.
//!
//! A single `AtomicU64` encodes a writer latch in bit 0 and a version
//! counter in bits 1–63. The word is even while unlocked and odd while
//! locked; a lock/unlock pair advances it by 2, so a reader that samples an
//! even word, reads node fields, and re-samples the same word knows it
//! observed a consistent snapshot.
//!
//! Writers get a [`VersionGuard`] that unlocks on drop, including during a
//! panic, so the latch is released on every path.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

const LOCK_BIT: u64 = 1;

/// A 64-bit version lock.
#[derive(Debug)]
pub struct VersionLock {
    word: AtomicU64,
}

/// Proof that a [`VersionLock`] is held.
///
/// Cannot be constructed except through [`VersionLock::lock`] or
/// [`VersionLock::try_lock`]. Dropping the guard releases the latch and
/// bumps the version.
#[derive(Debug)]
#[must_use = "dropping a guard immediately is an unlock; bind it"]
pub struct VersionGuard<'a> {
    lock: &'a VersionLock,

    // Raw-pointer PhantomData keeps guards !Send + !Sync.
    _marker: PhantomData<*mut ()>,
}

impl Drop for VersionGuard<'_> {
    fn drop(&mut self) {
        // Odd -> even: clears the latch bit and advances the version.
        self.lock.word.fetch_add(1, Ordering::Release);
    }
}

impl VersionLock {
    pub const fn new() -> Self {
        Self { word: AtomicU64::new(0) }
    }

    /// Sample the raw word for optimistic validation.
    ///
    /// An odd sample means a writer is active; even samples compare equal
    /// across a read iff no writer intervened.
    #[inline]
    #[must_use]
    pub fn read(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Sample the version, or `None` while a writer holds the latch.
    #[inline]
    #[must_use]
    pub fn read_version(&self) -> Option<u64> {
        let word = self.read();
        if word & LOCK_BIT != 0 { None } else { Some(word >> 1) }
    }

    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.read() & LOCK_BIT != 0
    }

    /// Current version counter (bits 1–63).
    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.read() >> 1
    }

    /// Spin until the latch is acquired.
    pub fn lock(&self) -> VersionGuard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            std::hint::spin_loop();
        }
    }

    /// One latch attempt.
    #[must_use]
    pub fn try_lock(&self) -> Option<VersionGuard<'_>> {
        let current = self.word.load(Ordering::Relaxed);
        if current & LOCK_BIT != 0 {
            return None;
        }
        self.word
            .compare_exchange_weak(
                current,
                current | LOCK_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| VersionGuard { lock: self, _marker: PhantomData })
    }
}

impl Default for VersionLock {
    fn default() -> Self {
        Self::new()
    }
}
