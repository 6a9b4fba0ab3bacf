// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Raw Spinlock
//!
//! A data-less spinlock with explicit lock/unlock. The split PTE lock taken
//! while a leaf table is being made read-only and pinned is released from a
//! multicall completion callback, long after the frame that took it has
//! returned, so it cannot be a scoped guard.

use core::sync::atomic::{AtomicBool, Ordering};

/// A raw spinlock without protected data
#[derive(Debug)]
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    /// Create a new, unlocked spinlock
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning until it becomes available
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin with pause to reduce bus contention
            core::hint::spin_loop();
        }
    }

    /// Try to acquire the lock without spinning
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock
    ///
    /// # Safety
    ///
    /// The caller must own the lock, either directly or by having been handed
    /// it by the context that acquired it.
    pub unsafe fn unlock(&self) {
        debug_assert!(self.is_locked());
        self.locked.store(false, Ordering::Release);
    }

    /// Check whether the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}
