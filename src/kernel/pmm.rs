// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Physical Frame Tracking
//!
//! Per-frame descriptors for the MMU and the frame allocator interface.
//!
//! # Design
//!
//! Frames are named by index into a [`FrameArena`], never by pointer. Each
//! [`FrameDesc`] records:
//!
//! - The frame's pin state and, while it backs a table, its level
//! - The split PTE lock held across a leaf table's read-only-and-pin window
//! - The user-mode root paired with a root table
//! - Every virtual alias of the frame beyond its linear-map address
//!
//! A protection change has to reach every alias. [`FrameArena::mappings`]
//! is the single list of those.
//!
//! The frame allocator itself is a collaborator ([`FrameAllocator`]); a
//! bitmap implementation is provided for the guest's own pool.
//!
//! # Usage
//!
//! ```ignore
//! let frames = FrameArena::new(max_pfn);
//! let desc = frames.frame(pfn);
//! if desc.is_pinned() { ... }
//! ```

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use spin::Mutex;

use crate::kernel::sync::RawSpinLock;
use crate::kernel::vm::layout::{Pfn, VAddr};
use crate::kernel::vm::page_table::PtLevel;

/// Pin state of a frame
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    /// Writable and not known to the hypervisor as a table
    UnpinnedWritable = 0,

    /// Mapped read-only, pin not yet accepted
    UnpinnedReadOnly = 1,

    /// Mapped read-only and pinned
    PinnedReadOnly = 2,
}

impl PinState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => PinState::UnpinnedReadOnly,
            2 => PinState::PinnedReadOnly,
            _ => PinState::UnpinnedWritable,
        }
    }
}

/// ============================================================================
/// Frame Descriptor
/// ============================================================================

/// MMU bookkeeping for one guest frame
#[derive(Debug)]
pub struct FrameDesc {
    state: AtomicU8,
    level: AtomicU8,
    save_pinned: AtomicBool,
    user_root: AtomicU64,
    ptl: RawSpinLock,
    aliases: Mutex<Vec<VAddr>>,
}

impl FrameDesc {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PinState::UnpinnedWritable as u8),
            level: AtomicU8::new(0),
            save_pinned: AtomicBool::new(false),
            user_root: AtomicU64::new(Pfn::INVALID.0),
            ptl: RawSpinLock::new(),
            aliases: Mutex::new(Vec::new()),
        }
    }

    /// Current pin state
    pub fn state(&self) -> PinState {
        PinState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PinState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Check whether the hypervisor holds this frame pinned
    pub fn is_pinned(&self) -> bool {
        self.state() == PinState::PinnedReadOnly
    }

    /// Table level, if the frame backs a page table
    pub fn level(&self) -> Option<PtLevel> {
        PtLevel::from_raw(self.level.load(Ordering::Acquire))
    }

    pub fn set_level(&self, level: Option<PtLevel>) {
        self.level.store(level.map_or(0, |l| l as u8), Ordering::Release);
    }

    /// Pinned by a save-time sweep rather than by use
    pub fn save_pinned(&self) -> bool {
        self.save_pinned.load(Ordering::Acquire)
    }

    pub fn set_save_pinned(&self, on: bool) {
        self.save_pinned.store(on, Ordering::Release);
    }

    /// User-mode root paired with this root table
    pub fn user_root(&self) -> Option<Pfn> {
        let raw = Pfn(self.user_root.load(Ordering::Acquire));
        raw.is_valid().then_some(raw)
    }

    pub fn set_user_root(&self, root: Option<Pfn>) {
        self.user_root.store(root.unwrap_or(Pfn::INVALID).0, Ordering::Release);
    }

    /// Split PTE lock
    pub fn ptl(&self) -> &RawSpinLock {
        &self.ptl
    }

    /// Forget everything about this frame
    pub fn reset(&self) {
        self.set_state(PinState::UnpinnedWritable);
        self.set_level(None);
        self.set_save_pinned(false);
        self.set_user_root(None);
    }
}

/// ============================================================================
/// Frame Arena
/// ============================================================================

/// Descriptors for every guest frame
pub struct FrameArena {
    frames: Vec<FrameDesc>,
}

impl FrameArena {
    /// Create descriptors for frames `0..nr_frames`
    pub fn new(nr_frames: u64) -> Self {
        Self {
            frames: (0..nr_frames).map(|_| FrameDesc::new()).collect(),
        }
    }

    /// Number of frames tracked
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Descriptor of `pfn`, if tracked
    pub fn get(&self, pfn: Pfn) -> Option<&FrameDesc> {
        self.frames.get(pfn.0 as usize)
    }

    /// Descriptor of a frame the caller knows is tracked
    ///
    /// An untracked frame reaching here means a table pointer is corrupt.
    pub fn frame(&self, pfn: Pfn) -> &FrameDesc {
        match self.get(pfn) {
            Some(desc) => desc,
            None => crate::fatal!("no descriptor for {:?}", pfn),
        }
    }

    /// Record an extra virtual alias of `pfn`
    pub fn add_alias(&self, pfn: Pfn, va: VAddr) {
        let mut aliases = self.frame(pfn).aliases.lock();
        if !aliases.contains(&va) {
            aliases.push(va);
        }
    }

    /// Drop an extra virtual alias of `pfn`
    pub fn remove_alias(&self, pfn: Pfn, va: VAddr) {
        self.frame(pfn).aliases.lock().retain(|&a| a != va);
    }

    /// Every virtual address `pfn` is mapped at, linear map first
    pub fn mappings(&self, pfn: Pfn) -> Vec<VAddr> {
        let mut out = Vec::with_capacity(1);
        out.push(pfn.to_virt());
        out.extend(self.frame(pfn).aliases.lock().iter().copied());
        out
    }
}

/// ============================================================================
/// Frame Allocator
/// ============================================================================

/// Physical frame allocator collaborator
pub trait FrameAllocator: Send + Sync {
    /// Allocate `count` contiguous guest frames
    fn alloc_frames(&self, count: usize) -> Option<Pfn>;

    /// Return frames from [`alloc_frames`](Self::alloc_frames)
    fn free_frames(&self, base: Pfn, count: usize);
}

/// Bitmap allocator over a fixed PFN range
///
/// Each bit represents one frame (0 = free, 1 = allocated).
pub struct BitmapAllocator {
    base: Pfn,
    count: usize,
    bitmap: Mutex<Vec<u64>>,
}

impl BitmapAllocator {
    /// Manage frames `base..base + count`
    pub fn new(base: Pfn, count: usize) -> Self {
        Self {
            base,
            count,
            bitmap: Mutex::new(alloc::vec![0; (count + 63) / 64]),
        }
    }

    /// Number of free frames
    pub fn free_count(&self) -> usize {
        let bitmap = self.bitmap.lock();
        self.count - bitmap.iter().map(|w| w.count_ones() as usize).sum::<usize>()
    }

    fn test_bit(bitmap: &[u64], index: usize) -> bool {
        bitmap[index / 64] & (1u64 << (index % 64)) != 0
    }

    fn set_bit(bitmap: &mut [u64], index: usize, on: bool) {
        if on {
            bitmap[index / 64] |= 1u64 << (index % 64);
        } else {
            bitmap[index / 64] &= !(1u64 << (index % 64));
        }
    }
}

impl FrameAllocator for BitmapAllocator {
    fn alloc_frames(&self, count: usize) -> Option<Pfn> {
        if count == 0 || count > self.count {
            return None;
        }

        let mut bitmap = self.bitmap.lock();
        let mut start = 0;
        while start + count <= self.count {
            match (start..start + count).find(|&i| Self::test_bit(&bitmap, i)) {
                Some(used) => start = used + 1,
                None => {
                    for i in start..start + count {
                        Self::set_bit(&mut bitmap, i, true);
                    }
                    return Some(self.base.add(start as u64));
                }
            }
        }
        None
    }

    fn free_frames(&self, base: Pfn, count: usize) {
        if base < self.base {
            return;
        }
        let first = (base.0 - self.base.0) as usize;
        let mut bitmap = self.bitmap.lock();
        for i in first..(first + count).min(self.count) {
            Self::set_bit(&mut bitmap, i, false);
        }
    }
}
