// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Guest Address Layout
//!
//! Frame numbers and address types used on both sides of the hypervisor
//! boundary, plus the fixed regions of the guest virtual layout.
//!
//! # Address Spaces
//!
//! | Name  | Meaning                                   | Dereferenceable |
//! |-------|-------------------------------------------|-----------------|
//! | VAddr | Guest virtual address                     | yes             |
//! | PAddr | Guest pseudo-physical address (PFN space) | no              |
//! | MAddr | Machine address (MFN space)               | no              |
//!
//! The guest's linear map places every PFN at `PAGE_OFFSET + (pfn << 12)`.

use core::fmt;

/// Virtual address type
pub type VAddr = u64;

/// Guest pseudo-physical address type
pub type PAddr = u64;

/// Machine address type
pub type MAddr = u64;

/// Page size (4KB)
pub const PAGE_SIZE: u64 = 4096;

/// Page size shift for quick division/multiplication
pub const PAGE_SHIFT: u32 = 12;

/// Mask for the in-page offset
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Entries in one page-table page at any level
pub const ENTRIES_PER_TABLE: usize = 512;

/// Base of the guest linear map of all pseudo-physical memory
pub const PAGE_OFFSET: VAddr = 0xFFFF_8880_0000_0000;

/// Just beyond the highest user address, rounded up to a root-slot boundary
pub const USER_LIMIT: VAddr = 0x0000_8000_0000_0000;

/// Top of the fixmap area; boot-time walks cover everything below it
pub const FIXADDR_TOP: VAddr = 0xFFFF_FFFF_FF60_0000;

/// First root slot reserved for the hypervisor's own mappings
pub const GUARD_HOLE_BASE_ADDR: VAddr = 0xFFFF_8000_0000_0000;

/// First root slot after the hypervisor's reservation
pub const GUARD_HOLE_END_ADDR: VAddr = 0xFFFF_8800_0000_0000;

/// Set on P2M values that name another domain's frame
pub const FOREIGN_FRAME_BIT: u64 = 1 << 63;

/// Set on P2M values for 1:1 (PFN == MFN) regions
pub const IDENTITY_FRAME_BIT: u64 = 1 << 62;

/// ============================================================================
/// Frame Numbers
/// ============================================================================

/// Guest frame number (pseudo-physical)
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pfn(pub u64);

/// Machine frame number
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mfn(pub u64);

impl Pfn {
    /// Reverse lookup sentinel: no PFN owns this MFN
    pub const INVALID: Pfn = Pfn(!0);

    /// Check whether this is a real frame number
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Pseudo-physical address of the start of this frame
    pub const fn paddr(self) -> PAddr {
        self.0 << PAGE_SHIFT
    }

    /// Frame containing a pseudo-physical address
    pub const fn from_paddr(paddr: PAddr) -> Self {
        Pfn(paddr >> PAGE_SHIFT)
    }

    /// Linear-map virtual address of this frame
    pub const fn to_virt(self) -> VAddr {
        PAGE_OFFSET + (self.0 << PAGE_SHIFT)
    }

    /// Frame backing a linear-map virtual address
    pub const fn from_virt(vaddr: VAddr) -> Self {
        Pfn((vaddr - PAGE_OFFSET) >> PAGE_SHIFT)
    }

    /// Frame `n` frames after this one
    pub const fn add(self, n: u64) -> Self {
        Pfn(self.0 + n)
    }
}

impl Mfn {
    /// Forward lookup sentinel: PFN has no machine frame
    pub const INVALID: Mfn = Mfn(!0);

    /// Check whether this is a real frame number
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Machine address of the start of this frame
    pub const fn maddr(self) -> MAddr {
        self.0 << PAGE_SHIFT
    }

    /// Frame containing a machine address
    pub const fn from_maddr(maddr: MAddr) -> Self {
        Mfn(maddr >> PAGE_SHIFT)
    }

    /// 1:1 marker value for `pfn`
    pub const fn identity(pfn: Pfn) -> Self {
        Mfn(pfn.0 | IDENTITY_FRAME_BIT)
    }

    /// Check for the 1:1 marker
    pub const fn is_identity(self) -> bool {
        self.is_valid() && (self.0 & IDENTITY_FRAME_BIT) != 0
    }

    /// Check for the foreign-frame marker
    pub const fn is_foreign(self) -> bool {
        self.is_valid() && (self.0 & FOREIGN_FRAME_BIT) != 0
    }

    /// Frame number with marker bits removed
    pub const fn strip_markers(self) -> Self {
        if self.is_valid() {
            Mfn(self.0 & !(FOREIGN_FRAME_BIT | IDENTITY_FRAME_BIT))
        } else {
            self
        }
    }

    /// Frame `n` frames after this one
    pub const fn add(self, n: u64) -> Self {
        Mfn(self.0 + n)
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Pfn({:#x})", self.0)
        } else {
            f.write_str("Pfn(INVALID)")
        }
    }
}

impl fmt::Debug for Mfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Mfn({:#x})", self.0)
        } else {
            f.write_str("Mfn(INVALID)")
        }
    }
}

/// ============================================================================
/// Helpers
/// ============================================================================

/// Check if an address is page-aligned
#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    (addr & PAGE_MASK) == 0
}

/// Align an address down to page boundary
#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Number of pages in a block of the given order
#[inline]
pub const fn order_pages(order: u32) -> u64 {
    1u64 << order
}
