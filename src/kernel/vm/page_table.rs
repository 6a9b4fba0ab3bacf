// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Page Table Entries and the Entry Codec
//!
//! Entries look the same in memory whichever frame space they are expressed
//! in, so the two views get distinct types:
//!
//! - [`Pte`] - guest view, address bits hold a PFN
//! - [`MachPte`] - hypervisor view, address bits hold an MFN
//!
//! [`encode`] and [`decode`] are the only way to move between them. Every
//! level of the hierarchy uses the same layout, so the codec is level-blind.
//!
//! # Entry Layout (x86-64)
//!
//! ```text
//!  63  62..52  51........12  11..9  8  7  6  5  4  3  2  1  0
//!  NX  avail   frame number  avail  G PS  D  A CD WT  U  W  P
//! ```
//!
//! # Failure Asymmetry
//!
//! A present machine entry whose MFN has no owner decodes to a non-present
//! entry that keeps its flag bits. A present guest entry whose PFN has no
//! backing encodes to the all-zero entry: an unresolvable frame is never
//! handed to the hypervisor as present.

use core::fmt;

use crate::kernel::vm::layout::{Mfn, Pfn, VAddr, ENTRIES_PER_TABLE, PAGE_SHIFT};
use crate::kernel::vm::p2m::P2m;

/// Address bits of an entry
pub const PTE_PFN_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Everything that is not address bits
pub const PTE_FLAGS_MASK: u64 = !PTE_PFN_MASK;

bitflags::bitflags! {
    /// Hardware entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// Present / valid mapping
        const PRESENT = 1 << 0;

        /// Writable
        const RW = 1 << 1;

        /// User-accessible
        const USER = 1 << 2;

        /// Write-through caching
        const PWT = 1 << 3;

        /// Cache disable
        const PCD = 1 << 4;

        /// Accessed (set by hardware)
        const ACCESSED = 1 << 5;

        /// Dirty (set by hardware)
        const DIRTY = 1 << 6;

        /// Large page at PMD/PUD level
        const PSE = 1 << 7;

        /// Global mapping
        const GLOBAL = 1 << 8;

        /// No-execute
        const NX = 1 << 63;
    }
}

/// Kernel read-write data
pub const PAGE_KERNEL: PteFlags = PteFlags::PRESENT
    .union(PteFlags::RW)
    .union(PteFlags::ACCESSED)
    .union(PteFlags::DIRTY);

/// Kernel read-only data
pub const PAGE_KERNEL_RO: PteFlags = PteFlags::PRESENT.union(PteFlags::ACCESSED);

/// Table level of a page-table page
///
/// `Pte` is the innermost level, `Pgd` the root.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PtLevel {
    Pte = 1,
    Pmd = 2,
    Pud = 3,
    Pgd = 4,
}

impl PtLevel {
    /// Decode a stored level tag
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(PtLevel::Pte),
            2 => Some(PtLevel::Pmd),
            3 => Some(PtLevel::Pud),
            4 => Some(PtLevel::Pgd),
            _ => None,
        }
    }

    /// Level of the tables this level's entries point at
    pub const fn child(self) -> Option<Self> {
        match self {
            PtLevel::Pgd => Some(PtLevel::Pud),
            PtLevel::Pud => Some(PtLevel::Pmd),
            PtLevel::Pmd => Some(PtLevel::Pte),
            PtLevel::Pte => None,
        }
    }

    /// Check whether entries at this level map data pages
    pub const fn is_leaf(self) -> bool {
        matches!(self, PtLevel::Pte)
    }

    /// Bit position of the lowest address bit this level indexes
    pub const fn shift(self) -> u32 {
        PAGE_SHIFT + 9 * (self as u32 - 1)
    }

    /// Bytes of address space covered by one entry at this level
    pub const fn entry_span(self) -> u64 {
        1u64 << self.shift()
    }

    /// Entry index of `vaddr` within a table at this level
    pub const fn index(self, vaddr: VAddr) -> usize {
        ((vaddr >> self.shift()) as usize) & (ENTRIES_PER_TABLE - 1)
    }
}

/// ============================================================================
/// Entry Types
/// ============================================================================

/// Guest-visible entry (PFN space)
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte(u64);

/// Hypervisor-visible entry (MFN space)
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MachPte(u64);

impl Pte {
    /// Empty entry
    pub const VOID: Pte = Pte(0);

    /// Build an entry mapping `pfn`
    pub const fn new(pfn: Pfn, flags: PteFlags) -> Self {
        Pte(((pfn.0 << PAGE_SHIFT) & PTE_PFN_MASK) | (flags.bits() & PTE_FLAGS_MASK))
    }

    /// Wrap a raw guest-space value
    pub const fn from_raw(raw: u64) -> Self {
        Pte(raw)
    }

    /// Raw value
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Frame named by the address bits
    pub const fn pfn(self) -> Pfn {
        Pfn((self.0 & PTE_PFN_MASK) >> PAGE_SHIFT)
    }

    /// Known hardware flags
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Check the present bit
    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    /// Same entry with `flags` replacing the known flag bits
    pub const fn with_flags(self, flags: PteFlags) -> Self {
        Pte((self.0 & !PteFlags::all().bits()) | flags.bits())
    }
}

impl MachPte {
    /// Empty entry
    pub const VOID: MachPte = MachPte(0);

    /// Build an entry mapping `mfn` directly
    pub const fn new(mfn: Mfn, flags: PteFlags) -> Self {
        MachPte(((mfn.0 << PAGE_SHIFT) & PTE_PFN_MASK) | (flags.bits() & PTE_FLAGS_MASK))
    }

    /// Wrap a raw machine-space value
    pub const fn from_raw(raw: u64) -> Self {
        MachPte(raw)
    }

    /// Raw value
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Frame named by the address bits
    pub const fn mfn(self) -> Mfn {
        Mfn((self.0 & PTE_PFN_MASK) >> PAGE_SHIFT)
    }

    /// Known hardware flags
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Check the present bit
    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    /// Check for a present, writable mapping
    pub const fn is_writable(self) -> bool {
        self.is_present() && self.0 & PteFlags::RW.bits() != 0
    }

    /// Same entry with `flags` replacing the known flag bits
    pub const fn with_flags(self, flags: PteFlags) -> Self {
        MachPte((self.0 & !PteFlags::all().bits()) | flags.bits())
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte({:#x})", self.0)
    }
}

impl fmt::Debug for MachPte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachPte({:#x})", self.0)
    }
}

/// ============================================================================
/// Codec
/// ============================================================================

/// Convert a guest entry to the form the hypervisor accepts
///
/// Non-present entries pass through untouched.
pub fn encode(p2m: &P2m, pte: Pte) -> MachPte {
    if !pte.is_present() {
        return MachPte(pte.0);
    }

    let mfn = p2m.pfn_to_mfn(pte.pfn());
    if !mfn.is_valid() {
        return MachPte::VOID;
    }

    MachPte(((mfn.0 << PAGE_SHIFT) & PTE_PFN_MASK) | (pte.0 & PTE_FLAGS_MASK))
}

/// Convert an entry read from a live table back to guest space
///
/// Non-present entries pass through untouched.
pub fn decode(p2m: &P2m, mpte: MachPte) -> Pte {
    if !mpte.is_present() {
        return Pte(mpte.0);
    }

    let flags = mpte.0 & PTE_FLAGS_MASK;
    let pfn = p2m.mfn_to_pfn(mpte.mfn());
    if !pfn.is_valid() {
        return Pte(flags & !PteFlags::PRESENT.bits());
    }

    Pte(((pfn.0 << PAGE_SHIFT) & PTE_PFN_MASK) | flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2m() -> P2m {
        let p2m = P2m::new(4096);
        p2m.set_phys_to_machine(Pfn(100), Mfn(5000));
        p2m
    }

    #[test]
    fn test_decode_known_frame() {
        let p2m = p2m();
        let flags = PAGE_KERNEL | PteFlags::NX;
        let mpte = MachPte::new(Mfn(5000), flags);
        let pte = decode(&p2m, mpte);
        assert_eq!(pte.raw(), (100 << PAGE_SHIFT) | flags.bits());
    }

    #[test]
    fn test_decode_unknown_frame_keeps_flags() {
        let p2m = p2m();
        let mpte = MachPte::new(Mfn(777), PAGE_KERNEL);
        let pte = decode(&p2m, mpte);
        assert!(!pte.is_present());
        assert_eq!(pte.pfn(), Pfn(0));
        assert_eq!(pte.flags(), PAGE_KERNEL - PteFlags::PRESENT);
    }

    #[test]
    fn test_encode_unmapped_is_void() {
        let p2m = p2m();
        let pte = Pte::new(Pfn(101), PAGE_KERNEL | PteFlags::USER);
        assert_eq!(encode(&p2m, pte), MachPte::VOID);
    }

    #[test]
    fn test_not_present_passes_through() {
        let p2m = p2m();
        // Swap entry style value
        let raw = 0x0000_0000_0bad_f000 | PteFlags::DIRTY.bits();
        assert_eq!(encode(&p2m, Pte::from_raw(raw)).raw(), raw);
        assert_eq!(decode(&p2m, MachPte::from_raw(raw)).raw(), raw);
    }

    #[test]
    fn test_encode_strips_identity_marker() {
        let p2m = P2m::new(4096);
        p2m.set_identity_range(Pfn(0xa0), Pfn(0xa1));
        let mpte = encode(&p2m, Pte::new(Pfn(0xa0), PAGE_KERNEL_RO));
        assert_eq!(mpte.mfn(), Mfn(0xa0));
        assert_eq!(decode(&p2m, mpte).pfn(), Pfn(0xa0));
    }

    #[test]
    fn test_level_index() {
        let va: VAddr = 0xFFFF_8880_0020_3000;
        assert_eq!(PtLevel::Pte.index(va), 3);
        assert_eq!(PtLevel::Pmd.index(va), 1);
        assert_eq!(PtLevel::Pgd.index(va), 273);
        assert_eq!(PtLevel::Pmd.child(), Some(PtLevel::Pte));
        assert_eq!(PtLevel::from_raw(4), Some(PtLevel::Pgd));
        assert_eq!(PtLevel::from_raw(0), None);
    }
}
