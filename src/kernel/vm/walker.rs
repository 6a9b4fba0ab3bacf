// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Page-Table Tree Walker
//!
//! One walker for every level. It reads entries through the guest's own
//! mappings, decodes them, and hands each table page it finds to a
//! [`PageVisitor`] together with its level.
//!
//! # Design
//!
//! - Only addresses below `limit` are walked
//! - Root slots reserved for the hypervisor are skipped
//! - Large-page entries end the descent, they point at data, not tables
//! - Non-root pages are visited children-first or parent-first; the root is
//!   always visited last
//!
//! # Usage
//!
//! ```ignore
//! mmu.walker().walk(root, USER_LIMIT, WalkOrder::ChildrenFirst, &mut |pfn: Pfn, level: PtLevel| {
//!     log_debug!("{:?} at {:?}", pfn, level);
//! });
//! ```

use crate::kernel::cmdline::PvMmuConfig;
use crate::kernel::hypervisor::GuestMemory;
use crate::kernel::vm::layout::{Pfn, VAddr, ENTRIES_PER_TABLE};
use crate::kernel::vm::p2m::P2m;
use crate::kernel::vm::page_table::{self, PtLevel, Pte, PteFlags};

/// Order in which non-root pages are visited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOrder {
    /// A table after everything below it
    ChildrenFirst,

    /// A table before anything below it
    ParentFirst,
}

/// Callback for each table page found
pub trait PageVisitor {
    fn visit(&mut self, pfn: Pfn, level: PtLevel);
}

impl<F: FnMut(Pfn, PtLevel)> PageVisitor for F {
    fn visit(&mut self, pfn: Pfn, level: PtLevel) {
        self(pfn, level)
    }
}

/// Tree walker over one guest's tables
pub struct Walker<'a> {
    mem: &'a dyn GuestMemory,
    p2m: &'a P2m,
    config: &'a PvMmuConfig,
}

impl<'a> Walker<'a> {
    pub fn new(mem: &'a dyn GuestMemory, p2m: &'a P2m, config: &'a PvMmuConfig) -> Self {
        Self { mem, p2m, config }
    }

    /// Read and decode one entry
    pub fn entry(&self, table: Pfn, index: usize) -> Pte {
        page_table::decode(self.p2m, self.mem.read_entry(table.to_virt(), index))
    }

    /// Visit every table page reachable from `root` below `limit`
    ///
    /// # Returns
    ///
    /// Number of pages visited, root included.
    pub fn walk(&self, root: Pfn, limit: VAddr, order: WalkOrder, visitor: &mut dyn PageVisitor) -> usize {
        let visited = self.walk_table(root, PtLevel::Pgd, 0, limit, order, visitor);
        visitor.visit(root, PtLevel::Pgd);
        visited + 1
    }

    /// Walk the children of `table`, which maps addresses from `base`
    fn walk_table(
        &self,
        table: Pfn,
        level: PtLevel,
        base: VAddr,
        limit: VAddr,
        order: WalkOrder,
        visitor: &mut dyn PageVisitor,
    ) -> usize {
        let child_level = match level.child() {
            Some(child) => child,
            None => return 0,
        };

        let mut visited = 0;
        for index in 0..ENTRIES_PER_TABLE {
            let va = sign_extend(base + index as u64 * level.entry_span());
            if va >= limit {
                break;
            }
            if level == PtLevel::Pgd && self.config.in_guard_hole(index) {
                continue;
            }

            let entry = self.entry(table, index);
            if !entry.is_present() || entry.flags().contains(PteFlags::PSE) {
                continue;
            }

            let child = entry.pfn();
            if order == WalkOrder::ParentFirst {
                visitor.visit(child, child_level);
            }
            visited += self.walk_table(child, child_level, va, limit, order, visitor);
            if order == WalkOrder::ChildrenFirst {
                visitor.visit(child, child_level);
            }
            visited += 1;
        }
        visited
    }
}

/// Canonical form of a 48-bit address
const fn sign_extend(va: VAddr) -> VAddr {
    if va & (1 << 47) != 0 {
        va | 0xFFFF_0000_0000_0000
    } else {
        va
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::hypervisor::mock::Harness;
    use crate::kernel::vm::layout::USER_LIMIT;
    use crate::kernel::vm::page_table::PAGE_KERNEL;
    use alloc::vec::Vec;

    #[test]
    fn test_children_first() {
        let h = Harness::new();
        let mut ctx = h.mmu.core_context(0);
        let mm = h.mmu.pgd_alloc().unwrap();
        let tree = h.map_user_page(&mut ctx, &mm, 0x40_0000, h.alloc_frame());

        let mut seen = Vec::new();
        let count = h
            .mmu
            .walker()
            .walk(mm.pgd(), USER_LIMIT, WalkOrder::ChildrenFirst, &mut |pfn: Pfn, level: PtLevel| seen.push((pfn, level)));
        assert_eq!(count, 4);
        assert_eq!(
            seen,
            [
                (tree.pte, PtLevel::Pte),
                (tree.pmd, PtLevel::Pmd),
                (tree.pud, PtLevel::Pud),
                (mm.pgd(), PtLevel::Pgd),
            ]
        );
    }

    #[test]
    fn test_parent_first_root_last() {
        let h = Harness::new();
        let mut ctx = h.mmu.core_context(0);
        let mm = h.mmu.pgd_alloc().unwrap();
        let tree = h.map_user_page(&mut ctx, &mm, 0x40_0000, h.alloc_frame());

        let mut seen = Vec::new();
        h.mmu
            .walker()
            .walk(mm.pgd(), USER_LIMIT, WalkOrder::ParentFirst, &mut |pfn: Pfn, _: PtLevel| seen.push(pfn));
        assert_eq!(seen, [tree.pud, tree.pmd, tree.pte, mm.pgd()]);
    }

    #[test]
    fn test_limit_and_large_pages() {
        let h = Harness::new();
        let mut ctx = h.mmu.core_context(0);
        let mm = h.mmu.pgd_alloc().unwrap();
        h.map_user_page(&mut ctx, &mm, 0x40_0000, h.alloc_frame());

        // Kernel-half table is outside the user limit
        let high = h.alloc_frame();
        h.mmu.set_entry(&mut ctx, mm.pgd(), 300, Pte::new(high, PAGE_KERNEL));
        // Large page at PUD level
        let big = h.alloc_frame();
        h.mmu
            .set_entry(&mut ctx, mm.pgd(), 5, Pte::new(big, PAGE_KERNEL | PteFlags::PSE));

        let mut seen = Vec::new();
        h.mmu
            .walker()
            .walk(mm.pgd(), USER_LIMIT, WalkOrder::ChildrenFirst, &mut |pfn: Pfn, _: PtLevel| seen.push(pfn));
        assert_eq!(seen.len(), 4);
        assert!(!seen.contains(&high));
        assert!(!seen.contains(&big));
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0x0000_8000_0000_0000), 0xFFFF_8000_0000_0000);
        assert_eq!(sign_extend(0x0000_7000_0000_0000), 0x0000_7000_0000_0000);
    }
}
