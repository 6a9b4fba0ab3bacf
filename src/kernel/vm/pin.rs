// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Pagetable Pinning
//!
//! A page in use as a page table must be read-only everywhere it is mapped
//! and pinned, so the hypervisor can trust it without revalidating on every
//! root load.
//!
//! # States
//!
//! ```text
//!                   make RO            pin accepted
//! UnpinnedWritable ---------> UnpinnedReadOnly ---------> PinnedReadOnly
//!                  <---------                  <---------
//!                   make RW                      unpin
//! ```
//!
//! # Ordering
//!
//! - **Pin**: every descendant is made read-only and pinned before the root.
//!   Leaf tables are made read-only and pinned with their split PTE lock
//!   held; the lock is dropped once the batch carrying the pin is in.
//! - **Unpin**: the root is unpinned first, then each descendant, parents
//!   before children, and each is made writable after its own unpin.
//!
//! A rejected pin, unpin or protection change halts.

use alloc::boxed::Box;
use alloc::vec;

use crate::kernel::hypervisor::multicall::LazyMode;
use crate::kernel::hypervisor::{MmuExtOp, MultiCall, UvmFlags};
use crate::kernel::mmu::PvMmu;
use crate::kernel::percpu::CoreContext;
use crate::kernel::pmm::PinState;
use crate::kernel::vm::aspace::AddressSpace;
use crate::kernel::vm::layout::{Pfn, FIXADDR_TOP};
use crate::kernel::vm::page_table::{PtLevel, PAGE_KERNEL, PAGE_KERNEL_RO};
use crate::kernel::vm::walker::WalkOrder;
use crate::kernel::vm::{Result, VmError};
use crate::{log_debug, log_trace_if};

const LOCAL_TRACE: bool = false;

impl PvMmu {
    fn split_lock(&self, level: PtLevel) -> bool {
        self.config.split_pte_locks && level.is_leaf()
    }

    /// Queue the read-only transition and pin of one table page
    fn pin_page(&self, ctx: &mut CoreContext, pfn: Pfn, level: PtLevel) {
        let desc = self.frames.frame(pfn);
        desc.set_level(Some(level));
        if desc.state() != PinState::UnpinnedWritable {
            return;
        }

        log_trace_if!(LOCAL_TRACE, "pin {:?} at {:?}", pfn, level);
        let locked = self.split_lock(level);
        if locked {
            desc.ptl().lock();
        }

        desc.set_state(PinState::UnpinnedReadOnly);
        self.set_frame_prot(ctx, pfn, PAGE_KERNEL_RO, UvmFlags::empty());
        let mfn = self.table_mfn(pfn);
        self.queue(ctx, MultiCall::MmuExtOp(vec![MmuExtOp::PinTable { level, mfn }]));
        self.queue_callback(ctx, self.state_callback(pfn, PinState::PinnedReadOnly));

        if locked {
            let frames = self.frames.clone();
            // SAFETY: the lock was taken above and is handed to the callback
            self.queue_callback(ctx, Box::new(move || unsafe { frames.frame(pfn).ptl().unlock() }));
        }
    }

    /// Queue the unpin and writable transition of one table page
    fn unpin_page(&self, ctx: &mut CoreContext, pfn: Pfn, level: PtLevel) {
        let desc = self.frames.frame(pfn);
        if desc.state() != PinState::PinnedReadOnly {
            return;
        }

        log_trace_if!(LOCAL_TRACE, "unpin {:?} at {:?}", pfn, level);
        let locked = self.split_lock(level);
        if locked {
            desc.ptl().lock();
        }

        desc.set_state(PinState::UnpinnedReadOnly);
        let mfn = self.table_mfn(pfn);
        self.queue(ctx, MultiCall::MmuExtOp(vec![MmuExtOp::UnpinTable { mfn }]));
        self.set_frame_prot(ctx, pfn, PAGE_KERNEL, UvmFlags::empty());
        self.queue_callback(ctx, self.state_callback(pfn, PinState::UnpinnedWritable));

        if locked {
            let frames = self.frames.clone();
            // SAFETY: the lock was taken above and is handed to the callback
            self.queue_callback(ctx, Box::new(move || unsafe { frames.frame(pfn).ptl().unlock() }));
        }
    }

    /// Make a root and its user-mode root writable again after their unpin
    fn release_root(&self, ctx: &mut CoreContext, root: Pfn) {
        let roots = [Some(root), self.frames.frame(root).user_root()];
        for pfn in roots.into_iter().flatten() {
            if self.frames.frame(pfn).state() != PinState::UnpinnedReadOnly {
                continue;
            }
            self.set_frame_prot(ctx, pfn, PAGE_KERNEL, UvmFlags::TLB_FLUSH);
            self.queue_callback(ctx, self.state_callback(pfn, PinState::UnpinnedWritable));
        }
    }

    /// Pin the tree under `root`
    ///
    /// Descendants are pinned first and the root last, followed by its
    /// user-mode root. Pinning a pinned root does nothing.
    pub fn pin(&self, ctx: &mut CoreContext, root: Pfn) {
        if self.frames.frame(root).state() != PinState::UnpinnedWritable {
            return;
        }

        let irq = ctx.irq_save();
        let pages = self.walker().walk(
            root,
            self.config.user_limit,
            WalkOrder::ChildrenFirst,
            &mut |pfn: Pfn, level: PtLevel| {
                self.pin_page(ctx, pfn, level);
                if pfn == root {
                    if let Some(user) = self.frames.frame(root).user_root() {
                        self.pin_page(ctx, user, PtLevel::Pgd);
                    }
                }
            },
        );
        self.flush(ctx);
        ctx.irq_restore(irq);

        log_debug!("cpu {}: pinned root {:?} ({} pages)", ctx.cpu, root, pages);
    }

    /// Unpin the tree under `root`
    ///
    /// The root (and its user-mode root) is unpinned first, then every
    /// descendant, parents before children. Unpinning an unpinned root does
    /// nothing. No core may still have `root` loaded, see
    /// [`drop_mm_ref`](Self::drop_mm_ref).
    pub fn unpin(&self, ctx: &mut CoreContext, root: Pfn) {
        let desc = self.frames.frame(root);
        if desc.state() != PinState::PinnedReadOnly {
            return;
        }

        let irq = ctx.irq_save();
        desc.set_state(PinState::UnpinnedReadOnly);
        let mut ops = vec![MmuExtOp::UnpinTable {
            mfn: self.table_mfn(root),
        }];
        if let Some(user) = desc.user_root() {
            let user_desc = self.frames.frame(user);
            if user_desc.state() == PinState::PinnedReadOnly {
                user_desc.set_state(PinState::UnpinnedReadOnly);
                ops.push(MmuExtOp::UnpinTable {
                    mfn: self.table_mfn(user),
                });
            }
        }
        self.queue(ctx, MultiCall::MmuExtOp(ops));

        let pages = self.walker().walk(
            root,
            self.config.user_limit,
            WalkOrder::ParentFirst,
            &mut |pfn: Pfn, level: PtLevel| {
                if pfn == root {
                    self.release_root(ctx, root);
                } else {
                    self.unpin_page(ctx, pfn, level);
                }
            },
        );
        self.flush(ctx);
        ctx.irq_restore(irq);

        log_debug!("cpu {}: unpinned root {:?} ({} pages)", ctx.cpu, root, pages);
    }

    /// Record the state of a tree the hypervisor already holds pinned
    ///
    /// Used at boot for the tables the domain builder handed over. Issues no
    /// requests.
    pub fn mark_pinned(&self, root: Pfn) {
        let pages = self.walker().walk(
            root,
            FIXADDR_TOP,
            WalkOrder::ChildrenFirst,
            &mut |pfn: Pfn, level: PtLevel| {
                let desc = self.frames.frame(pfn);
                desc.set_level(Some(level));
                desc.set_state(PinState::PinnedReadOnly);
            },
        );
        log_debug!("marked root {:?} pinned ({} pages)", root, pages);
    }

    /// ========================================================================
    /// Table Page Lifecycle
    /// ========================================================================

    /// A frame has just become a table page of `mm` at `level`
    ///
    /// Pages of a pinned address space are made read-only and pinned
    /// straight away; others stay writable until the whole tree is pinned.
    pub fn alloc_ptpage(&self, ctx: &mut CoreContext, mm: &AddressSpace, pfn: Pfn, level: PtLevel) {
        let desc = self.frames.frame(pfn);
        desc.set_level(Some(level));

        if self.frames.frame(mm.pgd()).state() == PinState::UnpinnedWritable {
            return;
        }

        log_trace_if!(LOCAL_TRACE, "alloc pinned {:?} at {:?}", pfn, level);
        desc.set_state(PinState::UnpinnedReadOnly);
        self.set_frame_prot(ctx, pfn, PAGE_KERNEL_RO, UvmFlags::empty());
        let mfn = self.table_mfn(pfn);
        self.queue(ctx, MultiCall::MmuExtOp(vec![MmuExtOp::PinTable { level, mfn }]));
        self.queue_callback(ctx, self.state_callback(pfn, PinState::PinnedReadOnly));
        self.issue(ctx, LazyMode::Mmu);
    }

    /// A table page is about to go back to the allocator
    pub fn release_ptpage(&self, ctx: &mut CoreContext, pfn: Pfn) {
        let desc = self.frames.frame(pfn);
        if desc.state() == PinState::UnpinnedWritable {
            desc.reset();
            return;
        }

        log_trace_if!(LOCAL_TRACE, "release pinned {:?}", pfn);
        desc.set_state(PinState::UnpinnedReadOnly);
        let mfn = self.table_mfn(pfn);
        self.queue(ctx, MultiCall::MmuExtOp(vec![MmuExtOp::UnpinTable { mfn }]));
        self.set_frame_prot(ctx, pfn, PAGE_KERNEL, UvmFlags::empty());
        let frames = self.frames.clone();
        self.queue_callback(ctx, Box::new(move || frames.frame(pfn).reset()));
        self.issue(ctx, LazyMode::Mmu);
    }

    /// ========================================================================
    /// Save/Restore
    /// ========================================================================

    /// Pin every unpinned root ahead of a save
    pub fn pin_all(&self, ctx: &mut CoreContext) {
        let roots = self.pgd_list.lock();
        for &root in roots.iter() {
            let desc = self.frames.frame(root);
            if desc.state() == PinState::UnpinnedWritable {
                self.pin(ctx, root);
                desc.set_save_pinned(true);
            }
        }
    }

    /// Unpin the roots [`pin_all`](Self::pin_all) pinned
    pub fn unpin_all(&self, ctx: &mut CoreContext) {
        let roots = self.pgd_list.lock();
        for &root in roots.iter() {
            let desc = self.frames.frame(root);
            if desc.save_pinned() {
                self.unpin(ctx, root);
                desc.set_save_pinned(false);
            }
        }
    }

    /// ========================================================================
    /// Single-Page Protection
    /// ========================================================================

    /// Make the linear mapping of `pfn` read-only, now
    pub fn make_page_readonly(&self, ctx: &mut CoreContext, pfn: Pfn) -> Result {
        let mfn = self.p2m.pfn_to_mfn(pfn);
        if !mfn.is_valid() {
            return Err(VmError::NotMapped);
        }

        self.queue(
            ctx,
            MultiCall::UpdateVaMapping {
                va: pfn.to_virt(),
                val: crate::kernel::vm::page_table::MachPte::new(mfn, PAGE_KERNEL_RO),
                flags: UvmFlags::empty(),
            },
        );
        self.flush(ctx);
        Ok(())
    }

    /// Make the linear mapping of `pfn` writable, now
    ///
    /// Refused for frames in use as pinned tables.
    pub fn make_page_readwrite(&self, ctx: &mut CoreContext, pfn: Pfn) -> Result {
        let mfn = self.p2m.pfn_to_mfn(pfn);
        if !mfn.is_valid() {
            return Err(VmError::NotMapped);
        }
        match self.frames.get(pfn).map(|desc| desc.state()) {
            Some(PinState::PinnedReadOnly) => return Err(VmError::AccessDenied),
            Some(PinState::UnpinnedReadOnly) => return Err(VmError::BadState),
            _ => {}
        }

        self.queue(
            ctx,
            MultiCall::UpdateVaMapping {
                va: pfn.to_virt(),
                val: crate::kernel::vm::page_table::MachPte::new(mfn, PAGE_KERNEL),
                flags: UvmFlags::empty(),
            },
        );
        self.flush(ctx);
        Ok(())
    }
}
