// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Address Space Management
//!
//! Root allocation and the hooks the generic VM calls around an address
//! space's life: switch, activate, dup, exit.
//!
//! # Design
//!
//! - A root is loaded with a batched base-pointer request. The core's
//!   confirmed root in [`CpuTable`](crate::kernel::percpu::CpuTable) only
//!   moves once that request has reached the hypervisor.
//! - Before a root is unpinned, no core may still be using it. Each core
//!   using it switches to the kernel root and flushes its batch, peers by
//!   cross-call.
//!
//! # Thread Safety
//!
//! Pin and unpin of one address space run under its `page_table_lock`.

use alloc::vec;

use spin::Mutex;

use crate::kernel::hypervisor::multicall::LazyMode;
use crate::kernel::hypervisor::{MmuExtOp, MultiCall};
use crate::kernel::mmu::PvMmu;
use crate::kernel::percpu::CoreContext;
use crate::kernel::pmm::PinState;
use crate::kernel::vm::layout::{Pfn, ENTRIES_PER_TABLE};
use crate::kernel::vm::page_table::PtLevel;
use crate::kernel::vm::{Result, VmError};
use crate::{log_debug, log_trace_if};

const LOCAL_TRACE: bool = false;

/// One address space, as far as the MMU is concerned
#[derive(Debug)]
pub struct AddressSpace {
    pgd: Pfn,
    page_table_lock: Mutex<()>,
}

impl AddressSpace {
    /// Root table frame
    pub fn pgd(&self) -> Pfn {
        self.pgd
    }
}

impl PvMmu {
    /// Allocate and initialize a new root
    ///
    /// The kernel half is copied from the kernel root. With a split user
    /// root configured, a user-mode root is allocated alongside.
    pub fn pgd_alloc(&self) -> Result<AddressSpace> {
        let pgd = self.alloc_root()?;
        if let Err(err) = self.copy_kernel_half(pgd) {
            self.free_root(pgd);
            return Err(err);
        }

        if self.config.split_user_root {
            match self.alloc_root() {
                Ok(user) => self.frames.frame(pgd).set_user_root(Some(user)),
                Err(err) => {
                    self.free_root(pgd);
                    return Err(err);
                }
            }
        }

        self.pgd_list.lock().push(pgd);
        log_trace_if!(LOCAL_TRACE, "pgd_alloc {:?}", pgd);
        Ok(AddressSpace {
            pgd,
            page_table_lock: Mutex::new(()),
        })
    }

    /// Release a root allocated by [`pgd_alloc`](Self::pgd_alloc)
    ///
    /// Every core still running on the root is moved off it first.
    pub fn pgd_free(&self, ctx: &mut CoreContext, mm: AddressSpace) {
        ctx.preempt_disable();
        self.drop_mm_ref(ctx, &mm);
        ctx.preempt_enable();

        {
            let _guard = mm.page_table_lock.lock();
            self.unpin(ctx, mm.pgd);
        }
        self.pgd_list.lock().retain(|&root| root != mm.pgd);

        if let Some(user) = self.frames.frame(mm.pgd).user_root() {
            self.free_root(user);
        }
        self.free_root(mm.pgd);
        log_trace_if!(LOCAL_TRACE, "pgd_free {:?}", mm.pgd);
    }

    fn alloc_root(&self) -> Result<Pfn> {
        let pfn = self.allocator.alloc_frames(1).ok_or(VmError::NoMemory)?;
        if let Err(err) = self.mem.zero_page(pfn.to_virt()) {
            self.allocator.free_frames(pfn, 1);
            return Err(err);
        }
        self.frames.frame(pfn).set_level(Some(PtLevel::Pgd));
        Ok(pfn)
    }

    fn free_root(&self, pfn: Pfn) {
        self.frames.frame(pfn).reset();
        self.allocator.free_frames(pfn, 1);
    }

    fn copy_kernel_half(&self, pgd: Pfn) -> Result {
        let kernel = self.kernel_root();
        if !kernel.is_valid() {
            return Ok(());
        }

        for index in self.config.user_root_slots()..ENTRIES_PER_TABLE {
            if self.config.in_guard_hole(index) {
                continue;
            }
            let val = self.mem.read_entry(kernel.to_virt(), index);
            if val.is_present() {
                self.mem.write_entry(pgd.to_virt(), index, val)?;
            }
        }
        Ok(())
    }

    /// ========================================================================
    /// Root Switching
    /// ========================================================================

    /// Load `root` on this core
    ///
    /// Batched while the core is in lazy CPU mode. The core's confirmed root
    /// changes when the request is submitted.
    pub fn write_cr3(&self, ctx: &mut CoreContext, root: Pfn) {
        let irq = ctx.irq_save();
        ctx.set_requested_root(root);

        let mut ops = vec![MmuExtOp::NewBasePtr {
            mfn: self.table_mfn(root),
        }];
        if self.config.split_user_root {
            let user = self.frames.frame(root).user_root();
            ops.push(MmuExtOp::NewUserBasePtr {
                mfn: user.map(|pfn| self.table_mfn(pfn)),
            });
        }
        self.queue(ctx, MultiCall::MmuExtOp(ops));

        let cpus = self.cpus.clone();
        let cpu = ctx.cpu;
        self.queue_callback(ctx, alloc::boxed::Box::new(move || cpus.set_confirmed_root(cpu, root)));
        self.issue(ctx, LazyMode::Cpu);
        ctx.irq_restore(irq);
    }

    /// Switch this core to `next`
    pub fn switch_mm(&self, ctx: &mut CoreContext, next: &AddressSpace) {
        if ctx.requested_root() == next.pgd {
            return;
        }
        self.activate_mm(ctx, next);
        self.write_cr3(ctx, next.pgd);
    }

    /// `mm` is about to be loaded for the first time
    pub fn activate_mm(&self, ctx: &mut CoreContext, mm: &AddressSpace) {
        let _guard = mm.page_table_lock.lock();
        self.pin(ctx, mm.pgd);
    }

    /// `mm` has just been populated as a copy of its parent
    pub fn dup_mmap(&self, ctx: &mut CoreContext, mm: &AddressSpace) {
        let _guard = mm.page_table_lock.lock();
        self.pin(ctx, mm.pgd);
    }

    /// `mm` is being torn down
    ///
    /// Every core lets go of it, then its tables are unpinned so the
    /// generic VM can free them with plain writes.
    pub fn exit_mmap(&self, ctx: &mut CoreContext, mm: &AddressSpace) {
        ctx.preempt_disable();
        self.drop_mm_ref(ctx, mm);
        ctx.preempt_enable();

        let _guard = mm.page_table_lock.lock();
        if self.frames.frame(mm.pgd).state() == PinState::PinnedReadOnly {
            self.unpin(ctx, mm.pgd);
        }
    }

    /// Make sure no core is using `mm`'s root
    ///
    /// Called with preemption off.
    pub fn drop_mm_ref(&self, ctx: &mut CoreContext, mm: &AddressSpace) {
        debug_assert!(ctx.in_atomic());
        let pgd = mm.pgd;
        self.leave_mm(ctx, pgd);

        let mask = self.cpus.cpus_using_root(pgd, ctx.cpu);
        if mask != 0 {
            log_debug!("cpu {}: root {:?} still live on cpus {:#x}", ctx.cpu, pgd, mask);
            self.xcall
                .call_function_many(mask, &|peer: &mut CoreContext| self.leave_mm(peer, pgd));
        }
    }

    /// Stop this core from using `pgd`
    fn leave_mm(&self, ctx: &mut CoreContext, pgd: Pfn) {
        if ctx.requested_root() == pgd {
            self.write_cr3(ctx, self.kernel_root());
        }
        // A switch away may still be sitting in the batch
        if self.cpus.confirmed_root(ctx.cpu) == pgd {
            self.flush(ctx);
        }
    }
}
