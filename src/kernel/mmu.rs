// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Paravirtual MMU Operations
//!
//! [`PvMmu`] is the operations table the generic VM calls into. It owns the
//! shared state (P2M, frame descriptors, per-CPU table, exchange lock) and
//! holds the collaborators it was built with.
//!
//! The operations are spread over the modules that implement them:
//!
//! - entry reads and writes - here
//! - pin/unpin, table-page alloc/release - [`crate::kernel::vm::pin`]
//! - root switching, mm hooks - [`crate::kernel::vm::aspace`]
//! - TLB flushes - [`crate::kernel::vm::tlb`]
//! - contiguous exchange - [`crate::kernel::vm::contig`]
//!
//! Every operation takes the caller's [`CoreContext`]; hypervisor requests
//! go into its batch queue. A rejected batch halts: past that point the
//! read-only pagetable invariant can no longer be shown to hold.
//!
//! # Usage
//!
//! ```ignore
//! let mmu = PvMmu::new(config, p2m, collaborators);
//! let mut ctx = mmu.core_context(0);
//!
//! mmu.enter_lazy_mmu(&mut ctx);
//! mmu.set_entry(&mut ctx, table, index, pte);
//! mmu.leave_lazy_mmu(&mut ctx);
//! ```

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::kernel::cmdline::PvMmuConfig;
use crate::kernel::hypervisor::multicall::{BatchLimits, Callback, LazyMode, MulticallFailure};
use crate::kernel::hypervisor::{GuestMemory, Hypervisor, MmuUpdate, MultiCall, UvmFlags};
use crate::kernel::mp::CrossCall;
use crate::kernel::percpu::{CoreContext, CpuTable};
use crate::kernel::pmm::{FrameAllocator, FrameArena, PinState};
use crate::kernel::vm::layout::{Mfn, Pfn};
use crate::kernel::vm::p2m::P2m;
use crate::kernel::vm::page_table::{self, MachPte, PtLevel, Pte, PteFlags};
use crate::kernel::vm::walker::Walker;
use crate::log_info;

/// Size of one entry in a table page
const ENTRY_SIZE: u64 = 8;

/// External services the MMU is built on
#[derive(Clone)]
pub struct Collaborators {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub memory: Arc<dyn GuestMemory>,
    pub allocator: Arc<dyn FrameAllocator>,
    pub cross_call: Arc<dyn CrossCall>,
}

/// Paravirtual MMU
pub struct PvMmu {
    pub(crate) config: PvMmuConfig,
    pub(crate) hv: Arc<dyn Hypervisor>,
    pub(crate) mem: Arc<dyn GuestMemory>,
    pub(crate) allocator: Arc<dyn FrameAllocator>,
    pub(crate) xcall: Arc<dyn CrossCall>,
    pub(crate) p2m: Arc<P2m>,
    pub(crate) frames: Arc<FrameArena>,
    pub(crate) cpus: Arc<CpuTable>,

    /// Scratch frame list, only touched under the lock
    pub(crate) reservation: Mutex<Vec<Mfn>>,

    /// Every live root, for the save-time sweeps
    pub(crate) pgd_list: Mutex<Vec<Pfn>>,

    kernel_root: AtomicU64,
}

impl PvMmu {
    /// Create the MMU over an already-populated P2M table
    pub fn new(config: PvMmuConfig, p2m: Arc<P2m>, collab: Collaborators) -> Self {
        let frames = Arc::new(FrameArena::new(p2m.max_pfn()));
        let cpus = Arc::new(CpuTable::new(config.max_cpus));
        log_info!(
            "pvmmu: {} frames, {} cpus, user root {}",
            frames.len(),
            cpus.max_cpus(),
            config.split_user_root
        );

        Self {
            cpus,
            reservation: Mutex::new(Vec::with_capacity(1 << config.max_contig_order)),
            config,
            hv: collab.hypervisor,
            mem: collab.memory,
            allocator: collab.allocator,
            xcall: collab.cross_call,
            p2m,
            frames,
            pgd_list: Mutex::new(Vec::new()),
            kernel_root: AtomicU64::new(Pfn::INVALID.0),
        }
    }

    /// Bring `cpu` online and hand back its context
    pub fn core_context(&self, cpu: usize) -> CoreContext {
        self.cpus.set_online(cpu, true);
        CoreContext::new(cpu, self.hv.clone(), BatchLimits::from_config(&self.config))
    }

    /// Take `cpu` offline
    pub fn core_offline(&self, cpu: usize) {
        self.cpus.set_online(cpu, false);
    }

    /// Active configuration
    pub fn config(&self) -> &PvMmuConfig {
        &self.config
    }

    /// The P2M table
    pub fn p2m(&self) -> &P2m {
        &self.p2m
    }

    /// Frame descriptors
    pub fn frames(&self) -> &FrameArena {
        &self.frames
    }

    /// Shared per-CPU table
    pub fn cpus(&self) -> &CpuTable {
        &self.cpus
    }

    /// Root of the kernel's own address space
    pub fn kernel_root(&self) -> Pfn {
        Pfn(self.kernel_root.load(Ordering::Acquire))
    }

    /// Install the kernel root
    ///
    /// It must already be pinned, see [`mark_pinned`](Self::mark_pinned).
    pub fn set_kernel_root(&self, root: Pfn) {
        self.kernel_root.store(root.0, Ordering::Release);
    }

    pub(crate) fn walker(&self) -> Walker<'_> {
        Walker::new(&*self.mem, &self.p2m, &self.config)
    }

    /// ========================================================================
    /// Batch Helpers
    /// ========================================================================

    fn check(ctx: &CoreContext, result: Result<(), MulticallFailure>) {
        if let Err(failure) = result {
            crate::fatal!("cpu {}: {}", ctx.cpu, failure);
        }
    }

    pub(crate) fn queue(&self, ctx: &mut CoreContext, call: MultiCall) {
        let result = ctx.batch.queue(call);
        Self::check(ctx, result);
    }

    pub(crate) fn queue_callback(&self, ctx: &mut CoreContext, cb: Callback) {
        let result = ctx.batch.add_callback(cb);
        Self::check(ctx, result);
    }

    pub(crate) fn issue(&self, ctx: &mut CoreContext, mode: LazyMode) {
        let result = ctx.batch.issue(mode);
        Self::check(ctx, result);
    }

    pub(crate) fn flush(&self, ctx: &mut CoreContext) {
        let result = ctx.batch.flush();
        Self::check(ctx, result);
    }

    /// MFN of a frame that must be backed
    pub(crate) fn table_mfn(&self, pfn: Pfn) -> Mfn {
        let mfn = self.p2m.pfn_to_mfn(pfn);
        if !mfn.is_valid() {
            crate::fatal!("table frame {:?} has no machine frame", pfn);
        }
        mfn
    }

    /// Queue a protection change of `pfn` on every mapping of it
    pub(crate) fn set_frame_prot(&self, ctx: &mut CoreContext, pfn: Pfn, flags: PteFlags, uvm: UvmFlags) {
        let val = MachPte::new(self.table_mfn(pfn), flags);
        for va in self.frames.mappings(pfn) {
            self.queue(ctx, MultiCall::UpdateVaMapping { va, val, flags: uvm });
        }
    }

    /// Completion that moves `pfn` to `state` once the batch is in
    pub(crate) fn state_callback(&self, pfn: Pfn, state: PinState) -> Callback {
        let frames = self.frames.clone();
        alloc::boxed::Box::new(move || frames.frame(pfn).set_state(state))
    }

    /// ========================================================================
    /// Lazy Mode
    /// ========================================================================

    /// Start batching page-table updates on this core
    pub fn enter_lazy_mmu(&self, ctx: &mut CoreContext) {
        ctx.batch.enter_lazy(LazyMode::Mmu);
    }

    /// Submit batched page-table updates and stop batching
    pub fn leave_lazy_mmu(&self, ctx: &mut CoreContext) {
        let result = ctx.batch.leave_lazy(LazyMode::Mmu);
        Self::check(ctx, result);
    }

    /// Start batching context-switch requests on this core
    pub fn enter_lazy_cpu(&self, ctx: &mut CoreContext) {
        ctx.batch.enter_lazy(LazyMode::Cpu);
    }

    /// Submit batched context-switch requests and stop batching
    pub fn leave_lazy_cpu(&self, ctx: &mut CoreContext) {
        let result = ctx.batch.leave_lazy(LazyMode::Cpu);
        Self::check(ctx, result);
    }

    /// Submit whatever this core has queued
    pub fn flush_batch(&self, ctx: &mut CoreContext) {
        self.flush(ctx);
    }

    /// ========================================================================
    /// Entries
    /// ========================================================================

    /// Build a hypervisor-ready entry for `pfn`
    pub fn make_pte(&self, pfn: Pfn, flags: PteFlags) -> MachPte {
        page_table::encode(&self.p2m, Pte::new(pfn, flags))
    }

    /// Guest view of an entry value
    pub fn pte_val(&self, mpte: MachPte) -> Pte {
        page_table::decode(&self.p2m, mpte)
    }

    /// Read entry `index` of table `table`
    pub fn read_entry(&self, table: Pfn, index: usize) -> Pte {
        self.pte_val(self.mem.read_entry(table.to_virt(), index))
    }

    /// Write entry `index` of table `table`
    ///
    /// A table nobody has made read-only is written directly. Anything else
    /// becomes a checked update, submitted now unless the core is batching
    /// page-table updates. Writes to user slots of a root are repeated in its
    /// user-mode root.
    pub fn set_entry(&self, ctx: &mut CoreContext, table: Pfn, index: usize, pte: Pte) {
        let val = page_table::encode(&self.p2m, pte);
        self.store_entry(ctx, table, index, val);

        let desc = self.frames.frame(table);
        if desc.level() == Some(PtLevel::Pgd) && index < self.config.user_root_slots() {
            if let Some(user) = desc.user_root() {
                self.store_entry(ctx, user, index, val);
            }
        }
    }

    /// Clear entry `index` of table `table`
    pub fn clear_entry(&self, ctx: &mut CoreContext, table: Pfn, index: usize) {
        self.set_entry(ctx, table, index, Pte::VOID);
    }

    fn store_entry(&self, ctx: &mut CoreContext, table: Pfn, index: usize, val: MachPte) {
        let desc = self.frames.frame(table);
        // Leaf tables are never seen read-only but not yet pinned
        let locked = self.config.split_pte_locks && desc.level() == Some(PtLevel::Pte);
        if locked {
            desc.ptl().lock();
        }

        if desc.state() == PinState::UnpinnedWritable {
            if let Err(err) = self.mem.write_entry(table.to_virt(), index, val) {
                crate::fatal!("direct store to {:?}[{}] refused: {}", table, index, err);
            }
        } else {
            let ptr = self.table_mfn(table).maddr() + index as u64 * ENTRY_SIZE;
            self.queue(ctx, MultiCall::MmuUpdate(vec![MmuUpdate::normal(ptr, val)]));
            self.issue(ctx, LazyMode::Mmu);
        }

        if locked {
            // SAFETY: taken above
            unsafe { desc.ptl().unlock() };
        }
    }

    /// Read an entry ahead of a protection change
    pub fn modify_prot_start(&self, table: Pfn, index: usize) -> Pte {
        self.read_entry(table, index)
    }

    /// Finish a protection change, keeping accessed/dirty bits set meanwhile
    pub fn modify_prot_commit(&self, ctx: &mut CoreContext, table: Pfn, index: usize, pte: Pte) {
        let val = page_table::encode(&self.p2m, pte);
        let ptr = self.table_mfn(table).maddr() + index as u64 * ENTRY_SIZE;
        self.queue(ctx, MultiCall::MmuUpdate(vec![MmuUpdate::preserve_ad(ptr, val)]));
        self.issue(ctx, LazyMode::Mmu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::hypervisor::mock::{Harness, MFN_BASE};
    use crate::kernel::hypervisor::MmuUpdateKind;
    use crate::kernel::vm::page_table::PAGE_KERNEL;

    #[test]
    fn test_unpinned_table_written_directly() {
        let h = Harness::new();
        let mut ctx = h.mmu.core_context(0);
        let mm = h.mmu.pgd_alloc().unwrap();
        let data = h.alloc_frame();

        h.mmu.set_entry(&mut ctx, mm.pgd(), 3, Pte::new(data, PAGE_KERNEL));
        assert_eq!(h.hv.batches(), 0);
        assert_eq!(h.mmu.read_entry(mm.pgd(), 3), Pte::new(data, PAGE_KERNEL));
    }

    #[test]
    fn test_pinned_table_written_through_hypervisor() {
        let h = Harness::new();
        let mut ctx = h.mmu.core_context(0);
        let mm = h.mmu.pgd_alloc().unwrap();
        h.mmu.pin(&mut ctx, mm.pgd());
        let table = h.alloc_frame();
        h.mmu.alloc_ptpage(&mut ctx, &mm, table, PtLevel::Pud);

        h.mmu.enter_lazy_mmu(&mut ctx);
        h.mmu.set_entry(&mut ctx, mm.pgd(), 3, Pte::new(table, PAGE_KERNEL));
        h.mmu.set_entry(&mut ctx, mm.pgd(), 4, Pte::new(table, PAGE_KERNEL));
        let before = h.hv.batches();
        h.mmu.leave_lazy_mmu(&mut ctx);
        assert_eq!(h.hv.batches(), before + 1);

        // Both writes folded into one entry-update request
        let updates = h.hv.updates();
        assert_eq!(updates.len(), 4);
        assert_eq!(updates[0].addr(), h.mmu.p2m().pfn_to_mfn(mm.pgd()).maddr() + 3 * 8);
        assert_eq!(h.mmu.read_entry(mm.pgd(), 4).pfn(), table);
    }

    #[test]
    #[should_panic(expected = "mmu_update")]
    fn test_writable_child_under_pinned_table_is_fatal() {
        let h = Harness::new();
        let mut ctx = h.mmu.core_context(0);
        let mm = h.mmu.pgd_alloc().unwrap();
        h.mmu.pin(&mut ctx, mm.pgd());

        // Never went through alloc_ptpage, so still writable
        let table = h.alloc_frame();
        h.mmu.set_entry(&mut ctx, mm.pgd(), 3, Pte::new(table, PAGE_KERNEL));
    }

    #[test]
    fn test_leaf_entries_under_pinned_table() {
        let h = Harness::new();
        let mut ctx = h.mmu.core_context(0);
        let mm = h.mmu.pgd_alloc().unwrap();
        let tree = h.map_user_page(&mut ctx, &mm, 0x40_0000, h.alloc_frame());
        h.mmu.pin(&mut ctx, mm.pgd());

        // Data pages and large pages may stay writable
        let data = h.alloc_frame();
        h.mmu.set_entry(&mut ctx, tree.pte, 2, Pte::new(data, PAGE_KERNEL));
        let big = h.alloc_frame();
        h.mmu.set_entry(&mut ctx, tree.pmd, 7, Pte::new(big, PAGE_KERNEL | PteFlags::PSE));
        assert_eq!(h.mmu.read_entry(tree.pte, 2).pfn(), data);
        assert_eq!(h.mmu.read_entry(tree.pmd, 7).pfn(), big);
        assert!(h.hv.is_writable_mapped(h.mfn(data)));
    }

    #[test]
    fn test_user_slots_mirrored() {
        let h = Harness::new();
        let mut ctx = h.mmu.core_context(0);
        let mm = h.mmu.pgd_alloc().unwrap();
        let user = h.mmu.frames().frame(mm.pgd()).user_root().unwrap();
        let data = h.alloc_frame();

        h.mmu.set_entry(&mut ctx, mm.pgd(), 1, Pte::new(data, PAGE_KERNEL));
        h.mmu.set_entry(&mut ctx, mm.pgd(), 300, Pte::new(data, PAGE_KERNEL));
        assert_eq!(h.mmu.read_entry(user, 1).pfn(), data);
        assert!(!h.mmu.read_entry(user, 300).is_present());
    }

    #[test]
    fn test_modify_prot_preserves_ad() {
        let h = Harness::new();
        let mut ctx = h.mmu.core_context(0);
        let mm = h.mmu.pgd_alloc().unwrap();
        let data = h.alloc_frame();

        let old = h.mmu.modify_prot_start(mm.pgd(), 7);
        assert!(!old.is_present());
        h.mmu.modify_prot_commit(&mut ctx, mm.pgd(), 7, Pte::new(data, PAGE_KERNEL));
        let updates = h.hv.updates();
        assert_eq!(updates.last().unwrap().kind(), MmuUpdateKind::PreserveAd);
        assert_eq!(h.mmu.read_entry(mm.pgd(), 7).pfn(), data);
    }

    #[test]
    fn test_make_pte() {
        let h = Harness::new();
        let pfn = Pfn(10);
        let mpte = h.mmu.make_pte(pfn, PAGE_KERNEL);
        assert_eq!(mpte.mfn(), Mfn(MFN_BASE + 10));
        assert_eq!(h.mmu.pte_val(mpte), Pte::new(pfn, PAGE_KERNEL));
    }
}
