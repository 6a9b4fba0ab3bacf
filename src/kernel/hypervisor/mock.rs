// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Mock Collaborators
//!
//! An in-memory hypervisor that enforces the read-only pagetable rules,
//! plus a cross-call fabric and a ready-made MMU over both.
//!
//! Rules the mock enforces:
//!
//! - A pin is refused if the frame has a writable mapping, or for levels
//!   above 1, if any table it references has one
//! - A mapping may not be made writable while the frame is pinned or
//!   referenced by a pinned table above level 1
//! - A checked update to a pinned table above level 1 may only reference
//!   an existing frame with no writable mapping
//! - A base pointer must name a pinned frame
//! - Direct stores need a present, writable mapping

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::err::{HvStatus, HV_EINVAL, HV_ENOMEM, HV_EPERM, HV_OK};
use crate::kernel::cmdline::PvMmuConfig;
use crate::kernel::hypervisor::{GuestMemory, Hypervisor, MemoryExchange, MmuExtOp, MmuUpdate, MmuUpdateKind, MultiCall};
use crate::kernel::mmu::{Collaborators, PvMmu};
use crate::kernel::mp::{cpus_in_mask, CpuMask, CrossCall, CrossCallFn};
use crate::kernel::percpu::CoreContext;
use crate::kernel::pmm::{BitmapAllocator, FrameAllocator, PinState};
use crate::kernel::vm::aspace::AddressSpace;
use crate::kernel::vm::layout::{Mfn, Pfn, VAddr, ENTRIES_PER_TABLE, PAGE_OFFSET, PAGE_SHIFT};
use crate::kernel::vm::p2m::P2m;
use crate::kernel::vm::page_table::{MachPte, PtLevel, Pte, PteFlags, PAGE_KERNEL, PAGE_KERNEL_RO};
use crate::kernel::vm::{Result, VmError};

/// Machine frame backing guest frame 0
pub const MFN_BASE: u64 = 0x10000;

/// Guest frames in a [`Harness`]
pub const NR_FRAMES: u64 = 512;

/// Frames below this are not handed out by the harness allocator
const POOL_BASE: u64 = 64;

const KERNEL_ROOT: Pfn = Pfn(1);
const KERNEL_PUD: Pfn = Pfn(2);

/// Scripted outcome of the next memory exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    /// Hand out extents starting at `next`
    Succeed { next: Mfn },

    /// Exchange nothing, out of memory
    Fail,

    /// Exchange nothing, failing with `status`
    Refuse { status: HvStatus },

    /// Exchange one extent, then give up
    Partial,

    /// Report success without handing out any frames
    Empty,
}

struct State {
    memory: BTreeMap<u64, Box<[u64; ENTRIES_PER_TABLE]>>,
    mappings: BTreeMap<VAddr, MachPte>,
    pinned: BTreeMap<u64, PtLevel>,
    bases: BTreeMap<usize, Mfn>,
    user_bases: BTreeMap<usize, Option<Mfn>>,
    log: Vec<MultiCall>,
    batches: usize,
    exchange: Exchange,
    exchanges: usize,
}

impl State {
    fn has_writable_mapping(&self, mfn: Mfn) -> bool {
        self.mappings
            .values()
            .any(|val| val.is_writable() && val.mfn() == mfn)
    }

    /// Table frames referenced by a table page
    fn children(&self, mfn: Mfn) -> Vec<Mfn> {
        match self.memory.get(&mfn.0) {
            Some(frame) => frame
                .iter()
                .map(|&raw| MachPte::from_raw(raw))
                .filter(|val| val.is_present() && !val.flags().contains(PteFlags::PSE))
                .map(|val| val.mfn())
                .collect(),
            None => Vec::new(),
        }
    }

    fn referenced_by_pinned(&self, mfn: Mfn) -> bool {
        self.pinned
            .iter()
            .filter(|&(_, &level)| level != PtLevel::Pte)
            .any(|(&table, _)| self.children(Mfn(table)).contains(&mfn))
    }

    fn mmu_update(&mut self, req: &MmuUpdate) -> HvStatus {
        let mfn = Mfn::from_maddr(req.addr());
        let index = ((req.addr() & 0xfff) / 8) as usize;

        let val = MachPte::from_raw(req.val);
        let upper = matches!(self.pinned.get(&mfn.0), Some(&level) if level != PtLevel::Pte);
        if upper && val.is_present() && !val.flags().contains(PteFlags::PSE) {
            if !self.memory.contains_key(&val.mfn().0) {
                return HV_EINVAL;
            }
            if self.has_writable_mapping(val.mfn()) {
                return HV_EPERM;
            }
        }

        let frame = match self.memory.get_mut(&mfn.0) {
            Some(frame) => frame,
            None => return HV_EINVAL,
        };
        let old = frame[index];
        frame[index] = match req.kind() {
            MmuUpdateKind::PreserveAd => req.val | (old & (PteFlags::ACCESSED | PteFlags::DIRTY).bits()),
            _ => req.val,
        };
        HV_OK
    }

    fn ext_op(&mut self, cpu: usize, op: &MmuExtOp) -> HvStatus {
        match *op {
            MmuExtOp::PinTable { level, mfn } => {
                if !self.memory.contains_key(&mfn.0) || self.pinned.contains_key(&mfn.0) {
                    return HV_EINVAL;
                }
                if self.has_writable_mapping(mfn) {
                    return HV_EPERM;
                }
                if level != PtLevel::Pte && self.children(mfn).iter().any(|&child| self.has_writable_mapping(child)) {
                    return HV_EPERM;
                }
                self.pinned.insert(mfn.0, level);
            }
            MmuExtOp::UnpinTable { mfn } => {
                if self.pinned.remove(&mfn.0).is_none() {
                    return HV_EINVAL;
                }
            }
            MmuExtOp::NewBasePtr { mfn } => {
                if !self.pinned.contains_key(&mfn.0) {
                    return HV_EINVAL;
                }
                self.bases.insert(cpu, mfn);
            }
            MmuExtOp::NewUserBasePtr { mfn } => {
                if let Some(mfn) = mfn {
                    if !self.pinned.contains_key(&mfn.0) {
                        return HV_EINVAL;
                    }
                }
                self.user_bases.insert(cpu, mfn);
            }
            _ => {}
        }
        HV_OK
    }

    fn update_va_mapping(&mut self, va: VAddr, val: MachPte) -> HvStatus {
        if val.is_writable() && (self.pinned.contains_key(&val.mfn().0) || self.referenced_by_pinned(val.mfn())) {
            return HV_EPERM;
        }
        self.mappings.insert(va, val);
        HV_OK
    }

    fn resolve(&self, va: VAddr) -> Option<MachPte> {
        self.mappings
            .get(&(va & !0xfff))
            .copied()
            .filter(|val| val.is_present())
    }

    fn writable_frame(&mut self, va: VAddr) -> Result<&mut Box<[u64; ENTRIES_PER_TABLE]>> {
        let val = self.resolve(va).ok_or(VmError::NotMapped)?;
        if !val.is_writable() {
            return Err(VmError::AccessDenied);
        }
        self.memory.get_mut(&val.mfn().0).ok_or(VmError::NotMapped)
    }
}

/// In-memory hypervisor and guest memory
pub struct MockHypervisor {
    state: Mutex<State>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                memory: BTreeMap::new(),
                mappings: BTreeMap::new(),
                pinned: BTreeMap::new(),
                bases: BTreeMap::new(),
                user_bases: BTreeMap::new(),
                log: Vec::new(),
                batches: 0,
                exchange: Exchange::Fail,
                exchanges: 0,
            }),
        }
    }

    /// Create machine frame `mfn` and map it writable at `va`
    pub fn map_frame(&self, va: VAddr, mfn: Mfn) {
        let mut state = self.state.lock();
        state.memory.insert(mfn.0, Box::new([0; ENTRIES_PER_TABLE]));
        state.mappings.insert(va, MachPte::new(mfn, PAGE_KERNEL));
    }

    /// Record `mfn` as pinned without any checks
    pub fn force_pin(&self, mfn: Mfn, level: PtLevel) {
        self.state.lock().pinned.insert(mfn.0, level);
    }

    /// Store straight into machine memory
    pub fn poke(&self, mfn: Mfn, index: usize, val: MachPte) {
        if let Some(frame) = self.state.lock().memory.get_mut(&mfn.0) {
            frame[index] = val.raw();
        }
    }

    pub fn set_mapping(&self, va: VAddr, val: MachPte) {
        self.state.lock().mappings.insert(va, val);
    }

    /// Current mapping of `va`
    pub fn mapping(&self, va: VAddr) -> MachPte {
        self.state
            .lock()
            .mappings
            .get(&va)
            .copied()
            .unwrap_or(MachPte::VOID)
    }

    pub fn is_pinned(&self, mfn: Mfn) -> bool {
        self.state.lock().pinned.contains_key(&mfn.0)
    }

    pub fn is_writable_mapped(&self, mfn: Mfn) -> bool {
        self.state.lock().has_writable_mapping(mfn)
    }

    /// Root loaded on `cpu`
    pub fn base(&self, cpu: usize) -> Option<Mfn> {
        self.state.lock().bases.get(&cpu).copied()
    }

    /// User-mode root loaded on `cpu`
    pub fn user_base(&self, cpu: usize) -> Option<Mfn> {
        self.state.lock().user_bases.get(&cpu).copied().flatten()
    }

    pub fn set_exchange(&self, outcome: Exchange) {
        self.state.lock().exchange = outcome;
    }

    /// Number of exchanges requested
    pub fn exchanges(&self) -> usize {
        self.state.lock().exchanges
    }

    /// Number of multicalls submitted
    pub fn batches(&self) -> usize {
        self.state.lock().batches
    }

    /// Every multicall entry submitted, in order
    pub fn log(&self) -> Vec<MultiCall> {
        self.state.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Every entry update submitted, in order
    pub fn updates(&self) -> Vec<MmuUpdate> {
        self.log()
            .into_iter()
            .filter_map(|call| match call {
                MultiCall::MmuUpdate(reqs) => Some(reqs),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Every extended operation submitted, in order
    pub fn ext_ops(&self) -> Vec<MmuExtOp> {
        self.log()
            .into_iter()
            .filter_map(|call| match call {
                MultiCall::MmuExtOp(ops) => Some(ops),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl Hypervisor for MockHypervisor {
    fn multicall(&self, cpu: usize, calls: &[MultiCall]) -> Vec<HvStatus> {
        let mut state = self.state.lock();
        state.batches += 1;
        state.log.extend(calls.iter().cloned());

        calls
            .iter()
            .map(|call| match call {
                MultiCall::MmuUpdate(reqs) => reqs
                    .iter()
                    .map(|req| state.mmu_update(req))
                    .find(|&status| status != HV_OK)
                    .unwrap_or(HV_OK),
                MultiCall::MmuExtOp(ops) => ops
                    .iter()
                    .map(|op| state.ext_op(cpu, op))
                    .find(|&status| status != HV_OK)
                    .unwrap_or(HV_OK),
                MultiCall::UpdateVaMapping { va, val, .. } => state.update_va_mapping(*va, *val),
            })
            .collect()
    }

    fn memory_exchange(&self, xchg: &mut MemoryExchange) -> HvStatus {
        let mut state = self.state.lock();
        state.exchanges += 1;

        let mut next = match state.exchange {
            Exchange::Succeed { next } => next,
            Exchange::Fail => {
                xchg.nr_exchanged = 0;
                return HV_ENOMEM;
            }
            Exchange::Refuse { status } => {
                xchg.nr_exchanged = 0;
                return status;
            }
            Exchange::Partial => {
                xchg.nr_exchanged = xchg.input.nr_extents.min(1);
                return HV_ENOMEM;
            }
            Exchange::Empty => {
                xchg.nr_exchanged = xchg.input.nr_extents;
                return HV_OK;
            }
        };

        let out_pages = 1u64 << xchg.output.order;
        let end = next.0 + xchg.output.nr_extents * out_pages;
        let bits = xchg.output.address_bits;
        if bits != 0 && bits < 64 && end << PAGE_SHIFT > 1u64 << bits {
            xchg.nr_exchanged = 0;
            return HV_ENOMEM;
        }

        let in_pages = 1u64 << xchg.input.order;
        for base in &xchg.input.frames {
            for i in 0..in_pages {
                state.memory.remove(&(base.0 + i));
            }
        }
        for _ in 0..xchg.output.nr_extents {
            for i in 0..out_pages {
                state.memory.insert(next.0 + i, Box::new([0; ENTRIES_PER_TABLE]));
            }
            xchg.output.frames.push(next);
            next = next.add(out_pages);
        }

        state.exchange = Exchange::Succeed { next };
        xchg.nr_exchanged = xchg.input.nr_extents;
        HV_OK
    }
}

impl GuestMemory for MockHypervisor {
    fn read_entry(&self, table: VAddr, index: usize) -> MachPte {
        let state = self.state.lock();
        state
            .resolve(table)
            .and_then(|val| state.memory.get(&val.mfn().0))
            .map(|frame| MachPte::from_raw(frame[index]))
            .unwrap_or(MachPte::VOID)
    }

    fn write_entry(&self, table: VAddr, index: usize, val: MachPte) -> Result {
        let mut state = self.state.lock();
        state.writable_frame(table)?[index] = val.raw();
        Ok(())
    }

    fn zero_page(&self, va: VAddr) -> Result {
        let mut state = self.state.lock();
        state.writable_frame(va)?.fill(0);
        Ok(())
    }
}

/// ============================================================================
/// Cross-Call Fabric
/// ============================================================================

/// Runs cross-calls synchronously on registered core contexts
pub struct MockCrossCall {
    cores: Mutex<BTreeMap<usize, CoreContext>>,
    calls: AtomicUsize,
}

impl MockCrossCall {
    pub fn new() -> Self {
        Self {
            cores: Mutex::new(BTreeMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Register a peer core
    pub fn add_core(&self, ctx: CoreContext) {
        self.cores.lock().insert(ctx.cpu, ctx);
    }

    /// Run `f` as peer `cpu`
    pub fn with_core<R>(&self, cpu: usize, f: impl FnOnce(&mut CoreContext) -> R) -> R {
        let mut cores = self.cores.lock();
        f(cores.get_mut(&cpu).expect("unregistered core"))
    }

    /// Number of cross-calls made
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CrossCall for MockCrossCall {
    fn call_function_many(&self, mask: CpuMask, func: CrossCallFn<'_>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut cores = self.cores.lock();
        for cpu in cpus_in_mask(mask) {
            if let Some(ctx) = cores.get_mut(&cpu) {
                func(ctx);
            }
        }
    }
}

/// ============================================================================
/// Harness
/// ============================================================================

/// Tables created by [`Harness::map_user_page`]
#[derive(Debug, Clone, Copy)]
pub struct UserTree {
    pub pud: Pfn,
    pub pmd: Pfn,
    pub pte: Pfn,
}

/// An MMU over the mock collaborators
///
/// Guest frame `n` is backed by machine frame `MFN_BASE + n` and mapped
/// writable at its linear-map address. The kernel root is already pinned
/// and maps one table in the linear-map slot.
pub struct Harness {
    pub mmu: PvMmu,
    pub hv: Arc<MockHypervisor>,
    pub xcall: Arc<MockCrossCall>,
    pub alloc: Arc<BitmapAllocator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PvMmuConfig::default())
    }

    pub fn with_config(config: PvMmuConfig) -> Self {
        let hv = Arc::new(MockHypervisor::new());
        let p2m = P2m::new(NR_FRAMES);
        for n in 0..NR_FRAMES {
            let mfn = Mfn(MFN_BASE + n);
            p2m.set_phys_to_machine(Pfn(n), mfn);
            hv.map_frame(Pfn(n).to_virt(), mfn);
        }

        let alloc = Arc::new(BitmapAllocator::new(Pfn(POOL_BASE), (NR_FRAMES - POOL_BASE) as usize));
        let xcall = Arc::new(MockCrossCall::new());
        let mmu = PvMmu::new(
            config,
            Arc::new(p2m),
            Collaborators {
                hypervisor: hv.clone(),
                memory: hv.clone(),
                allocator: alloc.clone(),
                cross_call: xcall.clone(),
            },
        );

        // Boot tables arrive pinned
        let slot = PtLevel::Pgd.index(PAGE_OFFSET);
        hv.poke(Mfn(MFN_BASE + KERNEL_ROOT.0), slot, MachPte::new(Mfn(MFN_BASE + KERNEL_PUD.0), PAGE_KERNEL));
        for (pfn, level) in [(KERNEL_ROOT, PtLevel::Pgd), (KERNEL_PUD, PtLevel::Pud)] {
            let mfn = Mfn(MFN_BASE + pfn.0);
            hv.force_pin(mfn, level);
            hv.set_mapping(pfn.to_virt(), MachPte::new(mfn, PAGE_KERNEL_RO));
        }
        mmu.mark_pinned(KERNEL_ROOT);
        mmu.set_kernel_root(KERNEL_ROOT);

        Self { mmu, hv, xcall, alloc }
    }

    /// Allocate a zeroed frame
    pub fn alloc_frame(&self) -> Pfn {
        let pfn = self.alloc.alloc_frames(1).expect("harness out of frames");
        self.hv.zero_page(pfn.to_virt()).expect("frame not writable");
        pfn
    }

    /// Machine frame currently backing `pfn`
    pub fn mfn(&self, pfn: Pfn) -> Mfn {
        self.mmu.p2m().pfn_to_mfn(pfn)
    }

    pub fn mem(&self) -> &dyn GuestMemory {
        &*self.hv
    }

    /// Map `pfn` writable at a second address as well
    pub fn add_alias(&self, pfn: Pfn, va: VAddr) {
        self.mmu.frames().add_alias(pfn, va);
        self.hv.set_mapping(va, self.mmu.make_pte(pfn, PAGE_KERNEL));
    }

    /// Map `data` at user address `va` in `mm`, building tables as needed
    pub fn map_user_page(&self, ctx: &mut CoreContext, mm: &AddressSpace, va: VAddr, data: Pfn) -> UserTree {
        let table_flags = PAGE_KERNEL | PteFlags::USER;
        let mut tables = [Pfn::INVALID; 3];
        let mut table = mm.pgd();
        for (slot, level) in [PtLevel::Pgd, PtLevel::Pud, PtLevel::Pmd].into_iter().enumerate() {
            let index = level.index(va);
            let entry = self.mmu.read_entry(table, index);
            let child = if entry.is_present() {
                entry.pfn()
            } else {
                let child = self.alloc_frame();
                let child_level = level.child().expect("leaf level has no child");
                self.mmu.alloc_ptpage(ctx, mm, child, child_level);
                self.mmu.set_entry(ctx, table, index, Pte::new(child, table_flags));
                child
            };
            tables[slot] = child;
            table = child;
        }
        self.mmu
            .set_entry(ctx, table, PtLevel::Pte.index(va), Pte::new(data, table_flags));

        UserTree {
            pud: tables[0],
            pmd: tables[1],
            pte: tables[2],
        }
    }

    /// Pin state, mapping writability and hypervisor pin of each frame
    pub fn snapshot(&self, frames: &[Pfn]) -> Vec<(PinState, bool, bool)> {
        frames
            .iter()
            .map(|&pfn| {
                let mfn = self.mfn(pfn);
                (
                    self.mmu.frames().frame(pfn).state(),
                    self.hv.is_writable_mapped(mfn),
                    self.hv.is_pinned(mfn),
                )
            })
            .collect()
    }
}
