// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! TLB Flush Coordination
//!
//! Remote flushes are a single hypervisor request naming the target vCPUs;
//! no IPIs are sent. A flush of at most one page is narrowed to a
//! single-address invalidation.
//!
//! Every flush is batched while the core is in lazy MMU mode, so it lands
//! after the entry updates that made it necessary.

use alloc::vec;

use crate::kernel::hypervisor::multicall::LazyMode;
use crate::kernel::hypervisor::{MmuExtOp, MultiCall};
use crate::kernel::mmu::PvMmu;
use crate::kernel::mp::CpuMask;
use crate::kernel::percpu::CoreContext;
use crate::kernel::vm::layout::{page_align_down, VAddr};
use crate::log_trace_if;

const LOCAL_TRACE: bool = false;

/// `end` value asking for a full flush
pub const TLB_FLUSH_ALL: VAddr = u64::MAX;

impl PvMmu {
    fn queue_flush(&self, ctx: &mut CoreContext, op: MmuExtOp) {
        log_trace_if!(LOCAL_TRACE, "cpu {}: {:?}", ctx.cpu, op);
        self.queue(ctx, MultiCall::MmuExtOp(vec![op]));
        self.issue(ctx, LazyMode::Mmu);
    }

    /// Flush this core's TLB
    pub fn flush_tlb_local(&self, ctx: &mut CoreContext) {
        self.queue_flush(ctx, MmuExtOp::TlbFlushLocal);
    }

    /// Invalidate one address on this core
    pub fn flush_tlb_one_user(&self, ctx: &mut CoreContext, va: VAddr) {
        self.queue_flush(ctx, MmuExtOp::InvlpgLocal { va: page_align_down(va) });
    }

    /// Flush `start..end` on the cores in `cpus`
    ///
    /// Offline cores are dropped from the mask; an empty mask does nothing.
    /// Pass [`TLB_FLUSH_ALL`] as `end` for a full flush. A range inside one
    /// page invalidates just that page.
    pub fn flush_tlb_multi(&self, ctx: &mut CoreContext, cpus: CpuMask, start: VAddr, end: VAddr) {
        let cpus = cpus & self.cpus.online_mask();
        if cpus == 0 {
            return;
        }

        let one_page = end != TLB_FLUSH_ALL && end > start && page_align_down(start) == page_align_down(end - 1);
        let op = if one_page {
            MmuExtOp::InvlpgMulti {
                va: page_align_down(start),
                cpus,
            }
        } else {
            MmuExtOp::TlbFlushMulti { cpus }
        };
        self.queue_flush(ctx, op);
    }

    /// Flush every core's TLB
    pub fn flush_tlb_all(&self, ctx: &mut CoreContext) {
        self.queue_flush(ctx, MmuExtOp::TlbFlushAll);
    }
}
