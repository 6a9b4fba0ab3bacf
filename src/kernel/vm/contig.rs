// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Contiguous Region Exchange
//!
//! Trades the scattered machine frames behind a run of linear-map pages for
//! one machine-contiguous extent (for DMA below some address width), and
//! back again.
//!
//! # Protocol
//!
//! Both directions run under the reservation lock with interrupts off:
//!
//! 1. Zap: record the current frames, unmap each page, invalidate its P2M
//!    entry, submit
//! 2. Ask the hypervisor for the exchange
//! 3. Remap onto the frames received, or onto the recorded frames if the
//!    exchange failed. The last remap flushes everywhere.
//!
//! A failed exchange leaves every page, mapping and P2M entry as it was and
//! returns the hypervisor's refusal, `NoMemory` when it ran out of memory.
//! A partial exchange halts.

use crate::kernel::hypervisor::{MemoryExchange, MultiCall, UvmFlags};
use crate::kernel::mmu::PvMmu;
use crate::kernel::percpu::CoreContext;
use crate::kernel::vm::layout::{is_page_aligned, order_pages, MAddr, Mfn, Pfn, VAddr, PAGE_OFFSET, PAGE_SHIFT, PAGE_SIZE};
use crate::kernel::vm::page_table::{MachPte, PAGE_KERNEL};
use crate::kernel::vm::{Result, VmError};
use crate::{log_debug, log_warn};

impl PvMmu {
    /// Check a region before touching anything
    fn check_region(&self, vstart: VAddr, order: u32) -> Result<Pfn> {
        if order > self.config.max_contig_order {
            return Err(VmError::InvalidArgs);
        }
        if vstart < PAGE_OFFSET || !is_page_aligned(vstart) {
            return Err(VmError::InvalidArgs);
        }

        let first = Pfn::from_virt(vstart);
        let npages = order_pages(order);
        if first.0 + npages > self.p2m.max_pfn() {
            return Err(VmError::OutOfRange);
        }
        if (0..npages).any(|i| !self.p2m.pfn_to_mfn(first.add(i)).is_valid()) {
            return Err(VmError::NotMapped);
        }
        Ok(first)
    }

    fn zero_region(&self, vstart: VAddr, npages: u64) -> Result {
        for i in 0..npages {
            self.mem.zero_page(vstart + i * PAGE_SIZE)?;
        }
        Ok(())
    }

    /// Unmap every page of the region, recording its frame in `frames`
    fn zap_region(&self, ctx: &mut CoreContext, first: Pfn, npages: u64, frames: &mut alloc::vec::Vec<Mfn>) {
        frames.clear();
        for i in 0..npages {
            let pfn = first.add(i);
            frames.push(self.p2m.pfn_to_mfn(pfn));
            self.queue(
                ctx,
                MultiCall::UpdateVaMapping {
                    va: pfn.to_virt(),
                    val: MachPte::VOID,
                    flags: UvmFlags::empty(),
                },
            );
            self.p2m.set_phys_to_machine(pfn, Mfn::INVALID);
        }
        self.flush(ctx);
    }

    /// Map the region onto `frames`, one frame per page, flushing everywhere
    /// with the last update
    fn remap_region(&self, ctx: &mut CoreContext, first: Pfn, order: u32, frames: &[Mfn]) {
        let last = frames.len().saturating_sub(1);
        for (i, &mfn) in frames.iter().enumerate() {
            let pfn = first.add(i as u64);
            let flags = match (i == last, order) {
                (false, _) => UvmFlags::empty(),
                (true, 0) => UvmFlags::INVLPG | UvmFlags::ALL,
                (true, _) => UvmFlags::TLB_FLUSH | UvmFlags::ALL,
            };
            self.queue(
                ctx,
                MultiCall::UpdateVaMapping {
                    va: pfn.to_virt(),
                    val: MachPte::new(mfn, PAGE_KERNEL),
                    flags,
                },
            );
            self.p2m.set_phys_to_machine(pfn, mfn);
        }
        self.flush(ctx);
    }

    /// Make the `1 << order` pages at `vstart` machine-contiguous
    ///
    /// `address_bits` bounds the machine address of the result, 0 for no
    /// bound. The pages are zeroed. Returns the machine address of the first
    /// page.
    ///
    /// # Errors
    ///
    /// - `InvalidArgs`, `OutOfRange`, `NotMapped` if the request is rejected;
    ///   nothing has been changed
    /// - the hypervisor's refusal through [`VmError::from_status`], `NoMemory`
    ///   when it could not supply the extent; the original frames are back
    ///   in place
    pub fn acquire_contiguous(&self, ctx: &mut CoreContext, vstart: VAddr, order: u32, address_bits: u32) -> Result<MAddr> {
        if address_bits != 0 && (address_bits < PAGE_SHIFT + order || address_bits > 64) {
            return Err(VmError::InvalidArgs);
        }
        let first = self.check_region(vstart, order)?;
        let npages = order_pages(order);
        self.zero_region(vstart, npages)?;

        log_debug!("cpu {}: exchange {:#x} order {} bits {}", ctx.cpu, vstart, order, address_bits);
        let irq = ctx.irq_save();
        let mut frames = self.reservation.lock();
        self.zap_region(ctx, first, npages, &mut frames);

        let mut xchg = MemoryExchange::new(frames.clone(), 0, 1, order, address_bits);
        let status = self.hv.memory_exchange(&mut xchg);
        let success = xchg.succeeded(status);
        if success {
            let base = match xchg.output.frames.first() {
                Some(&base) if base.is_valid() => base,
                _ => crate::fatal!("memory exchange: no extent returned for {:#x} order {}", vstart, order),
            };
            let contiguous: alloc::vec::Vec<Mfn> = (0..npages).map(|i| base.add(i)).collect();
            self.remap_region(ctx, first, order, &contiguous);
        } else {
            self.remap_region(ctx, first, order, &frames);
        }
        drop(frames);
        ctx.irq_restore(irq);

        if !success {
            log_warn!("cpu {}: exchange of {:#x} order {} refused: {}", ctx.cpu, vstart, order, status);
            return Err(VmError::from_status(status));
        }
        Ok(self.p2m.pfn_to_mfn(first).maddr())
    }

    /// Give back the extent behind `vstart` for individually placed frames
    ///
    /// Inverse of [`acquire_contiguous`](Self::acquire_contiguous). The pages
    /// are zeroed. If the hypervisor refuses, the original extent is back in
    /// place.
    pub fn release_contiguous(&self, ctx: &mut CoreContext, vstart: VAddr, order: u32) -> Result {
        let first = self.check_region(vstart, order)?;
        let npages = order_pages(order);
        self.zero_region(vstart, npages)?;

        log_debug!("cpu {}: release {:#x} order {}", ctx.cpu, vstart, order);
        let irq = ctx.irq_save();
        let mut frames = self.reservation.lock();
        self.zap_region(ctx, first, npages, &mut frames);

        let mut xchg = MemoryExchange::new(alloc::vec![frames[0]], order, npages, 0, 0);
        let status = self.hv.memory_exchange(&mut xchg);
        let success = xchg.succeeded(status);
        if success {
            if xchg.output.frames.len() as u64 != npages {
                crate::fatal!(
                    "memory exchange: {} frames returned for {} pages at {:#x}",
                    xchg.output.frames.len(),
                    npages,
                    vstart
                );
            }
            self.remap_region(ctx, first, order, &xchg.output.frames);
        } else {
            self.remap_region(ctx, first, order, &frames);
        }
        drop(frames);
        ctx.irq_restore(irq);

        if !success {
            log_warn!("cpu {}: release of {:#x} order {} refused: {}", ctx.cpu, vstart, order, status);
            return Err(VmError::from_status(status));
        }
        Ok(())
    }
}
