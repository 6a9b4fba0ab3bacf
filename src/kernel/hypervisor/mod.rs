// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Hypervisor Interface
//!
//! Request types the guest MMU sends across the hypervisor boundary and the
//! collaborator traits that carry them.
//!
//! # Design
//!
//! Everything crossing the boundary in the hypervisor-bound direction is
//! already in machine-frame space: entry pointers are machine addresses,
//! entry values are [`MachPte`]s, pin targets are MFNs.
//!
//! - [`Hypervisor`] - multicall submission and memory exchange
//! - [`GuestMemory`] - direct loads and stores through the guest's own
//!   mappings, which the hypervisor faults if the target is read-only
//!
//! Requests are never issued one by one. They go through the per-core
//! [`multicall::BatchQueue`].

use alloc::vec::Vec;

use crate::err::{self, HvStatus};
use crate::kernel::mp::CpuMask;
use crate::kernel::vm::layout::{MAddr, Mfn, VAddr};
use crate::kernel::vm::page_table::{MachPte, PtLevel};
use crate::kernel::vm::Result;

pub mod multicall;

#[cfg(test)]
pub mod mock;

/// ============================================================================
/// Entry Updates
/// ============================================================================

/// Kind of entry update, carried in the low bits of the pointer
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuUpdateKind {
    /// Checked write of a page-table entry
    Normal = 0,

    /// Update of the machine-to-phys entry for a frame
    MachPhys = 1,

    /// Like `Normal`, but keep the accessed/dirty bits the hardware set
    PreserveAd = 2,
}

/// One entry update request
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuUpdate {
    /// Machine address of the entry, with the kind in bits 0..2
    pub ptr: u64,

    /// New value
    pub val: u64,
}

impl MmuUpdate {
    /// Write `val` to the entry at machine address `ptr`
    pub const fn normal(ptr: MAddr, val: MachPte) -> Self {
        Self {
            ptr: ptr | MmuUpdateKind::Normal as u64,
            val: val.raw(),
        }
    }

    /// Write `val` keeping the hardware-set accessed/dirty bits
    pub const fn preserve_ad(ptr: MAddr, val: MachPte) -> Self {
        Self {
            ptr: ptr | MmuUpdateKind::PreserveAd as u64,
            val: val.raw(),
        }
    }

    /// Kind encoded in the pointer
    pub const fn kind(&self) -> MmuUpdateKind {
        match self.ptr & 3 {
            1 => MmuUpdateKind::MachPhys,
            2 => MmuUpdateKind::PreserveAd,
            _ => MmuUpdateKind::Normal,
        }
    }

    /// Machine address of the target entry
    pub const fn addr(&self) -> MAddr {
        self.ptr & !7
    }
}

/// Extended MMU operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuExtOp {
    /// Validate and pin a table frame at `level`
    PinTable { level: PtLevel, mfn: Mfn },

    /// Release a pinned table frame
    UnpinTable { mfn: Mfn },

    /// Load a new root
    NewBasePtr { mfn: Mfn },

    /// Load a new user-mode root, `None` to clear it
    NewUserBasePtr { mfn: Option<Mfn> },

    /// Flush this vCPU's TLB
    TlbFlushLocal,

    /// Invalidate one address on this vCPU
    InvlpgLocal { va: VAddr },

    /// Flush the TLBs of a set of vCPUs
    TlbFlushMulti { cpus: CpuMask },

    /// Invalidate one address on a set of vCPUs
    InvlpgMulti { va: VAddr, cpus: CpuMask },

    /// Flush every vCPU's TLB
    TlbFlushAll,

    /// Invalidate one address on every vCPU
    InvlpgAll { va: VAddr },
}

bitflags::bitflags! {
    /// Flush flags attached to a single-mapping update
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UvmFlags: u32 {
        /// Flush the whole TLB after the update
        const TLB_FLUSH = 1;

        /// Invalidate just the updated address
        const INVLPG = 2;

        /// Apply the flush on every vCPU, not only the local one
        const ALL = 4;
    }
}

/// Bytes of argument space one queued sub-request uses
const MMU_UPDATE_ARG_BYTES: usize = 16;
const MMUEXT_OP_ARG_BYTES: usize = 24;

/// One multicall entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiCall {
    /// Entry updates, applied in order
    MmuUpdate(Vec<MmuUpdate>),

    /// Extended operations, applied in order
    MmuExtOp(Vec<MmuExtOp>),

    /// Replace the mapping of one virtual page, then flush per `flags`
    UpdateVaMapping {
        va: VAddr,
        val: MachPte,
        flags: UvmFlags,
    },
}

impl MultiCall {
    /// Operation name for diagnostics
    pub const fn op_name(&self) -> &'static str {
        match self {
            MultiCall::MmuUpdate(_) => "mmu_update",
            MultiCall::MmuExtOp(_) => "mmuext_op",
            MultiCall::UpdateVaMapping { .. } => "update_va_mapping",
        }
    }

    /// Argument space this entry occupies
    pub fn arg_bytes(&self) -> usize {
        match self {
            MultiCall::MmuUpdate(reqs) => reqs.len() * MMU_UPDATE_ARG_BYTES,
            MultiCall::MmuExtOp(ops) => ops.len() * MMUEXT_OP_ARG_BYTES,
            MultiCall::UpdateVaMapping { .. } => 0,
        }
    }

    /// Fold `other` into this entry if both are the same argument-array op
    ///
    /// Returns `other` back when it cannot be merged.
    pub fn try_extend(&mut self, other: MultiCall) -> core::result::Result<(), MultiCall> {
        match (self, other) {
            (MultiCall::MmuUpdate(reqs), MultiCall::MmuUpdate(more)) => {
                reqs.extend(more);
                Ok(())
            }
            (MultiCall::MmuExtOp(ops), MultiCall::MmuExtOp(more)) => {
                ops.extend(more);
                Ok(())
            }
            (_, other) => Err(other),
        }
    }
}

/// ============================================================================
/// Memory Exchange
/// ============================================================================

/// One side of a memory exchange
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentSet {
    /// Input: frames given up. Output: filled in with the frames received
    pub frames: Vec<Mfn>,

    /// Number of extents on this side
    pub nr_extents: u64,

    /// Each extent is `1 << order` frames
    pub order: u32,

    /// Highest machine address width the extents may occupy, 0 for any
    pub address_bits: u32,
}

/// Exchange of one set of frames for another
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryExchange {
    pub input: ExtentSet,
    pub output: ExtentSet,

    /// Input extents actually exchanged, written by the hypervisor
    pub nr_exchanged: u64,
}

impl MemoryExchange {
    /// Build an exchange request
    pub fn new(input: Vec<Mfn>, in_order: u32, out_extents: u64, out_order: u32, address_bits: u32) -> Self {
        let nr_in = input.len() as u64;
        Self {
            input: ExtentSet {
                frames: input,
                nr_extents: nr_in,
                order: in_order,
                address_bits: 0,
            },
            output: ExtentSet {
                frames: Vec::new(),
                nr_extents: out_extents,
                order: out_order,
                address_bits,
            },
            nr_exchanged: 0,
        }
    }

    /// Check the outcome of a completed exchange
    ///
    /// A partial exchange, or a status that disagrees with the count, means
    /// the frame accounting can no longer be trusted and halts.
    pub fn succeeded(&self, status: HvStatus) -> bool {
        let success = self.nr_exchanged == self.input.nr_extents;
        if !success && (self.nr_exchanged != 0 || err::hv_ok(status)) {
            crate::fatal!(
                "memory exchange: {} of {} extents exchanged, status {}",
                self.nr_exchanged,
                self.input.nr_extents,
                status
            );
        }
        if success && !err::hv_ok(status) {
            crate::fatal!("memory exchange: completed with status {}", status);
        }
        success
    }
}

/// ============================================================================
/// Collaborators
/// ============================================================================

/// The hypervisor's hypercall surface
pub trait Hypervisor: Send + Sync {
    /// Submit one batch on behalf of `cpu`
    ///
    /// Entries are applied in order. Returns one status per entry.
    fn multicall(&self, cpu: usize, calls: &[MultiCall]) -> Vec<HvStatus>;

    /// Exchange frames, filling in `xchg.output.frames` and `xchg.nr_exchanged`
    fn memory_exchange(&self, xchg: &mut MemoryExchange) -> HvStatus;
}

/// Direct access to page-table memory through the guest's own mappings
///
/// `table` is the virtual address of the table page.
pub trait GuestMemory: Send + Sync {
    /// Load one entry
    fn read_entry(&self, table: VAddr, index: usize) -> MachPte;

    /// Store one entry
    ///
    /// Fails with `AccessDenied` if the page is mapped read-only.
    fn write_entry(&self, table: VAddr, index: usize, val: MachPte) -> Result;

    /// Zero one page
    fn zero_page(&self, va: VAddr) -> Result;
}
