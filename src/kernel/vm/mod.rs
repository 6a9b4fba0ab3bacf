// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Virtual Memory (Paravirtualized)
//!
//! Page-table management for a guest whose page tables are validated by the
//! hypervisor.
//!
//! # Design
//!
//! - **Two frame spaces**: the guest thinks in PFNs, the hypervisor in MFNs.
//!   [`p2m`] translates, [`page_table`] applies the translation to entries.
//! - **Read-only tables**: a page in use as a page table is read-only and
//!   pinned. [`pin`] moves whole trees in and out of that state.
//! - **Batched requests**: every hypervisor-bound mutation goes through the
//!   per-core multicall buffer in [`crate::kernel::hypervisor::multicall`].
//!
//! # Module Organization
//!
//! - [`layout`] - Frame numbers, address types, linear map
//! - [`p2m`] - PFN to MFN table
//! - [`page_table`] - Entry types and the entry codec
//! - [`walker`] - Generic table walker
//! - [`pin`] - Pin/unpin manager
//! - [`aspace`] - Address spaces and root switching
//! - [`tlb`] - TLB flush requests
//! - [`contig`] - Contiguous-region exchange

use core::fmt;

use crate::err::{self, HvStatus};

pub mod aspace;
pub mod contig;
pub mod layout;
pub mod p2m;
pub mod page_table;
pub mod pin;
pub mod tlb;
pub mod walker;

pub use layout::{MAddr, Mfn, PAddr, Pfn, VAddr, PAGE_SIZE};
pub use page_table::{MachPte, PtLevel, Pte, PteFlags};

/// VM error codes
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Invalid argument
    InvalidArgs = 1,

    /// Out of memory
    NoMemory = 2,

    /// Access denied
    AccessDenied = 4,

    /// Not mapped
    NotMapped = 6,

    /// Invalid state
    BadState = 12,

    /// Frame or index beyond a table's bounds
    OutOfRange = 13,

    /// Hypervisor refused a request with no more specific mapping
    Hypervisor = 14,
}

impl VmError {
    /// Convert to raw status code
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    /// Map a failed hypervisor status to the closest VM error
    pub const fn from_status(status: HvStatus) -> Self {
        match status {
            err::HV_ENOMEM => VmError::NoMemory,
            err::HV_EPERM => VmError::AccessDenied,
            err::HV_EINVAL => VmError::InvalidArgs,
            err::HV_EBUSY => VmError::BadState,
            _ => VmError::Hypervisor,
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::InvalidArgs => "invalid argument",
            VmError::NoMemory => "out of memory",
            VmError::AccessDenied => "access denied",
            VmError::NotMapped => "not mapped",
            VmError::BadState => "bad state",
            VmError::OutOfRange => "out of range",
            VmError::Hypervisor => "hypervisor error",
        };
        f.write_str(msg)
    }
}

/// Result type for VM operations
pub type Result<T = ()> = core::result::Result<T, VmError>;
