// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rustux Paravirtualized MMU
//!
//! Guest-side memory management for running under a paravirtualizing
//! hypervisor. The guest addresses memory by guest frame number (PFN) while
//! every page-table entry the hypervisor sees must carry a machine frame
//! number (MFN), and every page used as a page table must be read-only and
//! pinned before the hypervisor will load it.
//!
//! # Organization
//!
//! - [`kernel::vm::p2m`] - PFN to MFN translation table
//! - [`kernel::vm::page_table`] - Entry codec between PFN and MFN space
//! - [`kernel::hypervisor::multicall`] - Per-core batch queue (lazy mode)
//! - [`kernel::vm::pin`] - Pin/unpin of page-table trees
//! - [`kernel::vm::aspace`] - Root switching and cross-core root retirement
//! - [`kernel::vm::tlb`] - TLB flush requests
//! - [`kernel::vm::contig`] - Contiguous-region exchange
//! - [`kernel::mmu`] - The [`PvMmu`] operations table wiring it all together

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod kernel;

pub mod err;

pub use kernel::cmdline::PvMmuConfig;
pub use kernel::mmu::{Collaborators, PvMmu};
pub use kernel::percpu::CoreContext;
pub use kernel::vm::{VmError, Result};
