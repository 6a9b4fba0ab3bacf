// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-CPU Data
//!
//! # Design
//!
//! - **[`CoreContext`]**: state only the owning core touches (its batch
//!   queue, the root it last asked for, its interrupt and preemption
//!   nesting). Passed by `&mut` into every MMU operation.
//! - **[`CpuTable`]**: state other cores read. Each core's confirmed root is
//!   written from a multicall completion, after the hypervisor has seen the
//!   switch, and is the only root a peer may act on.
//!
//! # Usage
//!
//! ```ignore
//! let mut ctx = mmu.core_context(cpu);
//! let flags = ctx.irq_save();
//! mmu.write_cr3(&mut ctx, root);
//! ctx.irq_restore(flags);
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::kernel::hypervisor::multicall::{BatchLimits, BatchQueue};
use crate::kernel::hypervisor::Hypervisor;
use crate::kernel::mp::{cpu_num_to_mask, CpuMask, MASK_CPUS};
use crate::kernel::vm::layout::Pfn;

/// ============================================================================
/// Core-Local Context
/// ============================================================================

/// State owned by one core
pub struct CoreContext {
    /// CPU number
    pub cpu: usize,

    /// Pending hypervisor requests
    pub batch: BatchQueue,

    requested_root: Pfn,
    irqs_disabled: bool,
    preempt_count: u32,
}

impl CoreContext {
    /// Create the context for `cpu`
    pub fn new(cpu: usize, hv: Arc<dyn Hypervisor>, limits: BatchLimits) -> Self {
        Self {
            cpu,
            batch: BatchQueue::new(cpu, hv, limits),
            requested_root: Pfn::INVALID,
            irqs_disabled: false,
            preempt_count: 0,
        }
    }

    /// Root this core last asked to load
    ///
    /// May not have reached the hypervisor yet.
    pub fn requested_root(&self) -> Pfn {
        self.requested_root
    }

    pub(crate) fn set_requested_root(&mut self, root: Pfn) {
        self.requested_root = root;
    }

    /// Disable interrupts, returning the previous state
    pub fn irq_save(&mut self) -> bool {
        core::mem::replace(&mut self.irqs_disabled, true)
    }

    /// Restore the interrupt state returned by [`irq_save`](Self::irq_save)
    pub fn irq_restore(&mut self, was_disabled: bool) {
        self.irqs_disabled = was_disabled;
    }

    /// Check whether interrupts are off
    pub fn irqs_disabled(&self) -> bool {
        self.irqs_disabled
    }

    /// Disable preemption
    pub fn preempt_disable(&mut self) {
        self.preempt_count += 1;
    }

    /// Re-enable preemption
    pub fn preempt_enable(&mut self) {
        debug_assert!(self.preempt_count > 0);
        self.preempt_count = self.preempt_count.saturating_sub(1);
    }

    /// Check whether preemption is off
    pub fn in_atomic(&self) -> bool {
        self.preempt_count > 0 || self.irqs_disabled
    }
}

/// ============================================================================
/// Shared Per-CPU Table
/// ============================================================================

/// Per-CPU state visible to every core
pub struct CpuTable {
    confirmed_root: Vec<AtomicU64>,
    online: Vec<AtomicBool>,
}

impl CpuTable {
    /// Create a table for `max_cpus` CPUs, all offline
    ///
    /// Capped at what a [`CpuMask`] can name.
    pub fn new(max_cpus: usize) -> Self {
        let max_cpus = max_cpus.min(MASK_CPUS);
        Self {
            confirmed_root: (0..max_cpus).map(|_| AtomicU64::new(Pfn::INVALID.0)).collect(),
            online: (0..max_cpus).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Number of CPUs
    pub fn max_cpus(&self) -> usize {
        self.online.len()
    }

    /// Mark a CPU online or offline
    pub fn set_online(&self, cpu: usize, online: bool) {
        if let Some(slot) = self.online.get(cpu) {
            slot.store(online, Ordering::Release);
        }
    }

    /// Check if a CPU is online
    pub fn is_online(&self, cpu: usize) -> bool {
        self.online
            .get(cpu)
            .map(|slot| slot.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Mask of online CPUs
    pub fn online_mask(&self) -> CpuMask {
        (0..self.max_cpus())
            .filter(|&cpu| self.is_online(cpu))
            .fold(0, |mask, cpu| mask | cpu_num_to_mask(cpu))
    }

    /// Root the hypervisor is known to have loaded on `cpu`
    pub fn confirmed_root(&self, cpu: usize) -> Pfn {
        self.confirmed_root
            .get(cpu)
            .map(|slot| Pfn(slot.load(Ordering::Acquire)))
            .unwrap_or(Pfn::INVALID)
    }

    /// Record a root switch the hypervisor has seen
    pub fn set_confirmed_root(&self, cpu: usize, root: Pfn) {
        if let Some(slot) = self.confirmed_root.get(cpu) {
            slot.store(root.0, Ordering::Release);
        }
    }

    /// Online CPUs other than `except` whose confirmed root is `root`
    pub fn cpus_using_root(&self, root: Pfn, except: usize) -> CpuMask {
        (0..self.max_cpus())
            .filter(|&cpu| cpu != except && self.is_online(cpu) && self.confirmed_root(cpu) == root)
            .fold(0, |mask, cpu| mask | cpu_num_to_mask(cpu))
    }
}
