// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Multi-Processor Support
//!
//! CPU masks and the cross-core call facility the MMU uses to make other
//! cores let go of a root before it is unpinned.

use crate::kernel::percpu::CoreContext;

/// ============================================================================
/// CPU Masks
/// ============================================================================

/// CPU mask type (bitmask of CPUs)
pub type CpuMask = u64;

/// Largest CPU count a mask can describe
pub const MASK_CPUS: usize = 64;

/// Convert CPU number to mask
pub const fn cpu_num_to_mask(cpu: usize) -> CpuMask {
    1u64 << cpu
}

/// Iterate over the CPUs set in a mask, lowest first
pub fn cpus_in_mask(mask: CpuMask) -> impl Iterator<Item = usize> {
    (0..MASK_CPUS).filter(move |&cpu| mask & cpu_num_to_mask(cpu) != 0)
}

/// ============================================================================
/// Cross-Core Calls
/// ============================================================================

/// Function run on each target core, handed that core's context
pub type CrossCallFn<'a> = &'a (dyn Fn(&mut CoreContext) + Sync);

/// Directed call facility
pub trait CrossCall: Send + Sync {
    /// Run `func` on every CPU in `mask` and wait for all of them
    ///
    /// The caller's own CPU is never in `mask`.
    fn call_function_many(&self, mask: CpuMask, func: CrossCallFn<'_>);
}
