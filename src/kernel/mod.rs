// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rustux Paravirtualized MMU - Core Kernel Module
//!
//! This module contains the guest memory-management layer and the small
//! kernel services it leans on (per-CPU state, locks, logging, config).

pub mod cmdline;
pub mod debug;
pub mod hypervisor;
pub mod mmu;
pub mod mp;
pub mod percpu;
pub mod pmm;
pub mod sync;
pub mod vm;
