// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Multicall Batch Queue
//!
//! Per-core buffer of hypervisor requests submitted as one multicall.
//!
//! # Design
//!
//! A core is either issuing requests immediately or sitting in one of two
//! lazy modes. While lazy, requests accumulate here and go out together on
//! the next flush.
//!
//! - Consecutive entry updates (or consecutive extended ops) are folded into
//!   the previous queued entry instead of taking a new slot
//! - The buffer has fixed entry, argument-space and callback budgets; running
//!   out of any of them flushes first
//! - Callbacks run after submission in the order they were queued, whether
//!   or not an entry failed
//!
//! The queue lives inside [`CoreContext`](crate::kernel::percpu::CoreContext)
//! and is only reachable through `&mut`, so nothing else on the core can
//! interleave with a half-built batch.
//!
//! # Usage
//!
//! ```ignore
//! ctx.batch.queue(MultiCall::MmuExtOp(vec![MmuExtOp::TlbFlushLocal]))?;
//! ctx.batch.add_callback(Box::new(move || confirm()))?;
//! ctx.batch.issue(LazyMode::Cpu)?;
//! ```

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::err::{self, HvStatus};
use crate::kernel::cmdline::PvMmuConfig;
use crate::kernel::hypervisor::{Hypervisor, MultiCall};
use crate::{log_error, log_trace_if};

const LOCAL_TRACE: bool = false;

/// Deferred completion, run once the batch carrying it has been submitted
pub type Callback = Box<dyn FnOnce() + Send>;

/// Per-core lazy mode
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyMode {
    /// Every request is submitted as soon as it is issued
    Immediate = 0,

    /// Page-table update burst
    Mmu = 1,

    /// Context-switch burst
    Cpu = 2,
}

/// Buffer budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub entries: usize,
    pub arg_bytes: usize,
    pub callbacks: usize,
}

impl BatchLimits {
    /// Budgets from the active configuration
    pub fn from_config(config: &PvMmuConfig) -> Self {
        Self {
            entries: config.batch_entries,
            arg_bytes: config.batch_args,
            callbacks: config.batch_callbacks,
        }
    }
}

/// A batch entry the hypervisor rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticallFailure {
    /// Position of the first failing entry in the batch
    pub index: usize,

    /// Operation of that entry
    pub op: &'static str,

    /// Status it returned
    pub status: HvStatus,

    /// Total failing entries in the batch
    pub failed: usize,
}

impl fmt::Display for MulticallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of batch failed, first at {} ({}) status {}",
            self.failed, self.index, self.op, self.status
        )
    }
}

/// Per-core multicall buffer
pub struct BatchQueue {
    cpu: usize,
    hv: Arc<dyn Hypervisor>,
    limits: BatchLimits,
    mode: LazyMode,
    entries: Vec<MultiCall>,
    arg_bytes: usize,
    callbacks: Vec<Callback>,
    flushes: u64,
}

impl BatchQueue {
    /// Create an empty queue for `cpu`
    pub fn new(cpu: usize, hv: Arc<dyn Hypervisor>, limits: BatchLimits) -> Self {
        Self {
            cpu,
            hv,
            entries: Vec::with_capacity(limits.entries),
            callbacks: Vec::with_capacity(limits.callbacks),
            limits,
            mode: LazyMode::Immediate,
            arg_bytes: 0,
            flushes: 0,
        }
    }

    /// Current lazy mode
    pub fn mode(&self) -> LazyMode {
        self.mode
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.callbacks.is_empty()
    }

    /// Number of batches submitted so far
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Start deferring requests
    ///
    /// Lazy modes do not nest.
    pub fn enter_lazy(&mut self, mode: LazyMode) {
        if self.mode != LazyMode::Immediate {
            crate::fatal!("cpu {}: entering {:?} while in {:?}", self.cpu, mode, self.mode);
        }
        self.mode = mode;
    }

    /// Stop deferring and submit whatever is queued
    pub fn leave_lazy(&mut self, mode: LazyMode) -> Result<(), MulticallFailure> {
        if self.mode != mode {
            crate::fatal!("cpu {}: leaving {:?} while in {:?}", self.cpu, mode, self.mode);
        }
        self.mode = LazyMode::Immediate;
        self.flush()
    }

    /// Append a request, folding it into the last entry where possible
    pub fn queue(&mut self, call: MultiCall) -> Result<(), MulticallFailure> {
        let bytes = call.arg_bytes();
        if self.arg_bytes + bytes > self.limits.arg_bytes {
            self.flush()?;
        }

        let call = match self.entries.last_mut() {
            Some(last) => match last.try_extend(call) {
                Ok(()) => {
                    self.arg_bytes += bytes;
                    return Ok(());
                }
                Err(call) => call,
            },
            None => call,
        };

        if self.entries.len() >= self.limits.entries {
            self.flush()?;
        }

        self.arg_bytes += bytes;
        self.entries.push(call);
        Ok(())
    }

    /// Attach a completion to the current batch
    pub fn add_callback(&mut self, cb: Callback) -> Result<(), MulticallFailure> {
        if self.callbacks.len() >= self.limits.callbacks {
            self.flush()?;
        }
        self.callbacks.push(cb);
        Ok(())
    }

    /// Submit now unless the core is in `mode`
    pub fn issue(&mut self, mode: LazyMode) -> Result<(), MulticallFailure> {
        if self.mode != mode || mode == LazyMode::Immediate {
            self.flush()
        } else {
            Ok(())
        }
    }

    /// Submit everything queued as one multicall, then run the callbacks
    pub fn flush(&mut self) -> Result<(), MulticallFailure> {
        let entries = core::mem::take(&mut self.entries);
        let callbacks = core::mem::take(&mut self.callbacks);
        self.arg_bytes = 0;

        let mut first = None;
        let mut failed = 0;
        if !entries.is_empty() {
            self.flushes += 1;
            log_trace_if!(LOCAL_TRACE, "cpu {}: flush {} entries", self.cpu, entries.len());

            let statuses = self.hv.multicall(self.cpu, &entries);
            for (index, (call, &status)) in entries.iter().zip(statuses.iter()).enumerate() {
                if err::hv_ok(status) {
                    continue;
                }
                log_error!("cpu {}: multicall entry {} ({}) failed: {}", self.cpu, index, call.op_name(), status);
                failed += 1;
                if first.is_none() {
                    first = Some((index, call.op_name(), status));
                }
            }
        }

        for cb in callbacks {
            cb();
        }

        match first {
            Some((index, op, status)) => Err(MulticallFailure {
                index,
                op,
                status,
                failed,
            }),
            None => Ok(()),
        }
    }
}

impl Drop for BatchQueue {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            log_error!("cpu {}: dropping {} unsubmitted entries", self.cpu, self.entries.len());
        }
    }
}
