// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Command Line and MMU Configuration
//!
//! Parses `key=value` boot options and turns the `pvmmu.*` ones into a
//! [`PvMmuConfig`].
//!
//! # Design
//!
//! - Options are separated by whitespace
//! - Invalid characters are converted to '.'
//! - A key with no value reads as the empty string
//! - Later options override earlier ones
//!
//! # Usage
//!
//! ```ignore
//! let mut cmdline = Cmdline::new();
//! cmdline.append("pvmmu.batch_entries=16 pvmmu.split_ptlocks=off");
//!
//! let config = PvMmuConfig::from_cmdline(&cmdline);
//! ```

use alloc::string::String;
use alloc::vec::Vec;

use crate::kernel::vm::layout::{VAddr, GUARD_HOLE_BASE_ADDR, GUARD_HOLE_END_ADDR, USER_LIMIT};
use crate::kernel::vm::page_table::PtLevel;
use crate::log_info;

/// Maximum command line size
const CMDLINE_MAX: usize = 4096;

/// ============================================================================
/// Command Line
/// ============================================================================

/// Parsed boot options
#[derive(Debug, Clone, Default)]
pub struct Cmdline {
    entries: Vec<(String, String)>,
    size: usize,
}

impl Cmdline {
    /// Create an empty command line
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            size: 0,
        }
    }

    /// Append options to the command line
    ///
    /// Input past the size limit is dropped.
    pub fn append(&mut self, data: &str) {
        for word in data.split_whitespace() {
            if self.size + word.len() + 1 > CMDLINE_MAX {
                return;
            }
            self.size += word.len() + 1;

            let clean: String = word
                .chars()
                .map(|c| if c.is_ascii_graphic() { c } else { '.' })
                .collect();
            let (key, value) = match clean.split_once('=') {
                Some((k, v)) => (String::from(k), String::from(v)),
                None => (clean, String::new()),
            };
            self.entries.push((key, value));
        }
    }

    /// Number of options
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Get the value of an option
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get a boolean option
    ///
    /// "0", "false" and "off" are false, anything else (including a bare
    /// key) is true.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(v) => !matches!(v, "0" | "false" | "off"),
        }
    }

    /// Get a 32-bit integer option, decimal or `0x` hex
    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key)
            .and_then(parse_uint)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(default)
    }

    /// Get a 64-bit integer option, decimal or `0x` hex
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(parse_uint).unwrap_or(default)
    }
}

fn parse_uint(v: &str) -> Option<u64> {
    match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => v.parse().ok(),
    }
}

/// ============================================================================
/// MMU Configuration
/// ============================================================================

/// Multicall entries per batch
pub const MC_BATCH: usize = 32;

/// Multicall argument space per batch, in bytes
pub const MC_ARGS: usize = MC_BATCH * 16;

/// Largest contiguous-region order the exchange supports
pub const MAX_CONTIG_ORDER: u32 = 9;

/// Tunables of the paravirtual MMU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvMmuConfig {
    /// Entries per multicall batch
    pub batch_entries: usize,

    /// Argument bytes per multicall batch
    pub batch_args: usize,

    /// Completion callbacks per batch
    pub batch_callbacks: usize,

    /// Largest order accepted by the contiguous exchange
    pub max_contig_order: u32,

    /// Hold the per-frame lock across leaf-table pinning
    pub split_pte_locks: bool,

    /// Keep a separate user-mode root alongside each root
    pub split_user_root: bool,

    /// First address above the user half
    pub user_limit: VAddr,

    /// Root slots `[start, end)` owned by the hypervisor, never walked
    pub guard_hole: (usize, usize),

    /// Number of CPUs the per-core tables are sized for
    pub max_cpus: usize,
}

impl Default for PvMmuConfig {
    fn default() -> Self {
        Self {
            batch_entries: MC_BATCH,
            batch_args: MC_ARGS,
            batch_callbacks: MC_BATCH,
            max_contig_order: MAX_CONTIG_ORDER,
            split_pte_locks: true,
            split_user_root: true,
            user_limit: USER_LIMIT,
            guard_hole: (
                PtLevel::Pgd.index(GUARD_HOLE_BASE_ADDR),
                PtLevel::Pgd.index(GUARD_HOLE_END_ADDR),
            ),
            max_cpus: 64,
        }
    }
}

impl PvMmuConfig {
    /// Build the configuration from `pvmmu.*` boot options
    ///
    /// Sizes above the defaults are clamped down to them.
    pub fn from_cmdline(cmdline: &Cmdline) -> Self {
        let def = Self::default();
        let clamp = |v: u64, max: usize| (v as usize).clamp(1, max);

        let config = Self {
            batch_entries: clamp(cmdline.get_u64("pvmmu.batch_entries", def.batch_entries as u64), def.batch_entries),
            batch_args: clamp(cmdline.get_u64("pvmmu.batch_args", def.batch_args as u64), def.batch_args),
            max_contig_order: cmdline
                .get_u32("pvmmu.max_contig_order", def.max_contig_order)
                .min(def.max_contig_order),
            split_pte_locks: cmdline.get_bool("pvmmu.split_ptlocks", def.split_pte_locks),
            split_user_root: cmdline.get_bool("pvmmu.user_root", def.split_user_root),
            ..def
        };

        log_info!(
            "pvmmu: batch {} entries / {} bytes, max contig order {}, split ptlocks {}, user root {}",
            config.batch_entries,
            config.batch_args,
            config.max_contig_order,
            config.split_pte_locks,
            config.split_user_root
        );
        config
    }

    /// Check whether a root slot belongs to the hypervisor
    pub fn in_guard_hole(&self, index: usize) -> bool {
        index >= self.guard_hole.0 && index < self.guard_hole.1
    }

    /// Number of root slots that map user addresses
    pub fn user_root_slots(&self) -> usize {
        PtLevel::Pgd.index(self.user_limit - 1) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_get() {
        let mut cmdline = Cmdline::new();
        cmdline.append("num1=123 num2=0x1ff flag  bare");
        assert_eq!(cmdline.count(), 4);
        assert_eq!(cmdline.get("num1"), Some("123"));
        assert_eq!(cmdline.get_u32("num2", 0), 0x1ff);
        assert_eq!(cmdline.get("bare"), Some(""));
        assert!(cmdline.get("missing").is_none());
        assert_eq!(cmdline.get_u32("missing", 42), 42);
        assert_eq!(cmdline.get_u32("bare", 7), 7);
    }

    #[test]
    fn test_cmdline_get_bool() {
        let mut cmdline = Cmdline::new();
        cmdline.append("flag1=true flag2=off flag3");
        assert!(cmdline.get_bool("flag1", false));
        assert!(!cmdline.get_bool("flag2", true));
        assert!(cmdline.get_bool("flag3", false));
        assert!(cmdline.get_bool("missing", true));
    }

    #[test]
    fn test_cmdline_override_and_u64() {
        let mut cmdline = Cmdline::new();
        cmdline.append("num=1");
        cmdline.append("num=0X1ffffffff");
        assert_eq!(cmdline.get_u64("num", 0), 0x1ffffffff);
        assert_eq!(cmdline.get_u32("num", 5), 5);
    }

    #[test]
    fn test_default_config() {
        let config = PvMmuConfig::default();
        assert_eq!(config.batch_entries, 32);
        assert_eq!(config.batch_args, 512);
        assert_eq!(config.max_contig_order, 9);
        assert_eq!(config.guard_hole, (256, 272));
        assert!(config.in_guard_hole(256));
        assert!(!config.in_guard_hole(272));
        assert_eq!(config.user_root_slots(), 256);
    }

    #[test]
    fn test_config_from_cmdline() {
        let mut cmdline = Cmdline::new();
        cmdline.append("pvmmu.batch_entries=8 pvmmu.max_contig_order=12 pvmmu.split_ptlocks=0 pvmmu.batch_args=0");
        let config = PvMmuConfig::from_cmdline(&cmdline);
        assert_eq!(config.batch_entries, 8);
        assert_eq!(config.max_contig_order, 9);
        assert_eq!(config.batch_args, 1);
        assert!(!config.split_pte_locks);
        assert!(config.split_user_root);
    }
}
