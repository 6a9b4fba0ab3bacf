// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Logging and Diagnostics
//!
//! Logging facade for the MMU layer. The `log_*!` macros funnel into
//! [`log_print`], which forwards to the `log` crate when the `log` feature is
//! enabled and compiles to nothing otherwise.
//!
//! # Usage
//!
//! ```ignore
//! log_debug!("pin root pfn {:#x}", pfn.0);
//! log_trace_if!(LOCAL_TRACE, "flush {} entries", n);
//!
//! // Unrecoverable protocol violation
//! fatal!("hypervisor rejected pin of mfn {:#x}", mfn.0);
//! ```

use core::sync::atomic::{AtomicU8, Ordering};

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Trace-level logging (very verbose)
    Trace = 0,

    /// Debug-level logging (verbose)
    Debug = 1,

    /// Informational logging
    Info = 2,

    /// Warning-level logging
    Warning = 3,

    /// Error-level logging
    Error = 4,

    /// Fatal errors (will halt the system)
    Fatal = 5,
}

impl LogLevel {
    /// Get the log level name as a string
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warning,
            4 => LogLevel::Error,
            _ => LogLevel::Fatal,
        }
    }
}

#[cfg(feature = "log")]
impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error | LogLevel::Fatal => log::Level::Error,
        }
    }
}

/// Global minimum log level
///
/// Only messages at or above this level are handed to the backend.
static MIN_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Trace as u8);

/// Set the minimum log level
pub fn log_set_min_level(level: LogLevel) {
    MIN_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Get the current minimum log level
pub fn log_get_min_level() -> LogLevel {
    LogLevel::from_raw(MIN_LOG_LEVEL.load(Ordering::Relaxed))
}

/// Print a formatted message at a specific log level
///
/// # Arguments
///
/// * `level` - Log level for this message
/// * `args` - Format arguments
#[inline]
pub fn log_print(level: LogLevel, args: core::fmt::Arguments) {
    if level < log_get_min_level() {
        return;
    }

    #[cfg(feature = "log")]
    {
        let lvl: log::Level = level.into();
        log::log!(target: "pvmmu", lvl, "{}", args);
    }

    #[cfg(not(feature = "log"))]
    let _ = args;
}

/// Log a fatal error message and halt
///
/// Used when a hypervisor request that upholds the read-only pagetable
/// invariant is rejected. Nothing after this point can be trusted.
#[inline(never)]
#[cold]
pub fn log_fatal(args: core::fmt::Arguments) -> ! {
    log_print(LogLevel::Fatal, args);
    panic!("pvmmu: {}", args);
}

/// Log a trace message
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Trace, format_args!($($arg)*))
    };
}

/// Log a trace message if condition is true
#[macro_export]
macro_rules! log_trace_if {
    ($cond:expr, $($arg:tt)*) => {
        if $cond {
            $crate::log_trace!($($arg)*);
        }
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Debug, format_args!($($arg)*))
    };
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Info, format_args!($($arg)*))
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Warning, format_args!($($arg)*))
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Error, format_args!($($arg)*))
    };
}

/// Halt on an unrecoverable protocol violation
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_fatal(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Error < LogLevel::Fatal);
        assert_eq!(LogLevel::Warning.as_str(), "WARN");
    }

    #[test]
    #[should_panic(expected = "pvmmu: pin rejected")]
    fn test_fatal_halts() {
        crate::fatal!("pin rejected");
    }
}
