//! Leveled diagnostic printing to stderr.
//!
//! The source emulator guards every trace line behind a simple integer
//! log-level comparison and writes straight to stderr; there is no
//! structured-logging crate in the dependency graph this core is grown
//! from, so this module keeps that same shape instead of reaching for one.

use crate::config::LogLevel;

/// Print `msg` if `current` is at least as verbose as `threshold`.
pub fn log_at(current: LogLevel, threshold: LogLevel, msg: std::fmt::Arguments<'_>) {
    if current >= threshold {
        eprintln!("{msg}");
    }
}

macro_rules! log_calls {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log_at($level, $crate::config::LogLevel::Calls, format_args!($($arg)*))
    };
}

macro_rules! log_calls_sp {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log_at($level, $crate::config::LogLevel::CallsSp, format_args!($($arg)*))
    };
}

macro_rules! log_instrs {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log_at($level, $crate::config::LogLevel::Instrs, format_args!($($arg)*))
    };
}

macro_rules! log_warn {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log_at($level, $crate::config::LogLevel::Warn, format_args!($($arg)*))
    };
}

macro_rules! log_error {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log_at($level, $crate::config::LogLevel::Error, format_args!($($arg)*))
    };
}

pub(crate) use {log_calls, log_calls_sp, log_error, log_instrs, log_warn};
