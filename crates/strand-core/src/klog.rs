//! Leveled stderr logging
//!
//! The runtime logs through one choke point, [`emit`], behind the
//! `klog!`/`kerror!`/.../`ktrace!` macros. Settings are read from the
//! environment exactly once, on first log:
//!
//! - `STRAND_LOG_LEVEL` - a level name (`off`..`trace`) or digit 0-5
//! - `STRAND_FLUSH_EPRINT` - flush stderr after every line, for
//!   debugging crashes that would otherwise eat buffered output
//!
//! The level can still be changed at runtime with [`set_log_level`]
//! (tests use this to silence themselves); the flush flag cannot.

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use crate::env::{env_get, env_get_bool};

/// Verbosity, quietest first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// All levels, indexable by their numeric value
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Off,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    const NAMES: [&'static str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

    /// Fixed-width tag so log columns line up
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Off => "     ",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN ",
            LogLevel::Info => "INFO ",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    /// Accepts a level name or a bare digit; digits past 5 saturate at
    /// the most verbose level
    fn from_str(s: &str) -> Result<Self, ()> {
        let s = s.trim().to_ascii_lowercase();
        if let Some(pos) = Self::NAMES.iter().position(|n| *n == s) {
            return Ok(Self::ALL[pos]);
        }
        if let Ok(n) = s.parse::<u8>() {
            return Ok(Self::ALL[(n as usize).min(5)]);
        }
        Err(())
    }
}

struct Settings {
    level: AtomicU8,
    flush: bool,
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| Settings {
        level: AtomicU8::new(env_get("STRAND_LOG_LEVEL", LogLevel::Warn) as u8),
        flush: env_get_bool("STRAND_FLUSH_EPRINT", false),
    })
}

/// Current verbosity
pub fn log_level() -> LogLevel {
    LogLevel::ALL[(settings().level.load(Ordering::Relaxed) as usize).min(5)]
}

/// Override the verbosity at runtime
pub fn set_log_level(level: LogLevel) {
    settings().level.store(level as u8, Ordering::Relaxed);
}

/// Would a message at `level` currently be printed?
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 <= settings().level.load(Ordering::Relaxed)
}

/// Write one tagged line to stderr, honoring level and flush settings
#[doc(hidden)]
pub fn emit(level: LogLevel, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "[{}] {}", level.tag(), args);
    if settings().flush {
        let _ = err.flush();
    }
}

/// Write one untagged line, bypassing the level filter
#[doc(hidden)]
pub fn emit_raw(args: fmt::Arguments<'_>) {
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{}", args);
    if settings().flush {
        let _ = err.flush();
    }
}

/// Log at an explicit level
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::klog::emit($level, format_args!($($arg)*))
    };
}

/// Print a line to stderr regardless of log level
#[macro_export]
macro_rules! kprintln {
    () => { $crate::klog::emit_raw(format_args!("")) };
    ($($arg:tt)*) => { $crate::klog::emit_raw(format_args!($($arg)*)) };
}

/// Error level log
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::LogLevel::Error, $($arg)*) };
}

/// Warning level log
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::LogLevel::Warn, $($arg)*) };
}

/// Info level log
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::LogLevel::Info, $($arg)*) };
}

/// Debug level log
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::LogLevel::Debug, $($arg)*) };
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::LogLevel::Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!("warn".parse(), Ok(LogLevel::Warn));
        assert_eq!(" Trace ".parse(), Ok(LogLevel::Trace));
        assert_eq!("4".parse(), Ok(LogLevel::Debug));
        // Digits saturate, junk is rejected
        assert_eq!("99".parse(), Ok(LogLevel::Trace));
        assert_eq!("loud".parse::<LogLevel>(), Err(()));
    }

    #[test]
    fn test_level_table_matches_discriminants() {
        for (i, level) in LogLevel::ALL.iter().enumerate() {
            assert_eq!(*level as usize, i);
        }
    }

    // The level override is a shared static, so everything that pokes
    // it lives in one test.
    #[test]
    fn test_override_and_macros() {
        set_log_level(LogLevel::Warn);
        assert!(enabled(LogLevel::Error));
        assert!(enabled(LogLevel::Warn));
        assert!(!enabled(LogLevel::Info));

        // Off is never printable, even at the Off setting
        set_log_level(LogLevel::Off);
        assert!(!enabled(LogLevel::Error));
        assert!(!enabled(LogLevel::Off));

        kprintln!("line {}", 1);
        klog!(LogLevel::Info, "explicit {}", "level");
        kerror!("error");
        kwarn!("warn");
        kinfo!("info");
        kdebug!("debug");
        ktrace!("trace");
    }
}
