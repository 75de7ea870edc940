// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash-path logging.
//!
//! While a fatal event is handled the process may be in any state: another thread may hold the
//! allocator lock or the lock of a `tracing` subscriber. Log lines emitted from the capture path
//! therefore go through the `crash_*!` macros below, which format into a fixed stack buffer and
//! hand the bytes straight to `write(2)`. Setup code (install, the report store, configuration)
//! logs with `tracing` like the rest of the workspace.
//!
//! When a console log file is configured, lines are appended to it instead of stderr, and the
//! report writer embeds that file under `debug.console_log`.

use super::fixed_string::FixedString;
use super::raw_io;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use std::fs::OpenOptions;
use std::os::fd::IntoRawFd;
use std::path::Path;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicI32, AtomicU8};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

const LOG_LINE_LENGTH: usize = 1024;

static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static LOG_FD: AtomicI32 = AtomicI32::new(-1);

pub fn set_log_level(level: LogLevel) {
    LEVEL.store(level as u8, SeqCst);
}

pub fn log_enabled(level: LogLevel) -> bool {
    level as u8 <= LEVEL.load(SeqCst)
}

/// Sends crash-path log lines to `path` instead of stderr.
///
/// With `overwrite` the previous content is discarded, otherwise lines are appended.
/// Must not be called while a crash is being handled.
pub fn set_log_file(path: &Path, overwrite: bool) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.create(true);
    if overwrite {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    let fd = options.open(path)?.into_raw_fd();
    let old = LOG_FD.swap(fd, SeqCst);
    if old >= 0 {
        // SAFETY: the old descriptor came from `into_raw_fd` above and is no longer published.
        unsafe { libc::close(old) };
    }
    Ok(())
}

/// Goes back to logging on stderr.
pub fn close_log_file() {
    let old = LOG_FD.swap(-1, SeqCst);
    if old >= 0 {
        // SAFETY: see `set_log_file`.
        unsafe { libc::close(old) };
    }
}

/// Empties the console log file, if one is configured.
pub fn clear_log_file() {
    let fd = LOG_FD.load(SeqCst);
    if fd >= 0 {
        // SAFETY: plain syscalls on a descriptor we own.
        unsafe {
            libc::ftruncate(fd, 0);
            libc::lseek(fd, 0, libc::SEEK_SET);
        }
    }
}

/// Formats and writes one log line without allocating.
pub fn write_log(level: LogLevel, module: &str, args: fmt::Arguments<'_>) {
    if !log_enabled(level) {
        return;
    }
    let mut line = FixedString::<LOG_LINE_LENGTH>::new();
    let module = module.rsplit("::").next().unwrap_or(module);
    let _ = write!(line, "{} {}: ", level.as_str(), module);
    let _ = line.write_fmt(args);

    // One write per line so concurrent writers do not interleave mid-line.
    let mut out = [0u8; LOG_LINE_LENGTH + 1];
    let len = line.len();
    out[..len].copy_from_slice(line.as_bytes());
    out[len] = b'\n';

    let fd = match LOG_FD.load(SeqCst) {
        fd if fd >= 0 => fd,
        _ => libc::STDERR_FILENO,
    };
    // Nothing sensible can be done if logging itself fails.
    let _ = raw_io::write_all(fd, &out[..=len]);
}

macro_rules! crash_log {
    ($level:expr, $($arg:tt)+) => {
        $crate::shared::log::write_log($level, module_path!(), format_args!($($arg)+))
    };
}

macro_rules! crash_error {
    ($($arg:tt)+) => { $crate::shared::log::crash_log!($crate::shared::log::LogLevel::Error, $($arg)+) };
}

macro_rules! crash_warn {
    ($($arg:tt)+) => { $crate::shared::log::crash_log!($crate::shared::log::LogLevel::Warn, $($arg)+) };
}

macro_rules! crash_info {
    ($($arg:tt)+) => { $crate::shared::log::crash_log!($crate::shared::log::LogLevel::Info, $($arg)+) };
}

macro_rules! crash_debug {
    ($($arg:tt)+) => { $crate::shared::log::crash_log!($crate::shared::log::LogLevel::Debug, $($arg)+) };
}

pub(crate) use {crash_debug, crash_error, crash_info, crash_log, crash_warn};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        set_log_level(LogLevel::Warn);
        assert!(log_enabled(LogLevel::Error));
        assert!(log_enabled(LogLevel::Warn));
        assert!(!log_enabled(LogLevel::Info));
        set_log_level(LogLevel::Info);
        assert!(log_enabled(LogLevel::Info));
        assert!(!log_enabled(LogLevel::Debug));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_log_file_receives_lines() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ConsoleLog.txt");
        set_log_file(&path, true)?;
        crash_warn!("first {}", 1);
        crash_error!("second");
        let content = std::fs::read_to_string(&path)?;
        clear_log_file();
        let cleared = std::fs::read_to_string(&path)?;
        close_log_file();

        // Other tests may log concurrently, so only look for our own lines.
        assert!(content.lines().any(|l| l == "WARN tests: first 1"), "{content}");
        assert!(content.lines().any(|l| l == "ERROR tests: second"), "{content}");
        assert!(cleared.is_empty() || !cleared.contains("first 1"));
        Ok(())
    }
}
