//! Structured logging for scenario runs.
//!
//! Levels, most to least severe:
//! - ERROR: Failures that abort a task or the whole run
//! - WARN: Recoverable surprises (option overrides, retried assertions)
//! - INFO: Run milestones (setup steps, task start/finish, fleet lifecycle)
//! - DEBUG: Requests, command lines, receipts
//! - TRACE: Response bodies and poll iterations
//!
//! Every line goes to the scenario log file once [`set_log_file`] was
//! called; lines at or above the echo level are mirrored to stderr. Several
//! runs of one scenario share the file, so each line carries the run tag set
//! by [`set_run`].
//!
//! Debug mode can be enabled with `--debug` flag or `SP_DEBUG=1` env var.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Mutex;

static LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);
static FILE_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static ECHO_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static ECHO_ENABLED: AtomicBool = AtomicBool::new(false);
/// Current run number, or -1 before a run number is allocated.
static RUN: AtomicI64 = AtomicI64::new(-1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl From<u8> for LogLevel {
    fn from(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        })
    }
}

/// Pick levels from the debug flag or `SP_DEBUG` and start echoing to
/// stderr. Nothing is written to disk until [`set_log_file`].
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug
        || std::env::var("SP_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    // The file always gets debug detail; stderr only in debug mode.
    FILE_LEVEL.store(LogLevel::Debug as u8, Ordering::SeqCst);
    let echo = if debug_enabled {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    ECHO_LEVEL.store(echo as u8, Ordering::SeqCst);
    ECHO_ENABLED.store(true, Ordering::SeqCst);
}

/// Append all further lines to `path`, creating its directory.
pub fn set_log_file(path: &Path) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    *LOG_PATH.lock().unwrap_or_else(|e| e.into_inner()) = Some(path.to_path_buf());
}

/// Tag further lines with `run-<NNN>`.
pub fn set_run(run_number: u32) {
    RUN.store(i64::from(run_number), Ordering::SeqCst);
}

pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn format_line(timestamp: &str, run: Option<u32>, level: LogLevel, msg: &str) -> String {
    match run {
        Some(run) => format!("{} run-{:03} {:<5} {}", timestamp, run, level, msg),
        None => format!("{} {:<5} {}", timestamp, level, msg),
    }
}

/// Write `msg` at `level` to the file and, if loud enough, to stderr.
pub fn log_at(level: LogLevel, msg: &str) {
    let to_file = level <= LogLevel::from(FILE_LEVEL.load(Ordering::Relaxed));
    let to_echo = ECHO_ENABLED.load(Ordering::Relaxed)
        && level <= LogLevel::from(ECHO_LEVEL.load(Ordering::Relaxed));
    if !to_file && !to_echo {
        return;
    }

    let run = u32::try_from(RUN.load(Ordering::Relaxed)).ok();
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
    let line = format_line(&timestamp, run, level, msg);

    if to_file {
        let path = LOG_PATH.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(path) = path {
            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(file, "{}", line);
            }
        }
    }
    if to_echo {
        eprintln!("{}", line);
    }
}

#[macro_export]
macro_rules! plog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! plog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! plog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// Only reaches stderr in debug mode; always written to the run log.
#[macro_export]
macro_rules! plog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! plog_trace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
    };
}
