//! Logging backends for the `log` facade.
//!
//! Records share one on-disk layout:
//!
//! ```text
//! YYYYMMDD HH:MM:SS.mmm [  pid] [ LEVEL] payload - file:line
//! ```
//!
//! with UTC timestamps. [`init`] logs synchronously to stdout,
//! [`init_file`] to a plain file, and [`init_async`] through the
//! double-buffered background writer in [`AsyncLogging`]. Fatal records
//! (invariant violations, configuration failures) bypass any async sink:
//! they are written and flushed synchronously before the process aborts.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

mod async_log;
mod log_file;

pub use async_log::{AsyncLogging, DEFAULT_FLUSH_INTERVAL, DEFAULT_ROLL_SIZE};

macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::logger::fatal_impl(format_args!($($arg)*), file!(), line!())
    };
}

pub(crate) use fatal;

/// Install the stdout logger.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(SyncLogger::stdout()))?;
    log::set_max_level(default_level());
    Ok(())
}

/// Install a synchronous file logger.
pub fn init_file<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let logger = SyncLogger::file(path.as_ref())?;
    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;
    log::set_max_level(default_level());
    Ok(())
}

/// Install the asynchronous sink and start its background thread.
///
/// Returns a handle to the running sink; call [`AsyncLogging::stop`] to
/// drain it at shutdown.
pub fn init_async<P: Into<PathBuf>>(
    basename: P,
    roll_size: u64,
    flush_interval: Duration,
) -> Result<AsyncLogging, SetLoggerError> {
    let sink = AsyncLogging::new(basename, roll_size, flush_interval);
    sink.start();
    log::set_boxed_logger(Box::new(AsyncLogger { sink: sink.clone() }))?;
    log::set_max_level(default_level());
    Ok(sink)
}

pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Trace => "[ TRACE]",
        Level::Debug => "[ DEBUG]",
        Level::Info => "[  INFO]",
        Level::Warn => "[  WARN]",
        Level::Error => "[ ERROR]",
    }
}

pub(crate) fn utc_now() -> (libc::tm, u32) {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (utc_tm(elapsed.as_secs() as libc::time_t), elapsed.subsec_millis())
}

pub(crate) fn utc_tm(secs: libc::time_t) -> libc::tm {
    let mut tm: libc::tm = unsafe { mem::zeroed() };
    unsafe {
        libc::gmtime_r(&secs, &mut tm);
    }
    tm
}

fn timestamp() -> String {
    let (tm, millis) = utc_now();
    format!(
        "{:04}{:02}{:02} {:02}:{:02}:{:02}.{:03}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        millis
    )
}

fn short_file(file: &str) -> &str {
    file.rsplit('/').next().unwrap_or(file)
}

fn format_record(tag: &str, args: &fmt::Arguments, file: &str, line: u32) -> String {
    format!(
        "{} [{:>5}] {} {} - {}:{}\n",
        timestamp(),
        process::id(),
        tag,
        args,
        short_file(file),
        line
    )
}

fn render(record: &Record) -> String {
    format_record(
        level_tag(record.level()),
        record.args(),
        record.file().unwrap_or("?"),
        record.line().unwrap_or(0),
    )
}

/// Format and synchronously flush a fatal record, then abort.
pub(crate) fn fatal_impl(args: fmt::Arguments, file: &str, line: u32) -> ! {
    let line = format_record("[ FATAL]", &args, file, line);
    let mut stderr = io::stderr();
    let _ = stderr.write_all(line.as_bytes());
    let _ = stderr.flush();
    log::logger().flush();
    process::abort();
}

enum Sink {
    Stdout,
    File(File),
}

struct SyncLogger {
    sink: Mutex<Sink>,
}

impl SyncLogger {
    fn stdout() -> SyncLogger {
        SyncLogger {
            sink: Mutex::new(Sink::Stdout),
        }
    }

    fn file(path: &Path) -> io::Result<SyncLogger> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(SyncLogger {
            sink: Mutex::new(Sink::File(file)),
        })
    }
}

impl Log for SyncLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = render(record);
        let mut sink = self.sink.lock().unwrap();
        match &mut *sink {
            Sink::Stdout => {
                let mut out = io::stdout();
                let _ = out.write_all(line.as_bytes());
                let _ = out.flush();
            }
            Sink::File(file) => {
                let _ = file.write_all(line.as_bytes());
                let _ = file.flush();
            }
        }
    }

    fn flush(&self) {
        if let Sink::File(file) = &mut *self.sink.lock().unwrap() {
            let _ = file.flush();
        }
    }
}

struct AsyncLogger {
    sink: AsyncLogging,
}

impl Log for AsyncLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.sink.append(render(record).as_bytes());
    }

    fn flush(&self) {}
}
