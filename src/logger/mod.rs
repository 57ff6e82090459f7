//! Logging front end: a [`log::Log`] implementation that formats each record
//! into a small fixed buffer and hands the finished line to a sink — the
//! async back end when file logging is configured, stdout otherwise.

pub mod async_logging;
pub mod fixed;
pub mod log_file;

use std::cell::RefCell;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Local;
use log::{Level, LevelFilter, Metadata, Record};

use crate::config::LogConfig;
use crate::error::Result;
use crate::logger::async_logging::AsyncLogging;
use crate::logger::fixed::{FixedBuffer, SMALL_BUFFER};

const COLOR_RESET: &str = "\x1b[0m";

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[31m",
        Level::Warn => "\x1b[33m",
        Level::Info => "\x1b[32m",
        Level::Debug | Level::Trace => "\x1b[34m",
    }
}

fn level_tag(level: Level) -> char {
    match level {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug | Level::Trace => 'D',
    }
}

/// Small sequential ids instead of the opaque `ThreadId` debug format.
fn current_tid() -> u64 {
    static NEXT_TID: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TID: u64 = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|tid| *tid)
}

enum Sink {
    Stdout,
    Async(Arc<AsyncLogging>),
}

pub struct HearthLogger {
    level: LevelFilter,
    colorful: bool,
    sink: Sink,
}

impl HearthLogger {
    /// `1=Debug 2=Info 3=Warning 4=Error 5=None`, matching the config file.
    fn level_from_config(level: u8) -> LevelFilter {
        match level {
            0 | 1 => LevelFilter::Debug,
            2 => LevelFilter::Info,
            3 => LevelFilter::Warn,
            4 => LevelFilter::Error,
            _ => LevelFilter::Off,
        }
    }

    fn format_line(&self, buf: &mut FixedBuffer<SMALL_BUFFER>, record: &Record) {
        if self.colorful {
            buf.append(level_color(record.level()).as_bytes());
        }
        let _ = write!(
            buf,
            "{} {:>5} {}: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            current_tid(),
            level_tag(record.level()),
            record.args()
        );
        if let (Some(file), Some(line)) = (record.file(), record.line()) {
            let _ = write!(buf, " - {file}:{line}");
        }
        if self.colorful {
            buf.append(COLOR_RESET.as_bytes());
        }
        buf.append(b"\n");
    }
}

impl log::Log for HearthLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        thread_local! {
            static LINE: RefCell<FixedBuffer<SMALL_BUFFER>> = RefCell::new(FixedBuffer::new());
        }
        LINE.with(|line| {
            let mut line = line.borrow_mut();
            line.clear();
            self.format_line(&mut line, record);
            match &self.sink {
                Sink::Stdout => {
                    let _ = std::io::stdout().write_all(line.as_bytes());
                }
                Sink::Async(back_end) => back_end.append(line.as_bytes()),
            }
        });
        if record.level() == Level::Error {
            self.flush();
        }
    }

    fn flush(&self) {
        match &self.sink {
            Sink::Stdout => {
                let _ = std::io::stdout().flush();
            }
            Sink::Async(back_end) => back_end.flush(),
        }
    }
}

/// Installs the global logger per the `log` section of the config. Returns
/// the async back end (when file logging is on) so the caller can stop it on
/// shutdown.
pub fn init(config: &LogConfig) -> Result<Option<Arc<AsyncLogging>>> {
    let level = HearthLogger::level_from_config(config.level);
    let (sink, back_end) = if config.output_to_file {
        let back_end = Arc::new(AsyncLogging::start(
            PathBuf::from(&config.directory),
            &config.basename,
            config.size * 1024 * 1024,
        )?);
        (Sink::Async(Arc::clone(&back_end)), Some(back_end))
    } else {
        (Sink::Stdout, None)
    };
    let logger = HearthLogger {
        level,
        colorful: config.colorful,
        sink,
    };
    log::set_boxed_logger(Box::new(logger))
        .map_err(|err| crate::error::Error::Config(format!("logger already installed: {err}")))?;
    log::set_max_level(level);
    Ok(back_end)
}

#[cfg(test)]
mod test {
    use super::*;

    fn record_line(logger: &HearthLogger, level: Level, msg: &str) -> String {
        let mut buf = FixedBuffer::new();
        logger.format_line(
            &mut buf,
            &Record::builder()
                .level(level)
                .args(format_args!("{msg}"))
                .file(Some("src/server.rs"))
                .line(Some(42))
                .build(),
        );
        String::from_utf8(buf.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn line_carries_timestamp_tid_tag_message_and_location() {
        let logger = HearthLogger {
            level: LevelFilter::Debug,
            colorful: false,
            sink: Sink::Stdout,
        };
        let line = record_line(&logger, Level::Info, "server started");
        assert!(line.ends_with("I: server started - src/server.rs:42\n"), "{line}");
        // `YYYY-MM-DD HH:MM:SS.ffffff` prefix.
        assert_eq!(Some('-'), line.chars().nth(4));
        assert_eq!(Some(':'), line.chars().nth(13));
        assert_eq!(Some('.'), line.chars().nth(19));
    }

    #[test]
    fn colorful_lines_are_wrapped_in_ansi_codes() {
        let logger = HearthLogger {
            level: LevelFilter::Debug,
            colorful: true,
            sink: Sink::Stdout,
        };
        let line = record_line(&logger, Level::Warn, "low disk");
        assert!(line.starts_with("\x1b[33m"));
        assert!(line.ends_with("\x1b[0m\n"));
    }

    #[test]
    fn config_levels_map_to_filters() {
        assert_eq!(LevelFilter::Debug, HearthLogger::level_from_config(1));
        assert_eq!(LevelFilter::Info, HearthLogger::level_from_config(2));
        assert_eq!(LevelFilter::Warn, HearthLogger::level_from_config(3));
        assert_eq!(LevelFilter::Error, HearthLogger::level_from_config(4));
        assert_eq!(LevelFilter::Off, HearthLogger::level_from_config(5));
    }

    #[test]
    fn tids_are_stable_within_a_thread_and_distinct_across_threads() {
        let here = current_tid();
        assert_eq!(here, current_tid());
        let there = std::thread::spawn(current_tid).join().unwrap();
        assert_ne!(here, there);
    }
}
