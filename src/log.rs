//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for
//! details.
//!
//! Example:
//! ```no_run
//! use log::{info, LevelFilter};
//! use filament::log::StderrLogger;
//!
//! static LOGGER: StderrLogger = StderrLogger::new();
//! log::set_logger(&LOGGER).unwrap();
//! log::set_max_level(LevelFilter::Debug);
//! # let username = "Dave";
//! info!("Hello {}", username);
//! ```
//!
//! Records are annotated with the name of the fiber that produced them, so
//! interleaved output from several fibers stays attributable.

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};

/// [Log](https://docs.rs/log/latest/log/trait.Log.html) trait implementation
/// writing to standard error.
///
/// The line format is `LEVEL [fiber-name] file:line: message`. When the
/// runtime is not initialized yet the fiber annotation is the OS thread name.
pub struct StderrLogger {
    filter: Option<fn(&Metadata) -> bool>,
}

impl StderrLogger {
    #[inline(always)]
    pub const fn new() -> Self {
        StderrLogger { filter: None }
    }

    /// A logger which drops records rejected by `filter` regardless of the
    /// global max level.
    #[inline(always)]
    pub const fn with_filter(filter: fn(&Metadata) -> bool) -> Self {
        StderrLogger {
            filter: Some(filter),
        }
    }
}

impl Default for StderrLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for StderrLogger {
    #[inline]
    fn enabled(&self, metadata: &Metadata) -> bool {
        if let Some(filter) = self.filter {
            if !filter(metadata) {
                return false;
            }
        }
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let who = crate::fiber::current_name_for_diagnostics();
        let stderr = std::io::stderr();
        let mut stderr = stderr.lock();
        // A single write_fmt keeps lines whole when fibers interleave.
        let _ = writeln!(
            stderr,
            "{} [{}] {}:{}: {}",
            record.level(),
            who.as_deref().unwrap_or("-"),
            record.file().unwrap_or_default(),
            record.line().unwrap_or(0),
            record.args(),
        );
    }

    #[inline(always)]
    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger::new();

/// Install the [`StderrLogger`] as the global logger.
///
/// The max level is taken from the `FILAMENT_LOG` environment variable
/// (`error`, `warn`, `info`, `debug`, `trace` or `off`), defaulting to
/// `warn`. Does nothing if a logger is already installed.
pub fn init() {
    let level = std::env::var("FILAMENT_LOG")
        .ok()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Warn);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Map a verbosity knob (0 = warn, 1 = info, 2 = debug, 3+ = trace) to a
/// level filter. Convenience for CLI-style embedders.
#[inline]
pub fn verbosity_to_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_mapping() {
        assert_eq!(verbosity_to_level(0), LevelFilter::Warn);
        assert_eq!(verbosity_to_level(2), LevelFilter::Debug);
        assert_eq!(verbosity_to_level(9), LevelFilter::Trace);
    }
}
