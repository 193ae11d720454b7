//! Log facade wiring.
//!
//! This crate owns the [`log::Log`] implementation; where the records end up
//! is decided by whoever implements [`LogSinkIf`] (the kernel routes them
//! into its ring buffer). The indirection keeps every library crate free to
//! use the `log` macros without linking a sink.

#![no_std]

use crate_interface::call_interface;
use log::LevelFilter;

struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        call_interface!(LogSinkIf::write_log(record));
    }

    fn flush(&self) {}
}

/// Destination of formatted log records.
#[crate_interface::def_interface]
pub trait LogSinkIf: Send + Sync {
    fn write_log(record: &log::Record);
}

/// Installs the logger and picks the level from the `LOG` environment
/// variable at build time.
pub fn init() {
    static LOGGER: SimpleLogger = SimpleLogger;
    log::set_logger(&LOGGER).ok();
    log::set_max_level(match option_env!("LOG") {
        Some("trace") => LevelFilter::Trace,
        Some("debug") => LevelFilter::Debug,
        Some("info") => LevelFilter::Info,
        Some("warn") => LevelFilter::Warn,
        Some("error") => LevelFilter::Error,
        _ => LevelFilter::Off,
    });
}
