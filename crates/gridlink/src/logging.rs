// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Logger backend for the `log` facade.
//!
//! The library logs through `log::debug!`/`info!`/`warn!`/`error!` with
//! bracketed component prefixes (`[suc]`, `[broker]`, ...). The daemons call
//! [`init`] once at startup; verbosity comes from the broker config
//! (0 = error .. 3 = debug). Output goes to stderr, or to a file when a
//! path is given.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Map a config verbosity (0-3) to a `log` level filter.
pub fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

enum Sink {
    Stderr,
    File(Mutex<std::fs::File>),
}

struct Logger {
    sink: Sink,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[{}] {}\n", level_tag(record.level()), record.args());
        match &self.sink {
            Sink::Stderr => eprint!("{}", line),
            Sink::File(file) => {
                let mut file = match file.lock() {
                    Ok(lock) => lock,
                    Err(e) => e.into_inner(),
                };
                let _ = file.write_all(line.as_bytes());
            }
        }
    }

    fn flush(&self) {
        match &self.sink {
            Sink::Stderr => {
                let _ = io::stderr().flush();
            }
            Sink::File(file) => {
                let mut file = match file.lock() {
                    Ok(lock) => lock,
                    Err(e) => e.into_inner(),
                };
                let _ = file.flush();
            }
        }
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Install the stderr logger at the given verbosity.
///
/// A second call is ignored (the `log` crate permits one global logger).
pub fn init(verbosity: u8) {
    let logger = Box::new(Logger { sink: Sink::Stderr });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level_from_verbosity(verbosity));
    }
}

/// Install a file logger at the given verbosity.
pub fn init_file(path: &str, verbosity: u8) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let logger = Box::new(Logger {
        sink: Sink::File(Mutex::new(file)),
    });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level_from_verbosity(verbosity));
    }
    Ok(())
}
