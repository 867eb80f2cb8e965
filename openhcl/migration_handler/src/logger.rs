// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Logging support for the migration handler.
//!
//! The handler performs no filtering of its logging messages. Setup runs
//! before migration begins, and the command loop itself logs only at entry;
//! nothing derived from guest memory contents goes through this path.

use crate::arch::Serial;
use crate::single_threaded::SingleThreaded;
use core::cell::RefCell;
use core::fmt;
use core::fmt::Write;

/// The logging type to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerType {
    /// Log over a COM port.
    Serial,
}

enum Logger {
    Serial(Serial),
    None,
}

impl Logger {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match self {
            Logger::Serial(serial) => serial.write_str(s),
            Logger::None => Ok(()),
        }
    }
}

/// See [`MIGRATION_LOGGER`].
pub struct MigrationLogger {
    logger: SingleThreaded<RefCell<Logger>>,
}

/// The static logger used by the crate's `log!` macro.
pub static MIGRATION_LOGGER: MigrationLogger = MigrationLogger {
    logger: SingleThreaded(RefCell::new(Logger::None)),
};

/// Initialize the logger. This replaces any previous init calls.
pub fn logger_init(logger_type: LoggerType) {
    let mut logger = MIGRATION_LOGGER.logger.borrow_mut();

    *logger = match logger_type {
        LoggerType::Serial => Logger::Serial(Serial::init()),
    };
}

impl Write for &MigrationLogger {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.logger.borrow_mut().write_str(s)
    }
}

/// Log a message. These messages are always emitted regardless of debug or
/// release, if a corresponding logger was configured.
macro_rules! log {
    () => {};
    ($($arg:tt)*) => {
        {
            use core::fmt::Write;
            let _ = writeln!(&$crate::logger::MIGRATION_LOGGER, $($arg)*);
        }
    };
}

pub(crate) use log;
