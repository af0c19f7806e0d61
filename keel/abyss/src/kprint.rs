//! Kernel print utilities.

use crate::spinlock::SpinLock;
use core::fmt::Write;
use std::io::Write as _;

/// Serial port sink.
///
/// The machine's COM1 line is wired to the host's standard error.
pub struct Com1Sink {
    _p: (),
}

impl Com1Sink {
    const fn new() -> Self {
        Self { _p: () }
    }

    /// Writes raw bytes to the serial line.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let _ = std::io::stderr().write_all(bytes);
    }
}

impl core::fmt::Write for Com1Sink {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        eprint!("{s}");
        Ok(())
    }
}

static SERIAL: SpinLock<Com1Sink> = SpinLock::new(Com1Sink::new());

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let mut guard = SERIAL.lock();
    let _ = write!(&mut *guard, "{fmt}");
    guard.unlock();
}

/// Puts raw bytes on the serial line.
pub fn put_bytes(bytes: &[u8]) {
    let mut guard = SERIAL.lock();
    guard.write_bytes(bytes);
    guard.unlock();
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the serial console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the serial console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// A [`log::Log`] implementation writing `[LEVEL] message` lines to the
/// serial console.
pub struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
            && !crate::QUITE.load(core::sync::atomic::Ordering::SeqCst)
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            log::Level::Error => "ERROR",
            log::Level::Warn => "WARN",
            log::Level::Info => "INFO",
            log::Level::Debug => "DEBUG",
            log::Level::Trace => "TRACE",
        };
        crate::print!("[{}] {}\n", tag, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Installs the [`SerialLogger`] as the global logger.
///
/// The logger is installed once per host process; later calls only adjust the
/// maximum level.
pub fn init_logger(level: log::LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
