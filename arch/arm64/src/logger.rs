// =============================================================================
// Tern OS - Kernel Logger
// =============================================================================
// `log` backend writing colored `[LEVEL] [target] message` lines to the UART.
// =============================================================================

use log::{Level, LevelFilter, Log, Metadata, Record};

pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => "\x1b[1;31m",
            Level::Warn => "\x1b[1;33m",
            Level::Info => "\x1b[1;32m",
            Level::Debug => "\x1b[0;36m",
            Level::Trace => "\x1b[0;90m",
        };
        crate::println!(
            "{}[{:>5}]\x1b[0m [{}] {}",
            color,
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the UART logger. A second call keeps the first logger.
pub fn install(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
