//! Log routing for host applications.
//!
//! The engine emits `tracing` events. Hosts have two ways to receive them:
//!
//! - Native hosts and tests call [`init_tracing`] to install a
//!   `tracing-subscriber` formatter filtered by `RUST_LOG`.
//! - Embedding hosts (a browser extension background page, a mobile shell)
//!   implement [`Logger`] and register it with [`set_logger`]. Without a
//!   subscriber installed, `tracing` forwards events to the `log` facade, which
//!   this module routes to the registered [`Logger`].

use std::sync::{Arc, OnceLock};

use tracing_subscriber::EnvFilter;

/// Sink for log messages provided by the embedding host.
///
/// # Examples
///
/// ```rust
/// use ledgervault_core::logger::{LogLevel, Logger};
///
/// struct ConsoleLogger;
///
/// impl Logger for ConsoleLogger {
///     fn log(&self, level: LogLevel, message: String) {
///         println!("[{level:?}] {message}");
///     }
/// }
/// ```
pub trait Logger: Sync + Send {
    /// Logs a message at the specified log level.
    fn log(&self, level: LogLevel, message: String);
}

/// Severity of a forwarded log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Very detailed diagnostics.
    Trace,
    /// Debugging information.
    Debug,
    /// Progress of normal operations.
    Info,
    /// Recoverable anomalies (skipped blobs, failed queue attempts).
    Warn,
    /// Failures surfaced to the caller.
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Self::Error,
            log::Level::Warn => Self::Warn,
            log::Level::Info => Self::Info,
            log::Level::Debug => Self::Debug,
            log::Level::Trace => Self::Trace,
        }
    }
}

/// `log::Log` implementation forwarding to the registered [`Logger`].
struct ForeignLogger;

impl log::Log for ForeignLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let from_vault = record
            .module_path()
            .is_some_and(|module_path| module_path.starts_with("ledgervault"));
        let verbose = matches!(record.level(), log::Level::Debug | log::Level::Trace);

        // Dependency chatter below info is dropped.
        if verbose && !from_vault {
            return;
        }

        if let Some(logger) = LOGGER_INSTANCE.get() {
            logger.log(record.level().into(), format!("{}", record.args()));
        }
    }

    fn flush(&self) {}
}

static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Registers the host logger.
///
/// Only the first registration takes effect; later calls are ignored.
pub fn set_logger(logger: Arc<dyn Logger>) {
    if LOGGER_INSTANCE.set(logger).is_err() {
        tracing::debug!("host logger already set");
        return;
    }

    static LOGGER: ForeignLogger = ForeignLogger;
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Trace);
    }
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (for example `"ledgervault_core=debug"`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(LogLevel::from(log::Level::Warn), LogLevel::Warn);
        assert_eq!(LogLevel::from(log::Level::Trace), LogLevel::Trace);
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        let _ = init_tracing("ledgervault_core=debug");
        assert!(!init_tracing("ledgervault_core=debug"));
    }
}
