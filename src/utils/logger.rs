//! Logging utilities
//!
//! Subscriber setup for the binary.

use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Variable that replaces the level-derived filter when set
const LOG_ENV: &str = "SUITE_HARNESS_LOG";

/// Log level configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    pub fn from_verbosity(verbose: bool, quiet: bool) -> Self {
        match (verbose, quiet) {
            (true, _) => LogLevel::Debug,
            (false, true) => LogLevel::Warn,
            (false, false) => LogLevel::Info,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Unknown log level: {s}")),
        }
    }
}

/// Filter directive for `level`, scoped to this crate
fn default_directive(level: LogLevel) -> String {
    format!("suite_harness={}", level.to_tracing_level())
}

/// Initialize the logger with specified level
///
/// `SUITE_HARNESS_LOG`, then `RUST_LOG`, take precedence over `level`.
pub fn init_logger(level: LogLevel) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("info".parse(), Ok(LogLevel::Info));
        assert_eq!("DEBUG".parse(), Ok(LogLevel::Debug));
        assert!("unknown".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_verbosity() {
        assert_eq!(LogLevel::from_verbosity(true, true), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(false, true), LogLevel::Warn);
        assert_eq!(LogLevel::from_verbosity(false, false), LogLevel::Info);
        assert_eq!(default_directive(LogLevel::Debug), "suite_harness=DEBUG");
    }
}
