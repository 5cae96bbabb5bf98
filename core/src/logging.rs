//! Logging setup
//!
//! `tracing` everywhere, one subscriber per process. The filter sits behind a
//! reload handle so `setLogLevel` can change verbosity at runtime.

use crate::NearbyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use tracing::debug;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt as fmt_layer, reload, EnvFilter, Registry};

/// Bridge-facing verbosity, 0 (silent) to 5 (everything)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LogLevel {
    None = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    /// `EnvFilter` directive for this level
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::None => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "trace",
        }
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = NearbyError;

    fn try_from(value: u8) -> Result<Self, NearbyError> {
        match value {
            0 => Ok(LogLevel::None),
            1 => Ok(LogLevel::Error),
            2 => Ok(LogLevel::Warn),
            3 => Ok(LogLevel::Info),
            4 => Ok(LogLevel::Debug),
            5 => Ok(LogLevel::Verbose),
            other => Err(NearbyError::InvalidConfiguration(format!(
                "log level {} outside 0..=5",
                other
            ))),
        }
    }
}

impl From<LogLevel> for u8 {
    fn from(level: LogLevel) -> Self {
        level as u8
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.directive())
    }
}

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();
static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set. Returns false if a subscriber was
/// already installed (tests, or a host that brings its own).
pub fn init_logging(level: LogLevel) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    let (filter, handle) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer::layer().with_target(true))
        .try_init()
        .is_ok();

    if installed {
        let _ = FILTER_HANDLE.set(handle);
    }
    CURRENT_LEVEL.store(level.into(), Ordering::Relaxed);
    installed
}

/// Change verbosity of the installed subscriber
pub fn set_log_level(level: LogLevel) -> Result<(), NearbyError> {
    CURRENT_LEVEL.store(level.into(), Ordering::Relaxed);
    if let Some(handle) = FILTER_HANDLE.get() {
        handle
            .reload(EnvFilter::new(level.directive()))
            .map_err(|e| {
                NearbyError::InvalidConfiguration(format!("log filter reload failed: {}", e))
            })?;
    }
    Ok(())
}

pub fn current_log_level() -> LogLevel {
    LogLevel::try_from(CURRENT_LEVEL.load(Ordering::Relaxed)).unwrap_or(LogLevel::Info)
}

/// Hex dump of a payload at debug level
pub fn log_hex(label: &str, bytes: &[u8]) {
    debug!("{} ({} bytes): {}", label, bytes.len(), hex::encode_upper(bytes));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(LogLevel::try_from(0).unwrap().directive(), "off");
        assert_eq!(LogLevel::try_from(3).unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::try_from(5).unwrap().directive(), "trace");
        assert!(LogLevel::try_from(6).is_err());
    }

    #[test]
    fn test_level_serde_as_number() {
        assert_eq!(serde_json::to_string(&LogLevel::Warn).unwrap(), "2");
        let level: LogLevel = serde_json::from_str("4").unwrap();
        assert_eq!(level, LogLevel::Debug);
        assert!(serde_json::from_str::<LogLevel>("9").is_err());
    }

    #[test]
    fn test_set_log_level_tracks_current() {
        init_logging(LogLevel::Info);
        set_log_level(LogLevel::Debug).unwrap();
        assert_eq!(current_log_level(), LogLevel::Debug);
        set_log_level(LogLevel::Info).unwrap();
        assert_eq!(current_log_level(), LogLevel::Info);
    }
}
