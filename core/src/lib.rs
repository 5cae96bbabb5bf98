// Nearby Multipeer: dual-transport discovery and connection engine
//
// Session-protocol peers and BLE peripherals live in one endpoint space and go
// through one connection lifecycle. Platform radios plug in behind the adapter
// traits in `transport::abstraction`.

pub mod config;
pub mod engine;
pub mod logging;
pub mod transport;

use thiserror::Error;

pub use config::{parse_service_uuid, EngineConfig, DEFAULT_SERVICE_UUID};
pub use engine::{
    ConnectionState, ConnectionStatus, EndpointInfo, EngineStatus, NearbyEngine, NearbyEvent,
    TransferStatus,
};
pub use logging::{init_logging, set_log_level, LogLevel};
pub use transport::{
    AdapterEvent, AdapterEventSender, BleCentral, BlePeripheral, DeviceFamily, LoopbackDevice,
    LoopbackMedium, SessionTransport, TransportError, TransportKind, Transports,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors returned by engine commands
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NearbyError {
    #[error("Not initialized: {0}")]
    NotInitialized(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),
    #[error("Connection timed out: {0}")]
    ConnectionTimeout(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Radio command timed out: {0}")]
    RadioCommandTimeout(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Already in progress: {0}")]
    AlreadyInProgress(String),
}

impl NearbyError {
    /// Stable machine-readable code for bridge layers
    pub fn code(&self) -> &'static str {
        match self {
            NearbyError::NotInitialized(_) => "NOT_INITIALIZED",
            NearbyError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            NearbyError::EndpointNotFound(_) => "ENDPOINT_NOT_FOUND",
            NearbyError::ConnectionTimeout(_) => "CONNECTION_TIMEOUT",
            NearbyError::ConnectionFailed(_) => "CONNECTION_FAILED",
            NearbyError::RadioCommandTimeout(_) => "RADIO_COMMAND_TIMEOUT",
            NearbyError::SendFailed(_) => "SEND_FAILED",
            NearbyError::AlreadyInProgress(_) => "ALREADY_IN_PROGRESS",
        }
    }

    /// Human-readable detail without the variant prefix
    pub fn detail(&self) -> &str {
        match self {
            NearbyError::NotInitialized(d)
            | NearbyError::InvalidConfiguration(d)
            | NearbyError::EndpointNotFound(d)
            | NearbyError::ConnectionTimeout(d)
            | NearbyError::ConnectionFailed(d)
            | NearbyError::RadioCommandTimeout(d)
            | NearbyError::SendFailed(d)
            | NearbyError::AlreadyInProgress(d) => d,
        }
    }
}

impl From<transport::RadioError> for NearbyError {
    fn from(err: transport::RadioError) -> Self {
        match err {
            transport::RadioError::Timeout { .. } => {
                NearbyError::RadioCommandTimeout(err.to_string())
            }
            transport::RadioError::Failed { .. } => NearbyError::ConnectionFailed(err.to_string()),
            transport::RadioError::Cancelled(_) => NearbyError::NotInitialized(err.to_string()),
        }
    }
}

impl From<transport::TransportError> for NearbyError {
    fn from(err: transport::TransportError) -> Self {
        NearbyError::ConnectionFailed(err.to_string())
    }
}

impl From<engine::DirectoryError> for NearbyError {
    fn from(err: engine::DirectoryError) -> Self {
        match err {
            engine::DirectoryError::NotFound(id) => NearbyError::EndpointNotFound(id),
            other => NearbyError::AlreadyInProgress(other.to_string()),
        }
    }
}

impl From<transport::ScannerError> for NearbyError {
    fn from(err: transport::ScannerError) -> Self {
        NearbyError::InvalidConfiguration(err.to_string())
    }
}

impl From<transport::GattError> for NearbyError {
    fn from(err: transport::GattError) -> Self {
        NearbyError::SendFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            NearbyError::NotInitialized("x".into()).code(),
            "NOT_INITIALIZED"
        );
        assert_eq!(
            NearbyError::AlreadyInProgress("x".into()).code(),
            "ALREADY_IN_PROGRESS"
        );
        assert_eq!(
            NearbyError::RadioCommandTimeout("x".into()).code(),
            "RADIO_COMMAND_TIMEOUT"
        );
    }

    #[test]
    fn test_error_detail() {
        let err = NearbyError::EndpointNotFound("P1".into());
        assert_eq!(err.detail(), "P1");
        assert_eq!(err.to_string(), "Endpoint not found: P1");
    }

    #[test]
    fn test_radio_timeout_maps_to_radio_command_timeout() {
        let err: NearbyError = transport::RadioError::Timeout {
            label: "connect".into(),
            timeout_ms: 10_000,
        }
        .into();
        assert_eq!(err.code(), "RADIO_COMMAND_TIMEOUT");
        assert!(err.detail().contains("connect"));
    }

    #[test]
    fn test_directory_not_found_maps_to_endpoint_not_found() {
        let err: NearbyError = engine::DirectoryError::NotFound("P9".into()).into();
        assert_eq!(err, NearbyError::EndpointNotFound("P9".into()));
    }
}
