//! Notifications emitted to the host
//!
//! Event names and camelCase payloads match what bridge layers forward to
//! application code.

use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Outcome of a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Success,
    Failure,
}

impl ConnectionStatus {
    pub fn code(self) -> i32 {
        match self {
            ConnectionStatus::Success => 0,
            ConnectionStatus::Failure => -1,
        }
    }
}

impl Serialize for ConnectionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

/// Progress of an inbound payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Completed,
}

impl TransferStatus {
    pub fn code(self) -> i32 {
        match self {
            TransferStatus::InProgress => 2,
            TransferStatus::Completed => 3,
        }
    }
}

impl Serialize for TransferStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointFound {
    pub endpoint_id: String,
    pub endpoint_name: String,
    pub service_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointLost {
    pub endpoint_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequested {
    pub endpoint_id: String,
    pub endpoint_name: String,
    pub authentication_token: String,
    pub is_incoming_connection: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResult {
    pub endpoint_id: String,
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceived {
    pub endpoint_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadTransferUpdate {
    pub endpoint_id: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub status: TransferStatus,
}

/// Unified notification stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NearbyEvent {
    EndpointFound(EndpointFound),
    EndpointLost(EndpointLost),
    ConnectionRequested(ConnectionRequested),
    ConnectionResult(ConnectionResult),
    Message(MessageReceived),
    PayloadTransferUpdate(PayloadTransferUpdate),
}

impl NearbyEvent {
    /// Event name as forwarded by bridges
    pub fn name(&self) -> &'static str {
        match self {
            NearbyEvent::EndpointFound(_) => "endpointFound",
            NearbyEvent::EndpointLost(_) => "endpointLost",
            NearbyEvent::ConnectionRequested(_) => "connectionRequested",
            NearbyEvent::ConnectionResult(_) => "connectionResult",
            NearbyEvent::Message(_) => "message",
            NearbyEvent::PayloadTransferUpdate(_) => "payloadTransferUpdate",
        }
    }

    pub fn endpoint_id(&self) -> &str {
        match self {
            NearbyEvent::EndpointFound(e) => &e.endpoint_id,
            NearbyEvent::EndpointLost(e) => &e.endpoint_id,
            NearbyEvent::ConnectionRequested(e) => &e.endpoint_id,
            NearbyEvent::ConnectionResult(e) => &e.endpoint_id,
            NearbyEvent::Message(e) => &e.endpoint_id,
            NearbyEvent::PayloadTransferUpdate(e) => &e.endpoint_id,
        }
    }

    /// camelCase JSON payload
    pub fn payload(&self) -> Value {
        let value = match self {
            NearbyEvent::EndpointFound(e) => serde_json::to_value(e),
            NearbyEvent::EndpointLost(e) => serde_json::to_value(e),
            NearbyEvent::ConnectionRequested(e) => serde_json::to_value(e),
            NearbyEvent::ConnectionResult(e) => serde_json::to_value(e),
            NearbyEvent::Message(e) => serde_json::to_value(e),
            NearbyEvent::PayloadTransferUpdate(e) => serde_json::to_value(e),
        };
        value.unwrap_or_default()
    }

    pub(crate) fn endpoint_found(
        endpoint_id: &str,
        endpoint_name: &str,
        service_id: Option<&str>,
    ) -> Self {
        NearbyEvent::EndpointFound(EndpointFound {
            endpoint_id: endpoint_id.to_string(),
            endpoint_name: endpoint_name.to_string(),
            service_id: service_id.map(str::to_string),
        })
    }

    pub(crate) fn endpoint_lost(endpoint_id: &str) -> Self {
        NearbyEvent::EndpointLost(EndpointLost {
            endpoint_id: endpoint_id.to_string(),
        })
    }

    pub(crate) fn connection_result(endpoint_id: &str, status: ConnectionStatus) -> Self {
        NearbyEvent::ConnectionResult(ConnectionResult {
            endpoint_id: endpoint_id.to_string(),
            status,
        })
    }

    pub(crate) fn transfer_update(
        endpoint_id: &str,
        bytes_transferred: u64,
        total_bytes: u64,
        status: TransferStatus,
    ) -> Self {
        NearbyEvent::PayloadTransferUpdate(PayloadTransferUpdate {
            endpoint_id: endpoint_id.to_string(),
            bytes_transferred,
            total_bytes,
            status,
        })
    }
}

impl fmt::Display for NearbyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name(), self.payload())
    }
}
