//! Transport abstraction layer
//!
//! Native peer handles, the events adapters report to the engine, and the
//! traits platform code implements for the session protocol and the two BLE
//! roles. The engine never talks to a radio except through these traits.

use crate::transport::ble::advertisement::AdvertisementRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The two transports an endpoint can live on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Native peer-to-peer session protocol (same platform family)
    SessionProtocol,
    /// Raw BLE GATT advertising/scanning (cross-platform)
    Ble,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::SessionProtocol => write!(f, "SessionProtocol"),
            TransportKind::Ble => write!(f, "BLE"),
        }
    }
}

/// Opaque reference to a session-protocol peer identity.
///
/// The session protocol addresses peers by display name, which doubles as the
/// endpoint id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionPeerHandle {
    display_name: Arc<str>,
}

impl SessionPeerHandle {
    pub fn new(display_name: impl Into<Arc<str>>) -> Self {
        Self {
            display_name: display_name.into(),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

/// Opaque reference to a BLE device, keyed by its hardware identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle {
    identifier: Arc<str>,
}

impl PeripheralHandle {
    pub fn new(identifier: impl Into<Arc<str>>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// Which side of the GATT link the local device plays for a BLE endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleLinkRole {
    /// We scanned the remote and connect to it as central
    Outbound,
    /// The remote connected to our peripheral role
    Inbound,
}

/// Transport-specific identity owned by exactly one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeHandle {
    SessionPeer(SessionPeerHandle),
    BlePeripheral {
        handle: PeripheralHandle,
        role: BleLinkRole,
    },
}

impl NativeHandle {
    pub fn transport(&self) -> TransportKind {
        match self {
            NativeHandle::SessionPeer(_) => TransportKind::SessionProtocol,
            NativeHandle::BlePeripheral { .. } => TransportKind::Ble,
        }
    }

    /// Endpoint id derived from the transport-native identity
    pub fn endpoint_id(&self) -> &str {
        match self {
            NativeHandle::SessionPeer(peer) => peer.display_name(),
            NativeHandle::BlePeripheral { handle, .. } => handle.identifier(),
        }
    }
}

/// What the local BLE peripheral role broadcasts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    pub local_name: String,
    pub service_uuids: Vec<Uuid>,
    /// Vendor payload, company identifier already stripped
    pub manufacturer_data: Vec<u8>,
}

/// Parameters for one BLE central scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Only report advertisements listing this service, if set
    pub service_filter: Option<Uuid>,
    /// Report every advertisement instead of the first per device
    pub allow_duplicates: bool,
}

impl ScanRequest {
    pub fn broad() -> Self {
        Self {
            service_filter: None,
            allow_duplicates: true,
        }
    }

    pub fn filtered(service_uuid: Uuid) -> Self {
        Self {
            service_filter: Some(service_uuid),
            allow_duplicates: false,
        }
    }

    /// Whether an advertisement listing `service_uuids` passes this scan
    pub fn admits(&self, service_uuids: &[Uuid]) -> bool {
        match self.service_filter {
            Some(filter) => service_uuids.contains(&filter),
            None => true,
        }
    }
}

/// Decision callback handed over with an inbound session invitation.
///
/// Consuming `respond` is the only way to run it, so a decision can be made at
/// most once.
pub struct InvitationResponder {
    decide: Box<dyn FnOnce(bool) + Send + Sync>,
}

impl InvitationResponder {
    pub fn new(decide: impl FnOnce(bool) + Send + Sync + 'static) -> Self {
        Self {
            decide: Box::new(decide),
        }
    }

    pub fn respond(self, accept: bool) {
        (self.decide)(accept)
    }
}

impl fmt::Debug for InvitationResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InvitationResponder")
    }
}

/// Raw events from transport adapters to the engine
#[derive(Debug)]
pub enum AdapterEvent {
    /// Session browser found an advertising peer
    SessionPeerFound {
        peer: SessionPeerHandle,
        discovery_info: HashMap<String, String>,
    },
    /// Session browser lost sight of a peer
    SessionPeerLost { peer: SessionPeerHandle },
    /// A remote peer invited us into its session
    SessionInvitation {
        peer: SessionPeerHandle,
        context: Option<Vec<u8>>,
        responder: InvitationResponder,
    },
    SessionPeerConnected { peer: SessionPeerHandle },
    SessionPeerDisconnected { peer: SessionPeerHandle },
    SessionDataReceived {
        peer: SessionPeerHandle,
        data: Vec<u8>,
    },
    /// Progress of a resource the session protocol is receiving
    SessionTransferProgress {
        peer: SessionPeerHandle,
        bytes_transferred: u64,
        total_bytes: u64,
        completed: bool,
    },
    /// One scan observation from the BLE central role
    AdvertisementObserved(AdvertisementRecord),
    /// Our outbound GATT link came up
    PeripheralConnected { peripheral: PeripheralHandle },
    /// Our outbound GATT link went away (or never came up)
    PeripheralDisconnected {
        peripheral: PeripheralHandle,
        reason: Option<String>,
    },
    /// A remote central connected to our peripheral role
    CentralConnected {
        central: PeripheralHandle,
        name: Option<String>,
    },
    CentralDisconnected { central: PeripheralHandle },
    /// Characteristic write (inbound link) or notification (outbound link)
    BleDataReceived {
        from: PeripheralHandle,
        data: Vec<u8>,
    },
    /// Asynchronous failure a transport could not attach to any call
    TransportFailure {
        transport: TransportKind,
        operation: String,
        reason: String,
    },
}

impl fmt::Display for AdapterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterEvent::SessionPeerFound { peer, .. } => {
                write!(f, "SessionPeerFound {{ peer: {} }}", peer.display_name())
            }
            AdapterEvent::SessionPeerLost { peer } => {
                write!(f, "SessionPeerLost {{ peer: {} }}", peer.display_name())
            }
            AdapterEvent::SessionInvitation { peer, context, .. } => write!(
                f,
                "SessionInvitation {{ peer: {}, context_len: {} }}",
                peer.display_name(),
                context.as_ref().map(Vec::len).unwrap_or(0)
            ),
            AdapterEvent::SessionPeerConnected { peer } => {
                write!(f, "SessionPeerConnected {{ peer: {} }}", peer.display_name())
            }
            AdapterEvent::SessionPeerDisconnected { peer } => {
                write!(f, "SessionPeerDisconnected {{ peer: {} }}", peer.display_name())
            }
            AdapterEvent::SessionDataReceived { peer, data } => write!(
                f,
                "SessionDataReceived {{ peer: {}, data_len: {} }}",
                peer.display_name(),
                data.len()
            ),
            AdapterEvent::SessionTransferProgress {
                peer,
                bytes_transferred,
                total_bytes,
                ..
            } => write!(
                f,
                "SessionTransferProgress {{ peer: {}, {}/{} }}",
                peer.display_name(),
                bytes_transferred,
                total_bytes
            ),
            AdapterEvent::AdvertisementObserved(record) => write!(
                f,
                "AdvertisementObserved {{ peripheral: {}, rssi: {} }}",
                record.peripheral.identifier(),
                record.rssi
            ),
            AdapterEvent::PeripheralConnected { peripheral } => write!(
                f,
                "PeripheralConnected {{ peripheral: {} }}",
                peripheral.identifier()
            ),
            AdapterEvent::PeripheralDisconnected { peripheral, .. } => write!(
                f,
                "PeripheralDisconnected {{ peripheral: {} }}",
                peripheral.identifier()
            ),
            AdapterEvent::CentralConnected { central, .. } => {
                write!(f, "CentralConnected {{ central: {} }}", central.identifier())
            }
            AdapterEvent::CentralDisconnected { central } => write!(
                f,
                "CentralDisconnected {{ central: {} }}",
                central.identifier()
            ),
            AdapterEvent::BleDataReceived { from, data } => write!(
                f,
                "BleDataReceived {{ from: {}, data_len: {} }}",
                from.identifier(),
                data.len()
            ),
            AdapterEvent::TransportFailure {
                transport,
                operation,
                ..
            } => write!(
                f,
                "TransportFailure {{ transport: {}, operation: {} }}",
                transport, operation
            ),
        }
    }
}

/// Channel adapters push their events into
pub type AdapterEventSender = mpsc::UnboundedSender<AdapterEvent>;

/// Errors reported by transport adapters
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not available: {0}")]
    Unavailable(String),

    #[error("Peer not connected: {0}")]
    NotConnected(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

// ============================================================================
// PLATFORM ADAPTER TRAITS
// ============================================================================

/// Native session-protocol driver
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Route asynchronous events to the engine
    fn attach(&self, events: AdapterEventSender);

    async fn start_advertising(
        &self,
        display_name: &str,
        service_id: &str,
        discovery_info: &HashMap<String, String>,
    ) -> Result<(), TransportError>;

    async fn stop_advertising(&self) -> Result<(), TransportError>;

    async fn start_browsing(&self, display_name: &str, service_id: &str)
        -> Result<(), TransportError>;

    async fn stop_browsing(&self) -> Result<(), TransportError>;

    /// Invite a found peer into our session; the outcome arrives as
    /// `SessionPeerConnected` or `SessionPeerDisconnected`
    async fn invite(
        &self,
        peer: &SessionPeerHandle,
        context: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Reliable send to one connected peer
    async fn send(&self, peer: &SessionPeerHandle, data: &[u8]) -> Result<(), TransportError>;

    /// Tear down the whole session; the protocol has no single-peer primitive
    async fn disconnect_all(&self) -> Result<(), TransportError>;
}

/// BLE central role: scanning and outbound GATT links
#[async_trait]
pub trait BleCentral: Send + Sync {
    fn attach(&self, events: AdapterEventSender);

    async fn start_scan(&self, request: &ScanRequest) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Issue a connect; link-up is reported as `PeripheralConnected`
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError>;

    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError>;

    async fn write(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;
}

/// BLE peripheral role: advertising and inbound GATT links
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    fn attach(&self, events: AdapterEventSender);

    async fn start_advertising(&self, advertisement: &AdvertisementData)
        -> Result<(), TransportError>;

    async fn stop_advertising(&self) -> Result<(), TransportError>;

    async fn notify(
        &self,
        central: &PeripheralHandle,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    async fn disconnect_central(&self, central: &PeripheralHandle) -> Result<(), TransportError>;
}

/// The three adapters an engine drives
#[derive(Clone)]
pub struct Transports {
    pub session: Arc<dyn SessionTransport>,
    pub ble_central: Arc<dyn BleCentral>,
    pub ble_peripheral: Arc<dyn BlePeripheral>,
}

impl Transports {
    pub fn new(
        session: Arc<dyn SessionTransport>,
        ble_central: Arc<dyn BleCentral>,
        ble_peripheral: Arc<dyn BlePeripheral>,
    ) -> Self {
        Self {
            session,
            ble_central,
            ble_peripheral,
        }
    }

    /// Hand every adapter the engine's event channel
    pub fn attach(&self, events: &AdapterEventSender) {
        self.session.attach(events.clone());
        self.ble_central.attach(events.clone());
        self.ble_peripheral.attach(events.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::SessionProtocol.to_string(), "SessionProtocol");
        assert_eq!(TransportKind::Ble.to_string(), "BLE");
    }

    #[test]
    fn test_native_handle_derives_transport_and_id() {
        let session = NativeHandle::SessionPeer(SessionPeerHandle::new("Ana's iPhone"));
        assert_eq!(session.transport(), TransportKind::SessionProtocol);
        assert_eq!(session.endpoint_id(), "Ana's iPhone");

        let ble = NativeHandle::BlePeripheral {
            handle: PeripheralHandle::new("P1"),
            role: BleLinkRole::Outbound,
        };
        assert_eq!(ble.transport(), TransportKind::Ble);
        assert_eq!(ble.endpoint_id(), "P1");
    }

    #[test]
    fn test_scan_request_admits() {
        let svc = Uuid::from_u128(0xfa87c0d0_afac_11de_8a39_0800200c9a66);
        let other = Uuid::from_u128(0x1234);

        assert!(ScanRequest::broad().admits(&[]));
        assert!(ScanRequest::broad().admits(&[other]));
        assert!(ScanRequest::filtered(svc).admits(&[other, svc]));
        assert!(!ScanRequest::filtered(svc).admits(&[other]));
        assert!(!ScanRequest::filtered(svc).admits(&[]));
    }

    #[test]
    fn test_invitation_responder_runs_once() {
        let accepted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&accepted);
        let responder =
            InvitationResponder::new(move |accept| flag.store(accept, Ordering::SeqCst));

        responder.respond(true);
        assert!(accepted.load(Ordering::SeqCst));
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_invitation_responder_is_send_sync() {
        // Held by the engine task across awaits
        assert_send_sync::<InvitationResponder>();
        assert_send_sync::<AdapterEvent>();
    }

    #[test]
    fn test_adapter_event_display() {
        let event = AdapterEvent::SessionDataReceived {
            peer: SessionPeerHandle::new("bravo"),
            data: vec![1, 2, 3],
        };
        let display = event.to_string();
        assert!(display.contains("bravo"));
        assert!(display.contains("data_len: 3"));
    }

    #[test]
    fn test_transport_error_display() {
        let error = TransportError::NotConnected("P1".to_string());
        assert!(error.to_string().contains("not connected"));
    }
}
