//! Endpoint directory
//!
//! The single map from endpoint id to native handle and connection state.
//! Only the controller task touches it, so it needs no locking.

use crate::transport::{BleLinkRole, DeviceFamily, NativeHandle, TransportKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    /// Legal lifecycle edges
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Discovered, ConnectionState::Connecting)
                | (ConnectionState::Connecting, ConnectionState::Connected)
                | (ConnectionState::Connecting, ConnectionState::Disconnected)
                | (ConnectionState::Connected, ConnectionState::Disconnected)
        )
    }

    /// Connecting or connected
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Discovered => write!(f, "Discovered"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Endpoint not found: {0}")]
    NotFound(String),
    #[error("Illegal transition for {endpoint_id}: {from} -> {to}")]
    IllegalTransition {
        endpoint_id: String,
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("Handle for {0} belongs to another transport")]
    TransportMismatch(String),
}

/// One logical peer
#[derive(Debug, Clone)]
pub struct Endpoint {
    endpoint_id: String,
    display_name: String,
    service_id: Option<String>,
    device_family: Option<DeviceFamily>,
    state: ConnectionState,
    handle: NativeHandle,
}

impl Endpoint {
    /// A freshly discovered endpoint; the id comes from the handle
    pub fn discovered(
        handle: NativeHandle,
        display_name: impl Into<String>,
        service_id: Option<String>,
    ) -> Self {
        Self {
            endpoint_id: handle.endpoint_id().to_string(),
            display_name: display_name.into(),
            service_id,
            device_family: None,
            state: ConnectionState::Discovered,
            handle,
        }
    }

    pub fn with_family(mut self, family: DeviceFamily) -> Self {
        self.device_family = Some(family);
        self
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn service_id(&self) -> Option<&str> {
        self.service_id.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    pub fn transport(&self) -> TransportKind {
        self.handle.transport()
    }

    /// Link role for BLE endpoints
    pub fn ble_role(&self) -> Option<BleLinkRole> {
        match &self.handle {
            NativeHandle::BlePeripheral { role, .. } => Some(*role),
            NativeHandle::SessionPeer(_) => None,
        }
    }

    pub fn info(&self) -> EndpointInfo {
        EndpointInfo {
            endpoint_id: self.endpoint_id.clone(),
            display_name: self.display_name.clone(),
            service_id: self.service_id.clone(),
            transport: self.transport(),
            connection_state: self.state,
            device_family: self.device_family,
        }
    }
}

/// Snapshot of an endpoint for hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointInfo {
    pub endpoint_id: String,
    pub display_name: String,
    pub service_id: Option<String>,
    pub transport: TransportKind,
    pub connection_state: ConnectionState,
    pub device_family: Option<DeviceFamily>,
}

#[derive(Debug, Default)]
pub struct EndpointDirectory {
    endpoints: HashMap<String, Endpoint>,
}

impl EndpointDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the id is already known; true if inserted
    pub fn insert_if_absent(&mut self, endpoint: Endpoint) -> bool {
        if self.endpoints.contains_key(endpoint.endpoint_id()) {
            return false;
        }
        self.endpoints
            .insert(endpoint.endpoint_id().to_string(), endpoint);
        true
    }

    pub fn get(&self, endpoint_id: &str) -> Option<&Endpoint> {
        self.endpoints.get(endpoint_id)
    }

    pub fn contains(&self, endpoint_id: &str) -> bool {
        self.endpoints.contains_key(endpoint_id)
    }

    pub fn state_of(&self, endpoint_id: &str) -> Option<ConnectionState> {
        self.endpoints.get(endpoint_id).map(Endpoint::state)
    }

    /// Move along a legal edge; returns the previous state
    pub fn transition(
        &mut self,
        endpoint_id: &str,
        to: ConnectionState,
    ) -> Result<ConnectionState, DirectoryError> {
        let endpoint = self
            .endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| DirectoryError::NotFound(endpoint_id.to_string()))?;

        let from = endpoint.state;
        if !from.can_transition_to(to) {
            return Err(DirectoryError::IllegalTransition {
                endpoint_id: endpoint_id.to_string(),
                from,
                to,
            });
        }
        endpoint.state = to;
        Ok(from)
    }

    /// Swap the native handle, keeping the transport (inbound BLE link takeover)
    pub fn replace_handle(
        &mut self,
        endpoint_id: &str,
        handle: NativeHandle,
    ) -> Result<(), DirectoryError> {
        let endpoint = self
            .endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| DirectoryError::NotFound(endpoint_id.to_string()))?;
        if endpoint.handle.transport() != handle.transport()
            || handle.endpoint_id() != endpoint_id
        {
            return Err(DirectoryError::TransportMismatch(endpoint_id.to_string()));
        }
        endpoint.handle = handle;
        Ok(())
    }

    pub fn remove(&mut self, endpoint_id: &str) -> Option<Endpoint> {
        self.endpoints.remove(endpoint_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    /// Ids of endpoints that are connecting or connected
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .endpoints
            .values()
            .filter(|e| e.state.is_active())
            .map(|e| e.endpoint_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn connected_count(&self) -> usize {
        self.endpoints
            .values()
            .filter(|e| e.state == ConnectionState::Connected)
            .count()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Sorted by id for stable output
    pub fn snapshot(&self) -> Vec<EndpointInfo> {
        let mut infos: Vec<EndpointInfo> = self.endpoints.values().map(Endpoint::info).collect();
        infos.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        infos
    }

    pub fn clear(&mut self) -> Vec<Endpoint> {
        self.endpoints.drain().map(|(_, e)| e).collect()
    }
}
