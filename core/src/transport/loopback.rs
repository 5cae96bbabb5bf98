//! In-memory radio medium
//!
//! Any number of simulated devices share one medium. Each device implements
//! all three adapter traits, so an engine can be driven end to end without a
//! radio: session advertising/browsing/invitations/data, BLE advertising and
//! scanning, GATT links and writes. Tests can also inject raw adapter events,
//! wedge a device's BLE stack, or cut a link.

use crate::transport::abstraction::{
    AdapterEvent, AdapterEventSender, AdvertisementData, BleCentral, BlePeripheral,
    InvitationResponder, PeripheralHandle, ScanRequest, SessionPeerHandle, SessionTransport,
    TransportError, Transports,
};
use crate::transport::ble::advertisement::AdvertisementRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

const DEFAULT_RSSI: i16 = -55;

#[derive(Debug, Clone)]
struct SessionAdvert {
    service_id: String,
    discovery_info: HashMap<String, String>,
}

#[derive(Debug)]
struct DeviceState {
    events: Option<AdapterEventSender>,
    session_name: Option<String>,
    session_advert: Option<SessionAdvert>,
    browsing_service: Option<String>,
    ble_advert: Option<AdvertisementData>,
    scan: Option<ScanRequest>,
    radio_wedged: bool,
    rssi: i16,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            events: None,
            session_name: None,
            session_advert: None,
            browsing_service: None,
            ble_advert: None,
            scan: None,
            radio_wedged: false,
            rssi: DEFAULT_RSSI,
        }
    }
}

#[derive(Debug, Default)]
struct MediumState {
    devices: HashMap<String, DeviceState>,
    /// Unordered pairs of device addresses, stored sorted
    session_links: HashSet<(String, String)>,
    /// (central address, peripheral address)
    ble_links: HashSet<(String, String)>,
}

fn session_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl MediumState {
    fn device(&self, address: &str) -> Result<&DeviceState, TransportError> {
        self.devices
            .get(address)
            .ok_or_else(|| TransportError::Unavailable(format!("unknown device {}", address)))
    }

    fn device_mut(&mut self, address: &str) -> Result<&mut DeviceState, TransportError> {
        self.devices
            .get_mut(address)
            .ok_or_else(|| TransportError::Unavailable(format!("unknown device {}", address)))
    }

    fn emit(&self, address: &str, event: AdapterEvent) {
        match self.devices.get(address).and_then(|d| d.events.as_ref()) {
            Some(events) => {
                trace!("loopback -> {}: {}", address, event);
                let _ = events.send(event);
            }
            None => trace!("loopback: {} not attached, dropping {}", address, event),
        }
    }

    fn session_name(&self, address: &str) -> Result<String, TransportError> {
        self.device(address)?
            .session_name
            .clone()
            .ok_or_else(|| TransportError::OperationFailed("session not started".to_string()))
    }

    fn address_of_session_peer(&self, peer: &SessionPeerHandle) -> Option<String> {
        self.devices
            .iter()
            .find(|(_, d)| d.session_name.as_deref() == Some(peer.display_name()))
            .map(|(address, _)| address.clone())
    }

    fn advertisement_record(&self, address: &str) -> Option<AdvertisementRecord> {
        let device = self.devices.get(address)?;
        let advert = device.ble_advert.as_ref()?;
        Some(AdvertisementRecord {
            peripheral: PeripheralHandle::new(address),
            rssi: device.rssi,
            local_name: Some(advert.local_name.clone()).filter(|n| !n.is_empty()),
            service_uuids: advert.service_uuids.clone(),
            manufacturer_data: Some(advert.manufacturer_data.clone())
                .filter(|data| !data.is_empty()),
        })
    }

    fn ble_name(&self, address: &str) -> Option<String> {
        let device = self.devices.get(address)?;
        device
            .ble_advert
            .as_ref()
            .map(|a| a.local_name.clone())
            .or_else(|| device.session_name.clone())
    }
}

/// Shared simulated radio space
#[derive(Debug, Clone, Default)]
pub struct LoopbackMedium {
    state: Arc<Mutex<MediumState>>,
}

impl LoopbackMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or look up) a device by hardware address
    pub fn device(&self, address: &str) -> LoopbackDevice {
        self.state
            .lock()
            .devices
            .entry(address.to_string())
            .or_default();
        LoopbackDevice {
            medium: self.clone(),
            address: address.to_string(),
        }
    }

    /// Make every BLE operation on `address` hang until the lane gives up
    pub fn set_radio_wedged(&self, address: &str, wedged: bool) {
        if let Some(device) = self.state.lock().devices.get_mut(address) {
            device.radio_wedged = wedged;
        }
    }

    pub fn set_rssi(&self, address: &str, rssi: i16) {
        if let Some(device) = self.state.lock().devices.get_mut(address) {
            device.rssi = rssi;
        }
    }

    /// Deliver a raw adapter event to one device
    pub fn inject(&self, address: &str, event: AdapterEvent) {
        self.state.lock().emit(address, event);
    }

    /// Drop a GATT link as if the radio lost it
    pub fn sever_ble_link(&self, central: &str, peripheral: &str) -> bool {
        let mut state = self.state.lock();
        if !state
            .ble_links
            .remove(&(central.to_string(), peripheral.to_string()))
        {
            return false;
        }
        state.emit(
            central,
            AdapterEvent::PeripheralDisconnected {
                peripheral: PeripheralHandle::new(peripheral),
                reason: Some("link lost".to_string()),
            },
        );
        state.emit(
            peripheral,
            AdapterEvent::CentralDisconnected {
                central: PeripheralHandle::new(central),
            },
        );
        true
    }

    pub fn session_linked(&self, a: &str, b: &str) -> bool {
        self.state.lock().session_links.contains(&session_pair(a, b))
    }

    pub fn ble_linked(&self, central: &str, peripheral: &str) -> bool {
        self.state
            .lock()
            .ble_links
            .contains(&(central.to_string(), peripheral.to_string()))
    }

    pub fn session_advertising(&self, address: &str) -> bool {
        self.state
            .lock()
            .devices
            .get(address)
            .is_some_and(|d| d.session_advert.is_some())
    }

    pub fn ble_advertising(&self, address: &str) -> bool {
        self.state
            .lock()
            .devices
            .get(address)
            .is_some_and(|d| d.ble_advert.is_some())
    }

    pub fn browsing(&self, address: &str) -> bool {
        self.state
            .lock()
            .devices
            .get(address)
            .is_some_and(|d| d.browsing_service.is_some())
    }

    /// Current scan parameters of a device, if it is scanning
    pub fn scan_request(&self, address: &str) -> Option<ScanRequest> {
        self.state
            .lock()
            .devices
            .get(address)
            .and_then(|d| d.scan.clone())
    }

    fn resolve_invitation(&self, inviter: &str, target: &str, accept: bool) {
        let mut state = self.state.lock();
        let (Ok(inviter_name), Ok(target_name)) =
            (state.session_name(inviter), state.session_name(target))
        else {
            return;
        };

        if accept {
            state.session_links.insert(session_pair(inviter, target));
            state.emit(
                inviter,
                AdapterEvent::SessionPeerConnected {
                    peer: SessionPeerHandle::new(target_name),
                },
            );
            state.emit(
                target,
                AdapterEvent::SessionPeerConnected {
                    peer: SessionPeerHandle::new(inviter_name),
                },
            );
        } else {
            state.emit(
                inviter,
                AdapterEvent::SessionPeerDisconnected {
                    peer: SessionPeerHandle::new(target_name),
                },
            );
        }
    }
}

/// One simulated device on a [`LoopbackMedium`]
#[derive(Debug, Clone)]
pub struct LoopbackDevice {
    medium: LoopbackMedium,
    address: String,
}

impl LoopbackDevice {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn medium(&self) -> &LoopbackMedium {
        &self.medium
    }

    /// Adapter bundle backed by this device
    pub fn transports(&self) -> Transports {
        Transports::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    async fn radio_gate(&self) {
        let wedged = self
            .medium
            .state
            .lock()
            .devices
            .get(&self.address)
            .is_some_and(|d| d.radio_wedged);
        if wedged {
            debug!("loopback: {} radio wedged", self.address);
            futures::future::pending::<()>().await;
        }
    }

    fn attach_events(&self, events: AdapterEventSender) {
        if let Some(device) = self.medium.state.lock().devices.get_mut(&self.address) {
            device.events = Some(events);
        }
    }
}

#[async_trait]
impl SessionTransport for LoopbackDevice {
    fn attach(&self, events: AdapterEventSender) {
        self.attach_events(events);
    }

    async fn start_advertising(
        &self,
        display_name: &str,
        service_id: &str,
        discovery_info: &HashMap<String, String>,
    ) -> Result<(), TransportError> {
        let mut state = self.medium.state.lock();
        let device = state.device_mut(&self.address)?;
        device.session_name = Some(display_name.to_string());
        device.session_advert = Some(SessionAdvert {
            service_id: service_id.to_string(),
            discovery_info: discovery_info.clone(),
        });

        let browsers: Vec<String> = state
            .devices
            .iter()
            .filter(|(address, d)| {
                *address != &self.address && d.browsing_service.as_deref() == Some(service_id)
            })
            .map(|(address, _)| address.clone())
            .collect();
        for browser in browsers {
            state.emit(
                &browser,
                AdapterEvent::SessionPeerFound {
                    peer: SessionPeerHandle::new(display_name),
                    discovery_info: discovery_info.clone(),
                },
            );
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), TransportError> {
        let mut state = self.medium.state.lock();
        let device = state.device_mut(&self.address)?;
        let Some(advert) = device.session_advert.take() else {
            return Ok(());
        };
        let name = device.session_name.clone().unwrap_or_default();

        let browsers: Vec<String> = state
            .devices
            .iter()
            .filter(|(address, d)| {
                *address != &self.address
                    && d.browsing_service.as_deref() == Some(advert.service_id.as_str())
            })
            .map(|(address, _)| address.clone())
            .collect();
        for browser in browsers {
            state.emit(
                &browser,
                AdapterEvent::SessionPeerLost {
                    peer: SessionPeerHandle::new(name.as_str()),
                },
            );
        }
        Ok(())
    }

    async fn start_browsing(
        &self,
        display_name: &str,
        service_id: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.medium.state.lock();
        let device = state.device_mut(&self.address)?;
        device.session_name = Some(display_name.to_string());
        device.browsing_service = Some(service_id.to_string());

        let found: Vec<(String, HashMap<String, String>)> = state
            .devices
            .iter()
            .filter(|(address, _)| *address != &self.address)
            .filter_map(|(_, d)| {
                let advert = d.session_advert.as_ref()?;
                (advert.service_id == service_id)
                    .then(|| (d.session_name.clone(), advert.discovery_info.clone()))
                    .and_then(|(name, info)| name.map(|n| (n, info)))
            })
            .collect();
        for (name, discovery_info) in found {
            state.emit(
                &self.address,
                AdapterEvent::SessionPeerFound {
                    peer: SessionPeerHandle::new(name),
                    discovery_info,
                },
            );
        }
        Ok(())
    }

    async fn stop_browsing(&self) -> Result<(), TransportError> {
        let mut state = self.medium.state.lock();
        state.device_mut(&self.address)?.browsing_service = None;
        Ok(())
    }

    async fn invite(
        &self,
        peer: &SessionPeerHandle,
        context: Option<&[u8]>,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let state = self.medium.state.lock();
        let inviter_name = state.session_name(&self.address)?;
        let target = state
            .address_of_session_peer(peer)
            .filter(|address| {
                state
                    .devices
                    .get(address)
                    .is_some_and(|d| d.session_advert.is_some())
            })
            .ok_or_else(|| TransportError::NotConnected(peer.display_name().to_string()))?;

        let medium = self.medium.clone();
        let inviter = self.address.clone();
        let invited = target.clone();
        let responder = InvitationResponder::new(move |accept| {
            medium.resolve_invitation(&inviter, &invited, accept);
        });

        state.emit(
            &target,
            AdapterEvent::SessionInvitation {
                peer: SessionPeerHandle::new(inviter_name),
                context: context.map(<[u8]>::to_vec),
                responder,
            },
        );
        Ok(())
    }

    async fn send(&self, peer: &SessionPeerHandle, data: &[u8]) -> Result<(), TransportError> {
        let state = self.medium.state.lock();
        let own_name = state.session_name(&self.address)?;
        let target = state
            .address_of_session_peer(peer)
            .filter(|target| state.session_links.contains(&session_pair(&self.address, target)))
            .ok_or_else(|| TransportError::NotConnected(peer.display_name().to_string()))?;

        state.emit(
            &target,
            AdapterEvent::SessionDataReceived {
                peer: SessionPeerHandle::new(own_name),
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    async fn disconnect_all(&self) -> Result<(), TransportError> {
        let mut state = self.medium.state.lock();
        let own_name = state.session_name(&self.address).unwrap_or_default();
        let links: Vec<(String, String)> = state
            .session_links
            .iter()
            .filter(|(a, b)| a == &self.address || b == &self.address)
            .cloned()
            .collect();

        for link in links {
            state.session_links.remove(&link);
            let other = if link.0 == self.address { &link.1 } else { &link.0 };
            let other_name = state.session_name(other).unwrap_or_default();
            state.emit(
                &self.address,
                AdapterEvent::SessionPeerDisconnected {
                    peer: SessionPeerHandle::new(other_name),
                },
            );
            state.emit(
                other,
                AdapterEvent::SessionPeerDisconnected {
                    peer: SessionPeerHandle::new(own_name.as_str()),
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl BleCentral for LoopbackDevice {
    fn attach(&self, events: AdapterEventSender) {
        self.attach_events(events);
    }

    async fn start_scan(&self, request: &ScanRequest) -> Result<(), TransportError> {
        self.radio_gate().await;
        let mut state = self.medium.state.lock();
        state.device_mut(&self.address)?.scan = Some(request.clone());

        let records: Vec<AdvertisementRecord> = state
            .devices
            .keys()
            .filter(|address| *address != &self.address)
            .filter_map(|address| state.advertisement_record(address))
            .filter(|record| request.admits(&record.service_uuids))
            .collect();
        for record in records {
            state.emit(&self.address, AdapterEvent::AdvertisementObserved(record));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.radio_gate().await;
        self.medium.state.lock().device_mut(&self.address)?.scan = None;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        self.radio_gate().await;
        let mut state = self.medium.state.lock();
        let target = peripheral.identifier().to_string();
        if !state
            .devices
            .get(&target)
            .is_some_and(|d| d.ble_advert.is_some())
        {
            return Err(TransportError::NotConnected(format!(
                "{} is not connectable",
                target
            )));
        }

        state.ble_links.insert((self.address.clone(), target.clone()));
        let name = state.ble_name(&self.address);
        state.emit(
            &self.address,
            AdapterEvent::PeripheralConnected {
                peripheral: peripheral.clone(),
            },
        );
        state.emit(
            &target,
            AdapterEvent::CentralConnected {
                central: PeripheralHandle::new(self.address.as_str()),
                name,
            },
        );
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        self.radio_gate().await;
        let mut state = self.medium.state.lock();
        let link = (self.address.clone(), peripheral.identifier().to_string());
        if state.ble_links.remove(&link) {
            state.emit(
                &self.address,
                AdapterEvent::PeripheralDisconnected {
                    peripheral: peripheral.clone(),
                    reason: None,
                },
            );
            state.emit(
                &link.1,
                AdapterEvent::CentralDisconnected {
                    central: PeripheralHandle::new(self.address.as_str()),
                },
            );
        }
        Ok(())
    }

    async fn write(
        &self,
        peripheral: &PeripheralHandle,
        _characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.radio_gate().await;
        let state = self.medium.state.lock();
        let link = (self.address.clone(), peripheral.identifier().to_string());
        if !state.ble_links.contains(&link) {
            return Err(TransportError::NotConnected(link.1));
        }
        state.emit(
            &link.1,
            AdapterEvent::BleDataReceived {
                from: PeripheralHandle::new(self.address.as_str()),
                data: data.to_vec(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl BlePeripheral for LoopbackDevice {
    fn attach(&self, events: AdapterEventSender) {
        self.attach_events(events);
    }

    async fn start_advertising(
        &self,
        advertisement: &AdvertisementData,
    ) -> Result<(), TransportError> {
        self.radio_gate().await;
        let mut state = self.medium.state.lock();
        state.device_mut(&self.address)?.ble_advert = Some(advertisement.clone());

        let Some(record) = state.advertisement_record(&self.address) else {
            return Ok(());
        };
        let scanners: Vec<String> = state
            .devices
            .iter()
            .filter(|(address, d)| {
                *address != &self.address
                    && d.scan
                        .as_ref()
                        .is_some_and(|scan| scan.admits(&record.service_uuids))
            })
            .map(|(address, _)| address.clone())
            .collect();
        for scanner in scanners {
            state.emit(&scanner, AdapterEvent::AdvertisementObserved(record.clone()));
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), TransportError> {
        self.radio_gate().await;
        self.medium.state.lock().device_mut(&self.address)?.ble_advert = None;
        Ok(())
    }

    async fn notify(
        &self,
        central: &PeripheralHandle,
        _characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.radio_gate().await;
        let state = self.medium.state.lock();
        let link = (central.identifier().to_string(), self.address.clone());
        if !state.ble_links.contains(&link) {
            return Err(TransportError::NotConnected(link.0));
        }
        state.emit(
            &link.0,
            AdapterEvent::BleDataReceived {
                from: PeripheralHandle::new(self.address.as_str()),
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    async fn disconnect_central(&self, central: &PeripheralHandle) -> Result<(), TransportError> {
        self.radio_gate().await;
        let mut state = self.medium.state.lock();
        let link = (central.identifier().to_string(), self.address.clone());
        if state.ble_links.remove(&link) {
            state.emit(
                &self.address,
                AdapterEvent::CentralDisconnected {
                    central: central.clone(),
                },
            );
            state.emit(
                &link.0,
                AdapterEvent::PeripheralDisconnected {
                    peripheral: PeripheralHandle::new(self.address.as_str()),
                    reason: Some("central disconnected by peripheral".to_string()),
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const SERVICE: &str = "nearby-test";

    fn attached(
        medium: &LoopbackMedium,
        address: &str,
    ) -> (LoopbackDevice, mpsc::UnboundedReceiver<AdapterEvent>) {
        let device = medium.device(address);
        let (tx, rx) = mpsc::unbounded_channel();
        SessionTransport::attach(&device, tx);
        (device, rx)
    }

    fn advert(name: &str) -> AdvertisementData {
        AdvertisementData {
            local_name: name.to_string(),
            service_uuids: vec![Uuid::from_u128(0xfa87c0d0_afac_11de_8a39_0800200c9a66)],
            manufacturer_data: vec![0x4E, 0x4D, 0x50, 0x01, 0x02],
        }
    }

    #[tokio::test]
    async fn test_session_browse_finds_advertiser() {
        let medium = LoopbackMedium::new();
        let (alpha, mut alpha_rx) = attached(&medium, "AA");
        let (bravo, _bravo_rx) = attached(&medium, "BB");

        SessionTransport::start_advertising(&bravo, "bravo", SERVICE, &HashMap::new())
            .await
            .unwrap();
        alpha.start_browsing("alpha", SERVICE).await.unwrap();

        match alpha_rx.try_recv().unwrap() {
            AdapterEvent::SessionPeerFound { peer, .. } => assert_eq!(peer.display_name(), "bravo"),
            other => panic!("unexpected event {}", other),
        }

        SessionTransport::stop_advertising(&bravo).await.unwrap();
        assert!(matches!(
            alpha_rx.try_recv().unwrap(),
            AdapterEvent::SessionPeerLost { .. }
        ));
    }

    #[tokio::test]
    async fn test_session_other_service_not_found() {
        let medium = LoopbackMedium::new();
        let (alpha, mut alpha_rx) = attached(&medium, "AA");
        let (bravo, _bravo_rx) = attached(&medium, "BB");

        SessionTransport::start_advertising(&bravo, "bravo", "other", &HashMap::new())
            .await
            .unwrap();
        alpha.start_browsing("alpha", SERVICE).await.unwrap();
        assert!(alpha_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invitation_accept_links_both_sides() {
        let medium = LoopbackMedium::new();
        let (alpha, mut alpha_rx) = attached(&medium, "AA");
        let (bravo, mut bravo_rx) = attached(&medium, "BB");

        SessionTransport::start_advertising(&bravo, "bravo", SERVICE, &HashMap::new())
            .await
            .unwrap();
        alpha.start_browsing("alpha", SERVICE).await.unwrap();
        let _found = alpha_rx.try_recv().unwrap();

        alpha
            .invite(&SessionPeerHandle::new("bravo"), Some(b"hi"), Duration::from_secs(30))
            .await
            .unwrap();

        let AdapterEvent::SessionInvitation {
            peer,
            context,
            responder,
        } = bravo_rx.try_recv().unwrap()
        else {
            panic!("expected invitation");
        };
        assert_eq!(peer.display_name(), "alpha");
        assert_eq!(context.as_deref(), Some(&b"hi"[..]));

        responder.respond(true);
        assert!(medium.session_linked("AA", "BB"));
        assert!(matches!(
            alpha_rx.try_recv().unwrap(),
            AdapterEvent::SessionPeerConnected { .. }
        ));
        assert!(matches!(
            bravo_rx.try_recv().unwrap(),
            AdapterEvent::SessionPeerConnected { .. }
        ));

        alpha
            .send(&SessionPeerHandle::new("bravo"), b"hello")
            .await
            .unwrap();
        match bravo_rx.try_recv().unwrap() {
            AdapterEvent::SessionDataReceived { peer, data } => {
                assert_eq!(peer.display_name(), "alpha");
                assert_eq!(data, b"hello");
            }
            other => panic!("unexpected event {}", other),
        }

        alpha.disconnect_all().await.unwrap();
        assert!(!medium.session_linked("AA", "BB"));
        assert!(matches!(
            bravo_rx.try_recv().unwrap(),
            AdapterEvent::SessionPeerDisconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_send_without_link_fails() {
        let medium = LoopbackMedium::new();
        let (alpha, _alpha_rx) = attached(&medium, "AA");
        let (bravo, _bravo_rx) = attached(&medium, "BB");
        SessionTransport::start_advertising(&bravo, "bravo", SERVICE, &HashMap::new())
            .await
            .unwrap();
        alpha.start_browsing("alpha", SERVICE).await.unwrap();

        assert!(matches!(
            alpha.send(&SessionPeerHandle::new("bravo"), b"x").await,
            Err(TransportError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_ble_scan_respects_filter() {
        let medium = LoopbackMedium::new();
        let (alpha, mut alpha_rx) = attached(&medium, "AA");
        let (bravo, _bravo_rx) = attached(&medium, "BB");

        let mut data = advert("bravo");
        data.service_uuids.clear();
        BlePeripheral::start_advertising(&bravo, &data).await.unwrap();

        alpha
            .start_scan(&ScanRequest::filtered(Uuid::from_u128(
                0xfa87c0d0_afac_11de_8a39_0800200c9a66,
            )))
            .await
            .unwrap();
        assert!(alpha_rx.try_recv().is_err());

        alpha.start_scan(&ScanRequest::broad()).await.unwrap();
        match alpha_rx.try_recv().unwrap() {
            AdapterEvent::AdvertisementObserved(record) => {
                assert_eq!(record.peripheral.identifier(), "BB");
                assert_eq!(record.local_name.as_deref(), Some("bravo"));
            }
            other => panic!("unexpected event {}", other),
        }
    }

    #[tokio::test]
    async fn test_ble_link_and_write() {
        let medium = LoopbackMedium::new();
        let (alpha, mut alpha_rx) = attached(&medium, "AA");
        let (bravo, mut bravo_rx) = attached(&medium, "BB");
        BlePeripheral::start_advertising(&bravo, &advert("bravo")).await.unwrap();

        alpha.connect(&PeripheralHandle::new("BB")).await.unwrap();
        assert!(medium.ble_linked("AA", "BB"));
        assert!(matches!(
            alpha_rx.try_recv().unwrap(),
            AdapterEvent::PeripheralConnected { .. }
        ));
        assert!(matches!(
            bravo_rx.try_recv().unwrap(),
            AdapterEvent::CentralConnected { .. }
        ));

        alpha
            .write(&PeripheralHandle::new("BB"), Uuid::nil(), b"ping")
            .await
            .unwrap();
        assert!(matches!(
            bravo_rx.try_recv().unwrap(),
            AdapterEvent::BleDataReceived { .. }
        ));

        bravo
            .notify(&PeripheralHandle::new("AA"), Uuid::nil(), b"pong")
            .await
            .unwrap();
        assert!(matches!(
            alpha_rx.try_recv().unwrap(),
            AdapterEvent::BleDataReceived { .. }
        ));

        assert!(medium.sever_ble_link("AA", "BB"));
        assert!(matches!(
            alpha_rx.try_recv().unwrap(),
            AdapterEvent::PeripheralDisconnected { .. }
        ));
        assert!(matches!(
            bravo_rx.try_recv().unwrap(),
            AdapterEvent::CentralDisconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_connect_to_silent_peripheral_fails() {
        let medium = LoopbackMedium::new();
        let (alpha, _alpha_rx) = attached(&medium, "AA");
        let _bravo = medium.device("BB");
        assert!(alpha.connect(&PeripheralHandle::new("BB")).await.is_err());
    }
}
