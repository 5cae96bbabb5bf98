//! Shared helpers for the engine integration tests
#![allow(dead_code)]

use nearby_multipeer_core::engine::{ConnectionState, ConnectionStatus, TransferStatus};
use nearby_multipeer_core::{EngineConfig, LoopbackMedium, NearbyEngine, NearbyEvent};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};

pub const SERVICE: &str = "nearby-test";

/// Long enough to cover the connection timeout under paused time
pub const EVENT_WAIT: Duration = Duration::from_secs(60);

pub struct Peer {
    pub engine: NearbyEngine,
    pub events: UnboundedReceiver<NearbyEvent>,
    pub address: String,
    pub name: String,
}

pub fn peer(medium: &LoopbackMedium, address: &str, name: &str) -> Peer {
    peer_with(medium, address, |config| config.display_name = name.to_string())
}

pub fn peer_with(
    medium: &LoopbackMedium,
    address: &str,
    configure: impl FnOnce(&mut EngineConfig),
) -> Peer {
    let mut config = EngineConfig::default();
    configure(&mut config);
    let name = config.display_name.clone();
    let (engine, events) = NearbyEngine::spawn(config, medium.device(address).transports())
        .expect("Failed to spawn engine");
    Peer {
        engine,
        events,
        address: address.to_string(),
        name,
    }
}

impl Peer {
    /// Skip events until one matches
    pub async fn expect(
        &mut self,
        what: &str,
        matches: impl Fn(&NearbyEvent) -> bool,
    ) -> NearbyEvent {
        let deadline = Instant::now() + EVENT_WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) if matches(&event) => return event,
                Ok(Some(_)) => continue,
                Ok(None) => panic!("{}: event stream closed waiting for {}", self.name, what),
                Err(_) => panic!("{}: timed out waiting for {}", self.name, what),
            }
        }
    }

    /// Events already delivered, without waiting
    pub fn drain(&mut self) -> Vec<NearbyEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Everything that arrives within `window`
    pub async fn collect(&mut self, window: Duration) -> Vec<NearbyEvent> {
        let deadline = Instant::now() + window;
        let mut events = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) | Err(_) => return events,
            }
        }
    }
}

pub fn found(id: &str) -> impl Fn(&NearbyEvent) -> bool + '_ {
    move |event| matches!(event, NearbyEvent::EndpointFound(e) if e.endpoint_id == id)
}

pub fn lost(id: &str) -> impl Fn(&NearbyEvent) -> bool + '_ {
    move |event| matches!(event, NearbyEvent::EndpointLost(e) if e.endpoint_id == id)
}

pub fn requested(id: &str) -> impl Fn(&NearbyEvent) -> bool + '_ {
    move |event| matches!(event, NearbyEvent::ConnectionRequested(e) if e.endpoint_id == id)
}

pub fn result(id: &str, status: ConnectionStatus) -> impl Fn(&NearbyEvent) -> bool + '_ {
    move |event| {
        matches!(
            event,
            NearbyEvent::ConnectionResult(e) if e.endpoint_id == id && e.status == status
        )
    }
}

pub fn message(id: &str) -> impl Fn(&NearbyEvent) -> bool + '_ {
    move |event| matches!(event, NearbyEvent::Message(e) if e.endpoint_id == id)
}

pub fn transfer(id: &str, status: TransferStatus) -> impl Fn(&NearbyEvent) -> bool + '_ {
    move |event| {
        matches!(
            event,
            NearbyEvent::PayloadTransferUpdate(e) if e.endpoint_id == id && e.status == status
        )
    }
}

pub fn count(events: &[NearbyEvent], matches: impl Fn(&NearbyEvent) -> bool) -> usize {
    events.iter().filter(|event| matches(event)).count()
}

/// Let background radio commands run to completion
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Poll the directory until `endpoint_id` reaches `state`
pub async fn wait_for_state(engine: &NearbyEngine, endpoint_id: &str, state: ConnectionState) {
    let deadline = Instant::now() + EVENT_WAIT;
    loop {
        let endpoints = engine.endpoints().await.expect("engine stopped");
        if endpoints
            .iter()
            .any(|e| e.endpoint_id == endpoint_id && e.connection_state == state)
        {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{} never reached {}",
            endpoint_id,
            state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
