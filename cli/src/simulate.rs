// Two-device loopback walkthrough
//
// Drives a local engine and a peer engine over one in-memory medium through
// discovery, connection, a message exchange and disconnect, printing every
// notification either side raises.

use anyhow::{Context, Result};
use colored::*;
use nearby_multipeer_core::engine::ConnectionStatus;
use nearby_multipeer_core::{EngineConfig, LoopbackMedium, NearbyEngine, NearbyEvent};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};

const LOCAL_ADDRESS: &str = "02:00:00:00:00:01";
const PEER_ADDRESS: &str = "02:00:00:00:00:02";

/// Per-step bound; covers the 30s connection timeout plus slack
const STEP_TIMEOUT: Duration = Duration::from_secs(40);

pub struct SimulateOptions {
    pub ble: bool,
    pub message: String,
}

struct Device {
    label: ColoredString,
    engine: NearbyEngine,
    events: UnboundedReceiver<NearbyEvent>,
}

impl Device {
    fn spawn(
        medium: &LoopbackMedium,
        address: &str,
        config: EngineConfig,
        label: ColoredString,
    ) -> Result<Self> {
        let (engine, events) = NearbyEngine::spawn(config, medium.device(address).transports())
            .with_context(|| format!("Failed to start engine for {}", address))?;
        Ok(Self {
            label,
            engine,
            events,
        })
    }

    /// Print events until one matches
    async fn wait_for(
        &mut self,
        what: &str,
        matches: impl Fn(&NearbyEvent) -> bool,
    ) -> Result<NearbyEvent> {
        let deadline = Instant::now() + STEP_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) => {
                    print_event(&self.label, &event);
                    if matches(&event) {
                        return Ok(event);
                    }
                }
                Ok(None) => anyhow::bail!("{} stopped while waiting for {}", self.label, what),
                Err(_) => anyhow::bail!("{} timed out waiting for {}", self.label, what),
            }
        }
    }

    /// Print whatever is already queued
    async fn drain(&mut self, window: Duration) {
        while let Ok(Some(event)) = timeout(window, self.events.recv()).await {
            print_event(&self.label, &event);
        }
    }
}

fn print_event(label: &ColoredString, event: &NearbyEvent) {
    println!("  {} {} {}", label, event.name().bright_cyan(), event.payload().to_string().dimmed());
}

fn step(text: &str) {
    println!();
    println!("{} {}", "▶".bright_blue(), text.bold());
}

pub async fn run(config: EngineConfig, peer_name: String, options: SimulateOptions) -> Result<()> {
    if peer_name == config.display_name {
        anyhow::bail!("Local and peer display names must differ ({})", peer_name);
    }

    let medium = LoopbackMedium::new();
    let mut peer_config = config.clone();
    peer_config.display_name = peer_name.clone();

    let mut local = Device::spawn(
        &medium,
        LOCAL_ADDRESS,
        config.clone(),
        config.display_name.green(),
    )?;
    let mut peer = Device::spawn(&medium, PEER_ADDRESS, peer_config, peer_name.yellow())?;

    let transport = if options.ble { "BLE" } else { "session protocol" };
    println!("{}", "Loopback simulation".bold());
    println!("  Service:   {}", config.service_id);
    println!("  Transport: {}", transport);
    println!("  Local:     {} ({})", config.display_name, LOCAL_ADDRESS);
    println!("  Peer:      {} ({})", peer_name, PEER_ADDRESS);

    step("Initialize");
    let service_uuid = config.service_uuid.as_deref();
    local.engine.initialize(&config.service_id, service_uuid).await?;
    peer.engine.initialize(&config.service_id, service_uuid).await?;
    println!("{} Both engines ready", "✓".green());

    step("Discover");
    peer.engine.start_advertising().await?;
    local.engine.start_discovery().await?;
    // BLE endpoints are keyed by radio address, session endpoints by name
    let (target, inbound) = if options.ble {
        (PEER_ADDRESS.to_string(), LOCAL_ADDRESS.to_string())
    } else {
        (peer_name.clone(), config.display_name.clone())
    };
    local
        .wait_for("endpointFound", |e| {
            matches!(e, NearbyEvent::EndpointFound(found) if found.endpoint_id == target)
        })
        .await?;
    println!("{} Found {}", "✓".green(), target);

    step("Connect");
    let connecting = {
        let engine = local.engine.clone();
        let target = target.clone();
        let name = config.display_name.clone();
        tokio::spawn(async move { engine.connect(&target, Some(&name)).await })
    };
    if !options.ble {
        peer.wait_for("connectionRequested", |e| {
            matches!(e, NearbyEvent::ConnectionRequested(req) if req.endpoint_id == inbound)
        })
        .await?;
        peer.engine.accept_connection(&inbound).await?;
    }
    connecting
        .await
        .context("Connect task panicked")?
        .context("Connection failed")?;
    let connected = |id: &str| {
        let id = id.to_string();
        move |e: &NearbyEvent| {
            matches!(e, NearbyEvent::ConnectionResult(r)
                if r.endpoint_id == id && r.status == ConnectionStatus::Success)
        }
    };
    local.wait_for("connectionResult", connected(&target)).await?;
    peer.wait_for("connectionResult", connected(&inbound)).await?;
    println!("{} Connected", "✓".green());

    step("Message");
    local.engine.send_message(&target, &options.message).await?;
    let received = peer
        .wait_for("message", |e| matches!(e, NearbyEvent::Message(m) if m.endpoint_id == inbound))
        .await?;
    if let NearbyEvent::Message(m) = &received {
        println!("{} {} received \"{}\"", "✓".green(), peer.label, m.data);
    }
    peer.engine.send_message(&inbound, "ack").await?;
    local
        .wait_for("reply", |e| matches!(e, NearbyEvent::Message(m) if m.endpoint_id == target))
        .await?;
    println!("{} Reply delivered", "✓".green());

    step("Disconnect");
    local.engine.disconnect_from_endpoint(&target).await?;
    peer.wait_for("endpointLost", |e| {
        matches!(e, NearbyEvent::EndpointLost(lost) if lost.endpoint_id == inbound)
    })
    .await?;
    local.drain(Duration::from_millis(200)).await;
    println!("{} Disconnected", "✓".green());

    let radio = local.engine.status().await?.radio;
    tracing::debug!(?radio, "Local radio lane");

    local.engine.shutdown().await?;
    peer.engine.shutdown().await?;

    println!();
    println!("{}", "Simulation complete".green().bold());
    Ok(())
}
