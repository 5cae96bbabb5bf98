//! Connection lifecycle controller
//!
//! The actor that owns all engine state. Application commands, adapter events
//! and internal timer/completion messages arrive on channels and are handled
//! one at a time. Everything scoped to one `initialize()`..`cleanup()` span
//! lives in an [`ActivitySession`]; timers carry the session epoch so late
//! ones from an earlier session are dropped.

use super::directory::{ConnectionState, Endpoint, EndpointDirectory, EndpointInfo};
use super::events::{
    ConnectionRequested, ConnectionStatus, MessageReceived, NearbyEvent, TransferStatus,
};
use super::invitation::{InvitationBook, PendingInvitation};
use crate::config::{parse_service_uuid, EngineConfig};
use crate::logging::log_hex;
use crate::transport::ble::{
    AdvertisementClassifier, AdvertisementRecord, GattFragmenter, GattReassembler,
    ManufacturerPayload, RadioError, RadioLane, RadioLaneStats, RadioTicket, ReassemblyProgress,
    ScanSchedule, ScanStage, ScanStep, MESSAGE_CHARACTERISTIC_UUID,
};
use crate::transport::session::{discovery_info, SessionFrame, SERVICE_ID_KEY};
use crate::transport::{
    AdapterEvent, AdvertisementData, BleLinkRole, InvitationResponder, NativeHandle,
    PeripheralHandle, ScanRequest, SessionPeerHandle, TransportKind, Transports,
};
use crate::NearbyError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, NearbyError>>;

/// Commands from [`super::NearbyEngine`] handles
pub(crate) enum EngineCommand {
    Initialize {
        service_id: String,
        service_uuid: Option<String>,
        reply: Reply<()>,
    },
    SetDisplayName {
        name: String,
        reply: Reply<()>,
    },
    SetCommandTimeout {
        timeout: Duration,
        reply: Reply<()>,
    },
    StartAdvertising {
        reply: Reply<()>,
    },
    StopAdvertising {
        reply: Reply<()>,
    },
    StartDiscovery {
        reply: Reply<()>,
    },
    StopDiscovery {
        reply: Reply<()>,
    },
    Connect {
        endpoint_id: String,
        display_name: Option<String>,
        reply: Reply<()>,
    },
    AcceptConnection {
        endpoint_id: String,
        reply: Reply<()>,
    },
    RejectConnection {
        endpoint_id: String,
        reply: Reply<()>,
    },
    Disconnect {
        endpoint_id: String,
        reply: Reply<()>,
    },
    DisconnectAll {
        reply: Reply<()>,
    },
    SendMessage {
        endpoint_id: String,
        text: String,
        reply: Reply<()>,
    },
    Cleanup {
        reply: Reply<()>,
    },
    Endpoints {
        reply: oneshot::Sender<Vec<EndpointInfo>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Timer expiries and background completions
#[derive(Debug)]
pub(crate) enum Internal {
    ConnectDeadline {
        epoch: u64,
        endpoint_id: String,
        attempt: u64,
    },
    ScanWindowElapsed {
        epoch: u64,
        generation: u64,
    },
    BleConnectIssued {
        epoch: u64,
        endpoint_id: String,
        attempt: u64,
        result: Result<(), RadioError>,
    },
    AdvertisingFailed {
        epoch: u64,
        generation: u64,
        error: RadioError,
    },
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub initialized: bool,
    pub display_name: String,
    pub service_id: Option<String>,
    pub service_uuid: Option<Uuid>,
    /// Both transports are currently advertising
    pub advertising: bool,
    /// Advertising was requested; it may be paused while connected
    pub advertising_requested: bool,
    pub discovering: bool,
    pub scan_stage: ScanStage,
    pub endpoint_count: usize,
    pub connected_count: usize,
    pub pending_invitations: usize,
    pub radio: RadioLaneStats,
}

struct Notifier {
    events_tx: mpsc::UnboundedSender<NearbyEvent>,
}

impl Notifier {
    fn emit(&self, event: NearbyEvent) {
        debug!("Emitting {}", event);
        if self.events_tx.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }
}

/// State that outlives activity sessions
struct EngineContext {
    config: EngineConfig,
    transports: Transports,
    notifier: Notifier,
    internal_tx: mpsc::UnboundedSender<Internal>,
    display_name: String,
}

struct PendingConnect {
    attempt: u64,
    /// `None` for links we accepted rather than initiated
    reply: Option<Reply<()>>,
}

fn not_initialized() -> NearbyError {
    NearbyError::NotInitialized("call initialize() first".to_string())
}

fn send_error(err: RadioError) -> NearbyError {
    match err {
        RadioError::Timeout { .. } => NearbyError::RadioCommandTimeout(err.to_string()),
        other => NearbyError::SendFailed(other.to_string()),
    }
}

/// Let a radio command finish off the actor; failures are only logged
fn detach(ticket: RadioTicket<()>) {
    tokio::spawn(async move {
        let label = ticket.label().to_string();
        if let Err(e) = ticket.outcome().await {
            warn!("Background radio command '{}' failed: {}", label, e);
        }
    });
}

fn connect_error(err: RadioError) -> NearbyError {
    match err {
        RadioError::Timeout { .. } => NearbyError::RadioCommandTimeout(err.to_string()),
        other => NearbyError::ConnectionFailed(other.to_string()),
    }
}

pub(crate) struct Controller {
    ctx: EngineContext,
    session: Option<ActivitySession>,
    epoch: u64,
}

impl Controller {
    pub(crate) fn new(
        config: EngineConfig,
        transports: Transports,
        events_tx: mpsc::UnboundedSender<NearbyEvent>,
        internal_tx: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        let display_name = config.display_name.clone();
        Self {
            ctx: EngineContext {
                config,
                transports,
                notifier: Notifier { events_tx },
                internal_tx,
                display_name,
            },
            session: None,
            epoch: 0,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<EngineCommand>,
        mut adapter_rx: mpsc::UnboundedReceiver<AdapterEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!("Nearby engine task started");
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(EngineCommand::Shutdown { reply }) => {
                        self.cleanup().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.cleanup().await;
                        break;
                    }
                },
                Some(event) = adapter_rx.recv() => self.handle_adapter_event(event).await,
                Some(message) = internal_rx.recv() => self.handle_internal(message).await,
            }
        }
        info!("Nearby engine task stopped");
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Initialize {
                service_id,
                service_uuid,
                reply,
            } => {
                let _ = reply.send(self.initialize(service_id, service_uuid).await);
            }
            EngineCommand::SetDisplayName { name, reply } => {
                let _ = reply.send(self.set_display_name(name).await);
            }
            EngineCommand::SetCommandTimeout { timeout, reply } => {
                let _ = reply.send(self.set_command_timeout(timeout));
            }
            EngineCommand::StartAdvertising { reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => session.start_advertising(&self.ctx).await,
                    None => Err(not_initialized()),
                };
                let _ = reply.send(result);
            }
            EngineCommand::StopAdvertising { reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => {
                        session.stop_advertising(&self.ctx).await;
                        Ok(())
                    }
                    None => Err(not_initialized()),
                };
                let _ = reply.send(result);
            }
            EngineCommand::StartDiscovery { reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => session.start_discovery(&self.ctx).await,
                    None => Err(not_initialized()),
                };
                let _ = reply.send(result);
            }
            EngineCommand::StopDiscovery { reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => {
                        session.halt_discovery(&self.ctx).await;
                        Ok(())
                    }
                    None => Err(not_initialized()),
                };
                let _ = reply.send(result);
            }
            EngineCommand::Connect {
                endpoint_id,
                display_name,
                reply,
            } => match self.session.as_mut() {
                Some(session) => {
                    session
                        .connect(&self.ctx, endpoint_id, display_name, reply)
                        .await
                }
                None => {
                    let _ = reply.send(Err(not_initialized()));
                }
            },
            EngineCommand::AcceptConnection { endpoint_id, reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => {
                        session.accept(&self.ctx, &endpoint_id);
                        Ok(())
                    }
                    None => Err(not_initialized()),
                };
                let _ = reply.send(result);
            }
            EngineCommand::RejectConnection { endpoint_id, reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => {
                        session.reject(&endpoint_id);
                        Ok(())
                    }
                    None => Err(not_initialized()),
                };
                let _ = reply.send(result);
            }
            EngineCommand::Disconnect { endpoint_id, reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => session.disconnect(&self.ctx, &endpoint_id).await,
                    None => Err(not_initialized()),
                };
                let _ = reply.send(result);
            }
            EngineCommand::DisconnectAll { reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => {
                        session.disconnect_all(&self.ctx).await;
                        Ok(())
                    }
                    None => Err(not_initialized()),
                };
                let _ = reply.send(result);
            }
            EngineCommand::SendMessage {
                endpoint_id,
                text,
                reply,
            } => match self.session.as_mut() {
                Some(session) => {
                    session
                        .send_message(&self.ctx, &endpoint_id, text, reply)
                        .await
                }
                None => {
                    let _ = reply.send(Err(not_initialized()));
                }
            },
            EngineCommand::Cleanup { reply } => {
                self.cleanup().await;
                let _ = reply.send(Ok(()));
            }
            EngineCommand::Endpoints { reply } => {
                let snapshot = self
                    .session
                    .as_ref()
                    .map(|session| session.directory.snapshot())
                    .unwrap_or_default();
                let _ = reply.send(snapshot);
            }
            EngineCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineCommand::Shutdown { reply } => {
                // handled in the run loop
                let _ = reply.send(());
            }
        }
    }

    async fn initialize(
        &mut self,
        service_id: String,
        service_uuid: Option<String>,
    ) -> Result<(), NearbyError> {
        let service_id = service_id.trim().to_string();
        if service_id.is_empty() {
            return Err(NearbyError::InvalidConfiguration(
                "service id must not be empty".to_string(),
            ));
        }
        let service_uuid = match service_uuid.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_service_uuid(raw)?,
            _ => self.ctx.config.resolved_service_uuid()?,
        };

        if self.session.is_some() {
            info!("Re-initializing; cleaning up the previous activity session");
            self.cleanup().await;
        }

        self.epoch += 1;
        let lane = Arc::new(RadioLane::new(self.ctx.config.command_timeout()));
        let classifier = AdvertisementClassifier::new(service_uuid);
        let scan = ScanSchedule::new(service_uuid, self.ctx.config.scan);
        info!(
            "Initialized activity session {} for service '{}' ({})",
            self.epoch, service_id, service_uuid
        );
        self.session = Some(ActivitySession {
            epoch: self.epoch,
            service_id,
            service_uuid,
            classifier,
            lane,
            directory: EndpointDirectory::new(),
            invitations: InvitationBook::new(),
            pending_connects: HashMap::new(),
            scan,
            advertising_requested: false,
            advertising_active: false,
            advertising_generation: 0,
            discovering: false,
            reassemblers: HashMap::new(),
            next_attempt: 0,
        });
        Ok(())
    }

    async fn set_display_name(&mut self, name: String) -> Result<(), NearbyError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(NearbyError::InvalidConfiguration(
                "display name must not be empty".to_string(),
            ));
        }
        info!("Display name set to '{}'", name);
        self.ctx.display_name = name;

        if let Some(session) = self.session.as_mut() {
            if session.advertising_active {
                session.restart_advertising(&self.ctx).await?;
            }
        }
        Ok(())
    }

    fn set_command_timeout(&mut self, timeout: Duration) -> Result<(), NearbyError> {
        if timeout.is_zero() {
            return Err(NearbyError::InvalidConfiguration(
                "command timeout must be > 0".to_string(),
            ));
        }
        self.ctx.config.command_timeout_ms =
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if let Some(session) = self.session.as_ref() {
            session.lane.set_default_timeout(timeout);
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown(&self.ctx).await;
        }
    }

    fn status(&self) -> EngineStatus {
        match self.session.as_ref() {
            Some(session) => EngineStatus {
                initialized: true,
                display_name: self.ctx.display_name.clone(),
                service_id: Some(session.service_id.clone()),
                service_uuid: Some(session.service_uuid),
                advertising: session.advertising_active,
                advertising_requested: session.advertising_requested,
                discovering: session.discovering,
                scan_stage: session.scan.stage(),
                endpoint_count: session.directory.len(),
                connected_count: session.directory.connected_count(),
                pending_invitations: session.invitations.len(),
                radio: session.lane.stats(),
            },
            None => EngineStatus {
                initialized: false,
                display_name: self.ctx.display_name.clone(),
                service_id: None,
                service_uuid: None,
                advertising: false,
                advertising_requested: false,
                discovering: false,
                scan_stage: ScanStage::Idle,
                endpoint_count: 0,
                connected_count: 0,
                pending_invitations: 0,
                radio: RadioLaneStats::default(),
            },
        }
    }

    async fn handle_adapter_event(&mut self, event: AdapterEvent) {
        match self.session.as_mut() {
            Some(session) => session.handle_adapter_event(&self.ctx, event).await,
            None => {
                trace!("Engine not initialized, dropping adapter event {}", event);
                if let AdapterEvent::SessionInvitation { responder, .. } = event {
                    responder.respond(false);
                }
            }
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        let epoch = match &message {
            Internal::ConnectDeadline { epoch, .. }
            | Internal::ScanWindowElapsed { epoch, .. }
            | Internal::BleConnectIssued { epoch, .. }
            | Internal::AdvertisingFailed { epoch, .. } => *epoch,
        };
        let session = match self.session.as_mut() {
            Some(session) if session.epoch == epoch => session,
            _ => {
                trace!("Dropping stale internal message {:?}", message);
                return;
            }
        };

        match message {
            Internal::ConnectDeadline {
                endpoint_id,
                attempt,
                ..
            } => session.on_connect_deadline(&self.ctx, &endpoint_id, attempt).await,
            Internal::ScanWindowElapsed { generation, .. } => {
                session.on_scan_window(&self.ctx, generation).await
            }
            Internal::BleConnectIssued {
                endpoint_id,
                attempt,
                result,
                ..
            } => {
                session
                    .on_ble_connect_issued(&self.ctx, &endpoint_id, attempt, result)
                    .await
            }
            Internal::AdvertisingFailed {
                generation, error, ..
            } => {
                session
                    .on_advertising_failed(&self.ctx, generation, error)
                    .await
            }
        }
    }
}

/// Everything scoped to one `initialize()`..`cleanup()` span
struct ActivitySession {
    epoch: u64,
    service_id: String,
    service_uuid: Uuid,
    classifier: AdvertisementClassifier,
    lane: Arc<RadioLane>,
    directory: EndpointDirectory,
    invitations: InvitationBook,
    pending_connects: HashMap<String, PendingConnect>,
    scan: ScanSchedule,
    advertising_requested: bool,
    advertising_active: bool,
    /// Bumped whenever advertising is paused or resumed in the background
    advertising_generation: u64,
    discovering: bool,
    reassemblers: HashMap<String, GattReassembler>,
    next_attempt: u64,
}

impl ActivitySession {
    // ------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------

    fn advertisement(&self, ctx: &EngineContext) -> AdvertisementData {
        let payload = ManufacturerPayload::with_name_limit(
            ctx.config.device_family,
            Some(&ctx.display_name),
            ctx.config.max_name_bytes,
        );
        AdvertisementData {
            local_name: payload.name.clone().unwrap_or_default(),
            service_uuids: vec![self.service_uuid],
            manufacturer_data: payload.encode(),
        }
    }

    /// An endpoint is connected, or a BLE link is being set up
    fn links_busy(&self) -> bool {
        self.directory.iter().any(|endpoint| match endpoint.state() {
            ConnectionState::Connected => true,
            ConnectionState::Connecting => endpoint.transport() == TransportKind::Ble,
            _ => false,
        })
    }

    async fn start_advertising(&mut self, ctx: &EngineContext) -> Result<(), NearbyError> {
        if self.advertising_active {
            info!("Restarting advertising");
            self.halt_advertising(ctx).await;
        }
        self.advertising_requested = true;

        if self.links_busy() {
            info!("Advertising deferred until no endpoint is connected");
            return Ok(());
        }

        let result = self.activate_advertising(ctx).await;
        if result.is_err() {
            self.advertising_requested = false;
        }
        result
    }

    async fn restart_advertising(&mut self, ctx: &EngineContext) -> Result<(), NearbyError> {
        self.halt_advertising(ctx).await;
        self.activate_advertising(ctx).await
    }

    /// Start session advertising and queue the BLE start behind it
    async fn begin_advertising(
        &mut self,
        ctx: &EngineContext,
    ) -> Result<RadioTicket<()>, NearbyError> {
        let info = discovery_info(&self.service_id);
        ctx.transports
            .session
            .start_advertising(&ctx.display_name, &self.service_id, &info)
            .await
            .map_err(|e| NearbyError::ConnectionFailed(format!("session advertising: {}", e)))?;

        let advertisement = self.advertisement(ctx);
        log_hex("Advertising manufacturer payload", &advertisement.manufacturer_data);
        let peripheral = Arc::clone(&ctx.transports.ble_peripheral);
        Ok(self
            .lane
            .enqueue("start_advertising", None, move || async move {
                peripheral.start_advertising(&advertisement).await
            }))
    }

    async fn activate_advertising(&mut self, ctx: &EngineContext) -> Result<(), NearbyError> {
        let started = self.begin_advertising(ctx).await?.outcome().await;
        if let Err(e) = started {
            warn!("BLE advertising failed to start: {}", e);
            if let Err(stop_err) = ctx.transports.session.stop_advertising().await {
                warn!("Failed to roll back session advertising: {}", stop_err);
            }
            return Err(e.into());
        }

        self.advertising_active = true;
        info!(
            "Advertising as '{}' for service '{}'",
            ctx.display_name, self.service_id
        );
        Ok(())
    }

    /// Stop session advertising and queue the BLE stop; `None` if not advertising
    async fn pause_advertising(&mut self, ctx: &EngineContext) -> Option<RadioTicket<()>> {
        if !self.advertising_active {
            return None;
        }
        self.advertising_active = false;
        self.advertising_generation += 1;

        if let Err(e) = ctx.transports.session.stop_advertising().await {
            warn!("Failed to stop session advertising: {}", e);
        }
        let peripheral = Arc::clone(&ctx.transports.ble_peripheral);
        let ticket = self
            .lane
            .enqueue("stop_advertising", None, move || async move {
                peripheral.stop_advertising().await
            });
        debug!("Advertising paused");
        Some(ticket)
    }

    /// Pause advertising and wait for the radio to confirm
    async fn halt_advertising(&mut self, ctx: &EngineContext) {
        if let Some(ticket) = self.pause_advertising(ctx).await {
            if let Err(e) = ticket.outcome().await {
                warn!("Failed to stop BLE advertising: {}", e);
            }
        }
    }

    async fn stop_advertising(&mut self, ctx: &EngineContext) {
        self.advertising_requested = false;
        self.halt_advertising(ctx).await;
        info!("Advertising stopped");
    }

    /// Resume from an event handler; the BLE start completes in the background
    async fn maybe_resume_advertising(&mut self, ctx: &EngineContext) {
        if !self.advertising_requested || self.advertising_active || self.links_busy() {
            return;
        }
        info!("No endpoint connected, resuming advertising");
        let ticket = match self.begin_advertising(ctx).await {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!("Failed to resume advertising: {}", e);
                return;
            }
        };
        self.advertising_active = true;
        self.advertising_generation += 1;

        let internal_tx = ctx.internal_tx.clone();
        let epoch = self.epoch;
        let generation = self.advertising_generation;
        tokio::spawn(async move {
            if let Err(error) = ticket.outcome().await {
                let _ = internal_tx.send(Internal::AdvertisingFailed {
                    epoch,
                    generation,
                    error,
                });
            }
        });
    }

    async fn on_advertising_failed(
        &mut self,
        ctx: &EngineContext,
        generation: u64,
        error: RadioError,
    ) {
        if generation != self.advertising_generation || !self.advertising_active {
            return;
        }
        warn!("Failed to resume advertising: {}", error);
        self.advertising_active = false;
        if let Err(e) = ctx.transports.session.stop_advertising().await {
            warn!("Failed to roll back session advertising: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    async fn start_discovery(&mut self, ctx: &EngineContext) -> Result<(), NearbyError> {
        if self.discovering {
            info!("Restarting discovery");
            self.halt_discovery(ctx).await;
        }

        ctx.transports
            .session
            .start_browsing(&ctx.display_name, &self.service_id)
            .await
            .map_err(|e| NearbyError::ConnectionFailed(format!("session browsing: {}", e)))?;

        let step = self.scan.begin();
        let started = self
            .enqueue_scan(ctx, step.request.clone(), false)
            .outcome()
            .await;
        if let Err(e) = started {
            warn!("BLE scan failed to start: {}", e);
            self.scan.stop();
            if let Err(stop_err) = ctx.transports.session.stop_browsing().await {
                warn!("Failed to roll back session browsing: {}", stop_err);
            }
            return Err(e.into());
        }

        self.discovering = true;
        self.schedule_scan_window(ctx, &step);
        info!("Discovering service '{}'", self.service_id);
        Ok(())
    }

    /// Queue a scan start, preceded by a stop when restarting
    fn enqueue_scan(
        &self,
        ctx: &EngineContext,
        request: ScanRequest,
        restart: bool,
    ) -> RadioTicket<()> {
        if restart {
            let central = Arc::clone(&ctx.transports.ble_central);
            let stop = self.lane.enqueue("stop_scan", None, move || async move {
                central.stop_scan().await
            });
            detach(stop);
        }
        debug!(
            "Starting BLE scan (filter: {:?}, duplicates: {})",
            request.service_filter, request.allow_duplicates
        );
        let central = Arc::clone(&ctx.transports.ble_central);
        self.lane.enqueue("start_scan", None, move || async move {
            central.start_scan(&request).await
        })
    }

    fn schedule_scan_window(&self, ctx: &EngineContext, step: &ScanStep) {
        let Some(window) = step.next_window else {
            return;
        };
        let internal_tx = ctx.internal_tx.clone();
        let epoch = self.epoch;
        let generation = step.generation;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = internal_tx.send(Internal::ScanWindowElapsed { epoch, generation });
        });
    }

    async fn on_scan_window(&mut self, ctx: &EngineContext, generation: u64) {
        if !self.discovering {
            return;
        }
        let Some(step) = self.scan.on_window_elapsed(generation) else {
            return;
        };
        info!(
            "Scan stage {:?} ({} advertisements classified)",
            step.stage,
            self.scan.classified()
        );
        if step.restart {
            detach(self.enqueue_scan(ctx, step.request.clone(), true));
        }
        self.schedule_scan_window(ctx, &step);
    }

    async fn halt_discovery(&mut self, ctx: &EngineContext) {
        self.scan.stop();
        if !self.discovering {
            return;
        }
        self.discovering = false;

        if let Err(e) = ctx.transports.session.stop_browsing().await {
            warn!("Failed to stop session browsing: {}", e);
        }
        let central = Arc::clone(&ctx.transports.ble_central);
        if let Err(e) = self
            .lane
            .submit("stop_scan", None, move || async move { central.stop_scan().await })
            .await
        {
            warn!("Failed to stop BLE scan: {}", e);
        }
        info!("Discovery stopped");
    }

    fn record_discovery(&mut self, ctx: &EngineContext, endpoint: Endpoint) {
        let endpoint_id = endpoint.endpoint_id().to_string();
        let name = endpoint.display_name().to_string();
        let service_id = endpoint.service_id().map(str::to_string);
        let transport = endpoint.transport();

        if self.directory.insert_if_absent(endpoint) {
            info!("Endpoint found: {} '{}' via {}", endpoint_id, name, transport);
            ctx.notifier.emit(NearbyEvent::endpoint_found(
                &endpoint_id,
                &name,
                service_id.as_deref(),
            ));
        } else {
            trace!("Endpoint {} already known", endpoint_id);
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Track an outcome-pending connection and start its deadline
    fn arm_connect_deadline(
        &mut self,
        ctx: &EngineContext,
        endpoint_id: &str,
        reply: Option<Reply<()>>,
    ) -> u64 {
        self.next_attempt += 1;
        let attempt = self.next_attempt;

        if let Some(previous) = self
            .pending_connects
            .insert(endpoint_id.to_string(), PendingConnect { attempt, reply })
        {
            if let Some(reply) = previous.reply {
                let _ = reply.send(Err(NearbyError::AlreadyInProgress(format!(
                    "superseded connection attempt to {}",
                    endpoint_id
                ))));
            }
        }

        let internal_tx = ctx.internal_tx.clone();
        let epoch = self.epoch;
        let endpoint_id = endpoint_id.to_string();
        let timeout = ctx.config.connection_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal_tx.send(Internal::ConnectDeadline {
                epoch,
                endpoint_id,
                attempt,
            });
        });
        attempt
    }

    fn resolve_pending(&mut self, endpoint_id: &str, result: Result<(), NearbyError>) {
        if let Some(pending) = self.pending_connects.remove(endpoint_id) {
            if let Some(reply) = pending.reply {
                let _ = reply.send(result);
            }
        }
    }

    async fn connect(
        &mut self,
        ctx: &EngineContext,
        endpoint_id: String,
        display_name: Option<String>,
        reply: Reply<()>,
    ) {
        let Some(endpoint) = self.directory.get(&endpoint_id) else {
            let _ = reply.send(Err(NearbyError::EndpointNotFound(endpoint_id)));
            return;
        };
        let state = endpoint.state();
        if state != ConnectionState::Discovered {
            let _ = reply.send(Err(NearbyError::AlreadyInProgress(format!(
                "{} is {}",
                endpoint_id, state
            ))));
            return;
        }

        let handle = endpoint.handle().clone();
        if let NativeHandle::BlePeripheral {
            role: BleLinkRole::Inbound,
            ..
        } = handle
        {
            // Inbound links are up before they reach the directory
            let _ = reply.send(Err(NearbyError::AlreadyInProgress(format!(
                "{} is connected to us as central",
                endpoint_id
            ))));
            return;
        }

        if let Err(e) = self
            .directory
            .transition(&endpoint_id, ConnectionState::Connecting)
        {
            let _ = reply.send(Err(e.into()));
            return;
        }
        let attempt = self.arm_connect_deadline(ctx, &endpoint_id, Some(reply));
        info!("Connecting to {} via {}", endpoint_id, handle.transport());

        match handle {
            NativeHandle::SessionPeer(peer) => {
                let context = display_name.map(String::into_bytes);
                if let Err(e) = ctx
                    .transports
                    .session
                    .invite(&peer, context.as_deref(), ctx.config.connection_timeout())
                    .await
                {
                    self.fail_connection(
                        ctx,
                        &endpoint_id,
                        NearbyError::ConnectionFailed(e.to_string()),
                    )
                    .await;
                }
            }
            NativeHandle::BlePeripheral { handle, .. } => {
                if let Some(ticket) = self.pause_advertising(ctx).await {
                    detach(ticket);
                }
                let central = Arc::clone(&ctx.transports.ble_central);
                let ticket = self.lane.enqueue("connect", None, move || async move {
                    central.connect(&handle).await
                });
                let internal_tx = ctx.internal_tx.clone();
                let epoch = self.epoch;
                tokio::spawn(async move {
                    let result = ticket.outcome().await;
                    let _ = internal_tx.send(Internal::BleConnectIssued {
                        epoch,
                        endpoint_id,
                        attempt,
                        result,
                    });
                });
            }
        }
    }

    async fn on_ble_connect_issued(
        &mut self,
        ctx: &EngineContext,
        endpoint_id: &str,
        attempt: u64,
        result: Result<(), RadioError>,
    ) {
        if self.pending_connects.get(endpoint_id).map(|p| p.attempt) != Some(attempt) {
            return;
        }
        match result {
            Ok(()) => debug!("Connect issued to {}, waiting for link-up", endpoint_id),
            Err(e) => self.fail_connection(ctx, endpoint_id, connect_error(e)).await,
        }
    }

    async fn on_connect_deadline(&mut self, ctx: &EngineContext, endpoint_id: &str, attempt: u64) {
        if self.pending_connects.get(endpoint_id).map(|p| p.attempt) != Some(attempt) {
            return;
        }
        if self.directory.state_of(endpoint_id) == Some(ConnectionState::Connecting) {
            let timeout = ctx.config.connection_timeout();
            self.fail_connection(
                ctx,
                endpoint_id,
                NearbyError::ConnectionTimeout(format!(
                    "no link to {} within {}s",
                    endpoint_id,
                    timeout.as_secs()
                )),
            )
            .await;
        } else {
            self.pending_connects.remove(endpoint_id);
        }
    }

    /// Connecting -> Disconnected, report, forget the endpoint
    async fn fail_connection(
        &mut self,
        ctx: &EngineContext,
        endpoint_id: &str,
        error: NearbyError,
    ) {
        if self.directory.state_of(endpoint_id) != Some(ConnectionState::Connecting) {
            return;
        }
        if let Err(e) = self
            .directory
            .transition(endpoint_id, ConnectionState::Disconnected)
        {
            warn!("{}", e);
            return;
        }
        warn!("Connection to {} failed: {}", endpoint_id, error);
        ctx.notifier.emit(NearbyEvent::connection_result(
            endpoint_id,
            ConnectionStatus::Failure,
        ));
        self.resolve_pending(endpoint_id, Err(error));

        if let Some(endpoint) = self.directory.remove(endpoint_id) {
            if let NativeHandle::BlePeripheral {
                handle,
                role: BleLinkRole::Outbound,
            } = endpoint.handle().clone()
            {
                self.cancel_ble_connect(ctx, handle);
            }
        }
        self.reassemblers.remove(endpoint_id);
        ctx.notifier.emit(NearbyEvent::endpoint_lost(endpoint_id));
        self.maybe_resume_advertising(ctx).await;
    }

    /// Best-effort teardown of a half-open outbound link, off the actor
    fn cancel_ble_connect(&self, ctx: &EngineContext, handle: PeripheralHandle) {
        let central = Arc::clone(&ctx.transports.ble_central);
        let id = handle.identifier().to_string();
        let ticket = self.lane.enqueue("disconnect", None, move || async move {
            central.disconnect(&handle).await
        });
        tokio::spawn(async move {
            if let Err(e) = ticket.outcome().await {
                debug!("Cancelling connect to {} failed: {}", id, e);
            }
        });
    }

    async fn on_link_up(&mut self, ctx: &EngineContext, endpoint_id: &str) {
        match self.directory.state_of(endpoint_id) {
            Some(ConnectionState::Discovered) => {
                if let Err(e) = self
                    .directory
                    .transition(endpoint_id, ConnectionState::Connecting)
                {
                    warn!("{}", e);
                    return;
                }
            }
            Some(ConnectionState::Connecting) => {}
            Some(ConnectionState::Connected) => {
                debug!("Duplicate link-up for {}", endpoint_id);
                return;
            }
            _ => return,
        }
        if let Err(e) = self
            .directory
            .transition(endpoint_id, ConnectionState::Connected)
        {
            warn!("{}", e);
            return;
        }

        info!("Connected to {}", endpoint_id);
        if let Some(stale) = self.invitations.take(endpoint_id) {
            stale.resolve(false);
        }
        self.resolve_pending(endpoint_id, Ok(()));
        ctx.notifier.emit(NearbyEvent::connection_result(
            endpoint_id,
            ConnectionStatus::Success,
        ));
        if let Some(ticket) = self.pause_advertising(ctx).await {
            detach(ticket);
        }
    }

    async fn on_link_down(&mut self, ctx: &EngineContext, endpoint_id: &str, reason: &str) {
        match self.directory.state_of(endpoint_id) {
            Some(ConnectionState::Connecting) => {
                self.fail_connection(
                    ctx,
                    endpoint_id,
                    NearbyError::ConnectionFailed(format!("{}: {}", endpoint_id, reason)),
                )
                .await;
            }
            Some(ConnectionState::Connected) => {
                if let Err(e) = self
                    .directory
                    .transition(endpoint_id, ConnectionState::Disconnected)
                {
                    warn!("{}", e);
                }
                self.directory.remove(endpoint_id);
                self.reassemblers.remove(endpoint_id);
                info!("Disconnected from {}: {}", endpoint_id, reason);
                ctx.notifier.emit(NearbyEvent::endpoint_lost(endpoint_id));
                self.maybe_resume_advertising(ctx).await;
            }
            Some(ConnectionState::Discovered) if self.owns(endpoint_id, TransportKind::Ble) => {
                // The peripheral went away before we connected
                self.directory.remove(endpoint_id);
                self.reassemblers.remove(endpoint_id);
                info!("Endpoint lost: {} ({})", endpoint_id, reason);
                ctx.notifier.emit(NearbyEvent::endpoint_lost(endpoint_id));
            }
            Some(state) => debug!("Link down for {} while {}, ignoring", endpoint_id, state),
            None => trace!("Link down for unknown endpoint {}", endpoint_id),
        }
    }

    fn accept(&mut self, ctx: &EngineContext, endpoint_id: &str) {
        let Some(invitation) = self.invitations.take(endpoint_id) else {
            debug!("No pending invitation from {}", endpoint_id);
            return;
        };
        if self.directory.state_of(endpoint_id) == Some(ConnectionState::Discovered) {
            match self
                .directory
                .transition(endpoint_id, ConnectionState::Connecting)
            {
                Ok(_) => {
                    self.arm_connect_deadline(ctx, endpoint_id, None);
                }
                Err(e) => warn!("{}", e),
            }
        }
        info!("Accepting connection from {}", endpoint_id);
        invitation.resolve(true);
    }

    fn reject(&mut self, endpoint_id: &str) {
        match self.invitations.take(endpoint_id) {
            Some(invitation) => {
                info!("Rejecting connection from {}", endpoint_id);
                invitation.resolve(false);
            }
            None => debug!("No pending invitation from {}", endpoint_id),
        }
    }

    async fn disconnect(
        &mut self,
        ctx: &EngineContext,
        endpoint_id: &str,
    ) -> Result<(), NearbyError> {
        let endpoint = self
            .directory
            .get(endpoint_id)
            .ok_or_else(|| NearbyError::EndpointNotFound(endpoint_id.to_string()))?;
        if !endpoint.state().is_active() {
            debug!("{} is not connected, nothing to disconnect", endpoint_id);
            return Ok(());
        }
        let is_session = endpoint.transport() == TransportKind::SessionProtocol;

        self.teardown_link(ctx, endpoint_id).await;

        if is_session && !self.session_links_active() {
            if let Err(e) = ctx.transports.session.disconnect_all().await {
                warn!("Failed to tear down session: {}", e);
            }
        }
        Ok(())
    }

    async fn disconnect_all(&mut self, ctx: &EngineContext) {
        let ids = self.directory.active_ids();
        let mut had_session = false;
        for endpoint_id in &ids {
            had_session |= self
                .directory
                .get(endpoint_id)
                .is_some_and(|e| e.transport() == TransportKind::SessionProtocol);
            self.teardown_link(ctx, endpoint_id).await;
        }
        if had_session {
            if let Err(e) = ctx.transports.session.disconnect_all().await {
                warn!("Failed to tear down session: {}", e);
            }
        }
        info!("Disconnected {} endpoints", ids.len());
    }

    fn session_links_active(&self) -> bool {
        self.directory.iter().any(|endpoint| {
            endpoint.transport() == TransportKind::SessionProtocol && endpoint.state().is_active()
        })
    }

    /// Local disconnect of one endpoint; it leaves the directory either way
    async fn teardown_link(&mut self, ctx: &EngineContext, endpoint_id: &str) {
        let Some(endpoint) = self.directory.get(endpoint_id) else {
            return;
        };
        let handle = endpoint.handle().clone();
        let state = endpoint.state();

        match state {
            ConnectionState::Connecting => {
                self.fail_connection(
                    ctx,
                    endpoint_id,
                    NearbyError::ConnectionFailed(format!(
                        "connection to {} cancelled locally",
                        endpoint_id
                    )),
                )
                .await;
            }
            ConnectionState::Connected => {
                self.close_native_link(ctx, handle).await;
                self.on_link_down(ctx, endpoint_id, "disconnected locally").await;
            }
            _ => {}
        }
    }

    async fn close_native_link(&self, ctx: &EngineContext, handle: NativeHandle) {
        match handle {
            NativeHandle::SessionPeer(peer) => self.send_disconnect_notice(ctx, &peer).await,
            NativeHandle::BlePeripheral {
                handle,
                role: BleLinkRole::Outbound,
            } => {
                let central = Arc::clone(&ctx.transports.ble_central);
                if let Err(e) = self
                    .lane
                    .submit("disconnect", None, move || async move {
                        central.disconnect(&handle).await
                    })
                    .await
                {
                    warn!("BLE disconnect failed: {}", e);
                }
            }
            NativeHandle::BlePeripheral {
                handle,
                role: BleLinkRole::Inbound,
            } => {
                let peripheral = Arc::clone(&ctx.transports.ble_peripheral);
                if let Err(e) = self
                    .lane
                    .submit("disconnect_central", None, move || async move {
                        peripheral.disconnect_central(&handle).await
                    })
                    .await
                {
                    warn!("BLE central disconnect failed: {}", e);
                }
            }
        }
    }

    async fn send_disconnect_notice(&self, ctx: &EngineContext, peer: &SessionPeerHandle) {
        let notice = match SessionFrame::DisconnectNotice.encode() {
            Ok(notice) => notice,
            Err(e) => {
                warn!("Failed to encode disconnect notice: {}", e);
                return;
            }
        };
        if let Err(e) = ctx.transports.session.send(peer, &notice).await {
            debug!(
                "Disconnect notice to {} not delivered: {}",
                peer.display_name(),
                e
            );
        }
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    async fn send_message(
        &mut self,
        ctx: &EngineContext,
        endpoint_id: &str,
        text: String,
        reply: Reply<()>,
    ) {
        let Some(endpoint) = self.directory.get(endpoint_id) else {
            let _ = reply.send(Err(NearbyError::EndpointNotFound(endpoint_id.to_string())));
            return;
        };
        if endpoint.state() != ConnectionState::Connected {
            let _ = reply.send(Err(NearbyError::SendFailed(format!(
                "{} is not connected",
                endpoint_id
            ))));
            return;
        }

        match endpoint.handle().clone() {
            NativeHandle::SessionPeer(peer) => {
                let result = match SessionFrame::Text(text).encode() {
                    Ok(bytes) => {
                        log_hex("Session data sent", &bytes);
                        ctx.transports
                            .session
                            .send(&peer, &bytes)
                            .await
                            .map_err(|e| NearbyError::SendFailed(e.to_string()))
                    }
                    Err(e) => Err(NearbyError::SendFailed(e.to_string())),
                };
                let _ = reply.send(result);
            }
            NativeHandle::BlePeripheral { handle, role } => {
                let fragments = match GattFragmenter::new(ctx.config.write_len)
                    .and_then(|fragmenter| fragmenter.fragment(text.as_bytes()))
                {
                    Ok(fragments) => fragments,
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                        return;
                    }
                };
                debug!(
                    "Sending {} bytes to {} in {} fragments",
                    text.len(),
                    endpoint_id,
                    fragments.len()
                );

                // Enqueued back to back so no other command splits the message
                let tickets: Vec<_> = fragments
                    .into_iter()
                    .map(|fragment| {
                        let handle = handle.clone();
                        match role {
                            BleLinkRole::Outbound => {
                                let central = Arc::clone(&ctx.transports.ble_central);
                                self.lane.enqueue("write", None, move || async move {
                                    central
                                        .write(&handle, MESSAGE_CHARACTERISTIC_UUID, &fragment)
                                        .await
                                })
                            }
                            BleLinkRole::Inbound => {
                                let peripheral = Arc::clone(&ctx.transports.ble_peripheral);
                                self.lane.enqueue("notify", None, move || async move {
                                    peripheral
                                        .notify(&handle, MESSAGE_CHARACTERISTIC_UUID, &fragment)
                                        .await
                                })
                            }
                        }
                    })
                    .collect();

                tokio::spawn(async move {
                    for ticket in tickets {
                        if let Err(e) = ticket.outcome().await {
                            let _ = reply.send(Err(send_error(e)));
                            return;
                        }
                    }
                    let _ = reply.send(Ok(()));
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Adapter events
    // ------------------------------------------------------------------

    fn owns(&self, endpoint_id: &str, transport: TransportKind) -> bool {
        self.directory
            .get(endpoint_id)
            .is_some_and(|e| e.transport() == transport)
    }

    fn owns_ble(&self, endpoint_id: &str, role: BleLinkRole) -> bool {
        self.directory
            .get(endpoint_id)
            .is_some_and(|e| e.ble_role() == Some(role))
    }

    async fn handle_adapter_event(&mut self, ctx: &EngineContext, event: AdapterEvent) {
        trace!("Adapter event: {}", event);
        match event {
            AdapterEvent::SessionPeerFound {
                peer,
                discovery_info,
            } => {
                let service_id = discovery_info
                    .get(SERVICE_ID_KEY)
                    .cloned()
                    .unwrap_or_else(|| self.service_id.clone());
                let name = peer.display_name().to_string();
                self.record_discovery(
                    ctx,
                    Endpoint::discovered(NativeHandle::SessionPeer(peer), name, Some(service_id)),
                );
            }
            AdapterEvent::SessionPeerLost { peer } => {
                self.on_session_peer_lost(ctx, peer.display_name())
            }
            AdapterEvent::SessionInvitation {
                peer,
                context,
                responder,
            } => self.on_invitation(ctx, peer, context, responder),
            AdapterEvent::SessionPeerConnected { peer } => {
                let endpoint_id = peer.display_name().to_string();
                if !self.directory.contains(&endpoint_id) {
                    // Link initiated by the remote before we ever saw it
                    self.record_discovery(
                        ctx,
                        Endpoint::discovered(
                            NativeHandle::SessionPeer(peer),
                            endpoint_id.clone(),
                            Some(self.service_id.clone()),
                        ),
                    );
                }
                if self.owns(&endpoint_id, TransportKind::SessionProtocol) {
                    self.on_link_up(ctx, &endpoint_id).await;
                }
            }
            AdapterEvent::SessionPeerDisconnected { peer } => {
                let endpoint_id = peer.display_name();
                if self.owns(endpoint_id, TransportKind::SessionProtocol) {
                    self.on_link_down(ctx, endpoint_id, "session peer disconnected")
                        .await;
                }
            }
            AdapterEvent::SessionDataReceived { peer, data } => {
                self.on_session_data(ctx, peer.display_name(), &data).await
            }
            AdapterEvent::SessionTransferProgress {
                peer,
                bytes_transferred,
                total_bytes,
                completed,
            } => {
                let endpoint_id = peer.display_name();
                if self.owns(endpoint_id, TransportKind::SessionProtocol) {
                    let status = if completed {
                        TransferStatus::Completed
                    } else {
                        TransferStatus::InProgress
                    };
                    ctx.notifier.emit(NearbyEvent::transfer_update(
                        endpoint_id,
                        bytes_transferred,
                        total_bytes,
                        status,
                    ));
                }
            }
            AdapterEvent::AdvertisementObserved(record) => self.on_advertisement(ctx, record),
            AdapterEvent::PeripheralConnected { peripheral } => {
                let endpoint_id = peripheral.identifier();
                if self.owns_ble(endpoint_id, BleLinkRole::Outbound) {
                    self.on_link_up(ctx, endpoint_id).await;
                } else {
                    debug!("Link-up from untracked peripheral {}", endpoint_id);
                }
            }
            AdapterEvent::PeripheralDisconnected { peripheral, reason } => {
                let endpoint_id = peripheral.identifier();
                if self.owns_ble(endpoint_id, BleLinkRole::Outbound) {
                    let reason = reason.unwrap_or_else(|| "peripheral disconnected".to_string());
                    self.on_link_down(ctx, endpoint_id, &reason).await;
                }
            }
            AdapterEvent::CentralConnected { central, name } => {
                self.on_central_connected(ctx, central, name).await
            }
            AdapterEvent::CentralDisconnected { central } => {
                let endpoint_id = central.identifier();
                if self.owns_ble(endpoint_id, BleLinkRole::Inbound) {
                    self.on_link_down(ctx, endpoint_id, "central disconnected")
                        .await;
                }
            }
            AdapterEvent::BleDataReceived { from, data } => {
                self.on_ble_data(ctx, from.identifier(), &data)
            }
            AdapterEvent::TransportFailure {
                transport,
                operation,
                reason,
            } => error!("{} transport failed during {}: {}", transport, operation, reason),
        }
    }

    fn on_session_peer_lost(&mut self, ctx: &EngineContext, endpoint_id: &str) {
        let Some(endpoint) = self.directory.get(endpoint_id) else {
            return;
        };
        if endpoint.transport() != TransportKind::SessionProtocol {
            return;
        }
        if endpoint.state() != ConnectionState::Discovered
            || self.invitations.contains(endpoint_id)
        {
            debug!(
                "Ignoring loss of {} while {}",
                endpoint_id,
                endpoint.state()
            );
            return;
        }
        self.directory.remove(endpoint_id);
        info!("Endpoint lost: {}", endpoint_id);
        ctx.notifier.emit(NearbyEvent::endpoint_lost(endpoint_id));
    }

    fn on_invitation(
        &mut self,
        ctx: &EngineContext,
        peer: SessionPeerHandle,
        context: Option<Vec<u8>>,
        responder: InvitationResponder,
    ) {
        let endpoint_id = peer.display_name().to_string();
        match self.directory.get(&endpoint_id) {
            Some(endpoint) if endpoint.transport() != TransportKind::SessionProtocol => {
                warn!(
                    "Invitation from {} collides with a BLE endpoint, declining",
                    endpoint_id
                );
                responder.respond(false);
                return;
            }
            Some(endpoint) if endpoint.state() == ConnectionState::Connected => {
                debug!("Already connected to {}, declining invitation", endpoint_id);
                responder.respond(false);
                return;
            }
            Some(_) => {}
            None => {
                let endpoint = Endpoint::discovered(
                    NativeHandle::SessionPeer(peer),
                    endpoint_id.clone(),
                    Some(self.service_id.clone()),
                );
                self.record_discovery(ctx, endpoint);
            }
        }

        let endpoint_name = self
            .directory
            .get(&endpoint_id)
            .map(|e| e.display_name().to_string())
            .unwrap_or_else(|| endpoint_id.clone());
        let invitation = PendingInvitation::new(endpoint_id.clone(), context, responder);
        let authentication_token = invitation.authentication_token();
        self.invitations.insert(invitation);

        info!("Connection requested by {}", endpoint_id);
        ctx.notifier
            .emit(NearbyEvent::ConnectionRequested(ConnectionRequested {
                endpoint_id,
                endpoint_name,
                authentication_token,
                is_incoming_connection: true,
            }));
    }

    async fn on_session_data(&mut self, ctx: &EngineContext, endpoint_id: &str, data: &[u8]) {
        if !self.owns(endpoint_id, TransportKind::SessionProtocol) {
            warn!("Dropping data from unknown session peer {}", endpoint_id);
            return;
        }
        log_hex("Session data received", data);

        match SessionFrame::decode(data) {
            Ok(SessionFrame::DisconnectNotice) => {
                info!("{} sent a disconnect notice", endpoint_id);
                self.on_link_down(ctx, endpoint_id, "remote disconnected")
                    .await;
            }
            Ok(SessionFrame::Text(text)) => {
                ctx.notifier.emit(NearbyEvent::Message(MessageReceived {
                    endpoint_id: endpoint_id.to_string(),
                    data: text,
                }));
            }
            Err(e) => warn!("Dropping session payload from {}: {}", endpoint_id, e),
        }
    }

    fn on_advertisement(&mut self, ctx: &EngineContext, record: AdvertisementRecord) {
        match self.classifier.classify(&record) {
            Ok(classified) => {
                self.scan.record_classified();
                trace!(
                    "Classified {} as {} (rssi {})",
                    classified.peripheral.identifier(),
                    classified.family,
                    classified.rssi
                );
                let endpoint = Endpoint::discovered(
                    NativeHandle::BlePeripheral {
                        handle: classified.peripheral,
                        role: BleLinkRole::Outbound,
                    },
                    classified.display_name,
                    Some(self.service_id.clone()),
                )
                .with_family(classified.family);
                self.record_discovery(ctx, endpoint);
            }
            Err(e) => debug!(
                "Ignoring advertisement from {}: {}",
                record.peripheral.identifier(),
                e
            ),
        }
    }

    async fn on_central_connected(
        &mut self,
        ctx: &EngineContext,
        central: PeripheralHandle,
        name: Option<String>,
    ) {
        let endpoint_id = central.identifier().to_string();
        let inbound = NativeHandle::BlePeripheral {
            handle: central,
            role: BleLinkRole::Inbound,
        };

        match self
            .directory
            .get(&endpoint_id)
            .map(|e| (e.transport(), e.state()))
        {
            None => {
                let name = name
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| endpoint_id.clone());
                self.record_discovery(
                    ctx,
                    Endpoint::discovered(inbound, name, Some(self.service_id.clone())),
                );
            }
            Some((TransportKind::Ble, ConnectionState::Discovered)) => {
                if let Err(e) = self.directory.replace_handle(&endpoint_id, inbound) {
                    warn!("{}", e);
                    return;
                }
            }
            Some((_, state)) => {
                debug!("Ignoring inbound central {} while {}", endpoint_id, state);
                return;
            }
        }
        self.on_link_up(ctx, &endpoint_id).await;
    }

    fn on_ble_data(&mut self, ctx: &EngineContext, endpoint_id: &str, data: &[u8]) {
        let connected = self.directory.get(endpoint_id).is_some_and(|e| {
            e.transport() == TransportKind::Ble && e.state() == ConnectionState::Connected
        });
        if !connected {
            warn!("Dropping BLE data from {}: not connected", endpoint_id);
            return;
        }
        log_hex("BLE fragment received", data);

        let reassembler = self
            .reassemblers
            .entry(endpoint_id.to_string())
            .or_default();
        match reassembler.push(data) {
            Ok(ReassemblyProgress::Partial {
                received_bytes,
                total_bytes,
            }) => ctx.notifier.emit(NearbyEvent::transfer_update(
                endpoint_id,
                received_bytes,
                total_bytes,
                TransferStatus::InProgress,
            )),
            Ok(ReassemblyProgress::Complete(bytes)) => {
                let total = bytes.len() as u64;
                ctx.notifier.emit(NearbyEvent::transfer_update(
                    endpoint_id,
                    total,
                    total,
                    TransferStatus::Completed,
                ));
                match String::from_utf8(bytes) {
                    Ok(text) => ctx.notifier.emit(NearbyEvent::Message(MessageReceived {
                        endpoint_id: endpoint_id.to_string(),
                        data: text,
                    })),
                    Err(e) => warn!("Dropping non UTF-8 message from {}: {}", endpoint_id, e),
                }
            }
            Err(e) => warn!("Discarding BLE fragment from {}: {}", endpoint_id, e),
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Stop everything without emitting notifications
    async fn shutdown(mut self, ctx: &EngineContext) {
        self.invitations.decline_all();
        for (endpoint_id, pending) in self.pending_connects.drain() {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(NearbyError::NotInitialized(format!(
                    "cleanup cancelled connection to {}",
                    endpoint_id
                ))));
            }
        }

        self.halt_discovery(ctx).await;
        self.advertising_requested = false;
        if let Some(ticket) = self.pause_advertising(ctx).await {
            detach(ticket);
        }

        let mut had_session = false;
        for endpoint in self.directory.clear() {
            match endpoint.state() {
                ConnectionState::Connected => {
                    had_session |= endpoint.transport() == TransportKind::SessionProtocol;
                    self.close_native_link(ctx, endpoint.handle().clone()).await;
                }
                ConnectionState::Connecting => {
                    had_session |= endpoint.transport() == TransportKind::SessionProtocol;
                    if let NativeHandle::BlePeripheral { handle, .. } = endpoint.handle().clone()
                    {
                        self.cancel_ble_connect(ctx, handle);
                    }
                }
                _ => {}
            }
        }
        if had_session {
            if let Err(e) = ctx.transports.session.disconnect_all().await {
                warn!("Failed to tear down session: {}", e);
            }
        }

        self.reassemblers.clear();
        // Queued disconnects and stops must reach the radio before the worker goes
        if let Err(e) = self.lane.flush().await {
            warn!("Radio lane did not drain before shutdown: {}", e);
        }
        self.lane.shutdown();
        info!("Activity session {} cleaned up", self.epoch);
    }
}
