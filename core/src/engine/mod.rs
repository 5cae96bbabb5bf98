//! Discovery and connection engine
//!
//! [`NearbyEngine`] is a cheap, cloneable handle. The state lives in a single
//! controller task; handle methods send it a command and await the reply.

mod controller;
pub mod directory;
pub mod events;
pub mod invitation;

pub use controller::EngineStatus;
pub use directory::{ConnectionState, DirectoryError, Endpoint, EndpointDirectory, EndpointInfo};
pub use events::{
    ConnectionRequested, ConnectionResult, ConnectionStatus, EndpointFound, EndpointLost,
    MessageReceived, NearbyEvent, PayloadTransferUpdate, TransferStatus,
};
pub use invitation::{InvitationBook, PendingInvitation};

use crate::config::EngineConfig;
use crate::logging::{self, LogLevel};
use crate::transport::Transports;
use crate::NearbyError;
use controller::{Controller, EngineCommand, Reply};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

const COMMAND_CHANNEL_CAPACITY: usize = 128;

fn task_not_running() -> NearbyError {
    NearbyError::NotInitialized("engine task not running".to_string())
}

/// Handle to a running engine
#[derive(Clone)]
pub struct NearbyEngine {
    command_tx: mpsc::Sender<EngineCommand>,
}

impl NearbyEngine {
    /// Start the controller task. Must be called inside a tokio runtime.
    ///
    /// Returns the handle and the notification stream.
    pub fn spawn(
        config: EngineConfig,
        transports: Transports,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NearbyEvent>), NearbyError> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        transports.attach(&adapter_tx);
        info!(
            "Spawning nearby engine as '{}' ({})",
            config.display_name, config.device_family
        );
        let controller = Controller::new(config, transports, events_tx, internal_tx);
        tokio::spawn(controller.run(command_rx, adapter_rx, internal_rx));

        Ok((Self { command_tx }, events_rx))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> EngineCommand,
    ) -> Result<T, NearbyError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| task_not_running())?;
        reply_rx.await.map_err(|_| task_not_running())?
    }

    /// Start an activity session. Re-initializing cleans up the previous one.
    pub async fn initialize(
        &self,
        service_id: &str,
        service_uuid: Option<&str>,
    ) -> Result<(), NearbyError> {
        let service_id = service_id.to_string();
        let service_uuid = service_uuid.map(str::to_string);
        self.request(|reply| EngineCommand::Initialize {
            service_id,
            service_uuid,
            reply,
        })
        .await
    }

    pub async fn set_display_name(&self, name: &str) -> Result<(), NearbyError> {
        let name = name.to_string();
        self.request(|reply| EngineCommand::SetDisplayName { name, reply })
            .await
    }

    /// Default bound for radio commands queued from now on
    pub async fn set_command_timeout(&self, timeout: Duration) -> Result<(), NearbyError> {
        self.request(|reply| EngineCommand::SetCommandTimeout { timeout, reply })
            .await
    }

    pub async fn start_advertising(&self) -> Result<(), NearbyError> {
        self.request(|reply| EngineCommand::StartAdvertising { reply })
            .await
    }

    pub async fn stop_advertising(&self) -> Result<(), NearbyError> {
        self.request(|reply| EngineCommand::StopAdvertising { reply })
            .await
    }

    pub async fn start_discovery(&self) -> Result<(), NearbyError> {
        self.request(|reply| EngineCommand::StartDiscovery { reply })
            .await
    }

    pub async fn stop_discovery(&self) -> Result<(), NearbyError> {
        self.request(|reply| EngineCommand::StopDiscovery { reply })
            .await
    }

    /// Resolves once the link is up, refused, or timed out
    pub async fn connect(
        &self,
        endpoint_id: &str,
        display_name: Option<&str>,
    ) -> Result<(), NearbyError> {
        let endpoint_id = endpoint_id.to_string();
        let display_name = display_name.map(str::to_string);
        self.request(|reply| EngineCommand::Connect {
            endpoint_id,
            display_name,
            reply,
        })
        .await
    }

    pub async fn accept_connection(&self, endpoint_id: &str) -> Result<(), NearbyError> {
        let endpoint_id = endpoint_id.to_string();
        self.request(|reply| EngineCommand::AcceptConnection { endpoint_id, reply })
            .await
    }

    pub async fn reject_connection(&self, endpoint_id: &str) -> Result<(), NearbyError> {
        let endpoint_id = endpoint_id.to_string();
        self.request(|reply| EngineCommand::RejectConnection { endpoint_id, reply })
            .await
    }

    pub async fn disconnect_from_endpoint(&self, endpoint_id: &str) -> Result<(), NearbyError> {
        let endpoint_id = endpoint_id.to_string();
        self.request(|reply| EngineCommand::Disconnect { endpoint_id, reply })
            .await
    }

    pub async fn disconnect_all(&self) -> Result<(), NearbyError> {
        self.request(|reply| EngineCommand::DisconnectAll { reply })
            .await
    }

    pub async fn send_message(&self, endpoint_id: &str, text: &str) -> Result<(), NearbyError> {
        let endpoint_id = endpoint_id.to_string();
        let text = text.to_string();
        self.request(|reply| EngineCommand::SendMessage {
            endpoint_id,
            text,
            reply,
        })
        .await
    }

    /// Process-wide verbosity, 0 (none) to 5 (verbose)
    pub fn set_log_level(&self, level: u8) -> Result<(), NearbyError> {
        logging::set_log_level(LogLevel::try_from(level)?)
    }

    /// Stop everything and return to the uninitialized state. Idempotent.
    pub async fn cleanup(&self) -> Result<(), NearbyError> {
        self.request(|reply| EngineCommand::Cleanup { reply })
            .await
    }

    pub async fn endpoints(&self) -> Result<Vec<EndpointInfo>, NearbyError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::Endpoints { reply: reply_tx })
            .await
            .map_err(|_| task_not_running())?;
        reply_rx.await.map_err(|_| task_not_running())
    }

    pub async fn status(&self) -> Result<EngineStatus, NearbyError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::Status { reply: reply_tx })
            .await
            .map_err(|_| task_not_running())?;
        reply_rx.await.map_err(|_| task_not_running())
    }

    pub async fn is_advertising(&self) -> Result<bool, NearbyError> {
        Ok(self.status().await?.advertising)
    }

    pub async fn is_discovering(&self) -> Result<bool, NearbyError> {
        Ok(self.status().await?.discovering)
    }

    /// Clean up and stop the controller task
    pub async fn shutdown(&self) -> Result<(), NearbyError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| task_not_running())?;
        reply_rx.await.map_err(|_| task_not_running())
    }
}
