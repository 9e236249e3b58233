use std::sync::{Arc, OnceLock};

use derive_more::Display;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::models::sensor_command::SensorCommand;

use super::sensor_controller::{CommandEndpoint, CommandRequest};

#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// The monitor task of a controller is gone; its state is unknown.
    #[error("Sensor {0} is no longer accepting commands.")]
    ControllerGone(String),

    /// Channels were already released during shutdown.
    #[error("Control plane is shut down.")]
    ShutDown,
}

/// Control plane side of a command channel.
pub struct ControlChannel {
    name: String,
    tx_request: mpsc::Sender<CommandRequest>,
}

/// Create the channel linking the control plane to one controller. It has
/// capacity 1 and every command carries its own acknowledgment sender, so an
/// acknowledgment can only ever complete the request that asked for it.
pub fn control_channel(name: impl Into<String>) -> (ControlChannel, CommandEndpoint) {
    let (tx_request, rx_request) = mpsc::channel(1);
    (
        ControlChannel {
            name: name.into(),
            tx_request,
        },
        CommandEndpoint { rx_request },
    )
}

impl ControlChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a command and wait for its acknowledgment.
    async fn round_trip(&self, command: SensorCommand) -> Result<(), ControlPlaneError> {
        let (tx_ack, rx_ack) = oneshot::channel();
        self.tx_request
            .send(CommandRequest { command, tx_ack })
            .await
            .map_err(|_| ControlPlaneError::ControllerGone(self.name.clone()))?;
        rx_ack
            .await
            .map_err(|_| ControlPlaneError::ControllerGone(self.name.clone()))?;
        trace!("Sensor {} acknowledged {}.", self.name, command);
        Ok(())
    }
}

/// Why the process is shutting down.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    #[display(fmt = "termination signal")]
    Signal,
    #[display(fmt = "kill request")]
    KillRequest,
    #[display(fmt = "startup failure")]
    StartupFailure,
}

/// Process-wide quit signal. Fired at most once; every waiter is released
/// when it fires.
#[derive(Debug, Clone, Default)]
pub struct QuitSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl QuitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that actually fired the signal.
    pub fn fire(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason).is_err() {
            debug!("Quit already signalled, ignoring {}.", reason);
            return false;
        }
        info!("Quit signalled by {}.", reason);
        self.token.cancel();
        true
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn fired(&self) {
        self.token.cancelled().await
    }

    /// Token cancelled together with the signal, for tasks that only need
    /// to stop.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Broadcasts start/stop commands to every registered controller and waits
/// until all of them have acknowledged. Calls are serialized, so callers
/// always observe a fully started or fully stopped set.
pub struct ControlPlane {
    channels: Mutex<Option<Vec<ControlChannel>>>,
    quit: QuitSignal,
}

impl ControlPlane {
    pub fn new(channels: Vec<ControlChannel>, quit: QuitSignal) -> Self {
        Self {
            channels: Mutex::new(Some(channels)),
            quit,
        }
    }

    #[instrument(skip_all)]
    pub async fn start_all(&self) -> Result<(), ControlPlaneError> {
        self.broadcast(SensorCommand::Start).await
    }

    #[instrument(skip_all)]
    pub async fn stop_all(&self) -> Result<(), ControlPlaneError> {
        self.broadcast(SensorCommand::Stop).await
    }

    /// Stop every sensor, then fire the quit signal.
    #[instrument(skip_all)]
    pub async fn kill(&self) -> Result<(), ControlPlaneError> {
        info!("Shutting down...");
        self.stop_all().await?;
        if self.quit.fire(ShutdownReason::KillRequest) {
            info!("Bye!");
        }
        Ok(())
    }

    /// Take every channel out of the control plane, in registration order.
    /// Later commands fail with `ShutDown`.
    pub async fn close(&self) -> Vec<ControlChannel> {
        match self.channels.lock().await.take() {
            Some(channels) => channels,
            None => {
                warn!("Control plane already closed.");
                vec![]
            }
        }
    }

    async fn broadcast(&self, command: SensorCommand) -> Result<(), ControlPlaneError> {
        let guard = self.channels.lock().await;
        let channels = guard.as_ref().ok_or(ControlPlaneError::ShutDown)?;
        debug!("Sending {} to {} sensors.", command, channels.len());
        for channel in channels.iter() {
            channel.round_trip(command).await?;
        }
        debug!("All sensors acknowledged {}.", command);
        Ok(())
    }
}
