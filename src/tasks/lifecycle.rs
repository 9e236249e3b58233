use std::{future::Future, sync::Arc};

use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::externals::control_api::task::task_serve_control_api;

use super::{
    control_plane::{control_channel, ControlPlane, QuitSignal, ShutdownReason},
    sensor_controller::{task_monitor_sensor, SensorController},
};

/// Everything spawned at startup, kept together so that it is released on a
/// single path at exit.
pub struct Lifecycle {
    plane: Arc<ControlPlane>,
    quit: QuitSignal,
    tracker: TaskTracker,
    monitors: Vec<JoinHandle<SensorController>>,
    server: Option<JoinHandle<()>>,
}

impl Lifecycle {
    /// Spawn one monitor per controller and wire them to a new control plane,
    /// in the given order.
    pub fn start(controllers: Vec<SensorController>, tracker: TaskTracker) -> Self {
        let quit = QuitSignal::new();
        let mut channels = Vec::with_capacity(controllers.len());
        let mut monitors = Vec::with_capacity(controllers.len());
        for controller in controllers {
            let (channel, endpoint) = control_channel(controller.name());
            monitors.push(tracker.spawn(task_monitor_sensor(controller, endpoint)));
            channels.push(channel);
        }
        info!("Monitoring {} sensors.", monitors.len());

        Self {
            plane: Arc::new(ControlPlane::new(channels, quit.clone())),
            quit,
            tracker,
            monitors,
            server: None,
        }
    }

    #[cfg(test)]
    pub fn plane(&self) -> Arc<ControlPlane> {
        self.plane.clone()
    }

    pub fn quit_signal(&self) -> QuitSignal {
        self.quit.clone()
    }

    /// Serve the control API on `listener` until the quit signal fires.
    pub fn serve(&mut self, listener: TcpListener) {
        self.server = Some(self.tracker.spawn(task_serve_control_api(
            listener,
            self.plane.clone(),
            self.quit.clone(),
        )));
    }

    /// Block until either `os_signal` completes or the quit signal fires,
    /// whichever comes first. Sensors are stopped on the signal path; a kill
    /// request has already stopped them.
    #[instrument(skip_all)]
    pub async fn wait_for_exit_signal(&self, os_signal: impl Future<Output = ()>) -> ShutdownReason {
        info!("Waiting for exit signal...");
        tokio::select! {
            _ = os_signal => {
                if self.quit.fire(ShutdownReason::Signal) {
                    if let Err(e) = self.plane.stop_all().await {
                        error!("Failed to stop sensors. Error: {}", e);
                    }
                }
            },
            _ = self.quit.fired() => {}
        };

        let reason = self.quit.reason().unwrap_or(ShutdownReason::Signal);
        info!("Exiting on {}.", reason);
        reason
    }

    /// Release everything, in order: the listener, the control plane, then
    /// each sensor in registration order, and finally any task still tracked.
    #[instrument(skip_all)]
    pub async fn shutdown(self) {
        if !self.quit.is_fired() {
            warn!("Shutting down without a quit signal.");
            self.quit.fire(ShutdownReason::Signal);
        }

        if let Some(server) = self.server {
            if let Err(e) = server.await {
                error!("Control API task ended abnormally. Error: {}", e);
            }
        }

        let mut channels = self.plane.close().await.into_iter();
        for monitor in self.monitors {
            // Closing the channel ends the monitor, which stops its loop.
            if let Some(channel) = channels.next() {
                debug!("Closing command channel of sensor {}.", channel.name());
            }
            match monitor.await {
                Ok(controller) => {
                    if let Some(last) = controller.subscribe().borrow().as_ref() {
                        info!("Last measurement of {}: {}", controller.name(), last.reading);
                    }
                    controller.close();
                }
                Err(e) => error!("Sensor monitor ended abnormally. Error: {}", e),
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        debug!("All tasks finished.");
    }
}

/// Completes on Ctrl-C, or on SIGTERM where available.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C. Error: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM. Error: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
