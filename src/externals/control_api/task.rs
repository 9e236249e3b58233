use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::tasks::control_plane::{ControlPlane, ControlPlaneError, QuitSignal, ShutdownReason};

pub const START_PATH: &str = "/sensors/start";
pub const STOP_PATH: &str = "/sensors/stop";
pub const KILL_PATH: &str = "/sensors/kill";

/// Maps control plane failures onto HTTP responses.
struct ApiError(ControlPlaneError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("Control request failed. Error: {}", self.0);
        (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string()).into_response()
    }
}

impl From<ControlPlaneError> for ApiError {
    fn from(value: ControlPlaneError) -> Self {
        Self(value)
    }
}

async fn start_sensors(State(plane): State<Arc<ControlPlane>>) -> Result<StatusCode, ApiError> {
    plane.start_all().await?;
    Ok(StatusCode::OK)
}

async fn stop_sensors(State(plane): State<Arc<ControlPlane>>) -> Result<StatusCode, ApiError> {
    plane.stop_all().await?;
    Ok(StatusCode::OK)
}

async fn kill(State(plane): State<Arc<ControlPlane>>) -> Result<StatusCode, ApiError> {
    plane.kill().await?;
    Ok(StatusCode::OK)
}

pub fn router(plane: Arc<ControlPlane>) -> Router {
    Router::new()
        .route(START_PATH, any(start_sensors))
        .route(STOP_PATH, any(stop_sensors))
        .route(KILL_PATH, any(kill))
        .with_state(plane)
        .layer(TraceLayer::new_for_http())
}

/// Task: Serve the control API on `listener` until the quit signal fires.
/// Requests in flight when it fires (a kill, typically) still complete.
#[tracing::instrument(skip_all)]
pub async fn task_serve_control_api(
    listener: TcpListener,
    plane: Arc<ControlPlane>,
    quit: QuitSignal,
) {
    match listener.local_addr() {
        Ok(addr) => info!("Listening on {}...", addr),
        Err(e) => warn!("Listening on unknown address. Error: {}", e),
    }

    let token = quit.token();
    let result = axum::serve(listener, router(plane))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;

    match result {
        Ok(_) => warn!("Cancelled."),
        Err(e) => {
            error!("Control API failed. Error: {}", e);
            quit.fire(ShutdownReason::StartupFailure);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;
    use crate::tasks::{
        control_plane::control_channel,
        sensor_controller::{
            task_monitor_sensor,
            tests::{controller, FakeReader, RecordingSink},
        },
    };

    fn plane() -> (Arc<ControlPlane>, QuitSignal) {
        let reader = Arc::new(FakeReader::default());
        let sink = Arc::new(RecordingSink::default());
        let (channel, endpoint) = control_channel("A");
        tokio::spawn(task_monitor_sensor(
            controller("A", reader, sink, Duration::from_millis(10)),
            endpoint,
        ));
        let quit = QuitSignal::new();
        (Arc::new(ControlPlane::new(vec![channel], quit.clone())), quit)
    }

    async fn call(plane: &Arc<ControlPlane>, method: &str, path: &str) -> StatusCode {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        router(plane.clone()).oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_routes_accept_any_method() {
        let (plane, quit) = plane();
        assert_eq!(call(&plane, "GET", START_PATH).await, StatusCode::OK);
        assert_eq!(call(&plane, "POST", STOP_PATH).await, StatusCode::OK);
        assert!(!quit.is_fired());
    }

    #[tokio::test]
    async fn test_kill_fires_quit_signal() {
        let (plane, quit) = plane();
        assert_eq!(call(&plane, "GET", START_PATH).await, StatusCode::OK);
        assert_eq!(call(&plane, "GET", KILL_PATH).await, StatusCode::OK);
        assert_eq!(quit.reason(), Some(ShutdownReason::KillRequest));
    }

    #[tokio::test]
    async fn test_closed_plane_is_unavailable() {
        let (plane, _quit) = plane();
        drop(plane.close().await);
        assert_eq!(
            call(&plane, "GET", START_PATH).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let (plane, _quit) = plane();
        assert_eq!(call(&plane, "GET", "/sensors/restart").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_stops_when_quit_fires() {
        let (plane, quit) = plane();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = tokio::spawn(task_serve_control_api(listener, plane, quit.clone()));
        quit.fire(ShutdownReason::Signal);
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("Server did not stop")
            .unwrap();
    }
}
