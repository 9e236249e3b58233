use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace};

pub const AUTOSTART_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum AutostartError {
    #[error("Failed to build http client. Error: {0}")]
    Client(reqwest::Error),

    #[error("Request to {url} failed. Error: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("Gave up on {url} after {timeout:?}. Last error: {last}")]
    TimedOut {
        url: String,
        timeout: Duration,
        last: String,
    },
}

/// Ask the local control endpoint to start acquisition, retrying while the
/// connection is refused, until `timeout` has elapsed. Any other failure is
/// returned immediately.
#[instrument(skip_all, fields(url = %url))]
pub async fn request_start(url: &str, timeout: Duration) -> Result<(), AutostartError> {
    info!("Sending data acquisition start signal right away");
    let client = reqwest::Client::builder()
        .build()
        .map_err(AutostartError::Client)?;
    let deadline = Instant::now() + timeout;
    let mut last = String::from("no attempt made");

    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match client.get(url).timeout(remaining).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Acquisition started.");
                return Ok(());
            }
            Ok(response) => {
                return Err(AutostartError::Status {
                    url: url.to_string(),
                    status: response.status(),
                })
            }
            Err(e) if e.is_connect() => {
                trace!("Endpoint not ready yet. Error: {}", e);
                last = e.to_string();
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(source) => {
                return Err(AutostartError::Request {
                    url: url.to_string(),
                    source,
                })
            }
        }
    }

    Err(AutostartError::TimedOut {
        url: url.to_string(),
        timeout,
        last,
    })
}
