use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{config::DatabaseConfig, models::measurement::Measurement};

use super::line_protocol;

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Durably records measurements somewhere outside the process.
pub trait TelemetrySink: Send + Sync + 'static {
    fn write<'a>(&'a self, measurement: &'a Measurement) -> BoxFuture<'a, Result<(), TelemetryError>>;
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to build the database client. Error: {0}")]
    Client(reqwest::Error),

    #[error("Invalid database url '{0}'.")]
    InvalidUrl(String),

    #[error("Measurement '{0}' has no writable fields.")]
    NoFields(String),

    #[error("Measurement timestamp can't be expressed in nanoseconds.")]
    TimestampOutOfRange,

    #[error("Failed to send write request. Error: {0}")]
    Request(reqwest::Error),

    #[error("Database rejected write with status {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Writes points to an InfluxDB v2 instance over its HTTP write API.
pub struct InfluxDbSink {
    client: reqwest::Client,
    write_url: reqwest::Url,
    token: String,
    org: String,
    bucket: String,
}

impl InfluxDbSink {
    pub fn new(config: &DatabaseConfig) -> Result<Self, TelemetryError> {
        let base = format!("{}:{}", config.host, config.port);
        let write_url = reqwest::Url::parse(&base)
            .and_then(|url| url.join("/api/v2/write"))
            .map_err(|_| TelemetryError::InvalidUrl(base.clone()))?;
        let client = reqwest::Client::builder()
            .timeout(WRITE_TIMEOUT)
            .build()
            .map_err(TelemetryError::Client)?;
        debug!(
            "Writing to {} (org={}, bucket={}).",
            write_url, config.org, config.bucket
        );
        Ok(Self {
            client,
            write_url,
            token: config.token.clone(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
        })
    }

    async fn write_point(&self, measurement: &Measurement) -> Result<(), TelemetryError> {
        let body = line_protocol::encode(measurement)?;
        trace!("Writing point: {}", body);
        let response = self
            .client
            .post(self.write_url.clone())
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(TelemetryError::Request)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TelemetryError::Rejected { status, body })
    }
}

impl TelemetrySink for InfluxDbSink {
    fn write<'a>(&'a self, measurement: &'a Measurement) -> BoxFuture<'a, Result<(), TelemetryError>> {
        Box::pin(self.write_point(measurement))
    }
}

/// Accepts every measurement without persisting it.
pub struct DryRunSink;

impl TelemetrySink for DryRunSink {
    fn write<'a>(&'a self, measurement: &'a Measurement) -> BoxFuture<'a, Result<(), TelemetryError>> {
        debug!("Dry run, not writing to DB: {}", measurement.name);
        Box::pin(futures::future::ready(Ok(())))
    }
}
