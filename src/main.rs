pub mod config;
pub mod externals;
pub mod logging;
pub mod models;
pub mod tasks;

use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::Config;
use externals::{
    control_api::{
        autostart::{request_start, AUTOSTART_TIMEOUT},
        task::START_PATH,
    },
    sensors::bme280::Bme280Reader,
    telemetry::services::{DryRunSink, InfluxDbSink, TelemetrySink},
};
use tasks::{
    control_plane::ShutdownReason,
    lifecycle::{termination_signal, Lifecycle},
    sensor_controller::SensorController,
};
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Poll environmental sensors and publish their readings.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Start data acquisition right away
    #[arg(short, long)]
    start: bool,

    /// Read sensors without writing to the database
    #[arg(short, long)]
    dry_run: bool,

    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    let _log_guard = logging::init(&config.logger)?;
    info!("{}", config.describe());

    let sink = build_sink(&config, cli.dry_run).map_err(fatal)?;
    let tracker = TaskTracker::new();

    let mut controllers: Vec<SensorController> = Vec::with_capacity(config.sensors.len());
    for sensor in &config.sensors {
        let reader = Arc::new(Bme280Reader::new(sensor.bus.clone(), sensor.address));
        let controller =
            SensorController::new(sensor.profile(), reader, sink.clone(), tracker.clone())
                .with_poll_interval(sensor.poll_interval());
        if let Err(e) = controller.open() {
            let error = fatal(anyhow!(e).context(format!("Failed to open sensor {}", sensor.name)));
            controllers.iter().for_each(SensorController::close);
            return Err(error);
        }
        controllers.push(controller);
    }

    let mut lifecycle = Lifecycle::start(controllers, tracker);
    let quit = lifecycle.quit_signal();

    let bind_address = (config.api.bind_address.as_str(), config.api.port);
    let listener = match TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            let error = fatal(anyhow!(e).context(format!(
                "Failed to listen on {}:{}",
                config.api.bind_address, config.api.port
            )));
            quit.fire(ShutdownReason::StartupFailure);
            lifecycle.shutdown().await;
            return Err(error);
        }
    };
    lifecycle.serve(listener);

    let mut startup_error = None;
    if cli.start {
        let url = format!("{}{}", config.api.url(), START_PATH);
        if let Err(e) = request_start(&url, AUTOSTART_TIMEOUT).await {
            error!("Failed to start data acquisition. Error: {}", e);
            quit.fire(ShutdownReason::StartupFailure);
            startup_error = Some(e);
        }
    } else {
        info!("Waiting for start signal on {}{}", config.api.url(), START_PATH);
    }

    lifecycle.wait_for_exit_signal(termination_signal()).await;
    lifecycle.shutdown().await;
    info!("Exited.");

    match startup_error {
        Some(e) => Err(e).context("Data acquisition could not be started"),
        None => Ok(()),
    }
}

/// Log a startup error with its causes before it ends the process.
fn fatal(error: anyhow::Error) -> anyhow::Error {
    error!("{:#}", error);
    error
}

fn build_sink(config: &Config, dry_run: bool) -> Result<Arc<dyn TelemetrySink>> {
    if dry_run {
        info!("Dry run enabled, not writing data to database.");
        return Ok(Arc::new(DryRunSink));
    }
    if !config.writes_to_database() {
        warn!("No database token given, not writing data to database.");
        return Ok(Arc::new(DryRunSink));
    }
    let sink = InfluxDbSink::new(&config.database).context("Failed to create database client")?;
    Ok(Arc::new(sink))
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use clap::CommandFactory;

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from(["raspberry_sensors", "-s", "-d"]).unwrap();
        assert!(cli.start);
        assert!(cli.dry_run);
        assert_eq!(cli.config, PathBuf::from("config.toml"));

        let cli = Cli::try_parse_from(["raspberry_sensors", "--config", "/etc/sensors.toml"]).unwrap();
        assert!(!cli.start);
        assert!(!cli.dry_run);
        assert_eq!(cli.config, PathBuf::from("/etc/sensors.toml"));
    }

    #[test]
    fn test_fatal_errors_are_logged_with_cause() {
        let buffer = SharedBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let buffer = buffer.clone();
                move || buffer.clone()
            })
            .finish();

        let error = tracing::subscriber::with_default(subscriber, || {
            fatal(anyhow!("No such device").context("Failed to open sensor BME280"))
        });

        let logs = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("ERROR"));
        assert!(logs.contains("Failed to open sensor BME280: No such device"));
        assert_eq!(error.to_string(), "Failed to open sensor BME280");
    }

    #[test]
    fn test_invalid_database_url_is_fatal() {
        let mut config = Config::default();
        config.database.token = "abc".into();
        config.database.host = "http://bad host".into();
        assert!(build_sink(&config, false).is_err());
        assert!(build_sink(&config, true).is_ok());
    }
}
