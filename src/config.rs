//! Startup configuration.
//!
//! Values are resolved once, in this order:
//! 1. TOML file (missing keys fall back to defaults)
//! 2. Environment variables, then variables from a `.env` file in the working
//!    directory for those the environment does not set
//!
//! The result is validated before anything else is constructed.

use std::{
    collections::{HashMap, HashSet},
    fmt::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::models::measurement::SensorProfile;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}'. Error: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file. Error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to read .env file. Error: {0}")]
    DotEnv(#[from] dotenvy::Error),

    #[error("Config {0} can not be empty")]
    Empty(&'static str),

    #[error("Value for {0} has no protocol scheme. Add 'http://' or 'https://'")]
    MissingScheme(&'static str),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("At least one sensor must be configured")]
    NoSensors,

    #[error("Sensor name '{0}' is used more than once")]
    DuplicateSensor(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub logger: LoggerConfig,
    pub sensors: Vec<SensorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            logger: LoggerConfig::default(),
            sensors: vec![SensorConfig::default()],
        }
    }
}

/// The local control endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL (with scheme) the process uses to reach its own API.
    pub host: String,
    pub port: u16,
    /// Interface the listener binds to.
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 8080,
            bind_address: "0.0.0.0".into(),
        }
    }
}

impl ApiConfig {
    pub fn url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    /// An empty token disables database writes.
    pub token: String,
    pub org: String,
    pub bucket: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 8086,
            token: String::new(),
            org: "raspberry".into(),
            bucket: "seconds".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    /// Optional file receiving a copy of every log line.
    pub path: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "INFO".into(),
            path: String::new(),
        }
    }
}

impl LoggerConfig {
    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        match self.level.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LevelFilter::TRACE),
            "DEBUG" => Ok(LevelFilter::DEBUG),
            "INFO" => Ok(LevelFilter::INFO),
            "WARN" | "WARNING" => Ok(LevelFilter::WARN),
            "ERROR" => Ok(LevelFilter::ERROR),
            _ => Err(ConfigError::InvalidValue {
                key: "Logger Level",
                value: self.level.clone(),
            }),
        }
    }

    pub fn file(&self) -> Option<&Path> {
        (!self.path.is_empty()).then(|| Path::new(&self.path))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SensorConfig {
    pub name: String,
    #[serde(default = "default_bus")]
    pub bus: String,
    #[serde(default = "default_address")]
    pub address: u16,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    measurement: Option<String>,
    /// Time between two reads while acquisition is running.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_bus() -> String {
    "/dev/i2c-1".into()
}

fn default_address() -> u16 {
    0x76
}

fn default_location() -> String {
    "office".into()
}

fn default_interval_ms() -> u64 {
    1000
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name: "BME280".into(),
            bus: default_bus(),
            address: default_address(),
            location: default_location(),
            measurement: None,
            interval_ms: default_interval_ms(),
        }
    }
}

impl SensorConfig {
    /// Name of the series the sensor's samples are written to.
    pub fn measurement(&self) -> String {
        self.measurement
            .clone()
            .unwrap_or_else(|| format!("environment_{}", self.name.to_lowercase()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn profile(&self) -> SensorProfile {
        SensorProfile {
            name: self.name.clone(),
            measurement: self.measurement(),
            location: self.location.clone(),
        }
    }
}

pub const DOTENV_FILE: &str = ".env";

/// Variables from a dotenv file. A missing file yields none.
fn read_dotenv(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    match dotenvy::from_path_iter(path) {
        Ok(entries) => Ok(entries.collect::<Result<HashMap<_, _>, _>>()?),
        Err(e) if e.not_found() => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn parse_port(key: &'static str, value: String) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

fn require_scheme(key: &'static str, host: &str) -> Result<(), ConfigError> {
    if host.starts_with("http://") || host.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::MissingScheme(key))
    }
}

impl Config {
    /// Read `path`, apply environment and `.env` overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_from(path, Path::new(DOTENV_FILE), |key| std::env::var(key).ok())
    }

    fn load_from(
        path: &Path,
        dotenv_path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content)?;
        let dotenv = read_dotenv(dotenv_path)?;
        config.apply_overrides(|key| env(key).or_else(|| dotenv.get(key).cloned()))?;
        config.validate()?;
        Ok(config)
    }

    /// Supported variables: `SERVER_HOST`, `SERVER_PORT`, `DB_HOST`, `DB_PORT`,
    /// `DB_TOKEN`, `DB_ORG`, `DB_BUCKET`, `LOG_LEVEL`, `LOG_PATH`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("SERVER_HOST") {
            self.api.host = value;
        }
        if let Some(value) = lookup("SERVER_PORT") {
            self.api.port = parse_port("Server Port", value)?;
        }
        if let Some(value) = lookup("DB_HOST") {
            self.database.host = value;
        }
        if let Some(value) = lookup("DB_PORT") {
            self.database.port = parse_port("Database Port", value)?;
        }
        if let Some(value) = lookup("DB_TOKEN") {
            self.database.token = value;
        }
        if let Some(value) = lookup("DB_ORG") {
            self.database.org = value;
        }
        if let Some(value) = lookup("DB_BUCKET") {
            self.database.bucket = value;
        }
        if let Some(value) = lookup("LOG_LEVEL") {
            self.logger.level = value;
        }
        if let Some(value) = lookup("LOG_PATH") {
            self.logger.path = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut non_empty = vec![
            (&self.api.host, "Server Host"),
            (&self.api.bind_address, "Server Bind Address"),
            (&self.logger.level, "Logger Level"),
        ];
        if self.writes_to_database() {
            non_empty.extend([
                (&self.database.host, "Database Host"),
                (&self.database.org, "Database Org"),
                (&self.database.bucket, "Database Bucket"),
            ]);
        }
        if let Some((_, key)) = non_empty.iter().find(|(value, _)| value.trim().is_empty()) {
            return Err(ConfigError::Empty(*key));
        }

        require_scheme("Server Host", &self.api.host)?;
        if self.writes_to_database() {
            require_scheme("Database Host", &self.database.host)?;
        }
        self.logger.level_filter()?;

        if self.sensors.is_empty() {
            return Err(ConfigError::NoSensors);
        }
        let mut names = HashSet::new();
        for sensor in &self.sensors {
            if sensor.name.trim().is_empty() {
                return Err(ConfigError::Empty("Sensor Name"));
            }
            if !names.insert(sensor.name.as_str()) {
                return Err(ConfigError::DuplicateSensor(sensor.name.clone()));
            }
            if sensor.location.trim().is_empty() {
                return Err(ConfigError::Empty("Sensor Location"));
            }
            if sensor.measurement().trim().is_empty() {
                return Err(ConfigError::Empty("Sensor Measurement"));
            }
            if sensor.interval_ms == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "Sensor Interval",
                    value: sensor.interval_ms.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn writes_to_database(&self) -> bool {
        !self.database.token.is_empty()
    }

    /// Human readable summary of the effective configuration. Never
    /// includes the database token.
    pub fn describe(&self) -> String {
        let mut description = String::from("Configuration:\n");
        let _ = writeln!(description, " - Server URL: {}", self.api.url());
        let _ = writeln!(
            description,
            " - Listening on: {}:{}",
            self.api.bind_address, self.api.port
        );
        let _ = writeln!(description, " - Logger Level: {}", self.logger.level);
        let _ = writeln!(description, " - Log file path: {}", self.logger.path);
        for sensor in &self.sensors {
            let _ = writeln!(
                description,
                " - Sensor {}: {} @ {:#04x} ({})",
                sensor.name, sensor.bus, sensor.address, sensor.location
            );
        }
        if self.writes_to_database() {
            let _ = write!(
                description,
                " - Database URL: {}:{} (org={}, bucket={})",
                self.database.host, self.database.port, self.database.org, self.database.bucket
            );
        } else {
            description.push_str("No database token given, not writing data to database");
        }
        description
    }
}
