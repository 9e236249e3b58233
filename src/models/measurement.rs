use std::{collections::BTreeMap, fmt::Display};

use chrono::{DateTime, Utc};

pub const TEMPERATURE_FIELD: &str = "temperature_celsius";
pub const PRESSURE_FIELD: &str = "pressure_hpa";
pub const HUMIDITY_FIELD: &str = "humidity_percent";

/// One compensated sample read from an environmental sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Temperature, pressure and relative humidity (BME280).
    Environment {
        temperature_celsius: f64,
        pressure_hpa: f64,
        humidity_percent: f64,
    },
    /// Temperature and pressure only (BMP280).
    Barometric {
        temperature_celsius: f64,
        pressure_hpa: f64,
    },
}

impl Reading {
    /// Named numeric fields in a stable order.
    pub fn fields(&self) -> Vec<(&'static str, f64)> {
        match *self {
            Reading::Environment {
                temperature_celsius,
                pressure_hpa,
                humidity_percent,
            } => vec![
                (TEMPERATURE_FIELD, temperature_celsius),
                (PRESSURE_FIELD, pressure_hpa),
                (HUMIDITY_FIELD, humidity_percent),
            ],
            Reading::Barometric {
                temperature_celsius,
                pressure_hpa,
            } => vec![
                (TEMPERATURE_FIELD, temperature_celsius),
                (PRESSURE_FIELD, pressure_hpa),
            ],
        }
    }
}

impl Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reading::Environment {
                temperature_celsius,
                pressure_hpa,
                humidity_percent,
            } => write!(
                f,
                "Temperature: {:.2}°C, Pressure: {:.2} hPa, Humidity: {:.2}%",
                temperature_celsius, pressure_hpa, humidity_percent
            ),
            Reading::Barometric {
                temperature_celsius,
                pressure_hpa,
            } => write!(
                f,
                "Temperature: {:.2}°C, Pressure: {:.2} hPa",
                temperature_celsius, pressure_hpa
            ),
        }
    }
}

/// Static identity of a sensor, used to address its samples in the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorProfile {
    pub name: String,
    pub measurement: String,
    pub location: String,
}

impl SensorProfile {
    pub fn tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("sensor".to_string(), self.name.clone()),
            ("location".to_string(), self.location.clone()),
        ])
    }
}

/// A reading stamped with the time it was taken and the tags of its sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
    pub reading: Reading,
}

impl Measurement {
    pub fn new(profile: &SensorProfile, reading: Reading, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: profile.measurement.clone(),
            timestamp,
            tags: profile.tags(),
            reading,
        }
    }

    pub fn fields(&self) -> Vec<(&'static str, f64)> {
        self.reading.fields()
    }
}

impl Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.timestamp.to_rfc3339(), self.name, self.reading)
    }
}
