use std::fmt::Write;

use crate::models::measurement::Measurement;

use super::services::TelemetryError;

fn escape_measurement(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
}

fn escape_key(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Encode a measurement as a single InfluxDB line protocol point with a
/// nanosecond timestamp. Non-finite fields and empty tags are dropped.
pub fn encode(measurement: &Measurement) -> Result<String, TelemetryError> {
    let mut line = escape_measurement(&measurement.name);
    for (key, value) in measurement
        .tags
        .iter()
        .filter(|(key, value)| !key.is_empty() && !value.is_empty())
    {
        let _ = write!(line, ",{}={}", escape_key(key), escape_key(value));
    }

    let fields = measurement
        .fields()
        .into_iter()
        .filter(|(_, value)| value.is_finite())
        .map(|(key, value)| format!("{}={}", escape_key(key), value))
        .collect::<Vec<_>>();
    if fields.is_empty() {
        return Err(TelemetryError::NoFields(measurement.name.clone()));
    }
    line.push(' ');
    line.push_str(&fields.join(","));

    let nanos = measurement
        .timestamp
        .timestamp_nanos_opt()
        .ok_or(TelemetryError::TimestampOutOfRange)?;
    let _ = write!(line, " {}", nanos);
    Ok(line)
}
