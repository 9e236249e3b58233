use thiserror::Error;

use crate::models::measurement::Reading;

/// This service separates the bus and register protocol of a physical
/// sensor from the acquisition logic, which keeps the controller testable
/// without hardware.
///
/// All calls block the calling thread.
pub trait SensorReader: Send + Sync + 'static {
    /// Acquire the bus handle and prepare the device. A failure here means
    /// the sensor can never be read.
    fn open(&self) -> Result<(), SensorError>;

    /// Perform one measurement. No retries are attempted.
    fn read(&self) -> Result<Reading, SensorError>;

    /// Release the bus handle. Calling this on a closed reader is a no-op.
    fn halt(&self) -> Result<(), SensorError>;
}

#[derive(Error, Debug)]
pub enum SensorError {
    /// The bus device could not be opened.
    #[error("Failed to open bus '{bus}' at address {address:#04x}. Error: {source}")]
    OpenBus {
        bus: String,
        address: u16,
        #[source]
        source: std::io::Error,
    },

    /// Something answered on the address but it is not a supported chip.
    #[error("Unsupported chip id {0:#04x}.")]
    UnsupportedChip(u8),

    /// A register transfer failed.
    #[error("Bus transfer failed. Error: {0}")]
    Transfer(std::io::Error),

    /// The device never finished a conversion.
    #[error("Timed out waiting for the measurement to complete.")]
    Timeout,

    /// `read` was called before `open` or after `halt`.
    #[error("Sensor is not open.")]
    NotOpen,
}
