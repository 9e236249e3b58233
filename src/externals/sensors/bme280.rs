use std::{
    io,
    sync::{Mutex, PoisonError},
    thread,
    time::Duration,
};

use i2cdev::{
    core::{I2CMessage, I2CTransfer},
    linux::{LinuxI2CDevice, LinuxI2CMessage},
};
use tracing::{debug, instrument, trace, warn};

use crate::models::measurement::Reading;

use super::services::{SensorError, SensorReader};

const REG_CALIBRATION_TP: u8 = 0x88;
const REG_CHIP_ID: u8 = 0xD0;
const REG_RESET: u8 = 0xE0;
const REG_CALIBRATION_H: u8 = 0xE1;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_DATA: u8 = 0xF7;

const CHIP_ID_BME280: u8 = 0x60;
const CHIP_ID_BMP280: u8 = 0x58;
const RESET_COMMAND: u8 = 0xB6;

const STATUS_MEASURING: u8 = 0x08;
const STATUS_IM_UPDATE: u8 = 0x01;

// x1 oversampling on every channel.
const CTRL_HUM_OSRS_X1: u8 = 0x01;
const CTRL_MEAS_FORCED_X1: u8 = (0b001 << 5) | (0b001 << 2) | 0b01;
const CTRL_MEAS_SLEEP: u8 = 0x00;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(2);
const STATUS_POLL_ATTEMPTS: usize = 50;

/// Raw register access to a device on a bus.
pub trait RegisterBus: Send {
    /// Burst read consecutive registers starting at `start`.
    fn read_registers(&mut self, start: u8, buffer: &mut [u8]) -> io::Result<()>;
    fn write_register(&mut self, register: u8, value: u8) -> io::Result<()>;
}

fn i2c_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

impl RegisterBus for LinuxI2CDevice {
    fn read_registers(&mut self, start: u8, buffer: &mut [u8]) -> io::Result<()> {
        let reg = [start];
        let mut msgs = [LinuxI2CMessage::write(&reg), LinuxI2CMessage::read(buffer)];
        self.transfer(&mut msgs).map(|_| ()).map_err(i2c_error)
    }

    fn write_register(&mut self, register: u8, value: u8) -> io::Result<()> {
        let data = [register, value];
        let mut msgs = [LinuxI2CMessage::write(&data)];
        self.transfer(&mut msgs).map(|_| ()).map_err(i2c_error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chip {
    Bme280,
    Bmp280,
}

/// Factory trimming values burnt into the chip's NVM.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Calibration {
    t1: u16,
    t2: i16,
    t3: i16,
    p1: u16,
    p2: i16,
    p3: i16,
    p4: i16,
    p5: i16,
    p6: i16,
    p7: i16,
    p8: i16,
    p9: i16,
    h1: u8,
    h2: i16,
    h3: u8,
    h4: i16,
    h5: i16,
    h6: i8,
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_i16(bytes: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([bytes[at], bytes[at + 1]])
}

impl Calibration {
    /// Parse the 26 bytes starting at 0x88 and, for BME280, the 7 bytes
    /// starting at 0xE1.
    fn parse(tp: &[u8; 26], h: Option<&[u8; 7]>) -> Self {
        let mut calibration = Calibration {
            t1: le_u16(tp, 0),
            t2: le_i16(tp, 2),
            t3: le_i16(tp, 4),
            p1: le_u16(tp, 6),
            p2: le_i16(tp, 8),
            p3: le_i16(tp, 10),
            p4: le_i16(tp, 12),
            p5: le_i16(tp, 14),
            p6: le_i16(tp, 16),
            p7: le_i16(tp, 18),
            p8: le_i16(tp, 20),
            p9: le_i16(tp, 22),
            h1: tp[25],
            ..Default::default()
        };
        if let Some(h) = h {
            calibration.h2 = le_i16(h, 0);
            calibration.h3 = h[2];
            // H4 and H5 are 12-bit signed values sharing the nibbles of 0xE5.
            calibration.h4 = ((h[3] as i8 as i16) << 4) | (h[4] & 0x0F) as i16;
            calibration.h5 = ((h[5] as i8 as i16) << 4) | (h[4] >> 4) as i16;
            calibration.h6 = h[6] as i8;
        }
        calibration
    }

    /// Returns `(t_fine, degrees Celsius)`.
    fn temperature(&self, adc_t: i32) -> (f64, f64) {
        let adc_t = adc_t as f64;
        let t1 = self.t1 as f64;
        let var1 = (adc_t / 16384.0 - t1 / 1024.0) * self.t2 as f64;
        let var2 = (adc_t / 131072.0 - t1 / 8192.0).powi(2) * self.t3 as f64;
        let t_fine = var1 + var2;
        (t_fine, t_fine / 5120.0)
    }

    /// Pressure in Pa.
    fn pressure(&self, adc_p: i32, t_fine: f64) -> f64 {
        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * self.p6 as f64 / 32768.0;
        var2 += var1 * self.p5 as f64 * 2.0;
        var2 = var2 / 4.0 + self.p4 as f64 * 65536.0;
        var1 = (self.p3 as f64 * var1 * var1 / 524288.0 + self.p2 as f64 * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * self.p1 as f64;
        if var1 == 0.0 {
            return 0.0;
        }
        let mut p = 1048576.0 - adc_p as f64;
        p = (p - var2 / 4096.0) * 6250.0 / var1;
        let var1 = self.p9 as f64 * p * p / 2147483648.0;
        let var2 = p * self.p8 as f64 / 32768.0;
        p + (var1 + var2 + self.p7 as f64) / 16.0
    }

    /// Relative humidity in percent, clamped to 0..=100.
    fn humidity(&self, adc_h: i32, t_fine: f64) -> f64 {
        let mut h = t_fine - 76800.0;
        h = (adc_h as f64 - (self.h4 as f64 * 64.0 + self.h5 as f64 / 16384.0 * h))
            * (self.h2 as f64 / 65536.0
                * (1.0
                    + self.h6 as f64 / 67108864.0
                        * h
                        * (1.0 + self.h3 as f64 / 67108864.0 * h)));
        h *= 1.0 - self.h1 as f64 * h / 524288.0;
        h.clamp(0.0, 100.0)
    }
}

fn adc_20bit(bytes: &[u8]) -> i32 {
    ((bytes[0] as i32) << 12) | ((bytes[1] as i32) << 4) | ((bytes[2] as i32) >> 4)
}

/// Driver for a Bosch BME280 (or BMP280) in forced mode.
pub struct Bme280<B: RegisterBus> {
    bus: B,
    chip: Chip,
    calibration: Calibration,
}

impl<B: RegisterBus> Bme280<B> {
    /// Identify, reset and load the calibration of the chip behind `bus`.
    pub fn init(mut bus: B) -> Result<Self, SensorError> {
        let mut id = [0u8; 1];
        bus.read_registers(REG_CHIP_ID, &mut id)
            .map_err(SensorError::Transfer)?;
        let chip = match id[0] {
            CHIP_ID_BME280 => Chip::Bme280,
            CHIP_ID_BMP280 => Chip::Bmp280,
            other => return Err(SensorError::UnsupportedChip(other)),
        };
        debug!("Found {:?} (chip id {:#04x}).", chip, id[0]);

        bus.write_register(REG_RESET, RESET_COMMAND)
            .map_err(SensorError::Transfer)?;
        wait_for_status_clear(&mut bus, STATUS_IM_UPDATE)?;

        let mut tp = [0u8; 26];
        bus.read_registers(REG_CALIBRATION_TP, &mut tp)
            .map_err(SensorError::Transfer)?;
        let calibration = if chip == Chip::Bme280 {
            let mut h = [0u8; 7];
            bus.read_registers(REG_CALIBRATION_H, &mut h)
                .map_err(SensorError::Transfer)?;
            Calibration::parse(&tp, Some(&h))
        } else {
            Calibration::parse(&tp, None)
        };
        trace!("Loaded calibration: {:?}", calibration);

        Ok(Self {
            bus,
            chip,
            calibration,
        })
    }

    /// Trigger one forced-mode conversion and compensate the result.
    pub fn measure(&mut self) -> Result<Reading, SensorError> {
        if self.chip == Chip::Bme280 {
            // ctrl_hum only latches on the following ctrl_meas write.
            self.bus
                .write_register(REG_CTRL_HUM, CTRL_HUM_OSRS_X1)
                .map_err(SensorError::Transfer)?;
        }
        self.bus
            .write_register(REG_CTRL_MEAS, CTRL_MEAS_FORCED_X1)
            .map_err(SensorError::Transfer)?;
        wait_for_status_clear(&mut self.bus, STATUS_MEASURING)?;

        let mut raw = [0u8; 8];
        self.bus
            .read_registers(REG_DATA, &mut raw)
            .map_err(SensorError::Transfer)?;

        let adc_p = adc_20bit(&raw[0..3]);
        let adc_t = adc_20bit(&raw[3..6]);
        let (t_fine, temperature_celsius) = self.calibration.temperature(adc_t);
        let pressure_hpa = self.calibration.pressure(adc_p, t_fine) / 100.0;

        Ok(match self.chip {
            Chip::Bme280 => {
                let adc_h = ((raw[6] as i32) << 8) | raw[7] as i32;
                Reading::Environment {
                    temperature_celsius,
                    pressure_hpa,
                    humidity_percent: self.calibration.humidity(adc_h, t_fine),
                }
            }
            Chip::Bmp280 => Reading::Barometric {
                temperature_celsius,
                pressure_hpa,
            },
        })
    }

    /// Put the chip into sleep mode.
    pub fn sleep(&mut self) -> Result<(), SensorError> {
        self.bus
            .write_register(REG_CTRL_MEAS, CTRL_MEAS_SLEEP)
            .map_err(SensorError::Transfer)
    }
}

fn wait_for_status_clear<B: RegisterBus>(bus: &mut B, mask: u8) -> Result<(), SensorError> {
    let mut status = [0u8; 1];
    for _ in 0..STATUS_POLL_ATTEMPTS {
        thread::sleep(STATUS_POLL_INTERVAL);
        bus.read_registers(REG_STATUS, &mut status)
            .map_err(SensorError::Transfer)?;
        if status[0] & mask == 0 {
            return Ok(());
        }
    }
    Err(SensorError::Timeout)
}

type Connector<B> = Box<dyn Fn() -> io::Result<B> + Send + Sync>;

/// `SensorReader` backed by a BME280/BMP280 on an I2C bus.
pub struct Bme280Reader<B: RegisterBus = LinuxI2CDevice> {
    bus: String,
    address: u16,
    connect: Connector<B>,
    device: Mutex<Option<Bme280<B>>>,
}

impl Bme280Reader<LinuxI2CDevice> {
    pub fn new(bus: impl Into<String>, address: u16) -> Self {
        let bus = bus.into();
        let path = bus.clone();
        Self::with_connector(bus, address, move || {
            LinuxI2CDevice::new(&path, address).map_err(i2c_error)
        })
    }
}

impl<B: RegisterBus> Bme280Reader<B> {
    pub fn with_connector(
        bus: impl Into<String>,
        address: u16,
        connect: impl Fn() -> io::Result<B> + Send + Sync + 'static,
    ) -> Self {
        Self {
            bus: bus.into(),
            address,
            connect: Box::new(connect),
            device: Mutex::new(None),
        }
    }
}

impl<B: RegisterBus + 'static> SensorReader for Bme280Reader<B> {
    #[instrument(skip_all, fields(bus = %self.bus, address = self.address))]
    fn open(&self) -> Result<(), SensorError> {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        if device.is_some() {
            warn!("Already open.");
            return Ok(());
        }
        let bus = (self.connect)().map_err(|source| SensorError::OpenBus {
            bus: self.bus.clone(),
            address: self.address,
            source,
        })?;
        *device = Some(Bme280::init(bus)?);
        debug!("Opened.");
        Ok(())
    }

    fn read(&self) -> Result<Reading, SensorError> {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        device.as_mut().ok_or(SensorError::NotOpen)?.measure()
    }

    #[instrument(skip_all, fields(bus = %self.bus, address = self.address))]
    fn halt(&self) -> Result<(), SensorError> {
        let taken = self
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(mut device) => device.sleep(),
            None => {
                trace!("Not open, nothing to halt.");
                Ok(())
            }
        }
    }
}
