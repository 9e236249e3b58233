pub mod bme280;
pub mod services;
