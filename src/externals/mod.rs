pub mod control_api;
pub mod sensors;
pub mod telemetry;
