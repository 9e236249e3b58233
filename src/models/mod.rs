pub mod measurement;
pub mod sensor_command;
