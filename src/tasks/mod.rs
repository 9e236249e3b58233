pub mod control_plane;
pub mod lifecycle;
pub mod sensor_controller;
