pub mod line_protocol;
pub mod services;
