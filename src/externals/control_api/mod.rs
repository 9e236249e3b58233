pub mod autostart;
pub mod task;
