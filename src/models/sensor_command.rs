use derive_more::Display;

/// Command sent from the control plane to a single sensor controller.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SensorCommand {
    #[display(fmt = "start")]
    Start,
    #[display(fmt = "stop")]
    Stop,
}
