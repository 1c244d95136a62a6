mod mock;
pub use mock::MockGpio;

#[cfg(feature = "hardware")]
mod rpi;
#[cfg(feature = "hardware")]
pub use rpi::RppalGpio;

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Up,
    Down,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Whether a transition to `level` matches this trigger.
    pub fn matches(self, level: Level) -> bool {
        match self {
            Edge::Rising => level == Level::High,
            Edge::Falling => level == Level::Low,
            Edge::Both => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpioError {
    /// The pin has not been configured in either direction.
    PinUnconfigured(u8),
    /// The pin is configured, but not for the requested operation.
    DirectionMismatch(u8),
    /// The underlying driver failed.
    Driver(String),
}

impl fmt::Display for GpioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpioError::PinUnconfigured(pin) => write!(f, "pin {} is not configured", pin),
            GpioError::DirectionMismatch(pin) => {
                write!(f, "pin {} is configured for the other direction", pin)
            }
            GpioError::Driver(msg) => write!(f, "gpio driver error: {}", msg),
        }
    }
}

impl std::error::Error for GpioError {}

/// Handler invoked from the driver's notification context with the level the
/// pin settled at. It must return promptly and must not call back into the
/// port.
pub type EdgeHandler = Box<dyn Fn(Level) + Send + Sync + 'static>;

/// Uniform digital I/O port over BCM-numbered pins. One hardware binding,
/// one in-memory fake; both honour the same configuration contract.
pub trait GpioPort: Send + Sync {
    fn configure_input(&self, pin: u8, pull: Pull) -> Result<(), GpioError>;
    fn configure_output(&self, pin: u8) -> Result<(), GpioError>;
    fn read(&self, pin: u8) -> Result<Level, GpioError>;
    fn write(&self, pin: u8, level: Level) -> Result<(), GpioError>;
    fn on_edge(&self, pin: u8, edge: Edge, handler: EdgeHandler) -> Result<(), GpioError>;
    fn remove_handler(&self, pin: u8) -> Result<(), GpioError>;
}
