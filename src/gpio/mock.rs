use super::{Edge, EdgeHandler, GpioError, GpioPort, Level, Pull};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Input,
    Output,
}

struct PinState {
    direction: Direction,
    level: Level,
}

struct Watcher {
    edge: Edge,
    handler: Arc<EdgeHandler>,
}

#[derive(Default)]
struct MockState {
    pins: HashMap<u8, PinState>,
    watchers: HashMap<u8, Watcher>,
}

/// In-memory GPIO port. Tests script waveforms with [`MockGpio::set_level`]
/// and [`MockGpio::pulse`]; edge handlers fire synchronously from the
/// stimulating call, which stands in for the driver's notification context.
#[derive(Clone, Default)]
pub struct MockGpio {
    state: Arc<Mutex<MockState>>,
}

impl MockGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive an input pin to `level`, dispatching any matching edge handler.
    pub fn set_level(&self, pin: u8, level: Level) {
        // Decide under the lock, invoke outside it, so a handler may read
        // the port without deadlocking.
        let handler = {
            let mut state = self.state.lock().unwrap();
            let changed = match state.pins.get_mut(&pin) {
                Some(p) if p.level != level => {
                    p.level = level;
                    true
                }
                _ => false,
            };
            if changed {
                state
                    .watchers
                    .get(&pin)
                    .filter(|w| w.edge.matches(level))
                    .map(|w| w.handler.clone())
            } else {
                None
            }
        };
        if let Some(handler) = handler {
            handler(level);
        }
    }

    /// Script one low-going pulse: low for `low`, back high for `high`.
    pub async fn pulse(&self, pin: u8, low: Duration, high: Duration) {
        self.set_level(pin, Level::Low);
        tokio::time::sleep(low).await;
        self.set_level(pin, Level::High);
        tokio::time::sleep(high).await;
    }

    /// Level currently latched on an output pin, for assertions.
    pub fn output_level(&self, pin: u8) -> Option<Level> {
        let state = self.state.lock().unwrap();
        state
            .pins
            .get(&pin)
            .filter(|p| p.direction == Direction::Output)
            .map(|p| p.level)
    }
}

impl GpioPort for MockGpio {
    fn configure_input(&self, pin: u8, pull: Pull) -> Result<(), GpioError> {
        let mut state = self.state.lock().unwrap();
        let level = match pull {
            Pull::Up => Level::High,
            Pull::Down | Pull::None => Level::Low,
        };
        state.pins.insert(
            pin,
            PinState {
                direction: Direction::Input,
                level,
            },
        );
        Ok(())
    }

    fn configure_output(&self, pin: u8) -> Result<(), GpioError> {
        let mut state = self.state.lock().unwrap();
        state.pins.insert(
            pin,
            PinState {
                direction: Direction::Output,
                level: Level::Low,
            },
        );
        Ok(())
    }

    fn read(&self, pin: u8) -> Result<Level, GpioError> {
        let state = self.state.lock().unwrap();
        match state.pins.get(&pin) {
            Some(p) if p.direction == Direction::Input => Ok(p.level),
            Some(_) => Err(GpioError::DirectionMismatch(pin)),
            None => Err(GpioError::PinUnconfigured(pin)),
        }
    }

    fn write(&self, pin: u8, level: Level) -> Result<(), GpioError> {
        let mut state = self.state.lock().unwrap();
        match state.pins.get_mut(&pin) {
            Some(p) if p.direction == Direction::Output => {
                p.level = level;
                Ok(())
            }
            Some(_) => Err(GpioError::DirectionMismatch(pin)),
            None => Err(GpioError::PinUnconfigured(pin)),
        }
    }

    fn on_edge(&self, pin: u8, edge: Edge, handler: EdgeHandler) -> Result<(), GpioError> {
        let mut state = self.state.lock().unwrap();
        match state.pins.get(&pin) {
            Some(p) if p.direction == Direction::Input => {
                state.watchers.insert(
                    pin,
                    Watcher {
                        edge,
                        handler: Arc::new(handler),
                    },
                );
                Ok(())
            }
            Some(_) => Err(GpioError::DirectionMismatch(pin)),
            None => Err(GpioError::PinUnconfigured(pin)),
        }
    }

    fn remove_handler(&self, pin: u8) -> Result<(), GpioError> {
        let mut state = self.state.lock().unwrap();
        state.watchers.remove(&pin);
        Ok(())
    }
}
