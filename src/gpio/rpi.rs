use super::{Edge, EdgeHandler, GpioError, GpioPort, Level, Pull};
use rppal::gpio::{Gpio, InputPin, Level as HwLevel, OutputPin, Trigger};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// Edges arriving closer together than this are electrical chatter and are
/// discarded at the interrupt source, before any component sees them.
const MIN_EDGE_INTERVAL: Duration = Duration::from_millis(10);

fn driver_err(e: rppal::gpio::Error) -> GpioError {
    GpioError::Driver(e.to_string())
}

fn from_hw(level: HwLevel) -> Level {
    match level {
        HwLevel::High => Level::High,
        HwLevel::Low => Level::Low,
    }
}

/// Hardware port over the SoC GPIO controller.
pub struct RppalGpio {
    gpio: Gpio,
    inputs: Mutex<HashMap<u8, InputPin>>,
    outputs: Mutex<HashMap<u8, OutputPin>>,
}

impl RppalGpio {
    pub fn new() -> Result<Self, GpioError> {
        let gpio = Gpio::new().map_err(driver_err)?;
        Ok(Self {
            gpio,
            inputs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
        })
    }
}

impl GpioPort for RppalGpio {
    fn configure_input(&self, pin: u8, pull: Pull) -> Result<(), GpioError> {
        let raw = self.gpio.get(pin).map_err(driver_err)?;
        let input = match pull {
            Pull::Up => raw.into_input_pullup(),
            Pull::Down => raw.into_input_pulldown(),
            Pull::None => {
                warn!(pin, "input pin left floating; internal pull resistors disabled");
                raw.into_input()
            }
        };
        self.outputs.lock().unwrap().remove(&pin);
        self.inputs.lock().unwrap().insert(pin, input);
        Ok(())
    }

    fn configure_output(&self, pin: u8) -> Result<(), GpioError> {
        let output = self.gpio.get(pin).map_err(driver_err)?.into_output();
        self.inputs.lock().unwrap().remove(&pin);
        self.outputs.lock().unwrap().insert(pin, output);
        Ok(())
    }

    fn read(&self, pin: u8) -> Result<Level, GpioError> {
        if let Some(input) = self.inputs.lock().unwrap().get(&pin) {
            return Ok(from_hw(input.read()));
        }
        if self.outputs.lock().unwrap().contains_key(&pin) {
            return Err(GpioError::DirectionMismatch(pin));
        }
        Err(GpioError::PinUnconfigured(pin))
    }

    fn write(&self, pin: u8, level: Level) -> Result<(), GpioError> {
        let mut outputs = self.outputs.lock().unwrap();
        if let Some(output) = outputs.get_mut(&pin) {
            match level {
                Level::High => output.set_high(),
                Level::Low => output.set_low(),
            }
            return Ok(());
        }
        drop(outputs);
        if self.inputs.lock().unwrap().contains_key(&pin) {
            return Err(GpioError::DirectionMismatch(pin));
        }
        Err(GpioError::PinUnconfigured(pin))
    }

    fn on_edge(&self, pin: u8, edge: Edge, handler: EdgeHandler) -> Result<(), GpioError> {
        let trigger = match edge {
            Edge::Rising => Trigger::RisingEdge,
            Edge::Falling => Trigger::FallingEdge,
            Edge::Both => Trigger::Both,
        };
        let mut inputs = self.inputs.lock().unwrap();
        let input = match inputs.get_mut(&pin) {
            Some(input) => input,
            None => {
                if self.outputs.lock().unwrap().contains_key(&pin) {
                    return Err(GpioError::DirectionMismatch(pin));
                }
                return Err(GpioError::PinUnconfigured(pin));
            }
        };
        let last_edge = Arc::new(Mutex::new(None::<Instant>));
        input
            .set_async_interrupt(trigger, move |level| {
                let now = Instant::now();
                let mut last = last_edge.lock().unwrap();
                if let Some(prev) = *last {
                    if now.duration_since(prev) < MIN_EDGE_INTERVAL {
                        return;
                    }
                }
                *last = Some(now);
                drop(last);
                handler(from_hw(level));
            })
            .map_err(driver_err)
    }

    fn remove_handler(&self, pin: u8) -> Result<(), GpioError> {
        let mut inputs = self.inputs.lock().unwrap();
        match inputs.get_mut(&pin) {
            Some(input) => input.clear_async_interrupt().map_err(driver_err),
            None => Err(GpioError::PinUnconfigured(pin)),
        }
    }
}
