use crate::gpio::{GpioError, GpioPort, Level};
use crate::media::{Channel, SoundEngine};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Cadence {
    ring_on: Duration,
    ring_off: Duration,
    ring_file: PathBuf,
}

/// Drives the ringer amplifier-enable pin with cadenced bell playback:
/// enable high and the ring waveform looping for the on-phase, enable low
/// and silence for the pause, until stopped. `stop()` cuts the cycle at any
/// point and forces the output low.
pub struct Ringer {
    gpio: Arc<dyn GpioPort>,
    pin: u8,
    sound: SoundEngine,
    cadence: Arc<Mutex<Cadence>>,
    session: Mutex<Option<CancellationToken>>,
}

impl Ringer {
    pub fn new(
        gpio: Arc<dyn GpioPort>,
        pin: u8,
        sound: SoundEngine,
        ring_on: Duration,
        ring_off: Duration,
        ring_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            gpio,
            pin,
            sound,
            cadence: Arc::new(Mutex::new(Cadence {
                ring_on,
                ring_off,
                ring_file: ring_file.into(),
            })),
            session: Mutex::new(None),
        }
    }

    /// Claim the enable pin and park it low.
    pub fn init(&self) -> Result<(), GpioError> {
        self.gpio.configure_output(self.pin)?;
        self.gpio.write(self.pin, Level::Low)
    }

    pub fn is_ringing(&self) -> bool {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| !t.is_cancelled())
            .unwrap_or(false)
    }

    /// Begin the cadence loop. A second start while ringing is a no-op.
    pub fn start(&self) {
        let mut session = self.session.lock().unwrap();
        if session.as_ref().map(|t| !t.is_cancelled()).unwrap_or(false) {
            debug!("ringer already active");
            return;
        }
        let token = CancellationToken::new();
        *session = Some(token.clone());
        info!("ringer started");

        let gpio = self.gpio.clone();
        let pin = self.pin;
        let sound = self.sound.clone();
        let cadence = self.cadence.clone();
        tokio::spawn(async move {
            loop {
                let (ring_on, ring_off, ring_file) = {
                    let c = cadence.lock().unwrap();
                    (c.ring_on, c.ring_off, c.ring_file.clone())
                };

                if let Err(e) = gpio.write(pin, Level::High) {
                    warn!("ringer enable failed: {}", e);
                }
                // Shorter waveforms loop within the on-window.
                sound.play(Channel::Ringer, ring_file, true);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(ring_on) => {}
                }

                sound.stop(Channel::Ringer);
                gpio.write(pin, Level::Low).ok();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(ring_off) => {}
                }
            }
            sound.stop(Channel::Ringer);
            gpio.write(pin, Level::Low).ok();
            debug!("ringer cadence ended");
        });
    }

    /// Stop ringing wherever the cadence is; idempotent.
    pub fn stop(&self) {
        let token = self.session.lock().unwrap().take();
        if let Some(token) = token {
            token.cancel();
            info!("ringer stopped");
        }
        self.sound.stop(Channel::Ringer);
        self.gpio.write(self.pin, Level::Low).ok();
    }

    pub fn set_cadence(&self, ring_on: Duration, ring_off: Duration, ring_file: impl Into<PathBuf>) {
        let mut c = self.cadence.lock().unwrap();
        c.ring_on = ring_on;
        c.ring_off = ring_off;
        c.ring_file = ring_file.into();
    }
}
