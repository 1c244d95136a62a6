use crate::call::{CallInput, CallManagerBuilder, DialPlan, PhoneState};
use crate::callrecord::{CallLogSink, CallLogStore};
use crate::config::Config;
use crate::event::{EventSender, PhoneEvent};
use crate::gpio::{GpioPort, Level, MockGpio};
use crate::hardware::{DialReader, HookMonitor, Ringer, TonePlayer};
use crate::media::SoundEngine;
use crate::models::open_database;
use crate::sip::{
    MemorySignalingClient, SignalingClient, SipSignalingClientBuilder,
};
use anyhow::{anyhow, Result};
use std::fmt;
use std::sync::Arc;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Startup failures, sorted into the process exit codes the service
/// supervisor relies on.
#[derive(Debug)]
pub enum StartupError {
    /// Exit code 1.
    Config(anyhow::Error),
    /// Exit code 2.
    Hardware(anyhow::Error),
    /// Exit code 3.
    Signaling(anyhow::Error),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 1,
            StartupError::Hardware(_) => 2,
            StartupError::Signaling(_) => 3,
        }
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "configuration error: {:#}", e),
            StartupError::Hardware(e) => write!(f, "hardware error: {:#}", e),
            StartupError::Signaling(e) => write!(f, "signalling error: {:#}", e),
        }
    }
}

impl std::error::Error for StartupError {}

pub struct AppBuilder {
    config: Option<Config>,
    config_path: Option<String>,
    database_url: Option<String>,
    mock_hardware: bool,
}

/// Owns every component for the process lifetime: ports, audio, signalling,
/// the event bus, the record store and the state machine. Wires callbacks
/// into the machine's input queue, serves termination and reload signals,
/// and restores outputs to safe levels on the way out.
pub struct App {
    config: Config,
    config_path: Option<String>,
    token: CancellationToken,
    bus: EventSender,
    store: CallLogStore,
    sound: SoundEngine,
    gpio: Arc<dyn GpioPort>,
    ringer_pin: u8,
    queue_tx: mpsc::UnboundedSender<CallInput>,
    state_rx: watch::Receiver<PhoneState>,
    signaling: Arc<dyn SignalingClient>,
    hook: HookMonitor,
    dial: DialReader,
    ringer: Arc<Ringer>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            config_path: None,
            database_url: None,
            mock_hardware: false,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Remember where the config came from so SIGHUP can re-read it.
    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn mock_hardware(mut self, mock: bool) -> Self {
        self.mock_hardware = mock;
        self
    }

    /// Command-line override for the call-log database URL.
    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    pub async fn build(self) -> Result<App, StartupError> {
        let mut config = self.config.unwrap_or_default();
        if let Some(url) = self.database_url {
            config.database_url = url;
        }
        config.validate().map_err(StartupError::Config)?;

        let token = CancellationToken::new();
        let (bus, _keep) = crate::event::channel();

        let db = open_database(&config.database_url)
            .await
            .map_err(StartupError::Config)?;
        let store = CallLogStore::new(db);

        let sound = if self.mock_hardware {
            SoundEngine::mock()
        } else {
            SoundEngine::new(config.gain.speaker).map_err(StartupError::Hardware)?
        };

        let gpio: Arc<dyn GpioPort> = if self.mock_hardware {
            Arc::new(MockGpio::new())
        } else {
            build_hardware_gpio().map_err(StartupError::Hardware)?
        };

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let hook = HookMonitor::new(
            gpio.clone(),
            config.hardware.hook_pin,
            config.timing.hook_debounce(),
            queue_tx.clone(),
            token.child_token(),
        );
        let dial = DialReader::new(
            gpio.clone(),
            config.hardware.pulse_pin,
            config.timing.pulse_timeout(),
            queue_tx.clone(),
            token.child_token(),
        );
        let ringer = Arc::new(Ringer::new(
            gpio.clone(),
            config.hardware.ringer_pin,
            sound.clone(),
            config.timing.ring_on(),
            config.timing.ring_off(),
            config.audio.ring_file.clone(),
        ));
        let tone = Arc::new(TonePlayer::new(sound.clone(), config.audio.clone()));

        hook.start()
            .map_err(|e| StartupError::Hardware(anyhow!("hook pin: {}", e)))?;
        dial.start()
            .map_err(|e| StartupError::Hardware(anyhow!("pulse pin: {}", e)))?;
        ringer
            .init()
            .map_err(|e| StartupError::Hardware(anyhow!("ringer pin: {}", e)))?;
        if let Some(pin) = config.hardware.dial_active_pin {
            // Off-normal contact: observed for completeness, not decoded.
            gpio.configure_input(pin, crate::gpio::Pull::Up)
                .map_err(|e| StartupError::Hardware(anyhow!("dial-active pin: {}", e)))?;
        }

        let (sig_tx, mut sig_rx) = mpsc::unbounded_channel();
        let signaling: Arc<dyn SignalingClient> = if self.mock_hardware {
            Arc::new(MemorySignalingClient::new(sig_tx))
        } else {
            let client = SipSignalingClientBuilder::new()
                .with_config(config.sip.clone())
                .with_cancel_token(token.child_token())
                .with_events(sig_tx)
                .build()
                .await
                .map_err(StartupError::Signaling)?;
            let client = Arc::new(client);
            let serve_client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_client.serve().await {
                    error!("sip client exited: {:#}", e);
                }
            });
            client
        };

        // Signalling callbacks enter the machine's queue like everything
        // else; the machine never hands out a back-reference.
        let forward_queue = queue_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = sig_rx.recv().await {
                if forward_queue.send(CallInput::Signaling(event)).is_err() {
                    break;
                }
            }
        });

        let mut sink = CallLogSink::new(store.clone(), bus.clone(), token.child_token());
        tokio::spawn(async move { sink.serve().await });

        let (mut manager, state_rx) = CallManagerBuilder::new()
            .with_signaling(signaling.clone())
            .with_ringer(ringer.clone())
            .with_tone(tone)
            .with_hook(hook.state_handle())
            .with_bus(bus.clone())
            .with_queue(queue_rx)
            .with_dial_plan(DialPlan::from_config(&config))
            .with_timing(config.timing)
            .with_cancel_token(token.child_token())
            .build();
        tokio::spawn(async move { manager.serve().await });

        let ringer_pin = config.hardware.ringer_pin;
        Ok(App {
            config,
            config_path: self.config_path,
            token,
            bus,
            store,
            sound,
            gpio,
            ringer_pin,
            queue_tx,
            state_rx,
            signaling,
            hook,
            dial,
            ringer,
        })
    }
}

impl App {
    /// Read-only snapshot of the machine's state.
    pub fn state(&self) -> PhoneState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<PhoneState> {
        self.state_rx.clone()
    }

    /// Attach an event subscriber (push channels, tooling).
    pub fn events(&self) -> crate::event::EventReceiver {
        self.bus.subscribe()
    }

    /// Historical call queries.
    pub fn call_log(&self) -> &CallLogStore {
        &self.store
    }

    /// Run until a termination signal arrives. SIGHUP re-reads the
    /// configuration in place.
    pub async fn run(mut self) -> Result<()> {
        match self.signaling.register().await {
            Ok(()) => info!("signalling registration complete"),
            Err(e) => {
                // Not fatal: the machine keeps serving hook and dial input
                // and reports the error on pickup.
                warn!("initial registration failed: {}", e);
            }
        }

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sighup = signal(SignalKind::hangup())?;
            loop {
                select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("received interrupt, shutting down");
                        break;
                    }
                    _ = sigterm.recv() => {
                        info!("received terminate, shutting down");
                        break;
                    }
                    _ = sighup.recv() => {
                        if let Err(e) = self.reload_config().await {
                            error!("configuration reload failed: {:#}", e);
                        }
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("received interrupt, shutting down");
        }

        self.shutdown().await;
        Ok(())
    }

    /// Re-read the config file and apply changed sections. An unchanged
    /// document is a no-op and emits nothing.
    pub async fn reload_config(&mut self) -> Result<()> {
        let path = self
            .config_path
            .as_deref()
            .ok_or_else(|| anyhow!("no configuration path to reload from"))?;
        let fresh = Config::load(path)?;
        let changed = self.config.changed_sections(&fresh);
        if changed.is_empty() {
            info!("configuration unchanged");
            return Ok(());
        }
        info!(sections = ?changed, "configuration changed");

        if changed.contains(&"gain") {
            self.sound.set_speaker_gain(fresh.gain.speaker);
        }
        self.config = fresh;
        self.queue_tx
            .send(CallInput::ConfigUpdated(Arc::new(self.config.clone())))
            .ok();
        for section in changed {
            self.bus
                .send(PhoneEvent::ConfigChanged {
                    section: section.to_string(),
                })
                .ok();
        }
        Ok(())
    }

    /// Orderly teardown: signalling first, then the bell, then outputs to
    /// safe levels, then the sink and the audio device.
    pub async fn shutdown(self) {
        self.signaling.shutdown().await;
        self.ringer.stop();
        self.dial.stop();
        self.hook.stop();
        self.gpio.write(self.ringer_pin, Level::Low).ok();
        self.sound.stop_all();
        // Cancelling last lets the sink drain queued record writes.
        self.token.cancel();
        info!("shutdown complete");
    }
}

#[cfg(feature = "hardware")]
fn build_hardware_gpio() -> Result<Arc<dyn GpioPort>> {
    let gpio = crate::gpio::RppalGpio::new().map_err(|e| anyhow!("gpio controller: {}", e))?;
    Ok(Arc::new(gpio))
}

#[cfg(not(feature = "hardware"))]
fn build_hardware_gpio() -> Result<Arc<dyn GpioPort>> {
    Err(anyhow!(
        "built without the `hardware` feature; rerun with --mock-hardware"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_app_builds_and_reports_idle() {
        let mut config = Config::default();
        config.database_url = "sqlite::memory:".to_string();
        let app = AppBuilder::new()
            .config(config)
            .mock_hardware(true)
            .build()
            .await
            .unwrap();
        assert_eq!(app.state(), PhoneState::Idle);
        assert!(app.call_log().list(1).await.unwrap().is_empty());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_maps_to_exit_code_one() {
        let mut config = Config::default();
        config.gain.mic = 9.0;
        let err = AppBuilder::new()
            .config(config)
            .mock_hardware(true)
            .build()
            .await
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), 1);
    }
}
