use anyhow::{anyhow, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

const USER_AGENT: &str = "rustphone";

/// Digits the dial can feed into one number before further digits are dropped.
pub const MAX_DIALED_DIGITS: usize = 20;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "rustphone.toml")]
    pub conf: String,
    /// Run against the in-memory GPIO and signalling fakes instead of real hardware.
    #[clap(long)]
    pub mock_hardware: bool,
    /// Override the configured call-log database URL.
    #[clap(long)]
    pub db: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub database_url: String,
    pub sip: SipConfig,
    pub hardware: HardwareConfig,
    pub timing: TimingConfig,
    pub speed_dial: HashMap<String, String>,
    pub allowlist: Vec<String>,
    pub audio: AudioConfig,
    pub gain: GainConfig,
}

#[derive(Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SipConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Seconds between REGISTER refreshes; the server's Expires wins when shorter.
    pub register_interval_secs: Option<u64>,
    pub registration_timeout_secs: u64,
    /// Consecutive-failure window after which registration is reported lost.
    pub registration_grace_secs: u64,
    pub local_addr: String,
    pub udp_port: u16,
}

// The credential must never reach logs or the event stream.
impl fmt::Debug for SipConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SipConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("register_interval_secs", &self.register_interval_secs)
            .field("registration_timeout_secs", &self.registration_timeout_secs)
            .field("registration_grace_secs", &self.registration_grace_secs)
            .field("local_addr", &self.local_addr)
            .field("udp_port", &self.udp_port)
            .finish()
    }
}

/// BCM pin assignments. Inputs carry external 10k pull-ups and idle high.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct HardwareConfig {
    pub hook_pin: u8,
    pub pulse_pin: u8,
    pub dial_active_pin: Option<u8>,
    pub ringer_pin: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Quiet time after the last pulse before the digit is emitted.
    pub pulse_timeout_ms: u64,
    /// Quiet time after the last digit before the number is dialled.
    pub inter_digit_timeout_ms: u64,
    pub hook_debounce_ms: u64,
    pub ring_on_ms: u64,
    pub ring_off_ms: u64,
    /// How long an unanswered outbound attempt may stay in flight.
    pub call_attempt_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub ring_file: String,
    pub dial_tone_file: String,
    pub busy_tone_file: String,
    pub error_tone_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct GainConfig {
    pub mic: f32,
    pub speaker: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: None,
            log_file: None,
            database_url: "sqlite://rustphone.db".to_string(),
            sip: SipConfig::default(),
            hardware: HardwareConfig::default(),
            timing: TimingConfig::default(),
            speed_dial: HashMap::new(),
            allowlist: Vec::new(),
            audio: AudioConfig::default(),
            gain: GainConfig::default(),
        }
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 5060,
            username: String::new(),
            password: String::new(),
            register_interval_secs: None,
            registration_timeout_secs: 30,
            registration_grace_secs: 300,
            local_addr: "0.0.0.0".to_string(),
            udp_port: 25060,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            hook_pin: 17,
            pulse_pin: 27,
            dial_active_pin: Some(22),
            ringer_pin: 23,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pulse_timeout_ms: 300,
            inter_digit_timeout_ms: 2000,
            hook_debounce_ms: 50,
            ring_on_ms: 2000,
            ring_off_ms: 4000,
            call_attempt_timeout_secs: 60,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            ring_file: "sounds/ring.wav".to_string(),
            dial_tone_file: "sounds/dial_tone.wav".to_string(),
            busy_tone_file: "sounds/busy_tone.wav".to_string(),
            error_tone_file: "sounds/error_tone.wav".to_string(),
        }
    }
}

impl Default for GainConfig {
    fn default() -> Self {
        Self { mic: 1.0, speaker: 1.0 }
    }
}

impl TimingConfig {
    pub fn pulse_timeout(&self) -> Duration {
        Duration::from_millis(self.pulse_timeout_ms)
    }
    pub fn inter_digit_timeout(&self) -> Duration {
        Duration::from_millis(self.inter_digit_timeout_ms)
    }
    pub fn hook_debounce(&self) -> Duration {
        Duration::from_millis(self.hook_debounce_ms)
    }
    pub fn ring_on(&self) -> Duration {
        Duration::from_millis(self.ring_on_ms)
    }
    pub fn ring_off(&self) -> Duration {
        Duration::from_millis(self.ring_off_ms)
    }
    pub fn call_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.call_attempt_timeout_secs)
    }
}

impl SipConfig {
    pub fn user_agent(&self) -> &'static str {
        USER_AGENT
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config: Config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow!("{}: {}", e, path))?,
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, gain) in [("mic", self.gain.mic), ("speaker", self.gain.speaker)] {
            if !(0.0..=2.0).contains(&gain) {
                return Err(anyhow!("gain.{} must be within [0.0, 2.0], got {}", name, gain));
            }
        }
        let hw = &self.hardware;
        let mut pins = vec![hw.hook_pin, hw.pulse_pin, hw.ringer_pin];
        if let Some(p) = hw.dial_active_pin {
            pins.push(p);
        }
        let unique: std::collections::HashSet<u8> = pins.iter().copied().collect();
        if unique.len() != pins.len() {
            return Err(anyhow!("hardware pin assignments overlap: {:?}", hw));
        }
        for (code, number) in &self.speed_dial {
            if code.is_empty() || code.len() > 2 || !code.chars().all(|c| c.is_ascii_digit()) {
                return Err(anyhow!("speed_dial code {:?} must be 1-2 digits", code));
            }
            if number.is_empty() {
                return Err(anyhow!("speed_dial entry for {:?} is empty", code));
            }
        }
        if self.timing.pulse_timeout_ms == 0 || self.timing.inter_digit_timeout_ms == 0 {
            return Err(anyhow!("timing values must be non-zero"));
        }
        Ok(())
    }

    /// Section names whose contents differ from `other`. An unchanged reload
    /// yields an empty list and therefore no `ConfigChanged` events.
    pub fn changed_sections(&self, other: &Config) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.sip != other.sip {
            changed.push("sip");
        }
        if self.hardware != other.hardware {
            changed.push("hardware");
        }
        if self.timing != other.timing {
            changed.push("timing");
        }
        if self.speed_dial != other.speed_dial {
            changed.push("speed_dial");
        }
        if self.allowlist != other.allowlist {
            changed.push("allowlist");
        }
        if self.audio != other.audio {
            changed.push("audio");
        }
        if self.gain != other.gain {
            changed.push("gain");
        }
        changed
    }
}
