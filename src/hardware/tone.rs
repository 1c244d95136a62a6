use crate::config::AudioConfig;
use crate::media::{Channel, SoundEngine};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Dial,
    Busy,
    Error,
}

/// Call-progress tones in the earpiece. One tone at a time; starting a new
/// tone replaces the old one.
pub struct TonePlayer {
    sound: SoundEngine,
    files: Mutex<AudioConfig>,
}

impl TonePlayer {
    pub fn new(sound: SoundEngine, files: AudioConfig) -> Self {
        Self {
            sound,
            files: Mutex::new(files),
        }
    }

    pub fn play(&self, tone: Tone) {
        let file = {
            let files = self.files.lock().unwrap();
            match tone {
                Tone::Dial => files.dial_tone_file.clone(),
                Tone::Busy => files.busy_tone_file.clone(),
                Tone::Error => files.error_tone_file.clone(),
            }
        };
        debug!(?tone, "tone start");
        self.sound.play(Channel::Tone, file, true);
    }

    pub fn stop(&self) {
        self.sound.stop(Channel::Tone);
    }

    pub fn is_playing(&self) -> bool {
        self.sound.is_playing(Channel::Tone)
    }

    pub fn set_files(&self, files: AudioConfig) {
        *self.files.lock().unwrap() = files;
    }
}
