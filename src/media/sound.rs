use anyhow::{anyhow, Result};
use rodio::source::Source;
use rodio::{Decoder, OutputStream, Sink};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Playback channels. The call state machine guarantees ring and call audio
/// never overlap; tones and ringing are the only local playback sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Tone,
    Ringer,
}

enum Command {
    Play {
        channel: Channel,
        path: PathBuf,
        looped: bool,
    },
    Stop(Channel),
    StopAll,
    SetVolume(f32),
}

/// Process-wide audio output. The rodio device lives on a dedicated thread
/// (the output stream is not `Send`); everything else talks to it through a
/// command queue. With [`SoundEngine::mock`] no device is opened and playback
/// state is tracked in memory only.
#[derive(Clone)]
pub struct SoundEngine {
    tx: Option<mpsc::UnboundedSender<Command>>,
    playing: Arc<Mutex<HashSet<Channel>>>,
}

impl SoundEngine {
    /// Open the default output device. Fails when no usable device exists,
    /// which the process controller treats as fatal.
    pub fn new(speaker_gain: f32) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("audio".to_string())
            .spawn(move || audio_thread(rx, ready_tx, speaker_gain))
            .map_err(|e| anyhow!("failed to spawn audio thread: {}", e))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(anyhow!("audio device unavailable: {}", e)),
            Err(_) => return Err(anyhow!("audio thread exited before initialization")),
        }

        info!("audio output device opened");
        Ok(Self {
            tx: Some(tx),
            playing: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Deviceless engine for tests: commands only mutate the in-memory
    /// playing set.
    pub fn mock() -> Self {
        Self {
            tx: None,
            playing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn play(&self, channel: Channel, path: impl Into<PathBuf>, looped: bool) {
        let path = path.into();
        debug!(?channel, path = %path.display(), looped, "play");
        self.playing.lock().unwrap().insert(channel);
        if let Some(tx) = &self.tx {
            tx.send(Command::Play {
                channel,
                path,
                looped,
            })
            .ok();
        }
    }

    pub fn stop(&self, channel: Channel) {
        self.playing.lock().unwrap().remove(&channel);
        if let Some(tx) = &self.tx {
            tx.send(Command::Stop(channel)).ok();
        }
    }

    pub fn stop_all(&self) {
        self.playing.lock().unwrap().clear();
        if let Some(tx) = &self.tx {
            tx.send(Command::StopAll).ok();
        }
    }

    /// Speaker gain multiplier in [0.0, 2.0], applied to all sinks.
    pub fn set_speaker_gain(&self, gain: f32) {
        if let Some(tx) = &self.tx {
            tx.send(Command::SetVolume(gain)).ok();
        }
    }

    pub fn is_playing(&self, channel: Channel) -> bool {
        self.playing.lock().unwrap().contains(&channel)
    }
}

fn audio_thread(
    mut rx: mpsc::UnboundedReceiver<Command>,
    ready_tx: std::sync::mpsc::Sender<Result<(), String>>,
    mut volume: f32,
) {
    // _stream must stay alive for the handle to keep working.
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(pair) => {
            ready_tx.send(Ok(())).ok();
            pair
        }
        Err(e) => {
            ready_tx.send(Err(e.to_string())).ok();
            return;
        }
    };

    let mut sinks: HashMap<Channel, Sink> = HashMap::new();

    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Play {
                channel,
                path,
                looped,
            } => {
                if let Some(old) = sinks.remove(&channel) {
                    old.stop();
                }
                let source = match File::open(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|f| Decoder::new(BufReader::new(f)).map_err(|e| e.to_string()))
                {
                    Ok(s) => s,
                    Err(e) => {
                        error!(path = %path.display(), "failed to open waveform: {}", e);
                        continue;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("failed to create playback sink: {}", e);
                        continue;
                    }
                };
                sink.set_volume(volume);
                if looped {
                    sink.append(source.repeat_infinite());
                } else {
                    sink.append(source);
                }
                sinks.insert(channel, sink);
            }
            Command::Stop(channel) => {
                if let Some(sink) = sinks.remove(&channel) {
                    sink.stop();
                }
            }
            Command::StopAll => {
                for (_, sink) in sinks.drain() {
                    sink.stop();
                }
            }
            Command::SetVolume(gain) => {
                volume = gain;
                for sink in sinks.values() {
                    sink.set_volume(gain);
                }
            }
        }
    }
    warn!("audio command channel closed, releasing device");
}
