mod sound;

pub use sound::{Channel, SoundEngine};
