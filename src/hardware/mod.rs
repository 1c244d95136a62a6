mod dial;
mod hook;
mod ringer;
mod tone;

pub use dial::DialReader;
pub use hook::{HookEvent, HookMonitor, HookState, HookStateHandle};
pub use ringer::Ringer;
pub use tone::{Tone, TonePlayer};
