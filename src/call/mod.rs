mod manager;
mod policy;
#[cfg(test)]
mod tests;

pub use manager::{CallManager, CallManagerBuilder};
pub use policy::{DialPlan, Resolution};

use crate::hardware::HookEvent;
use crate::sip::SignalingEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Overall phone states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneState {
    /// On hook, nothing happening.
    Idle,
    /// Picked up, waiting for the first digit.
    OffHookWaiting,
    /// Digits are arriving.
    Dialing,
    /// Checking speed dial and the allow-list.
    Validating,
    /// Outbound attempt in flight.
    Calling,
    /// Incoming call, bell ringing.
    Ringing,
    /// Active call.
    Connected,
    /// Blocked number, failed call, signalling down.
    Error,
}

/// Everything the state machine reacts to, serialised through one queue.
/// Components send these via a handle cloned at construction; the machine
/// processes each input to completion before the next is dequeued.
#[derive(Debug)]
pub enum CallInput {
    Hook(HookEvent),
    Digit(char),
    Signaling(SignalingEvent),
    ConfigUpdated(Arc<crate::config::Config>),
}
