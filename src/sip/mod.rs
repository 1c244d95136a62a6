mod client;
mod memory;

pub use client::{SipSignalingClient, SipSignalingClientBuilder};
pub use memory::MemorySignalingClient;

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Opaque handle for one call leg.
pub type CallId = String;

/// Local view of one call's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSessionState {
    Initiating,
    Ringing,
    EarlyMedia,
    Answered,
    Connected,
    Ended(CallEndReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEndReason {
    Normal,
    Busy,
    NoAnswer,
    Rejected,
    NetworkError,
}

/// Asynchronous notifications from the signalling stack. Delivered through
/// the queue handle the client receives at construction, never through
/// back-references.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Incoming { call: CallId, caller_id: String },
    CallState { call: CallId, state: CallSessionState },
    Registered,
    RegistrationLost { reason: String },
}

pub type SignalingEventSender = mpsc::UnboundedSender<SignalingEvent>;
pub type SignalingEventReceiver = mpsc::UnboundedReceiver<SignalingEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    RegistrationFailed(String),
    NotRegistered,
    /// A call is already in flight; only one at a time is permitted.
    Busy,
    NoSuchCall,
    Transport(String),
}

impl fmt::Display for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingError::RegistrationFailed(reason) => {
                write!(f, "registration failed: {}", reason)
            }
            SignalingError::NotRegistered => write!(f, "not registered"),
            SignalingError::Busy => write!(f, "another call is already in progress"),
            SignalingError::NoSuchCall => write!(f, "no such call"),
            SignalingError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for SignalingError {}

/// Registration and call lifecycle against the signalling peer. Two
/// interchangeable implementations: the UDP SIP stack and the in-memory
/// simulator the test suite drives.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Attempt registration; idempotent. Returns once a terminal
    /// registration status is known or the configured timeout elapses.
    async fn register(&self) -> Result<(), SignalingError>;

    /// Start an outbound call. Returns as soon as the attempt is submitted;
    /// progress arrives as [`SignalingEvent::CallState`] notifications.
    async fn place_call(&self, destination: &str) -> Result<CallId, SignalingError>;

    async fn answer(&self, call: &CallId) -> Result<(), SignalingError>;

    async fn reject(&self, call: &CallId) -> Result<(), SignalingError>;

    async fn hangup(&self, call: &CallId) -> Result<(), SignalingError>;

    /// Cancel registration, terminate calls, release network resources.
    async fn shutdown(&self);
}
