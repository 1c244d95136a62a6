use super::{
    CallEndReason, CallId, CallSessionState, SignalingClient, SignalingError, SignalingEvent,
    SignalingEventSender,
};
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Ringing,
    Connected,
}

struct ActiveCall {
    id: CallId,
    direction: Direction,
    phase: Phase,
}

#[derive(Default)]
struct State {
    registered: bool,
    active: Option<ActiveCall>,
    last_destination: Option<String>,
}

/// Deterministic in-memory signalling peer. The test suite plays the remote
/// side through the `simulate_*` hooks; no network, no timers of its own.
pub struct MemorySignalingClient {
    state: Mutex<State>,
    events: SignalingEventSender,
}

impl MemorySignalingClient {
    pub fn new(events: SignalingEventSender) -> Self {
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn emit(&self, event: SignalingEvent) {
        self.events.send(event).ok();
    }

    fn emit_call_state(&self, call: &CallId, state: CallSessionState) {
        self.emit(SignalingEvent::CallState {
            call: call.clone(),
            state,
        });
    }

    /// The remote side calls us.
    pub fn simulate_incoming(&self, caller_id: &str) -> Option<CallId> {
        let id = {
            let mut state = self.state.lock().unwrap();
            if !state.registered {
                warn!("incoming call ignored, not registered");
                return None;
            }
            if state.active.is_some() {
                // One call at a time; the peer hears busy.
                warn!(caller_id, "incoming call ignored, line busy");
                return None;
            }
            let id = Uuid::new_v4().to_string();
            state.active = Some(ActiveCall {
                id: id.clone(),
                direction: Direction::Inbound,
                phase: Phase::Ringing,
            });
            id
        };
        info!(caller_id, call = %id, "incoming call");
        self.emit(SignalingEvent::Incoming {
            call: id.clone(),
            caller_id: caller_id.to_string(),
        });
        Some(id)
    }

    /// The remote party answers our outbound attempt.
    pub fn simulate_remote_answer(&self) {
        let id = {
            let mut state = self.state.lock().unwrap();
            match state.active.as_mut() {
                Some(call)
                    if call.direction == Direction::Outbound && call.phase == Phase::Ringing =>
                {
                    call.phase = Phase::Connected;
                    call.id.clone()
                }
                _ => {
                    warn!("remote answer with no ringing outbound call");
                    return;
                }
            }
        };
        self.emit_call_state(&id, CallSessionState::Answered);
        self.emit_call_state(&id, CallSessionState::Connected);
    }

    /// The remote party hangs up or cancels.
    pub fn simulate_remote_hangup(&self) {
        let (id, reason) = {
            let mut state = self.state.lock().unwrap();
            match state.active.take() {
                Some(call) => {
                    let reason = match (call.direction, call.phase) {
                        // Outbound attempt declined before anyone answered.
                        (Direction::Outbound, Phase::Ringing) => CallEndReason::Rejected,
                        _ => CallEndReason::Normal,
                    };
                    (call.id, reason)
                }
                None => {
                    debug!("remote hangup with no active call");
                    return;
                }
            }
        };
        self.emit_call_state(&id, CallSessionState::Ended(reason));
    }

    /// The transport drops out from under us.
    pub fn simulate_network_failure(&self) {
        let ended = {
            let mut state = self.state.lock().unwrap();
            state.registered = false;
            state.active.take().map(|call| call.id)
        };
        if let Some(id) = ended {
            self.emit_call_state(&id, CallSessionState::Ended(CallEndReason::NetworkError));
        }
        self.emit(SignalingEvent::RegistrationLost {
            reason: "network failure".to_string(),
        });
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().unwrap().registered
    }

    pub fn has_active_call(&self) -> bool {
        self.state.lock().unwrap().active.is_some()
    }

    /// Destination of the most recent outbound attempt, if any.
    pub fn last_destination(&self) -> Option<String> {
        self.state.lock().unwrap().last_destination.clone()
    }
}

#[async_trait]
impl SignalingClient for MemorySignalingClient {
    async fn register(&self) -> Result<(), SignalingError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.registered {
                return Ok(());
            }
            state.registered = true;
        }
        info!("registered (in-memory)");
        self.emit(SignalingEvent::Registered);
        Ok(())
    }

    async fn place_call(&self, destination: &str) -> Result<CallId, SignalingError> {
        let id = {
            let mut state = self.state.lock().unwrap();
            if !state.registered {
                return Err(SignalingError::NotRegistered);
            }
            if state.active.is_some() {
                return Err(SignalingError::Busy);
            }
            let id = Uuid::new_v4().to_string();
            state.active = Some(ActiveCall {
                id: id.clone(),
                direction: Direction::Outbound,
                phase: Phase::Ringing,
            });
            state.last_destination = Some(destination.to_string());
            id
        };
        info!(destination, call = %id, "placing call");
        self.emit_call_state(&id, CallSessionState::Initiating);
        self.emit_call_state(&id, CallSessionState::Ringing);
        Ok(id)
    }

    async fn answer(&self, call: &CallId) -> Result<(), SignalingError> {
        {
            let mut state = self.state.lock().unwrap();
            match state.active.as_mut() {
                Some(active)
                    if &active.id == call
                        && active.direction == Direction::Inbound
                        && active.phase == Phase::Ringing =>
                {
                    active.phase = Phase::Connected;
                }
                Some(_) | None => return Err(SignalingError::NoSuchCall),
            }
        }
        info!(call = %call, "call answered");
        self.emit_call_state(call, CallSessionState::Answered);
        self.emit_call_state(call, CallSessionState::Connected);
        Ok(())
    }

    async fn reject(&self, call: &CallId) -> Result<(), SignalingError> {
        {
            let mut state = self.state.lock().unwrap();
            match state.active.as_ref() {
                Some(active) if &active.id == call && active.direction == Direction::Inbound => {
                    state.active = None;
                }
                Some(_) | None => return Err(SignalingError::NoSuchCall),
            }
        }
        info!(call = %call, "call rejected");
        // No event: the rejecting side asked for this, nothing to report.
        Ok(())
    }

    async fn hangup(&self, call: &CallId) -> Result<(), SignalingError> {
        {
            let mut state = self.state.lock().unwrap();
            match state.active.as_ref() {
                Some(active) if &active.id == call => {
                    state.active = None;
                }
                Some(_) | None => return Err(SignalingError::NoSuchCall),
            }
        }
        info!(call = %call, "hung up");
        Ok(())
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.active = None;
        state.registered = false;
        info!("in-memory signalling shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn client() -> (MemorySignalingClient, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MemorySignalingClient::new(tx), rx)
    }

    #[tokio::test]
    async fn test_place_call_requires_registration() {
        let (client, _rx) = client();
        assert_eq!(
            client.place_call("+15551234567").await,
            Err(SignalingError::NotRegistered)
        );
    }

    #[tokio::test]
    async fn test_second_call_is_busy() {
        let (client, _rx) = client();
        client.register().await.unwrap();
        client.place_call("+15551234567").await.unwrap();
        assert_eq!(
            client.place_call("+15557654321").await,
            Err(SignalingError::Busy)
        );
    }

    #[tokio::test]
    async fn test_outbound_lifecycle_events() {
        let (client, mut rx) = client();
        client.register().await.unwrap();
        assert!(matches!(rx.recv().await, Some(SignalingEvent::Registered)));

        let id = client.place_call("+15551234567").await.unwrap();
        client.simulate_remote_answer();
        client.simulate_remote_hangup();

        let mut states = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let SignalingEvent::CallState { call, state } = ev {
                assert_eq!(call, id);
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                CallSessionState::Initiating,
                CallSessionState::Ringing,
                CallSessionState::Answered,
                CallSessionState::Connected,
                CallSessionState::Ended(CallEndReason::Normal),
            ]
        );
        assert!(!client.has_active_call());
    }

    #[tokio::test]
    async fn test_incoming_while_busy_is_dropped() {
        let (client, _rx) = client();
        client.register().await.unwrap();
        client.place_call("+15551234567").await.unwrap();
        assert!(client.simulate_incoming("+15550001111").is_none());
    }

    #[tokio::test]
    async fn test_network_failure_ends_call_and_registration() {
        let (client, mut rx) = client();
        client.register().await.unwrap();
        client.place_call("+15551234567").await.unwrap();
        client.simulate_network_failure();

        assert!(!client.is_registered());
        assert!(!client.has_active_call());

        let mut saw_network_end = false;
        let mut saw_registration_lost = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                SignalingEvent::CallState {
                    state: CallSessionState::Ended(CallEndReason::NetworkError),
                    ..
                } => saw_network_end = true,
                SignalingEvent::RegistrationLost { .. } => saw_registration_lost = true,
                _ => {}
            }
        }
        assert!(saw_network_end);
        assert!(saw_registration_lost);
    }
}
