use super::policy::{DialPlan, Resolution};
use super::{CallInput, PhoneState};
use crate::callrecord::{CallDirection, CallStatus};
use crate::config::{TimingConfig, MAX_DIALED_DIGITS};
use crate::event::{EventSender, PhoneEvent};
use crate::hardware::{HookEvent, HookState, HookStateHandle, Ringer, Tone, TonePlayer};
use crate::sip::{
    CallEndReason, CallId, CallSessionState, SignalingClient, SignalingEvent,
};
use std::sync::Arc;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ActiveCall {
    id: CallId,
    direction: CallDirection,
    /// Destination for outbound, caller id for inbound.
    number: String,
    answered_at: Option<Instant>,
}

enum Wake {
    Input(CallInput),
    InterDigitTimeout,
    CallAttemptTimeout,
    Stopped,
}

pub struct CallManagerBuilder {
    signaling: Option<Arc<dyn SignalingClient>>,
    ringer: Option<Arc<Ringer>>,
    tone: Option<Arc<TonePlayer>>,
    hook: Option<HookStateHandle>,
    bus: Option<EventSender>,
    queue: Option<mpsc::UnboundedReceiver<CallInput>>,
    dial_plan: DialPlan,
    timing: TimingConfig,
    cancel_token: Option<CancellationToken>,
    registration_down: bool,
}

/// The call state machine.
///
/// Logically single-threaded: hook edges, digits, signalling callbacks and
/// the resettable timers all funnel through one queue and are processed to
/// completion in arrival order. A hang-up that is already queued ahead of
/// late digits therefore invalidates them exactly as the transition table
/// requires. The machine is the sole arbiter of the audio path: no state
/// routes the ringer and call audio at the same time.
pub struct CallManager {
    signaling: Arc<dyn SignalingClient>,
    ringer: Arc<Ringer>,
    tone: Arc<TonePlayer>,
    hook: HookStateHandle,
    bus: EventSender,
    queue: mpsc::UnboundedReceiver<CallInput>,
    dial_plan: DialPlan,
    timing: TimingConfig,
    cancel_token: CancellationToken,
    state_tx: watch::Sender<PhoneState>,

    state: PhoneState,
    dialed: String,
    active: Option<ActiveCall>,
    registration_down: bool,
    inter_digit_deadline: Option<Instant>,
    call_attempt_deadline: Option<Instant>,
}

impl CallManagerBuilder {
    pub fn new() -> Self {
        Self {
            signaling: None,
            ringer: None,
            tone: None,
            hook: None,
            bus: None,
            queue: None,
            dial_plan: DialPlan::default(),
            timing: TimingConfig::default(),
            cancel_token: None,
            registration_down: false,
        }
    }

    pub fn with_signaling(mut self, signaling: Arc<dyn SignalingClient>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    pub fn with_ringer(mut self, ringer: Arc<Ringer>) -> Self {
        self.ringer = Some(ringer);
        self
    }

    pub fn with_tone(mut self, tone: Arc<TonePlayer>) -> Self {
        self.tone = Some(tone);
        self
    }

    pub fn with_hook(mut self, hook: HookStateHandle) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_bus(mut self, bus: EventSender) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_queue(mut self, queue: mpsc::UnboundedReceiver<CallInput>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_dial_plan(mut self, dial_plan: DialPlan) -> Self {
        self.dial_plan = dial_plan;
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn build(self) -> (CallManager, watch::Receiver<PhoneState>) {
        let (state_tx, state_rx) = watch::channel(PhoneState::Idle);
        let manager = CallManager {
            signaling: self.signaling.expect("signalling client is required"),
            ringer: self.ringer.expect("ringer is required"),
            tone: self.tone.expect("tone player is required"),
            hook: self.hook.expect("hook state handle is required"),
            bus: self.bus.expect("event bus is required"),
            queue: self.queue.expect("input queue is required"),
            dial_plan: self.dial_plan,
            timing: self.timing,
            cancel_token: self.cancel_token.unwrap_or_default(),
            state_tx,
            state: PhoneState::Idle,
            dialed: String::new(),
            active: None,
            registration_down: self.registration_down,
            inter_digit_deadline: None,
            call_attempt_deadline: None,
        };
        (manager, state_rx)
    }
}

impl CallManager {
    pub fn state(&self) -> PhoneState {
        self.state
    }

    /// Run until cancelled or the queue closes.
    pub async fn serve(&mut self) {
        info!("call manager started");
        loop {
            // Select resolves to a plain value first; the borrow-heavy
            // handling happens after the futures are gone.
            let wake = select! {
                _ = self.cancel_token.cancelled() => Wake::Stopped,
                input = self.queue.recv() => match input {
                    Some(input) => Wake::Input(input),
                    None => Wake::Stopped,
                },
                _ = sleep_until(self.inter_digit_deadline.unwrap_or_else(Instant::now)),
                    if self.inter_digit_deadline.is_some() => Wake::InterDigitTimeout,
                _ = sleep_until(self.call_attempt_deadline.unwrap_or_else(Instant::now)),
                    if self.call_attempt_deadline.is_some() => Wake::CallAttemptTimeout,
            };
            match wake {
                Wake::Stopped => break,
                Wake::Input(input) => self.handle_input(input).await,
                Wake::InterDigitTimeout => {
                    self.inter_digit_deadline = None;
                    self.on_inter_digit_timeout().await;
                }
                Wake::CallAttemptTimeout => {
                    self.call_attempt_deadline = None;
                    self.on_call_attempt_timeout().await;
                }
            }
        }
        self.ringer.stop();
        self.tone.stop();
        info!("call manager stopped");
    }

    async fn handle_input(&mut self, input: CallInput) {
        match input {
            CallInput::Hook(HookEvent::Pickup) => self.on_pickup().await,
            CallInput::Hook(HookEvent::Hangup) => self.on_hangup().await,
            CallInput::Digit(digit) => self.on_digit(digit),
            CallInput::Signaling(SignalingEvent::Incoming { call, caller_id }) => {
                self.on_incoming(call, caller_id).await
            }
            CallInput::Signaling(SignalingEvent::CallState { call, state }) => {
                self.on_call_state(call, state).await
            }
            CallInput::Signaling(SignalingEvent::Registered) => {
                if self.registration_down {
                    info!("signalling registration recovered");
                }
                self.registration_down = false;
            }
            CallInput::Signaling(SignalingEvent::RegistrationLost { reason }) => {
                warn!(reason = %reason, "signalling registration lost");
                self.registration_down = true;
            }
            CallInput::ConfigUpdated(config) => {
                self.dial_plan = DialPlan::from_config(&config);
                self.timing = config.timing;
                self.tone.set_files(config.audio.clone());
                self.ringer.set_cadence(
                    config.timing.ring_on(),
                    config.timing.ring_off(),
                    config.audio.ring_file.clone(),
                );
                debug!("call manager picked up new configuration");
            }
        }
    }

    fn transition(&mut self, new_state: PhoneState, error: Option<String>) {
        let old_state = self.state;
        if old_state == new_state && error.is_none() {
            return;
        }
        self.state = new_state;
        info!(from = ?old_state, to = ?new_state, "state transition");
        if let Some(error) = &error {
            warn!(error = %error, "entering error state");
        }
        self.state_tx.send(new_state).ok();

        let current_number = if !self.dialed.is_empty() {
            Some(self.dialed.clone())
        } else {
            self.active.as_ref().map(|c| c.number.clone())
        };
        self.bus
            .send(PhoneEvent::PhoneStateChanged {
                old: old_state,
                new: new_state,
                current_number,
                error,
            })
            .ok();
    }

    async fn on_pickup(&mut self) {
        debug!(state = ?self.state, "pickup");
        match self.state {
            PhoneState::Idle => {
                if self.registration_down {
                    // Better an audible error than dead silence.
                    self.tone.play(Tone::Error);
                    self.transition(
                        PhoneState::Error,
                        Some("signalling unavailable".to_string()),
                    );
                    return;
                }
                self.dialed.clear();
                self.transition(PhoneState::OffHookWaiting, None);
                self.tone.play(Tone::Dial);
            }
            PhoneState::Ringing => {
                self.ringer.stop();
                let call_id = match self.active.as_ref() {
                    Some(call) => call.id.clone(),
                    None => {
                        warn!("ringing without an active call");
                        self.transition(PhoneState::Error, Some("no call to answer".to_string()));
                        return;
                    }
                };
                match self.signaling.answer(&call_id).await {
                    Ok(()) => {
                        if let Some(call) = self.active.as_mut() {
                            call.answered_at = Some(Instant::now());
                        }
                        self.transition(PhoneState::Connected, None);
                    }
                    Err(e) => {
                        let message = format!("failed to answer: {}", e);
                        self.close_call(CallStatus::Failed, 0, Some(message.clone()));
                        self.tone.play(Tone::Error);
                        self.transition(PhoneState::Error, Some(message));
                    }
                }
            }
            _ => {
                debug!(state = ?self.state, "pickup ignored");
            }
        }
    }

    async fn on_hangup(&mut self) {
        debug!(state = ?self.state, "hangup");
        self.inter_digit_deadline = None;
        self.call_attempt_deadline = None;
        self.tone.stop();

        match self.state {
            PhoneState::Ringing => {
                // Defensive: the hook cannot normally move while the bell
                // rings, but a bounce may read that way.
                self.ringer.stop();
                if let Some(call) = self.active.as_ref() {
                    self.signaling.reject(&call.id).await.ok();
                }
                self.close_call(CallStatus::Missed, 0, None);
            }
            PhoneState::Calling => {
                if let Some(call) = self.active.as_ref() {
                    self.signaling.hangup(&call.id).await.ok();
                }
                self.close_call(CallStatus::Missed, 0, None);
            }
            PhoneState::Connected => {
                let duration = self.connected_duration();
                if let Some(call) = self.active.as_ref() {
                    self.signaling.hangup(&call.id).await.ok();
                }
                self.close_call(CallStatus::Completed, duration, None);
            }
            _ => {}
        }

        self.dialed.clear();
        self.active = None;
        self.transition(PhoneState::Idle, None);
    }

    fn on_digit(&mut self, digit: char) {
        debug!(digit = %digit, state = ?self.state, "digit");
        match self.state {
            PhoneState::OffHookWaiting => {
                self.tone.stop();
                self.dialed.push(digit);
                self.transition(PhoneState::Dialing, None);
                self.emit_digit(digit);
                self.arm_inter_digit_timer();
            }
            PhoneState::Dialing => {
                if self.dialed.len() < MAX_DIALED_DIGITS {
                    self.dialed.push(digit);
                    self.emit_digit(digit);
                } else {
                    debug!(digit = %digit, "buffer full, digit dropped");
                }
                // The timer re-arms even for dropped digits.
                self.arm_inter_digit_timer();
            }
            _ => {
                warn!(digit = %digit, state = ?self.state, "digit ignored");
            }
        }
    }

    fn emit_digit(&self, digit: char) {
        self.bus
            .send(PhoneEvent::DigitDialed {
                digit,
                number_so_far: self.dialed.clone(),
            })
            .ok();
    }

    fn arm_inter_digit_timer(&mut self) {
        self.inter_digit_deadline = Some(Instant::now() + self.timing.inter_digit_timeout());
    }

    async fn on_inter_digit_timeout(&mut self) {
        if self.state != PhoneState::Dialing || self.dialed.is_empty() {
            return;
        }
        info!(number = %self.dialed, "dialling complete");
        self.transition(PhoneState::Validating, None);

        match self.dial_plan.resolve(&self.dialed) {
            Resolution::Permitted {
                destination,
                speed_dial_code,
            } => {
                self.bus
                    .send(PhoneEvent::CallStarted {
                        direction: CallDirection::Outbound,
                        number: destination.clone(),
                        dialed_number: Some(self.dialed.clone()),
                        speed_dial_code,
                    })
                    .ok();
                match self.signaling.place_call(&destination).await {
                    Ok(call_id) => {
                        info!(destination = %destination, call = %call_id, "calling");
                        self.active = Some(ActiveCall {
                            id: call_id,
                            direction: CallDirection::Outbound,
                            number: destination,
                            answered_at: None,
                        });
                        self.call_attempt_deadline =
                            Some(Instant::now() + self.timing.call_attempt_timeout());
                        self.transition(PhoneState::Calling, None);
                    }
                    Err(e) => {
                        let message = format!("call failed: {}", e);
                        self.bus
                            .send(PhoneEvent::CallEnded {
                                status: CallStatus::Failed,
                                duration_seconds: 0,
                                error: Some(message.clone()),
                            })
                            .ok();
                        self.tone.play(Tone::Error);
                        self.transition(PhoneState::Error, Some(message));
                    }
                }
            }
            Resolution::Denied {
                destination,
                reason,
            } => {
                self.bus
                    .send(PhoneEvent::CallRejected {
                        direction: CallDirection::Outbound,
                        number: destination,
                        reason: reason.clone(),
                    })
                    .ok();
                self.tone.play(Tone::Error);
                self.transition(PhoneState::Error, Some(reason));
            }
        }
    }

    async fn on_call_attempt_timeout(&mut self) {
        if self.state != PhoneState::Calling {
            return;
        }
        let timeout = self.timing.call_attempt_timeout();
        warn!(?timeout, "call attempt timed out");
        if let Some(call) = self.active.as_ref() {
            self.signaling.hangup(&call.id).await.ok();
        }
        let message = format!("call attempt timed out after {}s", timeout.as_secs());
        self.close_call(CallStatus::Missed, 0, Some(message.clone()));
        self.active = None;
        self.tone.play(Tone::Error);
        self.transition(PhoneState::Error, Some(message));
    }

    async fn on_incoming(&mut self, call: CallId, caller_id: String) {
        info!(caller_id = %caller_id, "incoming call");
        if self.state != PhoneState::Idle {
            // One call at a time; the signalling client already declined.
            warn!(state = ?self.state, "incoming call ignored, phone not idle");
            return;
        }

        if !self.dial_plan.is_allowed(&caller_id) {
            let reason = format!("caller {} is not allowed", caller_id);
            warn!(caller_id = %caller_id, "screening incoming call");
            self.signaling.reject(&call).await.ok();
            self.bus
                .send(PhoneEvent::CallRejected {
                    direction: CallDirection::Inbound,
                    number: caller_id,
                    reason,
                })
                .ok();
            return;
        }

        self.bus
            .send(PhoneEvent::CallStarted {
                direction: CallDirection::Inbound,
                number: caller_id.clone(),
                dialed_number: None,
                speed_dial_code: None,
            })
            .ok();
        self.active = Some(ActiveCall {
            id: call,
            direction: CallDirection::Inbound,
            number: caller_id,
            answered_at: None,
        });
        self.ringer.start();
        self.transition(PhoneState::Ringing, None);
    }

    async fn on_call_state(&mut self, call: CallId, session: CallSessionState) {
        let is_current = self.active.as_ref().map(|c| c.id == call).unwrap_or(false);
        if !is_current {
            debug!(call = %call, ?session, "state for stale call ignored");
            return;
        }

        match session {
            CallSessionState::Initiating
            | CallSessionState::Ringing
            | CallSessionState::EarlyMedia => {
                debug!(call = %call, ?session, "call progress");
            }
            CallSessionState::Answered | CallSessionState::Connected => {
                if self.state == PhoneState::Calling {
                    self.call_attempt_deadline = None;
                    if let Some(active) = self.active.as_mut() {
                        if active.answered_at.is_none() {
                            active.answered_at = Some(Instant::now());
                        }
                    }
                    if session == CallSessionState::Connected {
                        self.transition(PhoneState::Connected, None);
                    }
                }
            }
            CallSessionState::Ended(reason) => {
                self.call_attempt_deadline = None;
                self.on_call_ended(reason).await;
            }
        }
    }

    async fn on_call_ended(&mut self, reason: CallEndReason) {
        info!(state = ?self.state, ?reason, "call ended by peer");
        match self.state {
            PhoneState::Calling => {
                let (status, error, tone) = match reason {
                    CallEndReason::NoAnswer | CallEndReason::Normal => {
                        (CallStatus::Missed, None, Tone::Error)
                    }
                    CallEndReason::Busy => (
                        CallStatus::Failed,
                        Some("destination busy".to_string()),
                        Tone::Busy,
                    ),
                    CallEndReason::Rejected => (
                        CallStatus::Failed,
                        Some("call rejected by remote party".to_string()),
                        Tone::Busy,
                    ),
                    CallEndReason::NetworkError => (
                        CallStatus::Failed,
                        Some("network error".to_string()),
                        Tone::Error,
                    ),
                };
                self.close_call(status, 0, error.clone());
                self.active = None;
                if self.hook.state() == HookState::OffHook {
                    // Transient error until the user hangs up.
                    self.tone.play(tone);
                    self.transition(
                        PhoneState::Error,
                        Some(error.unwrap_or_else(|| "call not answered".to_string())),
                    );
                } else {
                    self.dialed.clear();
                    self.transition(PhoneState::Idle, None);
                }
            }
            PhoneState::Connected => {
                let duration = self.connected_duration();
                self.close_call(CallStatus::Completed, duration, None);
                self.active = None;
                self.dialed.clear();
                if self.hook.state() == HookState::OffHook {
                    // Remote hung up first; invite another call.
                    self.transition(PhoneState::OffHookWaiting, None);
                    self.tone.play(Tone::Dial);
                } else {
                    self.transition(PhoneState::Idle, None);
                }
            }
            PhoneState::Ringing => {
                // Caller gave up before pickup.
                self.ringer.stop();
                self.close_call(CallStatus::Missed, 0, None);
                self.active = None;
                self.transition(PhoneState::Idle, None);
            }
            _ => {
                debug!(state = ?self.state, "call ended in unexpected state");
                self.active = None;
            }
        }
    }

    fn connected_duration(&self) -> u64 {
        self.active
            .as_ref()
            .and_then(|c| c.answered_at)
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    fn close_call(&self, status: CallStatus, duration_seconds: u64, error: Option<String>) {
        let Some(call) = self.active.as_ref() else {
            return;
        };
        debug!(
            direction = ?call.direction,
            number = %call.number,
            ?status,
            duration_seconds,
            "closing call record"
        );
        self.bus
            .send(PhoneEvent::CallEnded {
                status,
                duration_seconds,
                error,
            })
            .ok();
    }
}
