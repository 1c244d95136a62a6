use crate::call::{CallInput, CallManagerBuilder, DialPlan, PhoneState};
use crate::callrecord::{CallDirection, CallLogSink, CallLogStore, CallRecord, CallStatus};
use crate::config::{AudioConfig, TimingConfig};
use crate::event::{EventSender, PhoneEvent};
use crate::gpio::{Level, MockGpio};
use crate::hardware::{DialReader, HookMonitor, Ringer, TonePlayer};
use crate::media::{Channel, SoundEngine};
use crate::models::open_database;
use crate::sip::{MemorySignalingClient, SignalingClient};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const HOOK_PIN: u8 = 17;
const PULSE_PIN: u8 = 27;
const RINGER_PIN: u8 = 23;

const DEBOUNCE: Duration = Duration::from_millis(50);
const PULSE_TIMEOUT: Duration = Duration::from_millis(300);
const INTER_DIGIT: Duration = Duration::from_millis(2000);

/// A complete phone wired against the in-memory GPIO, audio and signalling
/// fakes, with the persistence sink running over an in-memory database.
struct Phone {
    gpio: Arc<MockGpio>,
    sound: SoundEngine,
    signaling: Arc<MemorySignalingClient>,
    store: CallLogStore,
    bus: EventSender,
    state_rx: watch::Receiver<PhoneState>,
    token: CancellationToken,
}

async fn phone_with(speed_dial: &[(&str, &str)], allowlist: &[&str]) -> Phone {
    let token = CancellationToken::new();
    let gpio = Arc::new(MockGpio::new());
    let sound = SoundEngine::mock();
    let (bus, _keep) = crate::event::channel();

    let (queue_tx, queue_rx) = mpsc::unbounded_channel();

    let hook = HookMonitor::new(
        gpio.clone(),
        HOOK_PIN,
        DEBOUNCE,
        queue_tx.clone(),
        token.child_token(),
    );
    hook.start().unwrap();
    let hook_handle = hook.state_handle();

    let dial = DialReader::new(
        gpio.clone(),
        PULSE_PIN,
        PULSE_TIMEOUT,
        queue_tx.clone(),
        token.child_token(),
    );
    dial.start().unwrap();

    let timing = TimingConfig {
        pulse_timeout_ms: PULSE_TIMEOUT.as_millis() as u64,
        inter_digit_timeout_ms: INTER_DIGIT.as_millis() as u64,
        hook_debounce_ms: DEBOUNCE.as_millis() as u64,
        ..TimingConfig::default()
    };

    let ringer = Arc::new(Ringer::new(
        gpio.clone(),
        RINGER_PIN,
        sound.clone(),
        timing.ring_on(),
        timing.ring_off(),
        "sounds/ring.wav",
    ));
    ringer.init().unwrap();
    let tone = Arc::new(TonePlayer::new(sound.clone(), AudioConfig::default()));

    let (sig_tx, mut sig_rx) = mpsc::unbounded_channel();
    let signaling = Arc::new(MemorySignalingClient::new(sig_tx));
    signaling.register().await.unwrap();

    // Signalling callbacks feed the same serialised input queue.
    let forward_queue = queue_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = sig_rx.recv().await {
            if forward_queue.send(CallInput::Signaling(event)).is_err() {
                break;
            }
        }
    });

    let dial_plan = DialPlan::new(
        speed_dial
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        allowlist.iter().map(|s| s.to_string()).collect(),
    );

    let db = open_database("sqlite::memory:").await.unwrap();
    let store = CallLogStore::new(db);
    let mut sink = CallLogSink::new(store.clone(), bus.clone(), token.child_token());
    tokio::spawn(async move { sink.serve().await });

    let signaling_client: Arc<dyn SignalingClient> = signaling.clone();
    let (mut manager, state_rx) = CallManagerBuilder::new()
        .with_signaling(signaling_client)
        .with_ringer(ringer)
        .with_tone(tone)
        .with_hook(hook_handle)
        .with_bus(bus.clone())
        .with_queue(queue_rx)
        .with_dial_plan(dial_plan)
        .with_timing(timing)
        .with_cancel_token(token.child_token())
        .build();
    tokio::spawn(async move { manager.serve().await });

    Phone {
        gpio,
        sound,
        signaling,
        store,
        bus,
        state_rx,
        token,
    }
}

impl Phone {
    async fn pickup(&self) {
        self.gpio.set_level(HOOK_PIN, Level::Low);
        sleep(DEBOUNCE * 3).await;
    }

    async fn hangup(&self) {
        self.gpio.set_level(HOOK_PIN, Level::High);
        sleep(DEBOUNCE * 3).await;
    }

    /// Spin the dial once: `digit` pulses (0 dials as ten).
    async fn dial_digit(&self, digit: u32) {
        let pulses = if digit == 0 { 10 } else { digit };
        for _ in 0..pulses {
            self.gpio
                .pulse(PULSE_PIN, Duration::from_millis(33), Duration::from_millis(66))
                .await;
        }
        sleep(PULSE_TIMEOUT * 2).await;
    }

    async fn dial_number(&self, number: &str) {
        for c in number.chars() {
            self.dial_digit(c.to_digit(10).unwrap()).await;
        }
    }

    /// Let the inter-digit timer expire so validation runs.
    async fn wait_dialling_complete(&self) {
        sleep(INTER_DIGIT + Duration::from_millis(500)).await;
    }

    async fn expect_state(&mut self, expected: PhoneState) {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *self.state_rx.borrow() == expected {
                    return;
                }
                if self.state_rx.changed().await.is_err() {
                    panic!("state channel closed while waiting for {:?}", expected);
                }
            }
        })
        .await;
        assert!(
            reached.is_ok(),
            "timed out waiting for {:?}, still {:?}",
            expected,
            *self.state_rx.borrow()
        );
    }

    fn state(&self) -> PhoneState {
        *self.state_rx.borrow()
    }

    fn ringer_level(&self) -> Level {
        self.gpio.output_level(RINGER_PIN).unwrap()
    }

    /// Poll the store until the sink has flushed the expected shape.
    async fn wait_records<F>(&self, pred: F) -> Vec<CallRecord>
    where
        F: Fn(&[CallRecord]) -> bool,
    {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let records = self.store.list(50).await.unwrap();
                if pred(&records) {
                    return records;
                }
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        match result {
            Ok(records) => records,
            Err(_) => panic!(
                "timed out waiting for record condition; have {:?}",
                self.store.list(50).await.unwrap()
            ),
        }
    }

    async fn shutdown(self) {
        self.token.cancel();
    }
}

#[tokio::test(start_paused = true)]
async fn test_speed_dial_outbound_call_completes() {
    let mut phone = phone_with(&[("1", "+15551234567")], &["+15551234567"]).await;

    phone.pickup().await;
    phone.expect_state(PhoneState::OffHookWaiting).await;
    assert!(phone.sound.is_playing(Channel::Tone));

    phone.dial_digit(1).await;
    phone.expect_state(PhoneState::Dialing).await;
    assert!(!phone.sound.is_playing(Channel::Tone));

    phone.wait_dialling_complete().await;
    phone.expect_state(PhoneState::Calling).await;
    assert_eq!(
        phone.signaling.last_destination().as_deref(),
        Some("+15551234567")
    );

    // The in-progress record is open while the attempt is in flight, and
    // it is the only one.
    let records = phone
        .wait_records(|r| r.iter().any(|r| r.status == CallStatus::InProgress))
        .await;
    assert_eq!(records.len(), 1);
    assert_eq!(phone.store.in_progress_count().await.unwrap(), 1);

    phone.signaling.simulate_remote_answer();
    phone.expect_state(PhoneState::Connected).await;

    sleep(Duration::from_secs(7)).await;
    phone.signaling.simulate_remote_hangup();
    phone.expect_state(PhoneState::OffHookWaiting).await;
    phone.hangup().await;
    phone.expect_state(PhoneState::Idle).await;

    let records = phone
        .wait_records(|r| r.len() == 1 && r[0].status == CallStatus::Completed)
        .await;
    assert_eq!(phone.store.in_progress_count().await.unwrap(), 0);
    let record = &records[0];
    assert_eq!(record.direction, CallDirection::Outbound);
    assert_eq!(record.status, CallStatus::Completed);
    assert_eq!(record.dialed_number.as_deref(), Some("1"));
    assert_eq!(record.speed_dial_code.as_deref(), Some("1"));
    assert_eq!(record.destination.as_deref(), Some("+15551234567"));
    assert!(record.duration_seconds >= 7);

    phone.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_blocked_destination_never_reaches_signalling() {
    let mut phone = phone_with(&[], &["+15551234567"]).await;

    phone.pickup().await;
    phone.expect_state(PhoneState::OffHookWaiting).await;

    phone.dial_number("5559999999").await;
    phone.expect_state(PhoneState::Dialing).await;
    phone.wait_dialling_complete().await;
    phone.expect_state(PhoneState::Error).await;

    // The signalling client was never asked to place anything.
    assert!(phone.signaling.last_destination().is_none());
    assert!(!phone.signaling.has_active_call());
    assert!(phone.sound.is_playing(Channel::Tone));

    let records = phone.wait_records(|r| r.len() == 1).await;
    assert_eq!(records[0].status, CallStatus::Failed);
    assert!(records[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("not allowed"));

    phone.hangup().await;
    phone.expect_state(PhoneState::Idle).await;
    phone.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_inbound_call_answered_and_logged() {
    let mut phone = phone_with(&[], &["+15551234567"]).await;

    phone.signaling.simulate_incoming("+15551234567");
    phone.expect_state(PhoneState::Ringing).await;

    // Two full ring cadences.
    sleep(Duration::from_secs(12)).await;
    assert!(phone.state() == PhoneState::Ringing);

    phone.pickup().await;
    phone.expect_state(PhoneState::Connected).await;
    // Bell and call audio never overlap.
    assert!(!phone.sound.is_playing(Channel::Ringer));
    assert_eq!(phone.ringer_level(), Level::Low);

    sleep(Duration::from_secs(12)).await;
    phone.signaling.simulate_remote_hangup();
    phone.expect_state(PhoneState::OffHookWaiting).await;
    phone.hangup().await;
    phone.expect_state(PhoneState::Idle).await;

    let records = phone
        .wait_records(|r| r.len() == 1 && r[0].status == CallStatus::Completed)
        .await;
    let record = &records[0];
    assert_eq!(record.direction, CallDirection::Inbound);
    assert_eq!(record.caller_id.as_deref(), Some("+15551234567"));
    assert_eq!(record.status, CallStatus::Completed);
    assert!(record.duration_seconds >= 11 && record.duration_seconds <= 13);

    phone.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_inbound_call_missed_when_remote_cancels() {
    let mut phone = phone_with(&[], &["*"]).await;

    phone.signaling.simulate_incoming("+15550001111");
    phone.expect_state(PhoneState::Ringing).await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(phone.ringer_level(), Level::High);

    phone.signaling.simulate_remote_hangup();
    phone.expect_state(PhoneState::Idle).await;
    assert_eq!(phone.ringer_level(), Level::Low);
    assert!(!phone.sound.is_playing(Channel::Ringer));

    let records = phone
        .wait_records(|r| r.len() == 1 && r[0].status == CallStatus::Missed)
        .await;
    assert_eq!(records[0].duration_seconds, 0);

    phone.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_hangup_during_dialling_leaves_no_record() {
    let mut phone = phone_with(&[], &["*"]).await;

    phone.pickup().await;
    phone.expect_state(PhoneState::OffHookWaiting).await;
    phone.dial_digit(5).await;
    phone.expect_state(PhoneState::Dialing).await;

    sleep(Duration::from_millis(500)).await;
    phone.hangup().await;
    phone.expect_state(PhoneState::Idle).await;

    // Give the sink a chance to have done something wrong.
    sleep(Duration::from_millis(200)).await;
    assert!(phone.store.list(10).await.unwrap().is_empty());
    assert!(!phone.sound.is_playing(Channel::Tone));

    phone.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ten_pulses_dial_zero() {
    let mut phone = phone_with(&[], &["*"]).await;
    let mut events = phone.bus.subscribe();

    phone.pickup().await;
    phone.expect_state(PhoneState::OffHookWaiting).await;
    phone.dial_digit(0).await;
    phone.expect_state(PhoneState::Dialing).await;

    let observed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(PhoneEvent::DigitDialed {
                digit,
                number_so_far,
            }) = events.recv().await
            {
                return (digit, number_so_far);
            }
        }
    })
    .await
    .expect("no digit observed");
    assert_eq!(observed, ('0', "0".to_string()));

    phone.hangup().await;
    phone.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_timeout_with_empty_buffer_is_noop() {
    let mut phone = phone_with(&[], &["*"]).await;

    phone.pickup().await;
    phone.expect_state(PhoneState::OffHookWaiting).await;

    // No digits at all: nothing must be attempted.
    sleep(INTER_DIGIT * 3).await;
    assert_eq!(phone.state(), PhoneState::OffHookWaiting);
    assert!(phone.signaling.last_destination().is_none());

    phone.hangup().await;
    phone.expect_state(PhoneState::Idle).await;
    phone.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_twenty_first_digit_is_dropped() {
    let mut phone = phone_with(&[], &["*"]).await;
    let mut events = phone.bus.subscribe();

    phone.pickup().await;
    phone.expect_state(PhoneState::OffHookWaiting).await;

    for _ in 0..21 {
        phone.dial_digit(1).await;
    }

    let mut last_number = String::new();
    while let Ok(event) = events.try_recv() {
        if let PhoneEvent::DigitDialed { number_so_far, .. } = event {
            last_number = number_so_far;
        }
    }
    assert_eq!(last_number.len(), 20);

    // The timer kept re-arming, so dialling still completes normally.
    phone.wait_dialling_complete().await;
    phone.expect_state(PhoneState::Calling).await;
    assert_eq!(
        phone.signaling.last_destination().map(|d| d.len()),
        Some(20)
    );

    phone.hangup().await;
    phone.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pickup_hangup_is_identity() {
    let mut phone = phone_with(&[], &["*"]).await;

    phone.pickup().await;
    phone.expect_state(PhoneState::OffHookWaiting).await;
    phone.hangup().await;
    phone.expect_state(PhoneState::Idle).await;

    sleep(Duration::from_millis(200)).await;
    assert!(phone.store.list(10).await.unwrap().is_empty());
    assert!(!phone.sound.is_playing(Channel::Tone));
    assert!(!phone.sound.is_playing(Channel::Ringer));

    phone.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_speed_dial_equals_direct_dial() {
    // Same target reachable both ways; both must hand the signalling client
    // the identical destination.
    let target = "5551234567";

    let mut phone = phone_with(&[("2", target)], &[target]).await;
    phone.pickup().await;
    phone.dial_digit(2).await;
    phone.wait_dialling_complete().await;
    phone.expect_state(PhoneState::Calling).await;
    let via_speed_dial = phone.signaling.last_destination();
    phone.hangup().await;
    phone.expect_state(PhoneState::Idle).await;
    phone.shutdown().await;

    let mut phone = phone_with(&[], &[target]).await;
    phone.pickup().await;
    phone.dial_number(target).await;
    phone.wait_dialling_complete().await;
    phone.expect_state(PhoneState::Calling).await;
    let direct = phone.signaling.last_destination();
    phone.hangup().await;
    phone.shutdown().await;

    assert_eq!(via_speed_dial.as_deref(), Some(target));
    assert_eq!(via_speed_dial, direct);
}

#[tokio::test(start_paused = true)]
async fn test_outbound_rejected_by_remote_is_transient_error() {
    let mut phone = phone_with(&[], &["*"]).await;

    phone.pickup().await;
    phone.dial_digit(7).await;
    phone.wait_dialling_complete().await;
    phone.expect_state(PhoneState::Calling).await;

    phone.signaling.simulate_remote_hangup();
    phone.expect_state(PhoneState::Error).await;

    let records = phone
        .wait_records(|r| r.len() == 1 && r[0].status == CallStatus::Failed)
        .await;
    assert!(records[0].error_message.is_some());

    // Hang-up clears the error.
    phone.hangup().await;
    phone.expect_state(PhoneState::Idle).await;
    phone.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_screened_caller_is_rejected_without_ringing() {
    let mut phone = phone_with(&[], &["+15551234567"]).await;

    phone.signaling.simulate_incoming("+15559999999");
    sleep(Duration::from_millis(500)).await;

    assert_eq!(phone.state(), PhoneState::Idle);
    assert_eq!(phone.ringer_level(), Level::Low);
    assert!(!phone.signaling.has_active_call());

    let records = phone
        .wait_records(|r| r.len() == 1 && r[0].status == CallStatus::Rejected)
        .await;
    assert_eq!(records[0].caller_id.as_deref(), Some("+15559999999"));

    phone.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_call_attempt_timeout_closes_record() {
    let mut phone = phone_with(&[], &["*"]).await;

    phone.pickup().await;
    phone.dial_digit(3).await;
    phone.wait_dialling_complete().await;
    phone.expect_state(PhoneState::Calling).await;

    // Nobody ever answers.
    sleep(TimingConfig::default().call_attempt_timeout() + Duration::from_secs(2)).await;
    phone.expect_state(PhoneState::Error).await;

    let records = phone
        .wait_records(|r| r.len() == 1 && r[0].status == CallStatus::Missed)
        .await;
    assert!(records[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("timed out"));
    assert_eq!(phone.store.in_progress_count().await.unwrap(), 0);

    phone.hangup().await;
    phone.expect_state(PhoneState::Idle).await;
    phone.shutdown().await;
}
