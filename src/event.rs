use crate::call::PhoneState;
use crate::callrecord::{CallDirection, CallStatus};
use serde::{Deserialize, Serialize};

/// Bounded fan-out capacity; a subscriber this far behind is lagging and
/// loses the overwritten events rather than stalling the publisher.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhoneEvent {
    PhoneStateChanged {
        old: PhoneState,
        new: PhoneState,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_number: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CallStarted {
        direction: CallDirection,
        number: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        dialed_number: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed_dial_code: Option<String>,
    },
    CallEnded {
        status: CallStatus,
        duration_seconds: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A call refused before any signalling took place (dial policy) or at
    /// the signalling edge (inbound screening). Recorded closed, never
    /// in-progress.
    CallRejected {
        direction: CallDirection,
        number: String,
        reason: String,
    },
    DigitDialed {
        digit: char,
        number_so_far: String,
    },
    CallLogUpdated {
        record_id: i64,
    },
    ConfigChanged {
        section: String,
    },
}

pub type EventSender = tokio::sync::broadcast::Sender<PhoneEvent>;
pub type EventReceiver = tokio::sync::broadcast::Receiver<PhoneEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The push channel ships these over the wire; the tags are part of the
    // external contract.
    #[test]
    fn test_events_serialize_tagged() {
        let event = PhoneEvent::PhoneStateChanged {
            old: PhoneState::Idle,
            new: PhoneState::OffHookWaiting,
            current_number: None,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "phone_state_changed");
        assert_eq!(json["old"], "idle");
        assert_eq!(json["new"], "off_hook_waiting");
        assert!(json.get("current_number").is_none());

        let event = PhoneEvent::DigitDialed {
            digit: '5',
            number_so_far: "55".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "digit_dialed");
        assert_eq!(json["digit"], "5");
        assert_eq!(json["number_so_far"], "55");
    }

    #[test]
    fn test_call_ended_round_trips() {
        let event = PhoneEvent::CallEnded {
            status: crate::callrecord::CallStatus::Completed,
            duration_seconds: 42,
            error: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: PhoneEvent = serde_json::from_str(&json).unwrap();
        match back {
            PhoneEvent::CallEnded {
                status,
                duration_seconds,
                error,
            } => {
                assert_eq!(status, crate::callrecord::CallStatus::Completed);
                assert_eq!(duration_seconds, 42);
                assert!(error.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
