mod store;
pub use store::{CallLogStore, CallStats, NewCall};

use crate::event::{EventReceiver, EventSender, PhoneEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    #[default]
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "inbound" => CallDirection::Inbound,
            _ => CallDirection::Outbound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    InProgress,
    Completed,
    Missed,
    Failed,
    Rejected,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Missed => "missed",
            CallStatus::Failed => "failed",
            CallStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => CallStatus::InProgress,
            "completed" => CallStatus::Completed,
            "missed" => CallStatus::Missed,
            "rejected" => CallStatus::Rejected,
            _ => CallStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::InProgress)
    }
}

/// One call attempt as exposed by the query API.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub caller_id: Option<String>,
    pub dialed_number: Option<String>,
    pub destination: Option<String>,
    pub speed_dial_code: Option<String>,
    pub duration_seconds: u64,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Persistence sink: the one bus subscriber that owns the record store.
/// Translates call events into inserts and the single terminal update, and
/// announces every write with `CallLogUpdated`. A lagged subscription drops
/// the overwritten events with a warning; the publisher is never held up.
pub struct CallLogSink {
    store: CallLogStore,
    events: EventReceiver,
    bus: EventSender,
    cancel_token: CancellationToken,
    open_record: Option<i64>,
}

impl CallLogSink {
    pub fn new(store: CallLogStore, bus: EventSender, cancel_token: CancellationToken) -> Self {
        Self {
            store,
            events: bus.subscribe(),
            bus,
            cancel_token,
            open_record: None,
        }
    }

    pub async fn serve(&mut self) {
        info!("call log sink started");
        loop {
            let next = select! {
                _ = self.cancel_token.cancelled() => None,
                event = self.events.recv() => Some(event),
            };
            match next {
                None => {
                    // Drain whatever is already queued before letting go.
                    while let Ok(event) = self.events.try_recv() {
                        self.handle_event(event).await;
                    }
                    break;
                }
                Some(Ok(event)) => self.handle_event(event).await,
                Some(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "call log sink lagged, events dropped");
                }
                Some(Err(RecvError::Closed)) => break,
            }
        }
        info!("call log sink stopped");
    }

    async fn handle_event(&mut self, event: PhoneEvent) {
        match event {
            PhoneEvent::CallStarted {
                direction,
                number,
                dialed_number,
                speed_dial_code,
            } => {
                if let Some(stale) = self.open_record.take() {
                    // A new attempt may never coexist with an open record.
                    warn!(record_id = stale, "previous record still open, closing as failed");
                    if let Err(e) = self
                        .store
                        .close(stale, CallStatus::Failed, 0, Some("superseded".to_string()))
                        .await
                    {
                        warn!("failed to close stale record: {:#}", e);
                    }
                }
                let call = match direction {
                    CallDirection::Outbound => NewCall {
                        direction,
                        destination: Some(number),
                        dialed_number,
                        speed_dial_code,
                        ..Default::default()
                    },
                    CallDirection::Inbound => NewCall {
                        direction,
                        caller_id: Some(number),
                        ..Default::default()
                    },
                };
                match self.store.insert_in_progress(call).await {
                    Ok(record_id) => {
                        self.open_record = Some(record_id);
                        self.announce(record_id);
                    }
                    Err(e) => warn!("failed to insert call record: {:#}", e),
                }
            }
            PhoneEvent::CallEnded {
                status,
                duration_seconds,
                error,
            } => match self.open_record.take() {
                Some(record_id) => {
                    match self
                        .store
                        .close(record_id, status, duration_seconds, error)
                        .await
                    {
                        Ok(()) => self.announce(record_id),
                        Err(e) => warn!("failed to close call record: {:#}", e),
                    }
                }
                None => warn!(?status, "call ended without an open record"),
            },
            PhoneEvent::CallRejected {
                direction,
                number,
                reason,
            } => {
                let (call, status) = match direction {
                    // A blocked outbound attempt failed locally.
                    CallDirection::Outbound => (
                        NewCall {
                            direction,
                            dialed_number: Some(number.clone()),
                            destination: Some(number),
                            ..Default::default()
                        },
                        CallStatus::Failed,
                    ),
                    // A screened caller was turned away.
                    CallDirection::Inbound => (
                        NewCall {
                            direction,
                            caller_id: Some(number),
                            ..Default::default()
                        },
                        CallStatus::Rejected,
                    ),
                };
                match self.store.insert_closed(call, status, Some(reason)).await {
                    Ok(record_id) => self.announce(record_id),
                    Err(e) => warn!("failed to insert rejected call record: {:#}", e),
                }
            }
            _ => {}
        }
    }

    fn announce(&self, record_id: i64) {
        self.bus.send(PhoneEvent::CallLogUpdated { record_id }).ok();
    }
}
