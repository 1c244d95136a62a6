use super::{
    CallEndReason, CallId, CallSessionState, SignalingClient, SignalingError, SignalingEvent,
    SignalingEventSender,
};
use crate::config::SipConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rsip::prelude::HeadersExt;
use rsipstack::dialog::authenticate::Credential;
use rsipstack::dialog::dialog::{DialogState, DialogStateReceiver, TerminatedReason};
use rsipstack::dialog::dialog_layer::DialogLayer;
use rsipstack::dialog::invitation::InviteOption;
use rsipstack::dialog::registration::Registration;
use rsipstack::dialog::server_dialog::ServerInviteDialog;
use rsipstack::dialog::DialogId;
use rsipstack::transaction::{Endpoint, TransactionReceiver};
use rsipstack::transport::{udp::UdpConnection, TransportLayer};
use rsipstack::EndpointBuilder;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const REGISTER_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
enum RegState {
    Unknown,
    Registered,
    Failed(String),
}

struct ActiveCall {
    id: CallId,
    dialog_id: Option<DialogId>,
    /// Inbound dialog not yet answered or rejected.
    pending: Option<ServerInviteDialog>,
    token: CancellationToken,
}

type ActiveSlot = Arc<Mutex<Option<ActiveCall>>>;

pub struct SipSignalingClientBuilder {
    config: Option<SipConfig>,
    cancel_token: Option<CancellationToken>,
    events: Option<SignalingEventSender>,
}

/// SIP endpoint speaking UDP to the configured peer: one registration, at
/// most one dialog in flight. Media is negotiated by the stack; this layer
/// only steers call lifecycle.
pub struct SipSignalingClient {
    config: SipConfig,
    token: CancellationToken,
    endpoint: Endpoint,
    dialog_layer: Arc<DialogLayer>,
    events: SignalingEventSender,
    reg_state: watch::Receiver<RegState>,
    reg_state_tx: watch::Sender<RegState>,
    active: ActiveSlot,
}

impl SipSignalingClientBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cancel_token: None,
            events: None,
        }
    }

    pub fn with_config(mut self, config: SipConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_events(mut self, events: SignalingEventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn build(mut self) -> Result<SipSignalingClient> {
        let token = self.cancel_token.take().unwrap_or_else(CancellationToken::new);
        let config = self.config.take().unwrap_or_default();
        let events = self
            .events
            .take()
            .ok_or_else(|| anyhow!("signalling event sender is required"))?;

        let local_ip = IpAddr::from_str(config.local_addr.as_str())?;
        let local_addr: SocketAddr = SocketAddr::new(local_ip, config.udp_port);

        let transport_layer = TransportLayer::new(token.clone());
        let udp_conn = UdpConnection::create_connection(local_addr, None)
            .await
            .map_err(|e| anyhow!("failed to create UDP connection: {}", e))?;
        transport_layer.add_transport(udp_conn.into());
        info!(%local_addr, "sip endpoint listening");

        let endpoint = EndpointBuilder::new()
            .with_cancel_token(token.child_token())
            .with_transport_layer(transport_layer)
            .build();
        let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));

        let (reg_state_tx, reg_state) = watch::channel(RegState::Unknown);

        Ok(SipSignalingClient {
            config,
            token,
            endpoint,
            dialog_layer,
            events,
            reg_state,
            reg_state_tx,
            active: Arc::new(Mutex::new(None)),
        })
    }
}

impl SipSignalingClient {
    /// Run the endpoint, the registration refresh loop and the inbound
    /// transaction dispatcher until cancelled.
    pub async fn serve(&self) -> Result<()> {
        let incoming_txs = self.endpoint.incoming_transactions();
        let endpoint_inner = self.endpoint.inner.clone();
        let token = self.token.child_token();

        select! {
            _ = token.cancelled() => {
                info!("sip client cancelled");
            }
            result = endpoint_inner.serve() => {
                if let Err(e) = result {
                    warn!("sip endpoint serve error: {:?}", e);
                }
            }
            result = self.registration_loop() => {
                if let Err(e) = result {
                    warn!("registration loop error: {:?}", e);
                }
            }
            result = self.process_incoming(incoming_txs) => {
                if let Err(e) = result {
                    warn!("incoming transaction loop error: {:?}", e);
                }
            }
        }
        info!("sip client stopped");
        Ok(())
    }

    fn credential(&self) -> Option<Credential> {
        if self.config.username.is_empty() {
            return None;
        }
        Some(Credential {
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            realm: None,
        })
    }

    fn local_uri(&self) -> String {
        format!("sip:{}@{}", self.config.username, self.config.server_addr())
    }

    /// Minimal audio offer; the stack and peer settle the codec.
    fn sdp_offer(&self) -> Vec<u8> {
        format!(
            "v=0\r\no=- {0} {0} IN IP4 {1}\r\ns=Call\r\nc=IN IP4 {1}\r\nt=0 0\r\nm=audio 49170 RTP/AVP 0 8\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\n",
            chrono::Utc::now().timestamp(),
            self.config.local_addr,
        )
        .into_bytes()
    }

    async fn registration_loop(&self) -> Result<()> {
        let server = self.config.server_addr();
        let mut first_failure: Option<tokio::time::Instant> = None;
        let grace = Duration::from_secs(self.config.registration_grace_secs);

        loop {
            if self.token.is_cancelled() {
                break;
            }
            let mut registration =
                Registration::new(self.endpoint.inner.clone(), self.credential());
            match registration.register(&server).await {
                Ok(resp) => {
                    if matches!(resp.status_code().kind(), rsip::StatusCodeKind::Successful) {
                        if *self.reg_state.borrow() != RegState::Registered {
                            info!(server = %server, "registration succeeded");
                            self.events.send(SignalingEvent::Registered).ok();
                        }
                        first_failure = None;
                        self.reg_state_tx.send(RegState::Registered).ok();

                        let mut expiry = registration.expires().max(50) as u64;
                        if let Some(interval) = self.config.register_interval_secs {
                            expiry = expiry.min(interval);
                        }
                        sleep(Duration::from_secs(expiry)).await;
                        continue;
                    }
                    let reason = resp.status_code().to_string();
                    self.note_registration_failure(&mut first_failure, grace, reason);
                }
                Err(e) => {
                    self.note_registration_failure(&mut first_failure, grace, e.to_string());
                }
            }
            sleep(REGISTER_RETRY_INTERVAL).await;
        }
        Ok(())
    }

    fn note_registration_failure(
        &self,
        first_failure: &mut Option<tokio::time::Instant>,
        grace: Duration,
        reason: String,
    ) {
        warn!(reason = %reason, "registration attempt failed");
        self.reg_state_tx.send(RegState::Failed(reason.clone())).ok();
        let started = first_failure.get_or_insert_with(tokio::time::Instant::now);
        if started.elapsed() >= grace {
            // Past the grace window the stack is considered down until a
            // refresh succeeds again.
            self.events
                .send(SignalingEvent::RegistrationLost { reason })
                .ok();
        }
    }

    async fn process_incoming(&self, mut incoming: TransactionReceiver) -> Result<()> {
        while let Some(mut tx) = incoming.recv().await {
            match tx.original.method {
                rsip::Method::Invite => {}
                _ => {
                    tx.reply(rsip::StatusCode::OK).await.ok();
                    continue;
                }
            }
            // Requests carrying a to-tag belong to an established dialog.
            if tx.original.to_header()?.tag()?.as_ref().is_some() {
                match self.dialog_layer.match_dialog(&tx.original) {
                    Some(mut d) => {
                        tokio::spawn(async move {
                            d.handle(&mut tx).await.ok();
                        });
                    }
                    None => {
                        tx.reply(rsip::StatusCode::CallTransactionDoesNotExist)
                            .await
                            .ok();
                    }
                }
                continue;
            }

            let caller_id = tx
                .original
                .from_header()?
                .uri()?
                .user()
                .unwrap_or_default()
                .to_string();

            let mut active = self.active.lock().await;
            if active.is_some() {
                info!(caller_id, "busy, declining second call");
                tx.reply(rsip::StatusCode::BusyHere).await.ok();
                continue;
            }

            let contact = self.dialog_layer.endpoint.get_addrs().first().map(|addr| rsip::Uri {
                scheme: Some(rsip::Scheme::Sip),
                auth: None,
                host_with_port: addr.addr.clone(),
                params: vec![],
                headers: vec![],
            });
            let (state_sender, state_receiver) = unbounded_channel();
            let dialog = match self.dialog_layer.get_or_create_server_invite(
                &tx,
                state_sender,
                None,
                contact,
            ) {
                Ok(d) => d,
                Err(e) => {
                    info!("failed to obtain dialog: {:?}", e);
                    tx.reply(rsip::StatusCode::CallTransactionDoesNotExist)
                        .await
                        .ok();
                    continue;
                }
            };

            let call_id = Uuid::new_v4().to_string();
            let call_token = self.token.child_token();
            info!(caller_id, call = %call_id, dialog = %dialog.id(), "incoming call");

            *active = Some(ActiveCall {
                id: call_id.clone(),
                dialog_id: Some(dialog.id()),
                pending: Some(dialog.clone()),
                token: call_token.clone(),
            });
            drop(active);

            let mut dialog_ref = dialog.clone();
            let token_ref = call_token.clone();
            tokio::spawn(async move {
                select! {
                    _ = token_ref.cancelled() => {}
                    _ = dialog_ref.handle(&mut tx) => {}
                }
            });

            self.spawn_dialog_event_loop(call_id.clone(), state_receiver);

            dialog.ringing(None, None).ok();
            self.events
                .send(SignalingEvent::Incoming {
                    call: call_id,
                    caller_id,
                })
                .ok();
        }
        Ok(())
    }

    /// Translate dialog-layer transitions into call session events and free
    /// the active slot when the dialog dies.
    fn spawn_dialog_event_loop(&self, call_id: CallId, mut receiver: DialogStateReceiver) {
        let events = self.events.clone();
        let active = self.active.clone();
        let token = self.token.child_token();

        tokio::spawn(async move {
            let send_state = |state: CallSessionState| {
                events
                    .send(SignalingEvent::CallState {
                        call: call_id.clone(),
                        state,
                    })
                    .ok();
            };
            loop {
                let state = select! {
                    _ = token.cancelled() => break,
                    state = receiver.recv() => match state {
                        Some(state) => state,
                        None => break,
                    },
                };
                match state {
                    DialogState::Trying(dialog_id) | DialogState::Calling(dialog_id) => {
                        info!(call = %call_id, %dialog_id, "dialog trying");
                        send_state(CallSessionState::Initiating);
                    }
                    DialogState::Early(dialog_id, resp) => {
                        let early_media = !resp.body().is_empty();
                        info!(call = %call_id, %dialog_id, early_media, "dialog early");
                        send_state(if early_media {
                            CallSessionState::EarlyMedia
                        } else {
                            CallSessionState::Ringing
                        });
                    }
                    DialogState::Confirmed(dialog_id) => {
                        info!(call = %call_id, %dialog_id, "dialog confirmed");
                        {
                            let mut slot = active.lock().await;
                            if let Some(call) = slot.as_mut() {
                                if call.id == call_id {
                                    call.dialog_id = Some(dialog_id);
                                    call.pending = None;
                                }
                            }
                        }
                        send_state(CallSessionState::Answered);
                        send_state(CallSessionState::Connected);
                    }
                    DialogState::Terminated(dialog_id, reason) => {
                        info!(call = %call_id, %dialog_id, ?reason, "dialog terminated");
                        {
                            let mut slot = active.lock().await;
                            if slot.as_ref().map(|c| c.id == call_id).unwrap_or(false) {
                                *slot = None;
                            }
                        }
                        send_state(CallSessionState::Ended(map_terminated(reason)));
                        break;
                    }
                    _ => {}
                }
            }
        });
    }
}

#[async_trait]
impl SignalingClient for SipSignalingClient {
    async fn register(&self) -> Result<(), SignalingError> {
        // The refresh loop does the talking; wait here for its verdict.
        let mut reg_state = self.reg_state.clone();
        let timeout = Duration::from_secs(self.config.registration_timeout_secs);
        let wait = async {
            loop {
                match &*reg_state.borrow() {
                    RegState::Registered => return Ok(()),
                    RegState::Failed(reason) => {
                        return Err(SignalingError::RegistrationFailed(reason.clone()))
                    }
                    RegState::Unknown => {}
                }
                if reg_state.changed().await.is_err() {
                    return Err(SignalingError::RegistrationFailed(
                        "registration loop stopped".to_string(),
                    ));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(SignalingError::RegistrationFailed(format!(
                "no registration response within {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn place_call(&self, destination: &str) -> Result<CallId, SignalingError> {
        if *self.reg_state.borrow() != RegState::Registered {
            return Err(SignalingError::NotRegistered);
        }

        let call_id = Uuid::new_v4().to_string();
        {
            let mut active = self.active.lock().await;
            if active.is_some() {
                return Err(SignalingError::Busy);
            }
            *active = Some(ActiveCall {
                id: call_id.clone(),
                dialog_id: None,
                pending: None,
                token: self.token.child_token(),
            });
        }

        let caller: rsip::Uri = self
            .local_uri()
            .try_into()
            .map_err(|e: rsip::Error| SignalingError::Transport(e.to_string()))?;
        let callee: rsip::Uri = format!("sip:{}@{}", destination, self.config.server_addr())
            .try_into()
            .map_err(|e: rsip::Error| SignalingError::Transport(e.to_string()))?;

        let invite_option = InviteOption {
            caller: caller.clone(),
            callee,
            content_type: Some("application/sdp".to_string()),
            offer: Some(self.sdp_offer()),
            contact: caller,
            credential: self.credential(),
            headers: None,
        };

        let (state_sender, state_receiver) = unbounded_channel();
        self.spawn_dialog_event_loop(call_id.clone(), state_receiver);

        info!(destination, call = %call_id, "inviting");
        let dialog_layer = self.dialog_layer.clone();
        let active = self.active.clone();
        let events = self.events.clone();
        let call_id_for_invite = call_id.clone();
        tokio::spawn(async move {
            match dialog_layer.do_invite(invite_option, state_sender).await {
                Ok((dialog, _answer)) => {
                    let mut slot = active.lock().await;
                    if let Some(call) = slot.as_mut() {
                        if call.id == call_id_for_invite {
                            call.dialog_id = Some(dialog.id());
                        }
                    }
                }
                Err(e) => {
                    warn!(call = %call_id_for_invite, "invite failed: {:?}", e);
                    let mut slot = active.lock().await;
                    if slot.as_ref().map(|c| c.id == call_id_for_invite).unwrap_or(false) {
                        *slot = None;
                        events
                            .send(SignalingEvent::CallState {
                                call: call_id_for_invite.clone(),
                                state: CallSessionState::Ended(CallEndReason::NetworkError),
                            })
                            .ok();
                    }
                }
            }
        });
        Ok(call_id)
    }

    async fn answer(&self, call: &CallId) -> Result<(), SignalingError> {
        let dialog = {
            let mut slot = self.active.lock().await;
            match slot.as_mut() {
                Some(active) if &active.id == call => active.pending.take(),
                _ => return Err(SignalingError::NoSuchCall),
            }
        };
        let dialog = dialog.ok_or(SignalingError::NoSuchCall)?;
        let headers = vec![rsip::Header::ContentType("application/sdp".into())];
        dialog
            .accept(Some(headers), Some(self.sdp_offer()))
            .map_err(|e| SignalingError::Transport(format!("{:?}", e)))?;
        info!(call = %call, "answered");
        Ok(())
    }

    async fn reject(&self, call: &CallId) -> Result<(), SignalingError> {
        let (dialog, token) = {
            let mut slot = self.active.lock().await;
            let matches = slot
                .as_ref()
                .map(|active| &active.id == call && active.pending.is_some())
                .unwrap_or(false);
            if !matches {
                return Err(SignalingError::NoSuchCall);
            }
            let active = slot.take().unwrap();
            (active.pending, active.token)
        };
        if let Some(dialog) = dialog {
            dialog.reject(None, None).ok();
        }
        token.cancel();
        info!(call = %call, "rejected");
        Ok(())
    }

    async fn hangup(&self, call: &CallId) -> Result<(), SignalingError> {
        let (dialog_id, pending, token) = {
            let mut slot = self.active.lock().await;
            let matches = slot
                .as_ref()
                .map(|active| &active.id == call)
                .unwrap_or(false);
            if !matches {
                return Err(SignalingError::NoSuchCall);
            }
            let active = slot.take().unwrap();
            (active.dialog_id, active.pending, active.token)
        };

        if let Some(dialog) = pending {
            // Never answered: decline rather than BYE.
            dialog.reject(None, None).ok();
            token.cancel();
            info!(call = %call, "unanswered call declined");
            return Ok(());
        }
        if let Some(dialog_id) = dialog_id {
            if let Some(dialog) = self.dialog_layer.get_dialog(&dialog_id) {
                dialog.hangup().await.ok();
                self.dialog_layer.remove_dialog(&dialog_id);
            }
        }
        token.cancel();
        info!(call = %call, "hung up");
        Ok(())
    }

    async fn shutdown(&self) {
        let active = self.active.lock().await.take();
        if let Some(call) = active {
            if let Some(dialog) = call.pending {
                dialog.reject(None, None).ok();
            } else if let Some(dialog_id) = call.dialog_id {
                if let Some(dialog) = self.dialog_layer.get_dialog(&dialog_id) {
                    dialog.hangup().await.ok();
                    self.dialog_layer.remove_dialog(&dialog_id);
                }
            }
            call.token.cancel();
        }
        self.token.cancel();
        info!("sip client shut down");
    }
}

fn map_terminated(reason: TerminatedReason) -> CallEndReason {
    match reason {
        TerminatedReason::UacCancel => CallEndReason::Normal,
        TerminatedReason::UacBye | TerminatedReason::UasBye => CallEndReason::Normal,
        TerminatedReason::UacBusy | TerminatedReason::UasBusy => CallEndReason::Busy,
        TerminatedReason::UasDecline => CallEndReason::Rejected,
        TerminatedReason::UacOther(code) | TerminatedReason::UasOther(code) => {
            match code.map(|c| c.code()) {
                Some(408) | Some(480) => CallEndReason::NoAnswer,
                Some(486) => CallEndReason::Busy,
                Some(603) => CallEndReason::Rejected,
                _ => CallEndReason::NetworkError,
            }
        }
        _ => CallEndReason::NetworkError,
    }
}
