//! Manual signaling state machine.
//!
//! Caller:   Idle -> OfferGenerated -> AnswerApplied -> CandidatesExchanging -> Connected
//! Receiver: Idle -> OfferApplied -> CandidatesExchanging -> Connected
//!
//! `Ended` and `Failed` are terminal from anywhere. `Connected` is only ever
//! entered from a monitor event, never from descriptor or candidate input.

use crate::config::Config;
use crate::error::{CallError, Result};
use crate::events::{CallEvent, LostReason};
use crate::peer::codec::{self, decode_candidates};
use crate::peer::ice::CandidateView;
use crate::peer::media::{MediaDevices, MediaHandle};
use crate::peer::monitor::ConnectionEvent;
use crate::peer::types::{ConnectionDescriptor, ConnectivityCandidate, Role};
use crate::session::MediaSessionManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalingState {
    Idle,
    OfferGenerated,
    AnswerApplied,
    OfferApplied,
    CandidatesExchanging,
    Connected,
    Ended,
    Failed,
}

impl SignalingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SignalingState::Ended | SignalingState::Failed)
    }

    /// Both descriptors are in place
    fn negotiated(self) -> bool {
        matches!(
            self,
            SignalingState::AnswerApplied
                | SignalingState::OfferApplied
                | SignalingState::CandidatesExchanging
                | SignalingState::Connected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Initiating,
    Ringing,
    Connected,
    Ended,
    Failed,
}

/// What the telephony/UI layer knows about the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub call_id: String,
    pub peer_label: String,
    pub direction: CallDirection,
    pub wants_video: bool,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

pub struct SignalingMachine {
    manager: MediaSessionManager,
    state: SignalingState,
    call: Option<CallRecord>,
    events: broadcast::Receiver<CallEvent>,
}

impl SignalingMachine {
    pub fn new(config: Config, devices: Arc<dyn MediaDevices>) -> Result<Self> {
        let manager = MediaSessionManager::new(config, devices)?;
        let events = manager.subscribe();
        Ok(Self {
            manager,
            state: SignalingState::Idle,
            call: None,
            events,
        })
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn call_record(&self) -> Option<&CallRecord> {
        self.call.as_ref()
    }

    pub fn role(&self) -> Option<Role> {
        self.manager.session().map(|s| s.role)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.manager.subscribe()
    }

    pub fn media(&self) -> Option<&MediaHandle> {
        self.manager.media()
    }

    pub fn remote_tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.manager.remote_tracks()
    }

    pub fn local_descriptor(&self) -> Option<&ConnectionDescriptor> {
        self.manager.local_descriptor()
    }

    /// Encoded local descriptor, ready for copy or QR display
    pub fn local_descriptor_text(&self) -> Result<Option<String>> {
        self.manager.local_descriptor().map(codec::encode).transpose()
    }

    pub fn local_candidates(&self) -> CandidateView {
        self.manager.drain_local_candidates()
    }

    /// Encoded batch of every candidate gathered so far
    pub fn local_candidates_text(&self) -> Result<String> {
        let batch: Vec<ConnectivityCandidate> = self.local_candidates().collect();
        codec::encode(&batch)
    }

    /// Waits for gathering to finish (bounded), then encodes the batch.
    pub async fn gather_local_candidates_text(&self) -> Result<String> {
        let batch = self.manager.gather_local_candidates().await;
        codec::encode(&batch)
    }

    pub async fn start_as_caller(&mut self, wants_video: bool) -> Result<String> {
        self.ready_to_start()?;
        let label = self.manager.config().peer_label.clone();
        info!("starting call as caller (video={wants_video})");

        let offer = match self.caller_offer(wants_video).await {
            Ok(offer) => offer,
            Err(e) => return Err(self.abort_start(e).await),
        };
        let text = match codec::encode(&offer) {
            Ok(text) => text,
            Err(e) => return Err(self.abort_start(e).await),
        };

        self.call = Some(new_record(
            offer.id.clone().unwrap_or_default(),
            label,
            CallDirection::Outgoing,
            wants_video,
        ));
        self.set_state(SignalingState::OfferGenerated);
        Ok(text)
    }

    pub async fn start_as_receiver(&mut self, offer_text: &str, wants_video: bool) -> Result<String> {
        self.ready_to_start()?;
        // a bad paste is rejected before touching any device
        let offer: ConnectionDescriptor = codec::decode(offer_text)?;
        if offer.role() != Role::Caller {
            return Err(CallError::InvalidRemoteDescriptor(
                "expected the caller's offer".into(),
            ));
        }
        let label = self.manager.config().peer_label.clone();
        info!("starting call as receiver (video={wants_video})");

        let answer = match self.receiver_answer(offer, wants_video).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.abort_start(e).await),
        };
        let text = match codec::encode(&answer) {
            Ok(text) => text,
            Err(e) => return Err(self.abort_start(e).await),
        };

        self.call = Some(new_record(
            answer.id.clone().unwrap_or_default(),
            label,
            CallDirection::Incoming,
            wants_video,
        ));
        self.set_state(SignalingState::OfferApplied);
        Ok(text)
    }

    pub async fn submit_answer_text(&mut self, text: &str) -> Result<()> {
        match self.state {
            SignalingState::OfferGenerated => {}
            SignalingState::AnswerApplied
            | SignalingState::CandidatesExchanging
            | SignalingState::Connected
                if self.role() == Some(Role::Caller) =>
            {
                return Err(CallError::AlreadyAnswered)
            }
            state => {
                return Err(CallError::precondition(format!(
                    "cannot apply an answer in {state:?}"
                )))
            }
        }

        let answer: ConnectionDescriptor = codec::decode(text)?;
        match self.manager.apply_answer(answer).await {
            Ok(()) => {
                self.set_state(SignalingState::AnswerApplied);
                Ok(())
            }
            Err(e) => Err(self.on_error(e).await),
        }
    }

    /// Accepts one candidate or a batch. Returns how many were submitted.
    /// If one is rejected partway, the ones before it stay applied and the
    /// step still advances.
    pub async fn submit_candidate_text(&mut self, text: &str) -> Result<usize> {
        if !self.state.negotiated() {
            return Err(CallError::precondition(format!(
                "candidates need both descriptors first (state {:?})",
                self.state
            )));
        }

        let batch = decode_candidates(text)?;
        let count = batch.len();
        for (applied, candidate) in batch.into_iter().enumerate() {
            if let Err(e) = self.manager.add_remote_candidate(candidate).await {
                // whatever went in before the failure stays applied
                if applied > 0 {
                    self.begin_exchange();
                }
                return Err(self.on_error(e).await);
            }
        }

        self.begin_exchange();
        debug!("{count} remote candidates submitted");
        Ok(count)
    }

    fn begin_exchange(&mut self) {
        if matches!(
            self.state,
            SignalingState::AnswerApplied | SignalingState::OfferApplied
        ) {
            self.set_state(SignalingState::CandidatesExchanging);
        }
    }

    /// User hang-up or abandon. Tears everything down and lands in `Ended`.
    pub async fn cancel(&mut self) -> Result<()> {
        match self.state {
            SignalingState::Idle => Err(CallError::precondition("no call to cancel")),
            state if state.is_terminal() => Ok(()),
            _ => {
                self.finish(SignalingState::Ended).await;
                Ok(())
            }
        }
    }

    /// Back to `Idle` from anywhere.
    pub async fn reset(&mut self) {
        self.manager.teardown().await;
        self.call = None;
        self.set_state(SignalingState::Idle);
    }

    pub fn toggle_audio(&self) -> bool {
        self.manager.toggle_audio()
    }

    pub fn toggle_video(&self) -> bool {
        self.manager.toggle_video()
    }

    pub async fn switch_camera(&self) -> Result<()> {
        self.manager.switch_camera().await
    }

    /// Applies a monitor event to the state machine. Returns whether the
    /// state changed. Events for any other call are ignored.
    pub async fn handle_event(&mut self, event: &CallEvent) -> bool {
        let current = self.call.as_ref().map(|c| c.call_id.as_str());
        if current != Some(event.call_id()) || self.state.is_terminal() {
            return false;
        }
        match event {
            CallEvent::Established { .. } => self.on_established(),
            CallEvent::Lost { reason, .. } => {
                self.on_lost(*reason).await;
                true
            }
            _ => false,
        }
    }

    /// Waits for the next event, applies it and hands it back.
    pub async fn next_event(&mut self) -> Option<CallEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    self.handle_event(&event).await;
                    return Some(event);
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("missed {n} call events, reconciling");
                    self.reconcile().await;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Single pass over the live connection state. Catches up on an
    /// `Established` or `Lost` that was published but never handled.
    pub async fn reconcile(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        match self.manager.reconcile() {
            Some(ConnectionEvent::Established) => {
                self.on_established();
            }
            Some(ConnectionEvent::Lost(reason)) => self.on_lost(reason).await,
            None => {}
        }
    }

    fn on_established(&mut self) -> bool {
        if !self.state.negotiated() || self.state == SignalingState::Connected {
            return false;
        }
        if let Some(call) = self.call.as_mut() {
            call.status = CallStatus::Connected;
            call.connected_at = Some(Utc::now());
        }
        self.set_state(SignalingState::Connected);
        true
    }

    async fn on_lost(&mut self, reason: LostReason) {
        let terminal = match reason {
            LostReason::Closed => SignalingState::Ended,
            LostReason::Disconnected | LostReason::Failed => SignalingState::Failed,
        };
        self.finish(terminal).await;
    }

    fn ready_to_start(&self) -> Result<()> {
        match self.state {
            SignalingState::Idle => Ok(()),
            // terminal states were torn down on entry
            state if state.is_terminal() => Ok(()),
            state => Err(CallError::precondition(format!(
                "a call is already in progress ({state:?})"
            ))),
        }
    }

    async fn caller_offer(&mut self, wants_video: bool) -> Result<ConnectionDescriptor> {
        self.clear_finished().await;
        self.manager.acquire_local_media(wants_video).await?;
        self.manager.create_offer(wants_video).await
    }

    async fn receiver_answer(
        &mut self,
        offer: ConnectionDescriptor,
        wants_video: bool,
    ) -> Result<ConnectionDescriptor> {
        self.clear_finished().await;
        self.manager.acquire_local_media(wants_video).await?;
        self.manager.accept_offer(offer, wants_video).await
    }

    async fn clear_finished(&mut self) {
        if self.state.is_terminal() {
            self.reset().await;
        }
    }

    /// A failed start leaves nothing behind: fatal errors end in `Failed`,
    /// the rest go back to `Idle` so the user can retry.
    async fn abort_start(&mut self, e: CallError) -> CallError {
        if e.is_fatal() {
            self.finish(SignalingState::Failed).await;
        } else {
            self.reset().await;
        }
        e
    }

    /// Fatal errors end the call; anything else leaves the state alone.
    async fn on_error(&mut self, e: CallError) -> CallError {
        if e.is_fatal() {
            self.finish(SignalingState::Failed).await;
        }
        e
    }

    async fn finish(&mut self, terminal: SignalingState) {
        self.manager.teardown().await;
        if let Some(call) = self.call.as_mut() {
            call.status = match terminal {
                SignalingState::Failed => CallStatus::Failed,
                _ => CallStatus::Ended,
            };
        }
        self.set_state(terminal);
    }

    fn set_state(&mut self, next: SignalingState) {
        if next != self.state {
            info!("signaling {:?} -> {:?}", self.state, next);
            self.state = next;
        }
        if let Some(call) = self.call.as_mut() {
            if matches!(
                next,
                SignalingState::OfferGenerated | SignalingState::OfferApplied
            ) {
                call.status = CallStatus::Ringing;
            }
        }
    }
}

fn new_record(
    call_id: String,
    peer_label: String,
    direction: CallDirection,
    wants_video: bool,
) -> CallRecord {
    CallRecord {
        call_id,
        peer_label,
        direction,
        wants_video,
        status: CallStatus::Initiating,
        started_at: Utc::now(),
        connected_at: None,
    }
}
