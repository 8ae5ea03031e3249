//! Media Session Manager.
//!
//! Owns the one peer connection and the local media of the active call.
//! Every other layer goes through the operations here; the
//! `RTCPeerConnection` itself never leaves this module.

use crate::config::Config;
use crate::error::{CallError, Result};
use crate::events::{CallEvent, EventBus};
use crate::logger::analyze_candidates;
use crate::peer::connection::{attach_media, new_peer, PeerSinks};
use crate::peer::ice::{to_init, Admission, CandidateView, LocalCandidates, RemoteCandidates};
use crate::peer::media::{MediaDevices, MediaHandle};
use crate::peer::monitor::{ConnectionEvent, ConnectionMonitor, MonitorPhase};
use crate::peer::state::SessionState;
use crate::peer::types::{ConnectionDescriptor, ConnectivityCandidate, DescriptorKind, Role};
use crate::utils::new_call_id;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

pub struct MediaSessionManager {
    config: Config,
    devices: Arc<dyn MediaDevices>,
    bus: EventBus,
    media: Option<MediaHandle>,
    session: Option<SessionState>,
}

impl MediaSessionManager {
    pub fn new(config: Config, devices: Arc<dyn MediaDevices>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            devices,
            bus: EventBus::default(),
            media: None,
            session: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.bus.subscribe()
    }

    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.call_id.as_str())
    }

    pub fn media(&self) -> Option<&MediaHandle> {
        self.media.as_ref()
    }

    pub fn local_descriptor(&self) -> Option<&ConnectionDescriptor> {
        self.session.as_ref().and_then(|s| s.local.as_ref())
    }

    pub fn remote_tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.session
            .as_ref()
            .map(|s| s.remote_tracks.lock().clone())
            .unwrap_or_default()
    }

    pub async fn acquire_local_media(&mut self, wants_video: bool) -> Result<MediaHandle> {
        if let Some(media) = &self.media {
            if media.has_video() == wants_video {
                return Ok(media.clone());
            }
            if self.session.is_some() {
                return Err(CallError::precondition(
                    "cannot change local media while a session is active",
                ));
            }
            media.release(self.devices.as_ref());
            self.media = None;
        }
        let media = MediaHandle::acquire(self.devices.as_ref(), wants_video).await?;
        self.media = Some(media.clone());
        Ok(media)
    }

    pub async fn create_offer(&mut self, wants_video: bool) -> Result<ConnectionDescriptor> {
        let media = self.ready_media(wants_video)?;
        let call_id = new_call_id();
        let (pending, sinks) = self.allocate(&call_id, &media).await?;

        let pc = &pending.peer;
        let built: Result<String> = async {
            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer).await?;
            local_sdp(pc).await
        }
        .await;
        let sdp = match built {
            Ok(sdp) => sdp,
            Err(e) => {
                pending.abandon().await;
                return Err(e);
            }
        };

        let offer = ConnectionDescriptor::offer(sdp, call_id.clone());
        info!("offer created for call {call_id}");
        self.session = Some(session_from(
            sinks,
            pending.keep(),
            Role::Caller,
            wants_video,
            offer.clone(),
            None,
        ));
        Ok(offer)
    }

    pub async fn accept_offer(
        &mut self,
        remote: ConnectionDescriptor,
        wants_video: bool,
    ) -> Result<ConnectionDescriptor> {
        if remote.kind != DescriptorKind::Offer {
            return Err(CallError::InvalidRemoteDescriptor(format!(
                "expected an offer, got an {:?}",
                remote.kind
            )));
        }
        remote
            .validate()
            .map_err(|e| CallError::InvalidRemoteDescriptor(e.to_string()))?;
        let offer_sdp = RTCSessionDescription::offer(remote.sdp.clone())
            .map_err(|e| CallError::InvalidRemoteDescriptor(e.to_string()))?;

        let media = self.ready_media(wants_video)?;
        // the receiver adopts the caller's id so both ends agree
        let call_id = remote.id.clone().unwrap_or_else(new_call_id);
        let (pending, sinks) = self.allocate(&call_id, &media).await?;

        let pc = &pending.peer;
        if let Err(e) = pc.set_remote_description(offer_sdp).await {
            pending.abandon().await;
            return Err(CallError::InvalidRemoteDescriptor(e.to_string()));
        }
        let built: Result<String> = async {
            let answer = pc.create_answer(None).await?;
            pc.set_local_description(answer).await?;
            local_sdp(pc).await
        }
        .await;
        let sdp = match built {
            Ok(sdp) => sdp,
            Err(e) => {
                pending.abandon().await;
                return Err(e);
            }
        };

        let answer = ConnectionDescriptor::answer(sdp, call_id.clone());
        info!("answer created for call {call_id}");
        self.session = Some(session_from(
            sinks,
            pending.keep(),
            Role::Receiver,
            wants_video,
            answer.clone(),
            Some(remote),
        ));
        Ok(answer)
    }

    pub async fn apply_answer(&mut self, remote: ConnectionDescriptor) -> Result<()> {
        let session = match self.session.as_mut() {
            Some(s) if s.role == Role::Caller => s,
            _ => return Err(CallError::NoActiveOffer),
        };
        if session.remote.is_some() {
            return Err(CallError::AlreadyAnswered);
        }
        if remote.kind != DescriptorKind::Answer {
            return Err(CallError::InvalidRemoteDescriptor(format!(
                "expected an answer, got an {:?}",
                remote.kind
            )));
        }
        if let Some(id) = &remote.id {
            if *id != session.call_id {
                return Err(CallError::InvalidRemoteDescriptor(format!(
                    "answer belongs to call {id}, not {}",
                    session.call_id
                )));
            }
        }
        remote
            .validate()
            .map_err(|e| CallError::InvalidRemoteDescriptor(e.to_string()))?;

        let answer_sdp = RTCSessionDescription::answer(remote.sdp.clone())
            .map_err(|e| CallError::InvalidRemoteDescriptor(e.to_string()))?;
        session
            .peer
            .set_remote_description(answer_sdp)
            .await
            .map_err(|e| CallError::InvalidRemoteDescriptor(e.to_string()))?;
        session.remote = Some(remote);
        info!("answer applied for call {}", session.call_id);

        // flush candidates that arrived ahead of the answer
        let pending = session.remote_candidates.take_pending();
        if !pending.is_empty() {
            debug!("applying {} buffered remote candidates", pending.len());
        }
        for candidate in pending {
            match session.peer.add_ice_candidate(to_init(candidate.clone())).await {
                Ok(()) => session.remote_candidates.record_applied(candidate),
                Err(e) => {
                    warn!("buffered candidate rejected: {e}");
                    session.remote_candidates.forget(&candidate);
                }
            }
        }
        Ok(())
    }

    /// Applies one remote candidate. Resubmitting a known candidate is a
    /// no-op. A caller still waiting for the answer buffers up to
    /// `max_pending_candidates`; they are flushed by [`Self::apply_answer`].
    pub async fn add_remote_candidate(&mut self, candidate: ConnectivityCandidate) -> Result<()> {
        let max_pending = self.config.max_pending_candidates;
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::NoActiveOffer);
        };
        candidate.validate()?;

        let remote_applied = session.remote_applied();
        match session
            .remote_candidates
            .admit(&candidate, session.role, remote_applied, max_pending)?
        {
            Admission::Duplicate => {
                debug!("duplicate remote candidate ignored");
                Ok(())
            }
            Admission::Buffered => {
                debug!(
                    "remote candidate buffered until the answer arrives ({} pending)",
                    session.remote_candidates.pending_len()
                );
                Ok(())
            }
            Admission::Apply => {
                if let Err(e) = session.peer.add_ice_candidate(to_init(candidate.clone())).await {
                    session.remote_candidates.forget(&candidate);
                    return Err(CallError::SchemaMismatch(format!(
                        "candidate rejected by transport: {e}"
                    )));
                }
                session.remote_candidates.record_applied(candidate);
                debug!(
                    "remote candidate applied, total {}",
                    session.remote_candidates.applied().len()
                );
                Ok(())
            }
        }
    }

    /// Lazy, restartable view over candidates gathered so far.
    pub fn drain_local_candidates(&self) -> CandidateView {
        self.session
            .as_ref()
            .map(|s| s.local_candidates.view())
            .unwrap_or_else(|| LocalCandidates::default().view())
    }

    /// Waits for gathering to finish (bounded by the configured timeout).
    pub async fn gather_local_candidates(&self) -> Vec<ConnectivityCandidate> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        let candidates = session
            .local_candidates
            .wait_complete(self.config.gather_timeout())
            .await;
        analyze_candidates(&candidates);
        candidates
    }

    pub fn toggle_audio(&self) -> bool {
        self.media.as_ref().map(|m| m.toggle_audio()).unwrap_or(false)
    }

    pub fn toggle_video(&self) -> bool {
        self.media.as_ref().map(|m| m.toggle_video()).unwrap_or(false)
    }

    pub async fn switch_camera(&self) -> Result<()> {
        match &self.media {
            Some(media) => media.switch_camera(self.devices.as_ref()).await,
            None => Ok(()),
        }
    }

    pub fn monitor_phase(&self) -> Option<MonitorPhase> {
        self.session.as_ref().map(|s| s.monitor.phase())
    }

    #[cfg(test)]
    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// One pass over the live connection state. Reports where the
    /// connection stands, so an `Established` or `Lost` event that nobody
    /// consumed is still seen here.
    pub fn reconcile(&self) -> Option<ConnectionEvent> {
        let session = self.session.as_ref()?;
        // picks up a state-change callback that never fired
        session.monitor.observe(session.peer.connection_state());
        session.monitor.status()
    }

    /// Releases media, closes the connection and drops the session.
    /// Safe from any state, any number of times.
    pub async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.monitor.detach();
            if let Err(e) = session.peer.close().await {
                warn!("closing peer connection: {e}");
            }
            session.remote_tracks.lock().clear();
            info!("session {} torn down", session.call_id);
        }
        if let Some(media) = self.media.take() {
            media.release(self.devices.as_ref());
        }
    }

    fn ready_media(&self, wants_video: bool) -> Result<MediaHandle> {
        if self.session.is_some() {
            return Err(CallError::precondition(
                "a session is already active; tear it down first",
            ));
        }
        let media = self
            .media
            .as_ref()
            .ok_or_else(|| CallError::MediaUnavailable("local media was not acquired".into()))?;
        if wants_video && !media.has_video() {
            return Err(CallError::MediaUnavailable(
                "video requested but no camera track was acquired".into(),
            ));
        }
        Ok(media.clone())
    }

    async fn allocate(
        &self,
        call_id: &str,
        media: &MediaHandle,
    ) -> Result<(PendingPeer, PeerSinks)> {
        let sinks = PeerSinks {
            call_id: call_id.to_string(),
            bus: self.bus.clone(),
            local_candidates: LocalCandidates::default(),
            monitor: Arc::new(ConnectionMonitor::new(call_id.to_string(), self.bus.clone())),
            remote_tracks: Arc::new(Mutex::new(Vec::new())),
        };
        let pending = PendingPeer::new(new_peer(&self.config, &sinks).await?, &sinks);
        if let Err(e) = attach_media(&pending.peer, media).await {
            pending.abandon().await;
            return Err(e);
        }
        Ok((pending, sinks))
    }
}

fn session_from(
    sinks: PeerSinks,
    peer: Arc<RTCPeerConnection>,
    role: Role,
    wants_video: bool,
    local: ConnectionDescriptor,
    remote: Option<ConnectionDescriptor>,
) -> SessionState {
    SessionState {
        call_id: sinks.call_id,
        role,
        wants_video,
        local: Some(local),
        remote,
        local_candidates: sinks.local_candidates,
        remote_candidates: RemoteCandidates::default(),
        remote_tracks: sinks.remote_tracks,
        monitor: sinks.monitor,
        peer,
    }
}

/// A connection that is not yet part of a session. Unless kept, it is
/// closed without being reported as lost, also when the future building
/// it is dropped midway.
struct PendingPeer {
    peer: Arc<RTCPeerConnection>,
    monitor: Arc<ConnectionMonitor>,
    armed: bool,
}

impl PendingPeer {
    fn new(peer: Arc<RTCPeerConnection>, sinks: &PeerSinks) -> Self {
        Self {
            peer,
            monitor: sinks.monitor.clone(),
            armed: true,
        }
    }

    fn keep(mut self) -> Arc<RTCPeerConnection> {
        self.armed = false;
        self.peer.clone()
    }

    async fn abandon(mut self) {
        self.armed = false;
        self.monitor.detach();
        if let Err(e) = self.peer.close().await {
            warn!("closing abandoned peer connection: {e}");
        }
    }
}

impl Drop for PendingPeer {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.monitor.detach();
        let peer = self.peer.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = peer.close().await {
                        warn!("closing dropped peer connection: {e}");
                    }
                });
            }
            Err(_) => warn!("no runtime left to close a dropped peer connection"),
        }
    }
}

async fn local_sdp(pc: &RTCPeerConnection) -> Result<String> {
    pc.local_description()
        .await
        .map(|d| d.sdp)
        .ok_or_else(|| CallError::ConnectivityFailed("no local description after negotiation".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::media::{DeviceKind, StaticDevices};

    fn manager_with(devices: Arc<StaticDevices>) -> MediaSessionManager {
        MediaSessionManager::new(Config::local_only(), devices).unwrap()
    }

    fn candidate(port: u16) -> ConnectivityCandidate {
        ConnectivityCandidate {
            candidate: format!("candidate:1 1 udp 2130706431 127.0.0.1 {port} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_dropped_pending_peer_gets_closed() {
        use std::time::Duration;
        use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

        let mut m = manager_with(Arc::new(StaticDevices::new()));
        let media = m.acquire_local_media(false).await.unwrap();
        let (pending, sinks) = m.allocate("dropped-call", &media).await.unwrap();
        let peer = pending.peer.clone();

        // as if the create_offer future were cancelled before storing it
        drop(pending);
        assert_eq!(sinks.monitor.phase(), MonitorPhase::Detached);
        tokio::time::timeout(Duration::from_secs(5), async {
            while peer.connection_state() != RTCPeerConnectionState::Closed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dropped connection was never closed");
        assert!(m.session().is_none());
        m.teardown().await;
    }

    #[tokio::test]
    async fn test_kept_peer_stays_open() {
        let mut m = manager_with(Arc::new(StaticDevices::new()));
        let media = m.acquire_local_media(false).await.unwrap();
        let (pending, sinks) = m.allocate("kept-call", &media).await.unwrap();
        let peer = pending.keep();
        assert_eq!(sinks.monitor.phase(), MonitorPhase::Armed);
        peer.close().await.unwrap();
        m.teardown().await;
    }

    #[tokio::test]
    async fn test_create_offer_requires_media() {
        let mut m = manager_with(Arc::new(StaticDevices::new()));
        let err = m.create_offer(false).await.unwrap_err();
        assert!(matches!(err, CallError::MediaUnavailable(_)));
        assert!(m.session().is_none());
    }

    #[tokio::test]
    async fn test_video_offer_needs_camera_track() {
        let mut m = manager_with(Arc::new(StaticDevices::new()));
        m.acquire_local_media(false).await.unwrap();
        assert!(matches!(
            m.create_offer(true).await,
            Err(CallError::MediaUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_acquire_reports_denied_permission() {
        let devices = Arc::new(StaticDevices::new().deny(DeviceKind::Camera));
        let mut m = manager_with(devices.clone());
        assert!(matches!(
            m.acquire_local_media(true).await,
            Err(CallError::PermissionDenied { .. })
        ));
        assert_eq!(devices.open_grants(), 0);
    }

    #[tokio::test]
    async fn test_apply_answer_ordering() {
        let mut caller = manager_with(Arc::new(StaticDevices::new()));
        let mut receiver = manager_with(Arc::new(StaticDevices::new()));

        let early = ConnectionDescriptor::answer("v=0\r\n".into(), "x");
        assert!(matches!(
            caller.apply_answer(early).await,
            Err(CallError::NoActiveOffer)
        ));

        caller.acquire_local_media(false).await.unwrap();
        let offer = caller.create_offer(false).await.unwrap();
        assert!(!offer.sdp.is_empty());

        receiver.acquire_local_media(false).await.unwrap();
        let answer = receiver.accept_offer(offer.clone(), false).await.unwrap();
        assert_eq!(answer.id, offer.id);

        caller.apply_answer(answer.clone()).await.unwrap();
        assert!(matches!(
            caller.apply_answer(answer).await,
            Err(CallError::AlreadyAnswered)
        ));

        caller.teardown().await;
        receiver.teardown().await;
    }

    #[tokio::test]
    async fn test_accept_offer_rejects_answer_kind() {
        let mut m = manager_with(Arc::new(StaticDevices::new()));
        m.acquire_local_media(false).await.unwrap();
        let answer = ConnectionDescriptor::answer("v=0\r\n".into(), "x");
        assert!(matches!(
            m.accept_offer(answer, false).await,
            Err(CallError::InvalidRemoteDescriptor(_))
        ));
        assert!(m.session().is_none());
    }

    #[tokio::test]
    async fn test_answer_for_other_call_rejected() {
        let mut caller = manager_with(Arc::new(StaticDevices::new()));
        caller.acquire_local_media(false).await.unwrap();
        let offer = caller.create_offer(false).await.unwrap();
        let stray = ConnectionDescriptor::answer(offer.sdp.clone(), "someone-else");
        assert!(matches!(
            caller.apply_answer(stray).await,
            Err(CallError::InvalidRemoteDescriptor(_))
        ));
        assert!(caller.session().unwrap().remote.is_none());
        caller.teardown().await;
    }

    #[tokio::test]
    async fn test_candidates_before_offer_rejected() {
        let mut m = manager_with(Arc::new(StaticDevices::new()));
        assert!(matches!(
            m.add_remote_candidate(candidate(9000)).await,
            Err(CallError::NoActiveOffer)
        ));
    }

    #[tokio::test]
    async fn test_early_candidates_buffered_then_flushed() {
        let mut caller = manager_with(Arc::new(StaticDevices::new()));
        let mut receiver = manager_with(Arc::new(StaticDevices::new()));
        caller.acquire_local_media(false).await.unwrap();
        receiver.acquire_local_media(false).await.unwrap();

        let offer = caller.create_offer(false).await.unwrap();
        caller.add_remote_candidate(candidate(9000)).await.unwrap();
        caller.add_remote_candidate(candidate(9000)).await.unwrap();
        assert_eq!(
            caller.session().unwrap().remote_candidates.pending_len(),
            1
        );

        let answer = receiver.accept_offer(offer, false).await.unwrap();
        caller.apply_answer(answer).await.unwrap();
        let session = caller.session().unwrap();
        assert_eq!(session.remote_candidates.pending_len(), 0);
        assert_eq!(session.applied_remote_candidates().len(), 1);

        caller.teardown().await;
        receiver.teardown().await;
    }

    #[tokio::test]
    async fn test_duplicate_candidate_recorded_once() {
        let mut caller = manager_with(Arc::new(StaticDevices::new()));
        let mut receiver = manager_with(Arc::new(StaticDevices::new()));
        caller.acquire_local_media(false).await.unwrap();
        receiver.acquire_local_media(false).await.unwrap();

        let offer = caller.create_offer(false).await.unwrap();
        receiver.accept_offer(offer, false).await.unwrap();

        receiver.add_remote_candidate(candidate(9100)).await.unwrap();
        receiver.add_remote_candidate(candidate(9100)).await.unwrap();
        assert_eq!(
            receiver.session().unwrap().applied_remote_candidates().len(),
            1
        );

        caller.teardown().await;
        receiver.teardown().await;
    }

    #[tokio::test]
    async fn test_second_session_refused_until_teardown() {
        let mut m = manager_with(Arc::new(StaticDevices::new()));
        m.acquire_local_media(false).await.unwrap();
        m.create_offer(false).await.unwrap();
        assert!(matches!(
            m.create_offer(false).await,
            Err(CallError::PreconditionNotMet(_))
        ));
        m.teardown().await;
        m.acquire_local_media(false).await.unwrap();
        assert!(m.create_offer(false).await.is_ok());
        m.teardown().await;
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent_and_releases_devices() {
        let devices = Arc::new(StaticDevices::new());
        let mut m = manager_with(devices.clone());
        m.acquire_local_media(true).await.unwrap();
        m.create_offer(true).await.unwrap();
        assert_eq!(devices.open_grants(), 2);

        m.teardown().await;
        m.teardown().await;
        assert_eq!(devices.open_grants(), 0);
        assert!(m.session().is_none());
        assert!(m.media().is_none());
        assert!(!m.toggle_audio());
        assert_eq!(m.drain_local_candidates().count(), 0);
    }

    #[tokio::test]
    async fn test_toggles_follow_media() {
        let mut m = manager_with(Arc::new(StaticDevices::new()));
        assert!(!m.toggle_audio());
        m.acquire_local_media(true).await.unwrap();
        assert!(!m.toggle_audio());
        assert!(m.toggle_audio());
        assert!(!m.toggle_video());
        assert!(m.switch_camera().await.is_ok());
        m.teardown().await;
    }
}
