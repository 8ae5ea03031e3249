use crate::peer::ice::{LocalCandidates, RemoteCandidates};
use crate::peer::monitor::ConnectionMonitor;
use crate::peer::types::{ConnectionDescriptor, ConnectivityCandidate, Role};
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

/// Everything that belongs to one in-progress call.
///
/// Owned by the session manager; nothing outside it sees the peer
/// connection. Dropped on teardown.
pub struct SessionState {
    pub call_id: String,
    pub role: Role,
    pub wants_video: bool,
    pub local: Option<ConnectionDescriptor>,
    pub remote: Option<ConnectionDescriptor>,
    pub local_candidates: LocalCandidates,
    pub remote_candidates: RemoteCandidates,
    pub(crate) remote_tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
    pub(crate) monitor: Arc<ConnectionMonitor>,
    pub(crate) peer: Arc<RTCPeerConnection>,
}

impl SessionState {
    pub fn remote_applied(&self) -> bool {
        self.remote.is_some()
    }

    pub fn applied_remote_candidates(&self) -> &[ConnectivityCandidate] {
        self.remote_candidates.applied()
    }
}
