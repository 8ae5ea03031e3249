use crate::error::{CallError, Result};
use crate::peer::types::{ConnectivityCandidate, Role};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Progress of local gathering: (candidates seen, gathering finished)
type Progress = (usize, bool);

/// Append-only list of locally gathered candidates.
///
/// Written from the webrtc gathering callback, read by the UI. Clones share
/// the same list.
#[derive(Clone)]
pub struct LocalCandidates {
    list: Arc<RwLock<Vec<ConnectivityCandidate>>>,
    progress: Arc<watch::Sender<Progress>>,
}

impl Default for LocalCandidates {
    fn default() -> Self {
        let (tx, _) = watch::channel((0, false));
        Self {
            list: Arc::new(RwLock::new(Vec::new())),
            progress: Arc::new(tx),
        }
    }
}

impl LocalCandidates {
    pub fn push(&self, candidate: ConnectivityCandidate) {
        let len = {
            let mut list = self.list.write();
            list.push(candidate);
            list.len()
        };
        debug!("local candidate #{len} gathered");
        self.progress.send_modify(|p| p.0 = len);
    }

    pub fn mark_complete(&self) {
        debug!("local candidate gathering complete");
        self.progress.send_modify(|p| p.1 = true);
    }

    pub fn is_complete(&self) -> bool {
        self.progress.borrow().1
    }

    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    pub fn snapshot(&self) -> Vec<ConnectivityCandidate> {
        self.list.read().clone()
    }

    /// Lazy view from the first candidate; sees later appends too.
    pub fn view(&self) -> CandidateView {
        CandidateView {
            list: self.list.clone(),
            pos: 0,
        }
    }

    /// Waits until gathering completes or `limit` elapses, then returns
    /// what has been gathered.
    pub async fn wait_complete(&self, limit: Duration) -> Vec<ConnectivityCandidate> {
        let mut rx = self.progress.subscribe();
        if timeout(limit, rx.wait_for(|p| p.1)).await.is_err() {
            warn!(
                "candidate gathering still running after {} s",
                limit.as_secs()
            );
        }
        self.snapshot()
    }
}

/// Restartable cursor over [`LocalCandidates`]
pub struct CandidateView {
    list: Arc<RwLock<Vec<ConnectivityCandidate>>>,
    pos: usize,
}

impl CandidateView {
    pub fn restart(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for CandidateView {
    type Item = ConnectivityCandidate;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.list.read().get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }
}

/// What to do with a remote candidate that was just submitted
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Apply,
    Buffered,
    Duplicate,
}

/// Remote candidates: applied ones (deduplicated) plus those that arrived
/// before the remote descriptor.
#[derive(Debug, Default)]
pub struct RemoteCandidates {
    applied: Vec<ConnectivityCandidate>,
    pending: Vec<ConnectivityCandidate>,
    seen: HashSet<ConnectivityCandidate>,
}

impl RemoteCandidates {
    /// Decides whether `candidate` goes to the transport now, waits for the
    /// remote descriptor, or was already seen. Only the caller can be
    /// ahead of its remote descriptor; the receiver applies the offer
    /// before it has a session at all.
    pub fn admit(
        &mut self,
        candidate: &ConnectivityCandidate,
        role: Role,
        remote_applied: bool,
        max_pending: usize,
    ) -> Result<Admission> {
        let key = normalized(candidate);
        if self.seen.contains(&key) {
            return Ok(Admission::Duplicate);
        }
        if !remote_applied {
            if role == Role::Receiver {
                return Err(CallError::NoActiveOffer);
            }
            if self.pending.len() >= max_pending {
                return Err(CallError::NoActiveAnswer);
            }
            self.seen.insert(key);
            self.pending.push(candidate.clone());
            return Ok(Admission::Buffered);
        }
        self.seen.insert(key);
        Ok(Admission::Apply)
    }

    pub fn record_applied(&mut self, candidate: ConnectivityCandidate) {
        self.applied.push(candidate);
    }

    /// Forgets a candidate the transport refused, so it can be resubmitted.
    pub fn forget(&mut self, candidate: &ConnectivityCandidate) {
        self.seen.remove(&normalized(candidate));
    }

    pub fn take_pending(&mut self) -> Vec<ConnectivityCandidate> {
        std::mem::take(&mut self.pending)
    }

    pub fn applied(&self) -> &[ConnectivityCandidate] {
        &self.applied
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn normalized(candidate: &ConnectivityCandidate) -> ConnectivityCandidate {
    let (line, mid, index) = candidate.key();
    ConnectivityCandidate {
        candidate: line.to_string(),
        sdp_mid: mid.map(str::to_string),
        sdp_mline_index: index,
        username_fragment: None,
    }
}

pub fn to_init(candidate: ConnectivityCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

pub fn from_init(init: RTCIceCandidateInit) -> ConnectivityCandidate {
    ConnectivityCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
