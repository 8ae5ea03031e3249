use crate::peer::types::ConnectivityCandidate;
use tokio::sync::broadcast;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

const EVENT_CAPACITY: usize = 256;

/// Why a connection was reported lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostReason {
    Disconnected,
    Failed,
    Closed,
}

/// Events published to the UI and telephony layers. Every event names the
/// call it belongs to; listeners drop events for calls that are gone.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Established {
        call_id: String,
    },
    Lost {
        call_id: String,
        reason: LostReason,
    },
    CandidateGathered {
        call_id: String,
        candidate: ConnectivityCandidate,
    },
    GatheringComplete {
        call_id: String,
    },
    RemoteTrack {
        call_id: String,
        kind: RTPCodecType,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> &str {
        match self {
            CallEvent::Established { call_id }
            | CallEvent::Lost { call_id, .. }
            | CallEvent::CandidateGathered { call_id, .. }
            | CallEvent::GatheringComplete { call_id }
            | CallEvent::RemoteTrack { call_id, .. } => call_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CallEvent) {
        // nobody listening is fine
        let _ = self.tx.send(event);
    }
}
