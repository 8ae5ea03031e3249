//! Connection Status Monitor.
//!
//! Collapses webrtc peer-connection states into `established` (at most once)
//! and `lost` (at most once, then detached) for one session.

use crate::events::{CallEvent, EventBus, LostReason};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    /// Waiting for the first live connection
    Armed,
    Established,
    /// Lost was emitted or the session went away
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Established,
    Lost(LostReason),
}

/// Pure transition table
pub fn transition(
    phase: MonitorPhase,
    state: RTCPeerConnectionState,
) -> (MonitorPhase, Option<ConnectionEvent>) {
    use MonitorPhase::*;
    use RTCPeerConnectionState as S;

    let lost = |reason| (Detached, Some(ConnectionEvent::Lost(reason)));
    match (phase, state) {
        (Detached, _) => (Detached, None),
        (Armed, S::Connected) => (Established, Some(ConnectionEvent::Established)),
        (_, S::Disconnected) => lost(LostReason::Disconnected),
        (_, S::Failed) => lost(LostReason::Failed),
        (_, S::Closed) => lost(LostReason::Closed),
        (phase, _) => (phase, None),
    }
}

pub struct ConnectionMonitor {
    call_id: String,
    phase: Mutex<MonitorPhase>,
    /// Set when the monitor detached because the connection was lost
    lost: Mutex<Option<LostReason>>,
    bus: EventBus,
}

impl ConnectionMonitor {
    pub fn new(call_id: String, bus: EventBus) -> Self {
        Self {
            call_id,
            phase: Mutex::new(MonitorPhase::Armed),
            lost: Mutex::new(None),
            bus,
        }
    }

    pub fn phase(&self) -> MonitorPhase {
        *self.phase.lock()
    }

    /// Feeds one underlying state change; publishes at most one event.
    pub fn observe(&self, state: RTCPeerConnectionState) -> Option<ConnectionEvent> {
        let event = {
            let mut phase = self.phase.lock();
            let (next, event) = transition(*phase, state);
            if next != *phase {
                debug!("monitor {:?} -> {:?} on {:?}", *phase, next, state);
            }
            *phase = next;
            if let Some(ConnectionEvent::Lost(reason)) = event {
                *self.lost.lock() = Some(reason);
            }
            event
        };

        match event {
            Some(ConnectionEvent::Established) => {
                info!("call {} established", self.call_id);
                self.bus.publish(CallEvent::Established {
                    call_id: self.call_id.clone(),
                });
            }
            Some(ConnectionEvent::Lost(reason)) => {
                warn!("call {} lost: {:?}", self.call_id, reason);
                self.bus.publish(CallEvent::Lost {
                    call_id: self.call_id.clone(),
                    reason,
                });
            }
            None => {}
        }
        event
    }

    /// Where the connection stands now, whether or not the edge event
    /// was ever consumed. `None` while armed or after a plain detach.
    pub fn status(&self) -> Option<ConnectionEvent> {
        match self.phase() {
            MonitorPhase::Armed => None,
            MonitorPhase::Established => Some(ConnectionEvent::Established),
            MonitorPhase::Detached => self.lost.lock().map(ConnectionEvent::Lost),
        }
    }

    /// Stops reporting. Used by teardown so the close itself is not "lost".
    pub fn detach(&self) {
        *self.phase.lock() = MonitorPhase::Detached;
    }
}
