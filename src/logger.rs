use crate::config::LoggingConfig;
use crate::peer::types::ConnectivityCandidate;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

/// Installs the fmt subscriber. `RUST_LOG` overrides the configured filter.
/// A second call (or an already installed subscriber) is ignored.
pub fn init(config: &LoggingConfig) {
    if !config.enabled {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.as_str()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Trace each candidate as it appears (trickle)
pub fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            "trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
            init.candidate, init.sdp_mid, init.sdp_mline_index, init.username_fragment
        );
    }
}

/// getStats snapshot of the nominated pair
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "stats {moment}: {}:{} type={:?} bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CandidateCounts {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

pub fn analyze_candidates(candidates: &[ConnectivityCandidate]) -> CandidateCounts {
    let mut counts = CandidateCounts::default();
    for candidate in candidates {
        match candidate.info().map(|i| i.kind) {
            Ok(kind) if kind == "host" => counts.host += 1,
            Ok(kind) if kind == "srflx" => counts.srflx += 1,
            Ok(kind) if kind == "relay" => counts.relay += 1,
            _ => counts.other += 1,
        }
    }

    info!(
        "candidate analysis: {} host, {} srflx, {} relay",
        counts.host, counts.srflx, counts.relay
    );
    if counts.relay == 0 {
        warn!("no TURN relay candidates; a connection through strict NAT may fail");
    }
    counts
}
