use crate::config::Config;
use crate::error::Result;
use crate::events::{CallEvent, EventBus, LostReason};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::ice::{from_init, LocalCandidates};
use crate::peer::media::MediaHandle;
use crate::peer::monitor::{ConnectionEvent, ConnectionMonitor};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Shared sinks the peer connection callbacks write into
pub struct PeerSinks {
    pub call_id: String,
    pub bus: EventBus,
    pub local_candidates: LocalCandidates,
    pub monitor: Arc<ConnectionMonitor>,
    pub remote_tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
}

/// Builds the peer connection and wires gathering, state and track handlers.
pub async fn new_peer(config: &Config, sinks: &PeerSinks) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    setting_engine.set_include_loopback_candidate(config.include_loopback_candidates);

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    let pc = Arc::new(api.new_peer_connection(rtc_config(config)).await?);
    info!("peer connection allocated for call {}", sinks.call_id);

    let local = sinks.local_candidates.clone();
    let bus = sinks.bus.clone();
    let call_id = sinks.call_id.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => {
                dump_candidate("LOCAL", &c);
                match c.to_json() {
                    Ok(init) => {
                        let candidate = from_init(init);
                        local.push(candidate.clone());
                        bus.publish(CallEvent::CandidateGathered {
                            call_id: call_id.clone(),
                            candidate,
                        });
                    }
                    Err(e) => warn!("unserializable local candidate: {e}"),
                }
            }
            None => {
                // None marks the end of gathering
                local.mark_complete();
                bus.publish(CallEvent::GatheringComplete {
                    call_id: call_id.clone(),
                });
            }
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        debug!("ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    let monitor = sinks.monitor.clone();
    let weak = Arc::downgrade(&pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        debug!("peer connection state changed to: {:?}", st);
        let event = monitor.observe(st);
        if let Some(ConnectionEvent::Lost(reason)) = event {
            if reason != LostReason::Closed {
                if let Some(pc) = weak.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
        }
        Box::pin(async {})
    }));

    let tracks = sinks.remote_tracks.clone();
    let bus = sinks.bus.clone();
    let call_id = sinks.call_id.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let kind = track.kind();
            info!("remote {:?} track {} arrived", kind, track.id());
            tracks.lock().push(track);
            bus.publish(CallEvent::RemoteTrack {
                call_id: call_id.clone(),
                kind,
            });
            Box::pin(async {})
        },
    ));

    Ok(pc)
}

/// Attaches the local tracks to the connection.
pub async fn attach_media(pc: &RTCPeerConnection, media: &MediaHandle) -> Result<()> {
    pc.add_track(media.audio_track() as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    if let Some(video) = media.video_track() {
        pc.add_track(video as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
    }
    debug!("local media attached (video={})", media.has_video());
    Ok(())
}

fn rtc_config(config: &Config) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config.rtc_ice_servers(),
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}
