//! Local capture devices and the media handle handed to the UI.
//!
//! The platform owns the actual microphone/camera. It is reached through
//! [`MediaDevices`]; the core only keeps the grants and the outgoing tracks.

use crate::error::{CallError, Result};
use crate::utils::random_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Microphone,
    Camera,
}

impl DeviceKind {
    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Microphone => "microphone",
            DeviceKind::Camera => "camera",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFacing {
    Front,
    Back,
}

impl CameraFacing {
    fn flipped(self) -> Self {
        match self {
            CameraFacing::Front => CameraFacing::Back,
            CameraFacing::Back => CameraFacing::Front,
        }
    }
}

/// Exclusive hardware handle returned by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGrant {
    pub kind: DeviceKind,
    pub id: String,
}

/// Platform capture access (permission prompt, device open/close).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Fails with `PermissionDenied` or `DeviceUnavailable`.
    async fn open(&self, kind: DeviceKind) -> Result<DeviceGrant>;

    fn close(&self, grant: &DeviceGrant);

    async fn switch_camera(&self, grant: &DeviceGrant, facing: CameraFacing) -> Result<()>;
}

/// Fixed device set. Counts open grants so leaks show up in tests.
#[derive(Debug)]
pub struct StaticDevices {
    has_microphone: bool,
    has_camera: bool,
    microphone_allowed: bool,
    camera_allowed: bool,
    open: AtomicUsize,
}

impl Default for StaticDevices {
    fn default() -> Self {
        Self {
            has_microphone: true,
            has_camera: true,
            microphone_allowed: true,
            camera_allowed: true,
            open: AtomicUsize::new(0),
        }
    }
}

impl StaticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_camera(mut self) -> Self {
        self.has_camera = false;
        self
    }

    pub fn without_microphone(mut self) -> Self {
        self.has_microphone = false;
        self
    }

    pub fn deny(mut self, kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Microphone => self.microphone_allowed = false,
            DeviceKind::Camera => self.camera_allowed = false,
        }
        self
    }

    pub fn open_grants(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for StaticDevices {
    async fn open(&self, kind: DeviceKind) -> Result<DeviceGrant> {
        let (present, allowed) = match kind {
            DeviceKind::Microphone => (self.has_microphone, self.microphone_allowed),
            DeviceKind::Camera => (self.has_camera, self.camera_allowed),
        };
        if !allowed {
            return Err(CallError::PermissionDenied {
                device: kind.name().into(),
            });
        }
        if !present {
            return Err(CallError::DeviceUnavailable {
                device: kind.name().into(),
            });
        }
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceGrant {
            kind,
            id: format!("{}-{}", kind.name(), random_id()),
        })
    }

    fn close(&self, grant: &DeviceGrant) {
        debug!("closing {}", grant.id);
        self.open.fetch_sub(1, Ordering::SeqCst);
    }

    async fn switch_camera(&self, grant: &DeviceGrant, facing: CameraFacing) -> Result<()> {
        debug!("{} now facing {:?}", grant.id, facing);
        Ok(())
    }
}

struct MediaInner {
    stream_id: String,
    audio: Arc<TrackLocalStaticSample>,
    video: Option<Arc<TrackLocalStaticSample>>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    released: AtomicBool,
    facing: Mutex<CameraFacing>,
    grants: Mutex<Vec<DeviceGrant>>,
}

/// Local audio (and optionally video) for the active call.
///
/// Clones share state. After [`MediaHandle::release`] the handle goes inert:
/// samples are dropped and the grants are back with the platform.
#[derive(Clone)]
pub struct MediaHandle {
    inner: Arc<MediaInner>,
}

impl MediaHandle {
    pub(crate) async fn acquire(devices: &dyn MediaDevices, wants_video: bool) -> Result<Self> {
        let mic = devices.open(DeviceKind::Microphone).await?;
        let camera = if wants_video {
            match devices.open(DeviceKind::Camera).await {
                Ok(grant) => Some(grant),
                Err(e) => {
                    devices.close(&mic);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let stream_id = format!("stream-{}", random_id());
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            format!("audio-{}", random_id()),
            stream_id.clone(),
        ));
        let video = camera.as_ref().map(|_| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                format!("video-{}", random_id()),
                stream_id.clone(),
            ))
        });

        let mut grants = vec![mic];
        grants.extend(camera);
        info!(
            "local media acquired: audio=true video={}",
            video.is_some()
        );

        Ok(Self {
            inner: Arc::new(MediaInner {
                stream_id,
                audio,
                video,
                audio_enabled: AtomicBool::new(true),
                video_enabled: AtomicBool::new(wants_video),
                released: AtomicBool::new(false),
                facing: Mutex::new(CameraFacing::Front),
                grants: Mutex::new(grants),
            }),
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn has_video(&self) -> bool {
        self.inner.video.is_some()
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.audio.clone()
    }

    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.inner.video.clone()
    }

    pub fn audio_enabled(&self) -> bool {
        self.inner.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.inner.video.is_some() && self.inner.video_enabled.load(Ordering::SeqCst)
    }

    pub fn camera_facing(&self) -> CameraFacing {
        *self.inner.facing.lock()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub(crate) fn toggle_audio(&self) -> bool {
        !self.inner.audio_enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub(crate) fn toggle_video(&self) -> bool {
        if self.inner.video.is_none() {
            return false;
        }
        !self.inner.video_enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub(crate) async fn switch_camera(&self, devices: &dyn MediaDevices) -> Result<()> {
        let grant = self
            .inner
            .grants
            .lock()
            .iter()
            .find(|g| g.kind == DeviceKind::Camera)
            .cloned();
        let Some(grant) = grant else {
            return Ok(());
        };
        let next = self.camera_facing().flipped();
        devices.switch_camera(&grant, next).await?;
        *self.inner.facing.lock() = next;
        Ok(())
    }

    /// Returns whether the sample went out.
    pub async fn write_audio_sample(&self, sample: &Sample) -> Result<bool> {
        if self.is_released() || !self.audio_enabled() {
            return Ok(false);
        }
        self.inner.audio.write_sample(sample).await?;
        Ok(true)
    }

    pub async fn write_video_sample(&self, sample: &Sample) -> Result<bool> {
        let Some(video) = &self.inner.video else {
            return Ok(false);
        };
        if self.is_released() || !self.video_enabled() {
            return Ok(false);
        }
        video.write_sample(sample).await?;
        Ok(true)
    }

    /// Hands every grant back. Safe to call more than once.
    pub(crate) fn release(&self, devices: &dyn MediaDevices) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for grant in self.inner.grants.lock().drain(..) {
            devices.close(&grant);
        }
        info!("local media released");
    }
}
