use super::{DeviceInfo, MediaKind};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

pub const LOCAL_STREAM_ID: &str = "meetmesh-local";

/// Outbound track fed by one capture device.
///
/// The enable flag is shared by every track of the same kind, so a mute
/// survives device switches and is never copied per peer.
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    device_id: String,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(device: &DeviceInfo, enabled: Arc<AtomicBool>) -> Self {
        let kind = device.kind();
        let capability = match kind {
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            format!("{kind}-{}", device.id),
            LOCAL_STREAM_ID.to_owned(),
        ));
        Self {
            kind,
            device_id: device.id.clone(),
            track,
            enabled,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.kind, self.device_id)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Samples written while the kind is muted are dropped; the sender
    /// stays attached so remote peers keep a silent/blank stream.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), webrtc::Error> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.track.write_sample(sample).await
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
