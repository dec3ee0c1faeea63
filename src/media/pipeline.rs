use super::{
    CaptureSession, DeviceInfo, DeviceRequest, LocalTrack, MediaConstraints, MediaDevices,
    MediaKind, SourceKind,
};
use crate::error::DeviceError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A device held open for the session. Dropping it stops the capture.
struct ActiveSource {
    device: DeviceInfo,
    track: LocalTrack,
    capture: Box<dyn CaptureSession>,
}

impl Drop for ActiveSource {
    fn drop(&mut self) {
        debug!("stopping capture on {}", self.device.id);
        self.capture.stop();
    }
}

/// Observable view of the local capture state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSnapshot {
    pub audio_device: Option<String>,
    pub video_device: Option<String>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

/// Owns local capture for one session.
///
/// Every exit path releases the hardware: sources stop when replaced,
/// on [`MediaPipeline::release`], and on drop.
pub struct MediaPipeline {
    devices: Arc<dyn MediaDevices>,
    audio: Option<ActiveSource>,
    video: Option<ActiveSource>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    camera_before_share: Option<DeviceInfo>,
}

impl MediaPipeline {
    /// Opens the devices named by `constraints`, audio first.
    ///
    /// Fails without retrying on permission denial or a missing device;
    /// anything already opened is released before the error returns.
    pub async fn acquire(
        devices: Arc<dyn MediaDevices>,
        constraints: &MediaConstraints,
    ) -> Result<Self, DeviceError> {
        let catalog = devices.enumerate().await?;
        let mut pipeline = Self {
            devices,
            audio: None,
            video: None,
            audio_enabled: Arc::new(AtomicBool::new(true)),
            video_enabled: Arc::new(AtomicBool::new(true)),
            camera_before_share: None,
        };

        for kind in MediaKind::ALL {
            let device = match resolve(&catalog, kind, constraints.request(kind))? {
                Some(device) => device,
                None => continue,
            };
            let source = pipeline.open(device).await?;
            *pipeline.slot(kind) = Some(source);
        }

        info!(
            "media acquired: audio={:?} video={:?}",
            pipeline.audio.as_ref().map(|s| &s.device.id),
            pipeline.video.as_ref().map(|s| &s.device.id)
        );
        Ok(pipeline)
    }

    /// Current outbound tracks, one per captured kind.
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.audio
            .iter()
            .chain(self.video.iter())
            .map(|s| s.track.clone())
            .collect()
    }

    pub fn track(&self, kind: MediaKind) -> Option<LocalTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
        .map(|s| s.track.clone())
    }

    /// Local mute. Flips the shared flag only; no track is removed and
    /// nothing is renegotiated.
    pub fn toggle_enabled(&self, kind: MediaKind, enabled: bool) {
        self.flag(kind).store(enabled, Ordering::Release);
        debug!("{kind} enabled={enabled}");
    }

    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        self.flag(kind).load(Ordering::Acquire)
    }

    /// Opens `device_id` and makes it the active source for its kind.
    /// The previous source keeps running if the new one fails to open.
    /// Returns the new track for fan-out to every peer.
    pub async fn switch_device(
        &mut self,
        kind: MediaKind,
        device_id: &str,
    ) -> Result<LocalTrack, DeviceError> {
        let catalog = self.devices.enumerate().await?;
        let device = catalog
            .into_iter()
            .find(|d| d.id == device_id && d.kind() == kind)
            .ok_or_else(|| DeviceError::NotFound {
                kind,
                wanted: device_id.to_string(),
            })?;
        if device.source == SourceKind::Screen {
            return self.start_screen_share(Some(device_id)).await;
        }
        let source = self.open(device).await?;
        if kind == MediaKind::Video {
            self.camera_before_share = None;
        }
        Ok(self.replace(source))
    }

    /// Swaps the outbound video to a screen source, remembering the camera.
    pub async fn start_screen_share(
        &mut self,
        screen_id: Option<&str>,
    ) -> Result<LocalTrack, DeviceError> {
        let catalog = self.devices.enumerate().await?;
        let screen = catalog
            .into_iter()
            .find(|d| d.source == SourceKind::Screen && screen_id.map_or(true, |id| d.id == id))
            .ok_or_else(|| DeviceError::NotFound {
                kind: MediaKind::Video,
                wanted: screen_id.unwrap_or("screen").to_string(),
            })?;
        let source = self.open(screen).await?;
        if !self.is_screen_sharing() {
            self.camera_before_share = self
                .video
                .as_ref()
                .filter(|s| s.device.source == SourceKind::Camera)
                .map(|s| s.device.clone());
        }
        Ok(self.replace(source))
    }

    /// Restores the camera that was active before sharing. Returns `None`
    /// when there was no share, or no camera to go back to (the screen
    /// track is then stopped and video stays empty).
    pub async fn stop_screen_share(&mut self) -> Result<Option<LocalTrack>, DeviceError> {
        if !self.is_screen_sharing() {
            return Ok(None);
        }
        match self.camera_before_share.take() {
            Some(camera) => {
                let source = self.open(camera).await?;
                Ok(Some(self.replace(source)))
            }
            None => {
                self.video = None;
                Ok(None)
            }
        }
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.video
            .as_ref()
            .is_some_and(|s| s.device.source == SourceKind::Screen)
    }

    pub fn snapshot(&self) -> MediaSnapshot {
        MediaSnapshot {
            audio_device: self.audio.as_ref().map(|s| s.device.id.clone()),
            video_device: self.video.as_ref().map(|s| s.device.id.clone()),
            audio_enabled: self.is_enabled(MediaKind::Audio),
            video_enabled: self.is_enabled(MediaKind::Video),
            screen_sharing: self.is_screen_sharing(),
        }
    }

    /// Stops every capture.
    pub fn release(&mut self) {
        self.audio = None;
        self.video = None;
        self.camera_before_share = None;
    }

    async fn open(&self, device: DeviceInfo) -> Result<ActiveSource, DeviceError> {
        let track = LocalTrack::new(&device, self.flag(device.kind()).clone());
        let capture = self.devices.open(&device, track.clone()).await?;
        Ok(ActiveSource {
            device,
            track,
            capture,
        })
    }

    fn replace(&mut self, source: ActiveSource) -> LocalTrack {
        let kind = source.device.kind();
        let track = source.track.clone();
        info!("{kind} source now {}", source.device.id);
        // Old source is dropped, and thereby stopped, here.
        *self.slot(kind) = Some(source);
        track
    }

    fn slot(&mut self, kind: MediaKind) -> &mut Option<ActiveSource> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    fn flag(&self, kind: MediaKind) -> &Arc<AtomicBool> {
        match kind {
            MediaKind::Audio => &self.audio_enabled,
            MediaKind::Video => &self.video_enabled,
        }
    }
}

fn resolve(
    catalog: &[DeviceInfo],
    kind: MediaKind,
    request: &DeviceRequest,
) -> Result<Option<DeviceInfo>, DeviceError> {
    let wanted = match request {
        DeviceRequest::Disabled => return Ok(None),
        DeviceRequest::Any => None,
        DeviceRequest::Exact(id) => Some(id.as_str()),
    };
    catalog
        .iter()
        .find(|d| match wanted {
            Some(id) => d.id == id && d.kind() == kind,
            None => d.kind() == kind && d.source != SourceKind::Screen,
        })
        .cloned()
        .map(Some)
        .ok_or_else(|| DeviceError::NotFound {
            kind,
            wanted: wanted.unwrap_or("any").to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::VirtualDevices;

    fn two_cameras() -> VirtualDevices {
        VirtualDevices::new().with_device(DeviceInfo::new(
            "usb-camera",
            "USB Camera",
            SourceKind::Camera,
        ))
    }

    #[tokio::test]
    async fn acquires_default_devices() {
        let devices = VirtualDevices::new();
        let pipeline = MediaPipeline::acquire(Arc::new(devices.clone()), &MediaConstraints::default())
            .await
            .unwrap();

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.audio_device.as_deref(), Some("virtual-mic"));
        assert_eq!(snapshot.video_device.as_deref(), Some("virtual-camera"));
        assert!(!snapshot.screen_sharing);
        assert_eq!(pipeline.tracks().len(), 2);
        assert_eq!(devices.active_captures(), 2);
    }

    #[tokio::test]
    async fn permission_denied_releases_earlier_devices() {
        let devices = VirtualDevices::new().deny(SourceKind::Camera);
        let result =
            MediaPipeline::acquire(Arc::new(devices.clone()), &MediaConstraints::default()).await;

        assert_eq!(
            result.err(),
            Some(DeviceError::PermissionDenied(SourceKind::Camera))
        );
        assert_eq!(devices.active_captures(), 0);
    }

    #[tokio::test]
    async fn missing_device_is_not_found() {
        let devices = VirtualDevices::empty().with_device(DeviceInfo::new(
            "mic",
            "Mic",
            SourceKind::Microphone,
        ));
        let result =
            MediaPipeline::acquire(Arc::new(devices.clone()), &MediaConstraints::default()).await;

        assert!(matches!(
            result.err(),
            Some(DeviceError::NotFound { kind: MediaKind::Video, .. })
        ));
        assert_eq!(devices.active_captures(), 0);
    }

    #[tokio::test]
    async fn disabled_kind_is_not_opened() {
        let devices = VirtualDevices::new();
        let pipeline =
            MediaPipeline::acquire(Arc::new(devices.clone()), &MediaConstraints::audio_only())
                .await
                .unwrap();

        assert!(pipeline.track(MediaKind::Video).is_none());
        assert_eq!(devices.active_captures(), 1);
    }

    #[tokio::test]
    async fn mute_is_shared_across_device_switch() {
        let devices = two_cameras();
        let mut pipeline =
            MediaPipeline::acquire(Arc::new(devices.clone()), &MediaConstraints::default())
                .await
                .unwrap();

        pipeline.toggle_enabled(MediaKind::Video, false);
        let track = pipeline.switch_device(MediaKind::Video, "usb-camera").await.unwrap();

        assert_eq!(track.device_id(), "usb-camera");
        assert!(!track.is_enabled());
        assert_eq!(devices.active_captures(), 2);

        pipeline.toggle_enabled(MediaKind::Video, true);
        assert!(track.is_enabled());
    }

    #[tokio::test]
    async fn failed_switch_keeps_old_source() {
        let devices = VirtualDevices::new();
        let mut pipeline =
            MediaPipeline::acquire(Arc::new(devices.clone()), &MediaConstraints::default())
                .await
                .unwrap();

        assert!(pipeline.switch_device(MediaKind::Video, "no-such-camera").await.is_err());
        assert_eq!(
            pipeline.snapshot().video_device.as_deref(),
            Some("virtual-camera")
        );
        assert_eq!(devices.active_captures(), 2);
    }

    #[tokio::test]
    async fn screen_share_round_trip_restores_camera() {
        let devices = VirtualDevices::new();
        let mut pipeline =
            MediaPipeline::acquire(Arc::new(devices.clone()), &MediaConstraints::default())
                .await
                .unwrap();

        let screen = pipeline.start_screen_share(None).await.unwrap();
        assert_eq!(screen.device_id(), "virtual-screen");
        assert!(pipeline.is_screen_sharing());
        assert_eq!(devices.active_captures(), 2);

        let camera = pipeline.stop_screen_share().await.unwrap().unwrap();
        assert_eq!(camera.device_id(), "virtual-camera");
        assert!(!pipeline.is_screen_sharing());
        assert_eq!(pipeline.stop_screen_share().await.unwrap().map(|t| t.id()), None);
    }

    #[tokio::test]
    async fn release_stops_everything() {
        let devices = VirtualDevices::new();
        let mut pipeline =
            MediaPipeline::acquire(Arc::new(devices.clone()), &MediaConstraints::default())
                .await
                .unwrap();

        pipeline.release();
        assert!(pipeline.tracks().is_empty());
        assert_eq!(devices.active_captures(), 0);
    }
}
