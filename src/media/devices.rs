use super::{DeviceInfo, LocalTrack, MediaKind, SourceKind};
use crate::error::DeviceError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::media::Sample;

/// A running capture feeding samples into a [`LocalTrack`].
pub trait CaptureSession: Send + Sync {
    /// Stops the hardware. Must be idempotent.
    fn stop(&mut self);
}

/// Host capture backend: enumerates devices and opens them into tracks.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError>;

    async fn open(
        &self,
        device: &DeviceInfo,
        sink: LocalTrack,
    ) -> Result<Box<dyn CaptureSession>, DeviceError>;
}

const VIDEO_FRAME: Duration = Duration::from_millis(33);
const AUDIO_FRAME: Duration = Duration::from_millis(20);
// Opus DTX silence frame.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const BLANK_VIDEO: &[u8] = &[0u8; 64];

/// Software devices producing silence and blank frames.
///
/// Used by headless participants and tests; permission denial can be
/// simulated per source kind.
#[derive(Clone)]
pub struct VirtualDevices {
    devices: Vec<DeviceInfo>,
    denied: HashSet<SourceKind>,
    active: Arc<AtomicUsize>,
}

impl Default for VirtualDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDevices {
    /// One camera, one microphone, one screen.
    pub fn new() -> Self {
        Self::empty()
            .with_device(DeviceInfo::new(
                "virtual-mic",
                "Virtual Microphone",
                SourceKind::Microphone,
            ))
            .with_device(DeviceInfo::new(
                "virtual-camera",
                "Virtual Camera",
                SourceKind::Camera,
            ))
            .with_device(DeviceInfo::new(
                "virtual-screen",
                "Virtual Screen",
                SourceKind::Screen,
            ))
    }

    pub fn empty() -> Self {
        Self {
            devices: Vec::new(),
            denied: HashSet::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.devices.push(device);
        self
    }

    pub fn deny(mut self, source: SourceKind) -> Self {
        self.denied.insert(source);
        self
    }

    /// Number of captures currently running.
    pub fn active_captures(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MediaDevices for VirtualDevices {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(self.devices.clone())
    }

    async fn open(
        &self,
        device: &DeviceInfo,
        sink: LocalTrack,
    ) -> Result<Box<dyn CaptureSession>, DeviceError> {
        if self.denied.contains(&device.source) {
            return Err(DeviceError::PermissionDenied(device.source));
        }
        if !self.devices.iter().any(|d| d.id == device.id) {
            return Err(DeviceError::NotFound {
                kind: device.kind(),
                wanted: device.id.clone(),
            });
        }

        let (frame, payload) = match device.kind() {
            MediaKind::Audio => (AUDIO_FRAME, Bytes::from_static(OPUS_SILENCE)),
            MediaKind::Video => (VIDEO_FRAME, Bytes::from_static(BLANK_VIDEO)),
        };
        let label = device.label.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame);
            loop {
                ticker.tick().await;
                let sample = Sample {
                    data: payload.clone(),
                    duration: frame,
                    ..Default::default()
                };
                if let Err(e) = sink.write_sample(&sample).await {
                    warn!("{label}: dropping sample: {e}");
                }
            }
        });

        self.active.fetch_add(1, Ordering::AcqRel);
        debug!("opened virtual device {}", device.id);
        Ok(Box::new(VirtualCapture {
            task: Some(task),
            active: self.active.clone(),
        }))
    }
}

struct VirtualCapture {
    task: Option<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
}

impl CaptureSession for VirtualCapture {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for VirtualCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
