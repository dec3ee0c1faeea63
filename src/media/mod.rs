//! Local capture: device catalog, outbound tracks, and the pipeline that
//! owns them for the lifetime of a session.

pub mod devices;
pub mod pipeline;
pub mod track;

pub use devices::{CaptureSession, MediaDevices, VirtualDevices};
pub use pipeline::{MediaPipeline, MediaSnapshot};
pub use track::LocalTrack;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Camera,
    Microphone,
    Screen,
}

impl SourceKind {
    pub fn media_kind(self) -> MediaKind {
        match self {
            SourceKind::Microphone => MediaKind::Audio,
            SourceKind::Camera | SourceKind::Screen => MediaKind::Video,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Camera => write!(f, "camera"),
            SourceKind::Microphone => write!(f, "microphone"),
            SourceKind::Screen => write!(f, "screen"),
        }
    }
}

/// A capture source the host can open.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub source: SourceKind,
}

impl DeviceInfo {
    pub fn new(id: &str, label: &str, source: SourceKind) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            source,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.source.media_kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceRequest {
    Disabled,
    #[default]
    Any,
    Exact(String),
}

/// What to capture at session start.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaConstraints {
    pub audio: DeviceRequest,
    pub video: DeviceRequest,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: DeviceRequest::Any,
            video: DeviceRequest::Disabled,
        }
    }

    pub fn request(&self, kind: MediaKind) -> &DeviceRequest {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }
}
