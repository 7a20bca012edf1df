//! Local media acquisition.
//!
//! A [`LocalStream`] is what the device handed us for one call. Tracks are
//! shared handles: the peer connection reads the same `enabled`/`live`
//! flags the call controller flips, so muting or stopping is visible to the
//! sending side immediately and nothing is copied.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::signaling::CallType;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Where a track's samples come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    /// 1 kHz PCMU test tone.
    Tone,
    /// Negotiated but carries no frames (no capture device or encoder).
    Blank,
}

/// Failure to obtain local media.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("no {0} device available")]
    DeviceUnavailable(TrackKind),
}

/// One captured track.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: TrackSource) -> Self {
        Self {
            id: format!("{}-{}", kind, uuid::Uuid::new_v4()),
            kind,
            source,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    /// Disabled tracks stay live but send silence / black.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    /// End the track for good.
    pub fn stop(&self) {
        self.live.store(false, Ordering::Relaxed);
    }
}

/// The set of tracks captured for one call.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    /// Enable or disable every track of `kind`.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    /// Stop every track.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Number of tracks not yet stopped.
    pub fn active_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }
}

/// Device access for local capture.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire audio, plus video for video calls.
    async fn acquire(&self, call_type: CallType) -> Result<LocalStream, MediaError>;
}

/// Capture source for headless clients.
///
/// Audio is a test tone; video tracks are negotiated but send nothing.
/// Availability mirrors the `[media]` config section so a client can
/// behave like a device without a camera or with permission denied.
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    pub microphone: bool,
    pub camera: bool,
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, call_type: CallType) -> Result<LocalStream, MediaError> {
        if !self.microphone {
            return Err(MediaError::PermissionDenied);
        }
        let mut tracks = vec![LocalTrack::new(TrackKind::Audio, TrackSource::Tone)];
        if call_type.has_video() {
            if !self.camera {
                return Err(MediaError::DeviceUnavailable(TrackKind::Video));
            }
            tracks.push(LocalTrack::new(TrackKind::Video, TrackSource::Blank));
        }
        let stream = LocalStream::new(tracks);
        tracing::debug!(
            "Acquired local stream {} ({} tracks) for {} call",
            stream.id(),
            stream.tracks().len(),
            call_type
        );
        Ok(stream)
    }
}
