//! Local capture devices and the media gateway
//!
//! Camera and microphone are acquired as one combined stream through the
//! [`CaptureSource`] capability, so a non-browser target can satisfy the
//! contract with whatever capture stack it has. The gateway owns the stream
//! on behalf of a single session; release is idempotent and toggling a track
//! is local-only (no renegotiation, no signaling).

use crate::types::{MediaConstraints, MediaKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// Permission denied or no device available; never retried automatically
    #[error("media acquisition failed: {0}")]
    AcquisitionFailed(String),

    /// Operation needs a live local stream
    #[error("no local stream")]
    NoLocalStream,
}

/// One local capture track
///
/// `enabled` is the mute flag; `live` flips to false once the track is
/// stopped and never comes back.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: MediaKind,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create a live, enabled track
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle the enabled flag
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Current enabled flag
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Stop the track; safe to call repeatedly
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    /// Whether the track is still live
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Combined audio+video capture stream
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    /// Tracks in this stream
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// Build a stream from tracks
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    /// Tracks of one kind
    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    /// Stop every track; safe to call repeatedly
    pub fn release(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// A remote media track surfaced by the peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Owning stream identifier
    pub stream_id: String,
    /// Audio or video
    pub kind: MediaKind,
}

/// Capability seam over platform capture devices
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Request a combined stream per the constraints
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::AcquisitionFailed`] if permission is denied or
    /// no device is available.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Owner of the local capture stream for one session
pub struct MediaGateway {
    source: Arc<dyn CaptureSource>,
    stream: Option<LocalStream>,
}

impl MediaGateway {
    /// Create a gateway over a capture source
    pub fn new(source: Arc<dyn CaptureSource>) -> Self {
        Self {
            source,
            stream: None,
        }
    }

    /// The capture source this gateway acquires from
    pub fn source(&self) -> Arc<dyn CaptureSource> {
        Arc::clone(&self.source)
    }

    /// Acquire the combined stream
    ///
    /// # Errors
    ///
    /// Returns error if the devices cannot be acquired; the caller converts
    /// this into session teardown, never a retry.
    pub async fn acquire(&mut self, constraints: &MediaConstraints) -> Result<(), MediaError> {
        if let Some(existing) = self.stream.take() {
            tracing::warn!("Releasing stale local stream before re-acquisition");
            existing.release();
        }
        let stream = self.source.acquire(constraints).await?;
        tracing::debug!(tracks = stream.tracks.len(), "Local stream acquired");
        self.stream = Some(stream);
        Ok(())
    }

    /// Adopt a stream acquired out-of-band
    ///
    /// The service acquires without holding session locks and hands the
    /// result over here.
    pub fn adopt(&mut self, stream: LocalStream) {
        if let Some(existing) = self.stream.take() {
            tracing::warn!("Releasing stale local stream before adoption");
            existing.release();
        }
        self.stream = Some(stream);
    }

    /// Current stream, if acquired
    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    /// Stop every track and drop the stream; idempotent no-op without one
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            tracing::debug!(tracks = stream.tracks.len(), "Releasing local stream");
            stream.release();
        }
    }

    /// Toggle microphone tracks
    ///
    /// # Errors
    ///
    /// Returns error if no stream has been acquired.
    pub fn set_audio_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.set_kind_enabled(MediaKind::Audio, enabled)
    }

    /// Toggle camera tracks
    ///
    /// # Errors
    ///
    /// Returns error if no stream has been acquired.
    pub fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.set_kind_enabled(MediaKind::Video, enabled)
    }

    fn set_kind_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), MediaError> {
        let stream = self.stream.as_ref().ok_or(MediaError::NoLocalStream)?;
        for track in stream.tracks_of(kind) {
            track.set_enabled(enabled);
        }
        Ok(())
    }
}

/// Capture source that fabricates silent tracks
///
/// Stands in for platform capture in the CLI demo and anywhere real devices
/// are unavailable.
#[derive(Debug, Default)]
pub struct SyntheticCaptureSource;

#[async_trait]
impl CaptureSource for SyntheticCaptureSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(
                format!("audio-{}", Uuid::new_v4()),
                MediaKind::Audio,
            ));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(
                format!("video-{}", Uuid::new_v4()),
                MediaKind::Video,
            ));
        }
        Ok(LocalStream::new(tracks))
    }
}
