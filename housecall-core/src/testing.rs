//! Test doubles for the agent and capture seams
//!
//! Shipped as a regular module so integration tests and downstream embedders
//! can script call flows without real devices or a network stack.

use crate::media::{CaptureSource, LocalStream, LocalTrack, MediaError};
use crate::peer::{AgentEvent, PeerError, SdpAgent, SdpAgentFactory};
use crate::types::{IceCandidate, MediaConstraints, MediaKind, RtcConfig, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Scripted ICE/SDP agent
///
/// Records every description, candidate, and track it is handed, and exposes
/// an injection handle so tests can drive candidate/track/connectivity events
/// as if they came from a real negotiation.
pub struct MockAgent {
    events: mpsc::UnboundedSender<AgentEvent>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    applied_candidates: Mutex<Vec<IceCandidate>>,
    attached_tracks: Mutex<Vec<String>>,
    reject_candidates: AtomicBool,
    fail_sdp: AtomicBool,
    closed: AtomicBool,
}

impl MockAgent {
    /// Create an agent plus the raw event stream a manager would consume
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let agent = Arc::new(Self {
            events,
            remote_descriptions: Mutex::new(Vec::new()),
            applied_candidates: Mutex::new(Vec::new()),
            attached_tracks: Mutex::new(Vec::new()),
            reject_candidates: AtomicBool::new(false),
            fail_sdp: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (agent, events_rx)
    }

    /// Inject a raw event, as if negotiation produced it
    pub fn inject(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    /// Make every subsequent `add_ice_candidate` fail
    pub fn reject_candidates(&self) {
        self.reject_candidates.store(true, Ordering::SeqCst);
    }

    /// Make every subsequent offer/answer fail
    pub fn fail_sdp(&self) {
        self.fail_sdp.store(true, Ordering::SeqCst);
    }

    /// Remote descriptions applied, in order
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    /// Remote candidates applied, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied_candidates.lock().clone()
    }

    /// Ids of the local tracks attached
    pub fn attached_tracks(&self) -> Vec<String> {
        self.attached_tracks.lock().clone()
    }

    /// Whether `close` ran
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SdpAgent for MockAgent {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        if self.fail_sdp.load(Ordering::SeqCst) {
            return Err(PeerError::AgentError("scripted offer failure".into()));
        }
        Ok(SessionDescription::offer("v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=mock\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.fail_sdp.load(Ordering::SeqCst) {
            return Err(PeerError::AgentError("scripted answer failure".into()));
        }
        if self.remote_descriptions.lock().is_empty() {
            return Err(PeerError::AgentError("no remote offer set".into()));
        }
        Ok(SessionDescription::answer("v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=mock\r\n"))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.remote_descriptions.lock().push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.reject_candidates.load(Ordering::SeqCst) {
            return Err(PeerError::AgentError("scripted candidate rejection".into()));
        }
        self.applied_candidates.lock().push(candidate);
        Ok(())
    }

    async fn attach_local_stream(&self, stream: &LocalStream) -> Result<(), PeerError> {
        let mut attached = self.attached_tracks.lock();
        for track in &stream.tracks {
            attached.push(track.id.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`MockAgent`]s and keeping handles to them
#[derive(Default)]
pub struct MockAgentFactory {
    created: Mutex<Vec<Arc<MockAgent>>>,
    fail_next: AtomicBool,
}

impl MockAgentFactory {
    /// Create a factory
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `create_agent` call fail
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Every agent created so far, in creation order
    pub fn agents(&self) -> Vec<Arc<MockAgent>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl SdpAgentFactory for MockAgentFactory {
    async fn create_agent(
        &self,
        _config: &RtcConfig,
    ) -> Result<(Arc<dyn SdpAgent>, mpsc::UnboundedReceiver<AgentEvent>), PeerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PeerError::ConfigError("scripted factory failure".into()));
        }
        let (agent, events_rx) = MockAgent::new();
        self.created.lock().push(Arc::clone(&agent));
        Ok((agent, events_rx))
    }
}

/// Capture source with no real devices behind it
///
/// Succeeds by default; flip `deny` to exercise the permission-denied path.
#[derive(Default)]
pub struct FakeCaptureSource {
    deny: AtomicBool,
    acquisitions: AtomicUsize,
}

impl FakeCaptureSource {
    /// Create a source that always succeeds
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent acquisition fail as permission-denied
    pub fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    /// How many acquisitions succeeded
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureSource for FakeCaptureSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::AcquisitionFailed("permission denied".into()));
        }
        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(format!("fake-audio-{n}"), MediaKind::Audio));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(format!("fake-video-{n}"), MediaKind::Video));
        }
        Ok(LocalStream::new(tracks))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_agent_records_negotiation() {
        let (agent, _events) = MockAgent::new();
        agent
            .set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        let answer = agent.create_answer().await.unwrap();
        assert_eq!(answer.kind, crate::types::SdpKind::Answer);
        assert_eq!(agent.remote_descriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_agent_answer_requires_offer() {
        let (agent, _events) = MockAgent::new();
        assert!(agent.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn test_fake_capture_honors_constraints() {
        let source = FakeCaptureSource::new();
        let stream = source
            .acquire(&MediaConstraints::audio_only())
            .await
            .unwrap();
        assert_eq!(stream.tracks.len(), 1);
        assert_eq!(stream.tracks[0].kind, MediaKind::Audio);
        assert_eq!(source.acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_fake_capture_denied() {
        let source = FakeCaptureSource::new();
        source.deny();
        assert!(source.acquire(&MediaConstraints::default()).await.is_err());
        assert_eq!(source.acquisitions(), 0);
    }
}
