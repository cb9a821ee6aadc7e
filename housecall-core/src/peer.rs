//! Peer connection ownership and the ICE/SDP agent seam
//!
//! A session owns exactly one [`PeerConnectionManager`], which wraps one
//! [`SdpAgent`]. The agent is a capability trait so the same session logic
//! runs over webrtc-rs, a browser bridge, or the scripted test agent. The
//! manager normalizes the agent's event streams for the session: local
//! candidates are forwarded individually as they are discovered, each remote
//! track is surfaced once, and the two connectivity streams the agent may
//! have collapse into one de-duplicated signal.

use crate::media::{LocalStream, RemoteTrack};
use crate::types::{ConnectivityState, IceCandidate, RtcConfig, SessionDescription};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    /// Underlying agent rejected the operation
    #[error("agent error: {0}")]
    AgentError(String),

    /// Agent construction failed
    #[error("agent configuration error: {0}")]
    ConfigError(String),

    /// Operation on a closed connection
    #[error("peer connection closed")]
    Closed,
}

/// Raw event from an ICE/SDP agent
///
/// Agents map both their ICE-connection-state and overall-connection-state
/// streams into `Connectivity`; the manager owns de-duplication.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Locally discovered ICE candidate
    Candidate(IceCandidate),
    /// Inbound media track appeared
    Track(RemoteTrack),
    /// Connectivity state changed
    Connectivity(ConnectivityState),
}

/// Normalized event delivered to the session
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Forward this candidate to the remote peer, immediately
    LocalCandidate(IceCandidate),
    /// A remote track became available (surfaced once per track)
    RemoteTrack(RemoteTrack),
    /// De-duplicated connectivity signal
    Connectivity(ConnectivityState),
}

/// The ICE/SDP agent capability
///
/// One instance negotiates one media session. Descriptions created here have
/// already been applied locally; callers only exchange them over signaling.
#[async_trait]
pub trait SdpAgent: Send + Sync {
    /// Create an offer and set it as the local description
    ///
    /// # Errors
    ///
    /// Returns error if SDP generation fails.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an answer and set it as the local description
    ///
    /// Requires the remote offer to be set first.
    ///
    /// # Errors
    ///
    /// Returns error if SDP generation fails.
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply the remote description
    ///
    /// # Errors
    ///
    /// Returns error if the description is malformed or rejected.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote ICE candidate
    ///
    /// Rejection of an individual candidate is non-fatal for the session;
    /// callers log and continue.
    ///
    /// # Errors
    ///
    /// Returns error if the agent rejects the candidate.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Attach local capture tracks before negotiation
    ///
    /// # Errors
    ///
    /// Returns error if a track cannot be attached.
    async fn attach_local_stream(&self, stream: &LocalStream) -> Result<(), PeerError>;

    /// Release the agent; idempotent
    ///
    /// # Errors
    ///
    /// Returns error if shutdown fails.
    async fn close(&self) -> Result<(), PeerError>;
}

/// Builds agents configured with the externally supplied STUN/TURN list
#[async_trait]
pub trait SdpAgentFactory: Send + Sync {
    /// Create a fresh agent plus its raw event stream
    ///
    /// A new call attempt always gets a new agent; closed agents are never
    /// reused.
    ///
    /// # Errors
    ///
    /// Returns error if the agent cannot be constructed.
    async fn create_agent(
        &self,
        config: &RtcConfig,
    ) -> Result<(Arc<dyn SdpAgent>, mpsc::UnboundedReceiver<AgentEvent>), PeerError>;
}

/// Owner of the single live agent for one session
pub struct PeerConnectionManager {
    agent: Arc<dyn SdpAgent>,
    closed: Arc<AtomicBool>,
    forwarder: JoinHandle<()>,
}

impl PeerConnectionManager {
    /// Wrap an agent and start normalizing its events into `outbound`
    pub fn new(
        agent: Arc<dyn SdpAgent>,
        events: mpsc::UnboundedReceiver<AgentEvent>,
        outbound: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let forwarder = tokio::spawn(forward_events(events, outbound, Arc::clone(&closed)));
        Self {
            agent,
            closed,
            forwarder,
        }
    }

    /// Create and locally apply an offer
    ///
    /// # Errors
    ///
    /// Returns error if the agent fails or the connection is closed.
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        self.agent.create_offer().await
    }

    /// Create and locally apply an answer
    ///
    /// # Errors
    ///
    /// Returns error if the agent fails or the connection is closed.
    pub async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        self.agent.create_answer().await
    }

    /// Apply the remote description
    ///
    /// # Errors
    ///
    /// Returns error if the agent rejects it or the connection is closed.
    pub async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.agent.set_remote_description(desc).await
    }

    /// Apply a remote candidate
    ///
    /// # Errors
    ///
    /// Returns error if the agent rejects it; non-fatal for the session.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.agent.add_ice_candidate(candidate).await
    }

    /// Attach local capture tracks
    ///
    /// # Errors
    ///
    /// Returns error if a track cannot be attached.
    pub async fn attach_local_stream(&self, stream: &LocalStream) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.agent.attach_local_stream(stream).await
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release the agent and stop event forwarding; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forwarder.abort();
        if let Err(e) = self.agent.close().await {
            tracing::warn!(error = %e, "Agent close reported an error");
        }
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        Ok(())
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Normalize raw agent events into session-facing peer events
///
/// Candidates pass through one by one. Tracks are de-duplicated by id.
/// Connectivity collapses to a single monotone signal: `Connected` and the
/// fatal states are forwarded at most once each, everything else only on
/// change.
async fn forward_events(
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    outbound: mpsc::UnboundedSender<PeerEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut seen_tracks: HashSet<String> = HashSet::new();
    let mut last_state: Option<ConnectivityState> = None;
    let mut established_sent = false;
    let mut fatal_sent = false;

    while let Some(event) = events.recv().await {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let forwarded = match event {
            AgentEvent::Candidate(candidate) => Some(PeerEvent::LocalCandidate(candidate)),
            AgentEvent::Track(track) => {
                if seen_tracks.insert(track.id.clone()) {
                    Some(PeerEvent::RemoteTrack(track))
                } else {
                    None
                }
            }
            AgentEvent::Connectivity(state) => {
                let duplicate = last_state == Some(state)
                    || (state.is_established() && established_sent)
                    || (state.is_fatal() && fatal_sent);
                last_state = Some(state);
                if duplicate {
                    None
                } else {
                    established_sent |= state.is_established();
                    fatal_sent |= state.is_fatal();
                    Some(PeerEvent::Connectivity(state))
                }
            }
        };
        if let Some(event) = forwarded {
            if outbound.send(event).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::RemoteTrack;
    use crate::types::MediaKind;

    struct NullAgent;

    #[async_trait]
    impl SdpAgent for NullAgent {
        async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
            Ok(SessionDescription::offer("v=0\r\n"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
            Ok(SessionDescription::answer("v=0\r\n"))
        }

        async fn set_remote_description(
            &self,
            _desc: SessionDescription,
        ) -> Result<(), PeerError> {
            Ok(())
        }

        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), PeerError> {
            Ok(())
        }

        async fn attach_local_stream(&self, _stream: &LocalStream) -> Result<(), PeerError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), PeerError> {
            Ok(())
        }
    }

    fn manager() -> (
        PeerConnectionManager,
        mpsc::UnboundedSender<AgentEvent>,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let mgr = PeerConnectionManager::new(Arc::new(NullAgent), agent_rx, peer_tx);
        (mgr, agent_tx, peer_rx)
    }

    fn track(id: &str) -> RemoteTrack {
        RemoteTrack {
            id: id.to_string(),
            stream_id: "remote".to_string(),
            kind: MediaKind::Video,
        }
    }

    #[tokio::test]
    async fn test_candidates_forwarded_individually() {
        let (_mgr, agent_tx, mut peer_rx) = manager();
        for n in 0..3 {
            agent_tx
                .send(AgentEvent::Candidate(IceCandidate {
                    candidate: format!("candidate:{n}"),
                    sdp_mid: None,
                    sdp_mline_index: None,
                }))
                .unwrap();
        }
        for n in 0..3 {
            match peer_rx.recv().await.unwrap() {
                PeerEvent::LocalCandidate(c) => {
                    assert_eq!(c.candidate, format!("candidate:{n}"));
                }
                other => unreachable!("expected candidate, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_connected_surfaced_once() {
        let (_mgr, agent_tx, mut peer_rx) = manager();
        // Both agent streams report an established path.
        agent_tx
            .send(AgentEvent::Connectivity(ConnectivityState::Connecting))
            .unwrap();
        agent_tx
            .send(AgentEvent::Connectivity(ConnectivityState::Connected))
            .unwrap();
        agent_tx
            .send(AgentEvent::Connectivity(ConnectivityState::Connecting))
            .unwrap();
        agent_tx
            .send(AgentEvent::Connectivity(ConnectivityState::Connected))
            .unwrap();
        agent_tx
            .send(AgentEvent::Connectivity(ConnectivityState::Failed))
            .unwrap();

        let mut connected = 0;
        let mut fatal = 0;
        while let Some(event) = peer_rx.recv().await {
            if let PeerEvent::Connectivity(state) = event {
                if state.is_established() {
                    connected += 1;
                }
                if state.is_fatal() {
                    fatal += 1;
                    break;
                }
            }
        }
        assert_eq!(connected, 1);
        assert_eq!(fatal, 1);
    }

    #[tokio::test]
    async fn test_fatal_surfaced_once() {
        let (_mgr, agent_tx, mut peer_rx) = manager();
        agent_tx
            .send(AgentEvent::Connectivity(ConnectivityState::Disconnected))
            .unwrap();
        agent_tx
            .send(AgentEvent::Connectivity(ConnectivityState::Failed))
            .unwrap();
        agent_tx
            .send(AgentEvent::Connectivity(ConnectivityState::Closed))
            .unwrap();
        // A candidate after the fatal burst shows forwarding kept going.
        agent_tx
            .send(AgentEvent::Candidate(IceCandidate {
                candidate: "candidate:tail".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            }))
            .unwrap();

        let mut fatal = 0;
        loop {
            match peer_rx.recv().await.unwrap() {
                PeerEvent::Connectivity(state) if state.is_fatal() => fatal += 1,
                PeerEvent::LocalCandidate(c) if c.candidate == "candidate:tail" => break,
                _ => {}
            }
        }
        assert_eq!(fatal, 1);
    }

    #[tokio::test]
    async fn test_tracks_surfaced_once_per_id() {
        let (_mgr, agent_tx, mut peer_rx) = manager();
        agent_tx.send(AgentEvent::Track(track("t1"))).unwrap();
        agent_tx.send(AgentEvent::Track(track("t1"))).unwrap();
        agent_tx.send(AgentEvent::Track(track("t2"))).unwrap();

        let mut ids = Vec::new();
        while ids.len() < 2 {
            if let Some(PeerEvent::RemoteTrack(t)) = peer_rx.recv().await {
                ids.push(t.id);
            }
        }
        assert_eq!(ids, vec!["t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mgr, _agent_tx, _peer_rx) = manager();
        mgr.close().await;
        mgr.close().await;
        assert!(mgr.is_closed());
        assert!(matches!(mgr.create_offer().await, Err(PeerError::Closed)));
    }
}
