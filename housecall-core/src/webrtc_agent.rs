//! ICE/SDP agent backed by webrtc-rs
//!
//! Implements [`SdpAgent`](crate::peer::SdpAgent) over a real
//! `RTCPeerConnection`. Compiled behind the `webrtc-agent` feature so
//! embedders bridging to a platform WebRTC stack can drop the dependency.

use crate::media::{LocalStream, RemoteTrack};
use crate::peer::{AgentEvent, PeerError, SdpAgent, SdpAgentFactory};
use crate::types::{
    ConnectivityState, IceCandidate, MediaKind, RtcConfig, SdpKind, SessionDescription,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const LOCAL_STREAM_ID: &str = "housecall-local";

/// Builds [`WebRtcAgent`] instances from the service's ICE server list
#[derive(Default)]
pub struct WebRtcAgentFactory;

impl WebRtcAgentFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SdpAgentFactory for WebRtcAgentFactory {
    #[tracing::instrument(skip(self, config))]
    async fn create_agent(
        &self,
        config: &RtcConfig,
    ) -> Result<(Arc<dyn SdpAgent>, mpsc::UnboundedReceiver<AgentEvent>), PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::ConfigError(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::ConfigError(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| PeerError::ConfigError(e.to_string()))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        register_callbacks(&pc, events_tx);

        tracing::debug!("Created peer connection agent");
        let agent: Arc<dyn SdpAgent> = Arc::new(WebRtcAgent { pc });
        Ok((agent, events_rx))
    }
}

/// [`SdpAgent`] over a webrtc-rs `RTCPeerConnection`
pub struct WebRtcAgent {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl SdpAgent for WebRtcAgent {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::AgentError(e.to_string()))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| PeerError::AgentError(e.to_string()))?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::AgentError(e.to_string()))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| PeerError::AgentError(e.to_string()))?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let remote = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| PeerError::AgentError(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| PeerError::AgentError(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::AgentError(e.to_string()))
    }

    async fn attach_local_stream(&self, stream: &LocalStream) -> Result<(), PeerError> {
        for track in &stream.tracks {
            let capability = match track.kind {
                MediaKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                MediaKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                capability,
                track.id.clone(),
                LOCAL_STREAM_ID.to_owned(),
            ));
            self.pc
                .add_track(local)
                .await
                .map_err(|e| PeerError::AgentError(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::AgentError(e.to_string()))
    }
}

fn register_callbacks(
    pc: &Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<AgentEvent>,
) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(AgentEvent::Candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to serialize local candidate");
                    }
                }
            }
        })
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        };
        let remote = RemoteTrack {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
        };
        let _ = tx.send(AgentEvent::Track(remote));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let mapped = match state {
            RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
            RTCPeerConnectionState::Connected => ConnectivityState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectivityState::Failed,
            RTCPeerConnectionState::Closed => ConnectivityState::Closed,
            _ => ConnectivityState::New,
        };
        let _ = tx.send(AgentEvent::Connectivity(mapped));
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let mapped = match state {
            RTCIceConnectionState::Checking => ConnectivityState::Connecting,
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                ConnectivityState::Connected
            }
            RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
            RTCIceConnectionState::Failed => ConnectivityState::Failed,
            RTCIceConnectionState::Closed => ConnectivityState::Closed,
            _ => ConnectivityState::New,
        };
        let _ = tx.send(AgentEvent::Connectivity(mapped));
        Box::pin(async {})
    }));
}
