//! Shared call types and data structures

use crate::participant::{Participant, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one call attempt, used for log correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    /// Create a new random attempt id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the call this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Placed the call
    Caller,
    /// Received the call
    Callee,
}

/// Session state as exposed to the UI
///
/// `Connected` is reached only once the underlying connectivity state
/// reports a usable media path, not when SDP exchange completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No negotiation started yet
    Idle,
    /// Offer sent, waiting for the callee
    Offering,
    /// Incoming offer stored, waiting for local accept/decline
    Ringing,
    /// Media is flowing
    Connected,
    /// Terminal; the session object is discarded
    Ended,
}

impl SessionState {
    /// True for every state except `Ended`
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Ended)
    }
}

/// SDP description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Session offer
    Offer,
    /// Session answer
    Answer,
}

/// A session description as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// "offer" or "answer"
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP media id
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Normalized connectivity state of the peer connection
///
/// Both the ICE-connection-state and the overall-connection-state streams of
/// the underlying agent map into this one sequence; consecutive duplicates
/// are dropped by the peer connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    /// Agent created, nothing attempted
    New,
    /// Path checks in progress
    Connecting,
    /// A usable media path exists
    Connected,
    /// Path lost; fatal for the session
    Disconnected,
    /// Negotiation failed; fatal for the session
    Failed,
    /// Agent closed; fatal for the session
    Closed,
}

impl ConnectivityState {
    /// True once media can flow
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// True for the states that always drive teardown
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// A STUN/TURN server entry, consumed as configuration only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (stun:/turn: schemes)
    pub urls: Vec<String>,
    /// TURN username, if required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential, if required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A STUN-only entry
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Peer connection configuration supplied at construction time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtcConfig {
    /// STUN/TURN server list
    pub ice_servers: Vec<IceServer>,
}

/// Media constraints for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture microphone audio
    pub audio: bool,
    /// Capture camera video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

/// Why a session ended
///
/// Surfaced to the UI as the human-readable terminal reason; the UI never
/// observes raw errors from the negotiation machinery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    HungUp,
    /// Remote peer hung up
    RemoteHangup,
    /// Local user declined the ringing call
    Declined,
    /// Remote peer declined our offer
    RemoteDeclined,
    /// Connectivity reported disconnected/failed/closed
    ConnectivityLost,
    /// Capture devices could not be acquired
    MediaUnavailable(String),
    /// A new call attempt to the same peer replaced this session
    Replaced,
}

impl EndReason {
    /// Human-readable reason string for the UI
    pub fn describe(&self) -> String {
        match self {
            Self::HungUp => "call ended".to_string(),
            Self::RemoteHangup => "call ended by the other party".to_string(),
            Self::Declined => "call declined".to_string(),
            Self::RemoteDeclined => "call declined by the other party".to_string(),
            Self::ConnectivityLost => "call ended".to_string(),
            Self::MediaUnavailable(detail) => format!("camera or microphone unavailable: {detail}"),
            Self::Replaced => "call replaced by a new attempt".to_string(),
        }
    }
}

/// Session event delivered to the UI layer
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An incoming call is ringing
    IncomingCall {
        /// Who is calling
        caller: Participant,
        /// Visit this call belongs to
        service_id: String,
    },
    /// Session state changed
    StateChanged {
        /// Remote peer the session is keyed by
        peer: UserId,
        /// New state
        state: SessionState,
    },
    /// A remote media track became available
    RemoteTrackAdded {
        /// Remote peer
        peer: UserId,
        /// Track kind
        kind: MediaKind,
    },
    /// Session reached its terminal state
    Ended {
        /// Remote peer
        peer: UserId,
        /// Terminal reason
        reason: EndReason,
    },
}
