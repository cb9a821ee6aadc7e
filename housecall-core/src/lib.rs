//! Housecall - call signaling and session lifecycle for home medical visits
//!
//! This library drives the doctor↔nurse video consultations of an on-demand
//! home-visit platform. It features:
//!
//! - **CallSession state machine**: `idle → offering/ringing → connected → ended`,
//!   with `connected` gated on real connectivity rather than SDP exchange
//! - **Explicit signaling handle**: a [`SignalingChannel`] passed into each
//!   session, never a shared connection singleton
//! - **Candidate buffering**: ICE candidates that arrive before the remote
//!   description are held and flushed in order, exactly once
//! - **Lazy media capture**: a ringing callee acquires devices only on accept
//! - **Pluggable negotiation**: the [`SdpAgent`] seam runs over webrtc-rs or
//!   any embedder-provided stack
//!
//! # Examples
//!
//! ```rust,no_run
//! use housecall_core::prelude::*;
//! use housecall_core::signaling::LocalRelay;
//! use housecall_core::testing::{FakeCaptureSource, MockAgentFactory};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = LocalRelay::new();
//! let doctor = Participant::new("doctor-1", "Dr. Bello", Role::Doctor);
//! let nurse = Participant::new("nurse-1", "Nurse Adeyemi", Role::Nurse);
//! let (channel, inbound) = relay.register(doctor.clone());
//!
//! let service = CallService::new(
//!     doctor,
//!     channel,
//!     FakeCaptureSource::new(),
//!     MockAgentFactory::new(),
//!     CallConfig::default(),
//!     inbound,
//! );
//! service.start_call(nurse, "visit-42").await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Shared call types and data structures
pub mod types;

/// Call participants and clinical roles
pub mod participant;

/// Signaling events, the channel seam, and the in-process relay
pub mod signaling;

/// ICE candidate buffering until the remote description is set
pub mod ice;

/// Local capture streams and the media gateway
pub mod media;

/// Peer connection ownership and the ICE/SDP agent seam
pub mod peer;

/// Call session state machine
pub mod session;

/// Call coordination service
pub mod service;

/// Wall-clock call duration counter
pub mod timer;

/// Test doubles for the agent and capture seams
pub mod testing;

/// webrtc-rs backed agent (requires webrtc-agent feature)
#[cfg(feature = "webrtc-agent")]
pub mod webrtc_agent;

// Re-export main types at crate root
pub use ice::{CandidateDisposition, IceCandidateBuffer};
pub use media::{CaptureSource, LocalStream, LocalTrack, MediaError, MediaGateway, RemoteTrack};
pub use participant::{Participant, Role, UserId};
pub use peer::{
    AgentEvent, PeerConnectionManager, PeerError, PeerEvent, SdpAgent, SdpAgentFactory,
};
pub use service::{CallConfig, CallService, CallServiceError};
pub use session::{CallSession, SessionError};
pub use signaling::{
    InboundEvent, LocalRelay, RelayEndpoint, SignalingChannel, SignalingError, SignalingEvent,
};
pub use timer::CallTimer;
pub use types::*;
#[cfg(feature = "webrtc-agent")]
pub use webrtc_agent::{WebRtcAgent, WebRtcAgentFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::participant::{Participant, Role, UserId};
    pub use crate::service::{CallConfig, CallService, CallServiceError};
    pub use crate::session::{CallSession, SessionError};
    pub use crate::signaling::{SignalingChannel, SignalingEvent};
    pub use crate::types::{
        CallRole, ConnectivityState, EndReason, IceCandidate, IceServer, MediaConstraints,
        MediaKind, RtcConfig, SessionDescription, SessionEvent, SessionState,
    };
    #[cfg(feature = "webrtc-agent")]
    pub use crate::webrtc_agent::WebRtcAgentFactory;
}
