//! Call session state machine
//!
//! One [`CallSession`] drives one call attempt, outbound or inbound, from
//! creation to termination. State follows `idle → {offering|ringing} →
//! connected → ended` with no skips backwards; `connected` is entered only
//! when the normalized connectivity signal first reports an established
//! path, never on SDP exchange alone. `ended` is absorbing: the session is
//! discarded and any later attempt for the same peer gets a fresh session.

use crate::ice::{CandidateDisposition, IceCandidateBuffer};
use crate::media::{MediaError, MediaGateway, RemoteTrack};
use crate::participant::Participant;
use crate::peer::{PeerConnectionManager, PeerError};
use crate::signaling::{SignalingChannel, SignalingError, SignalingEvent};
use crate::timer::CallTimer;
use crate::types::{
    AttemptId, CallRole, ConnectivityState, EndReason, IceCandidate, SessionDescription,
    SessionEvent, SessionState,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Session state machine errors
///
/// Every error path also drives the session to `ended`; callers that ignore
/// the `Result` still observe the failure through the event stream.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Signaling transport rejected an emission
    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// SDP negotiation failed
    #[error("negotiation error: {0}")]
    Negotiation(#[from] PeerError),

    /// Capture devices unavailable
    #[error("media error: {0}")]
    Media(#[from] MediaError),

    /// Operation not valid in the current state
    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        /// What was attempted
        operation: &'static str,
        /// State at the time
        state: SessionState,
    },

    /// Negotiation requested before a peer connection was attached
    #[error("no peer connection attached")]
    NoPeerConnection,

    /// Accept requested for a call whose answer is already negotiated
    #[error("call already answered")]
    AlreadyAnswered,
}

/// One call attempt, creation to termination
pub struct CallSession {
    attempt_id: AttemptId,
    local: Participant,
    remote: Participant,
    service_id: String,
    role: CallRole,
    state: SessionState,
    media: MediaGateway,
    peer: Option<PeerConnectionManager>,
    candidates: IceCandidateBuffer,
    pending_remote_offer: Option<SessionDescription>,
    remote_tracks: Vec<RemoteTrack>,
    started_at: Option<DateTime<Utc>>,
    timer: CallTimer,
    torn_down: bool,
    signaling: Arc<dyn SignalingChannel>,
    events: broadcast::Sender<SessionEvent>,
}

impl CallSession {
    /// Create an outbound session in `idle`
    pub fn outgoing(
        local: Participant,
        remote: Participant,
        service_id: impl Into<String>,
        media: MediaGateway,
        signaling: Arc<dyn SignalingChannel>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            attempt_id: AttemptId::new(),
            local,
            remote,
            service_id: service_id.into(),
            role: CallRole::Caller,
            state: SessionState::Idle,
            media,
            peer: None,
            candidates: IceCandidateBuffer::new(),
            pending_remote_offer: None,
            remote_tracks: Vec::new(),
            started_at: None,
            timer: CallTimer::new(),
            torn_down: false,
            signaling,
            events,
        }
    }

    /// Create an inbound session in `ringing`
    ///
    /// Stores the remote offer; no media is acquired and no peer connection
    /// exists until the local user accepts.
    pub fn incoming(
        local: Participant,
        remote: Participant,
        service_id: impl Into<String>,
        offer: SessionDescription,
        media: MediaGateway,
        signaling: Arc<dyn SignalingChannel>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            attempt_id: AttemptId::new(),
            local,
            remote,
            service_id: service_id.into(),
            role: CallRole::Callee,
            state: SessionState::Ringing,
            media,
            peer: None,
            candidates: IceCandidateBuffer::new(),
            pending_remote_offer: Some(offer),
            remote_tracks: Vec::new(),
            started_at: None,
            timer: CallTimer::new(),
            torn_down: false,
            signaling,
            events,
        }
    }

    /// Attempt id for log correlation
    pub fn attempt_id(&self) -> AttemptId {
        self.attempt_id
    }

    /// Remote participant
    pub fn remote(&self) -> &Participant {
        &self.remote
    }

    /// Visit this call belongs to
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Which side of the call this is
    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// When connectivity first reported an established path
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Live duration counter
    pub fn timer(&self) -> &CallTimer {
        &self.timer
    }

    /// Remote tracks surfaced so far
    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    /// Local media controls
    pub fn media(&self) -> &MediaGateway {
        &self.media
    }

    /// Mutable access for stream adoption
    pub fn media_mut(&mut self) -> &mut MediaGateway {
        &mut self.media
    }

    /// Whether a peer connection is attached
    ///
    /// Set once negotiation begins; a ringing callee with an attached peer
    /// has already answered even though the state stays `ringing` until
    /// connectivity reports a path.
    pub fn peer_attached(&self) -> bool {
        self.peer.is_some()
    }

    /// Install the peer connection for this attempt
    ///
    /// A session owns exactly one connection for its whole life; a second
    /// attach is refused and the rejected manager handed back so the caller
    /// can close it.
    ///
    /// # Errors
    ///
    /// Returns the rejected manager if a connection is already attached.
    pub fn attach_peer(
        &mut self,
        peer: PeerConnectionManager,
    ) -> Result<(), PeerConnectionManager> {
        if self.peer.is_some() {
            tracing::warn!(
                attempt_id = %self.attempt_id,
                "Refusing to replace the live peer connection"
            );
            return Err(peer);
        }
        self.peer = Some(peer);
        Ok(())
    }

    /// Caller: negotiate the offer and ring the remote peer
    ///
    /// Requires `idle`, an adopted local stream, and an attached peer
    /// connection. On success the session is `offering`.
    ///
    /// # Errors
    ///
    /// Returns error on negotiation or signaling failure; the session is
    /// torn down first.
    #[tracing::instrument(skip(self), fields(attempt_id = %self.attempt_id, peer = %self.remote.id))]
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        match self.negotiate_offer().await {
            Ok(()) => {
                self.transition(SessionState::Offering);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Outbound negotiation failed");
                self.teardown(EndReason::ConnectivityLost).await;
                Err(e)
            }
        }
    }

    async fn negotiate_offer(&mut self) -> Result<(), SessionError> {
        let peer = self.peer.as_ref().ok_or(SessionError::NoPeerConnection)?;
        if let Some(stream) = self.media.stream() {
            peer.attach_local_stream(stream).await?;
        }
        let offer = peer.create_offer().await?;
        self.signaling
            .emit(
                &self.remote.id,
                SignalingEvent::CallInitiate {
                    target_user_id: self.remote.id.clone(),
                    service_id: self.service_id.clone(),
                    offer,
                    caller_name: self.local.display_name.clone(),
                },
            )
            .await?;
        Ok(())
    }

    /// Callee: answer the stored offer
    ///
    /// Requires `ringing`, an adopted local stream, and an attached peer
    /// connection. Applies the stored offer, flushes buffered candidates in
    /// arrival order, then sends the answer. The session stays `ringing`
    /// until connectivity reports an established path.
    ///
    /// # Errors
    ///
    /// Returns error on negotiation or signaling failure; the session is
    /// torn down first, notifying the caller so their ringing UI clears.
    /// A repeat accept fails with [`SessionError::AlreadyAnswered`] and
    /// leaves the answered session untouched.
    #[tracing::instrument(skip(self), fields(attempt_id = %self.attempt_id, peer = %self.remote.id))]
    pub async fn accept(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Ringing {
            return Err(SessionError::InvalidState {
                operation: "accept",
                state: self.state,
            });
        }
        // The offer is consumed by the first accept; a repeat must not
        // decline or tear down the already-answered session.
        if self.pending_remote_offer.is_none() {
            return Err(SessionError::AlreadyAnswered);
        }
        match self.negotiate_answer().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "Answer negotiation failed");
                self.notify(SignalingEvent::CallDecline {
                    target_user_id: self.remote.id.clone(),
                })
                .await;
                self.teardown(EndReason::ConnectivityLost).await;
                Err(e)
            }
        }
    }

    async fn negotiate_answer(&mut self) -> Result<(), SessionError> {
        let offer = self
            .pending_remote_offer
            .take()
            .ok_or(SessionError::InvalidState {
                operation: "accept",
                state: self.state,
            })?;
        let peer = self.peer.as_ref().ok_or(SessionError::NoPeerConnection)?;
        if let Some(stream) = self.media.stream() {
            peer.attach_local_stream(stream).await?;
        }
        peer.set_remote_description(offer).await?;
        let flushed = self.candidates.mark_remote_description();
        Self::apply_candidates(peer, flushed).await;
        let answer = peer.create_answer().await?;
        self.signaling
            .emit(
                &self.remote.id,
                SignalingEvent::CallAnswer {
                    target_user_id: self.remote.id.clone(),
                    answer,
                },
            )
            .await?;
        Ok(())
    }

    /// Callee: decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if the session is not `ringing`; teardown still runs
    /// on signaling failure.
    #[tracing::instrument(skip(self), fields(attempt_id = %self.attempt_id, peer = %self.remote.id))]
    pub async fn decline(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Ringing {
            return Err(SessionError::InvalidState {
                operation: "decline",
                state: self.state,
            });
        }
        self.notify(SignalingEvent::CallDecline {
            target_user_id: self.remote.id.clone(),
        })
        .await;
        self.teardown(EndReason::Declined).await;
        Ok(())
    }

    /// Hang up from any active state
    ///
    /// Also valid while still `offering`/`ringing`, so the counter-party's
    /// ringing UI clears.
    #[tracing::instrument(skip(self), fields(attempt_id = %self.attempt_id, peer = %self.remote.id))]
    pub async fn hang_up(&mut self) {
        if !self.state.is_active() {
            return;
        }
        self.notify(SignalingEvent::CallEnd {
            target_user_id: self.remote.id.clone(),
        })
        .await;
        self.teardown(EndReason::HungUp).await;
    }

    /// Caller: apply the remote answer and flush buffered candidates
    ///
    /// Ignored outside `offering`; the session stays `offering` until
    /// connectivity reports an established path.
    #[tracing::instrument(skip(self, answer), fields(attempt_id = %self.attempt_id, peer = %self.remote.id))]
    pub async fn handle_answer(&mut self, answer: SessionDescription) {
        if self.state != SessionState::Offering {
            tracing::debug!(state = ?self.state, "Dropping answer outside offering");
            return;
        }
        let Some(peer) = self.peer.as_ref() else {
            return;
        };
        if let Err(e) = peer.set_remote_description(answer).await {
            tracing::warn!(error = %e, "Remote answer rejected");
            return;
        }
        let flushed = self.candidates.mark_remote_description();
        Self::apply_candidates(peer, flushed).await;
    }

    /// Apply or buffer a remote candidate
    ///
    /// Buffered until the remote description is set; a candidate the agent
    /// rejects is logged and skipped, it never aborts the session.
    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.state.is_active() {
            return;
        }
        match self.candidates.add(candidate) {
            CandidateDisposition::Buffered => {}
            CandidateDisposition::Apply(candidate) => {
                if let Some(peer) = self.peer.as_ref() {
                    if let Err(e) = peer.add_ice_candidate(candidate).await {
                        tracing::warn!(
                            attempt_id = %self.attempt_id,
                            error = %e,
                            "Skipping rejected candidate"
                        );
                    }
                }
            }
        }
    }

    /// Forward a locally discovered candidate to the remote peer
    pub async fn handle_local_candidate(&self, candidate: IceCandidate) {
        if !self.state.is_active() {
            return;
        }
        self.notify(SignalingEvent::CallIceCandidate {
            target_user_id: Some(self.remote.id.clone()),
            from_user_id: None,
            candidate,
        })
        .await;
    }

    /// Record a remote track and surface it to the UI
    pub fn handle_remote_track(&mut self, track: RemoteTrack) {
        if !self.state.is_active() {
            return;
        }
        let kind = track.kind;
        self.remote_tracks.push(track);
        let _ = self.events.send(SessionEvent::RemoteTrackAdded {
            peer: self.remote.id.clone(),
            kind,
        });
    }

    /// React to the normalized connectivity signal
    ///
    /// The first established report moves the session to `connected`, stamps
    /// `started_at`, and starts the timer exactly once. A fatal report tears
    /// the session down; no `call_end` from the peer is required.
    #[tracing::instrument(skip(self), fields(attempt_id = %self.attempt_id, peer = %self.remote.id))]
    pub async fn handle_connectivity(&mut self, connectivity: ConnectivityState) {
        if !self.state.is_active() {
            return;
        }
        if connectivity.is_established() {
            if self.state != SessionState::Connected {
                self.started_at = Some(Utc::now());
                if self.timer.start() {
                    tracing::info!("Call connected");
                }
                self.transition(SessionState::Connected);
            }
        } else if connectivity.is_fatal() {
            tracing::info!(?connectivity, "Connectivity lost");
            self.teardown(EndReason::ConnectivityLost).await;
        }
    }

    /// Abort a session whose setup (capture or agent creation) failed
    ///
    /// A ringing callee still notifies the caller so their screen clears;
    /// a caller that never sent its offer has nothing to notify.
    pub async fn cancel_setup(&mut self, reason: EndReason) {
        if self.role == CallRole::Callee && self.state == SessionState::Ringing {
            self.notify(SignalingEvent::CallDecline {
                target_user_id: self.remote.id.clone(),
            })
            .await;
        }
        self.teardown(reason).await;
    }

    /// Remote peer hung up; no further notification is sent back
    pub async fn handle_remote_end(&mut self) {
        self.teardown(EndReason::RemoteHangup).await;
    }

    /// Remote peer declined our offer
    pub async fn handle_remote_declined(&mut self) {
        self.teardown(EndReason::RemoteDeclined).await;
    }

    /// Release everything the session owns and enter `ended`; idempotent
    ///
    /// Runs on every termination path: local hangup/decline, remote
    /// end/decline, connectivity failure, negotiation failure, replacement
    /// by a new attempt. Safe to call twice; the second call is a no-op.
    #[tracing::instrument(skip(self), fields(attempt_id = %self.attempt_id, peer = %self.remote.id))]
    pub async fn teardown(&mut self, reason: EndReason) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.media.release();
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        self.candidates.clear();
        self.pending_remote_offer = None;
        self.timer.stop();
        self.transition(SessionState::Ended);
        tracing::info!(reason = %reason.describe(), "Session ended");
        let _ = self.events.send(SessionEvent::Ended {
            peer: self.remote.id.clone(),
            reason,
        });
    }

    async fn apply_candidates(peer: &PeerConnectionManager, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Skipping rejected buffered candidate");
            }
        }
    }

    fn transition(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?state, "State transition");
        self.state = state;
        let _ = self.events.send(SessionEvent::StateChanged {
            peer: self.remote.id.clone(),
            state,
        });
    }

    async fn notify(&self, event: SignalingEvent) {
        let name = event.name();
        if let Err(e) = self.signaling.emit(&self.remote.id, event).await {
            tracing::warn!(event = name, error = %e, "Signaling emission failed");
        }
    }
}
