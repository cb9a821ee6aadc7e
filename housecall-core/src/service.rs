//! Call coordination service
//!
//! [`CallService`] owns the session table and the event router for one
//! authenticated user. It keys sessions by remote peer id, enforces one
//! active session per peer, routes inbound signaling and peer connection
//! events to the right session, and silently drops events addressed to a
//! session that no longer exists.

use crate::media::{CaptureSource, MediaGateway};
use crate::participant::Participant;
use crate::peer::{PeerConnectionManager, PeerError, PeerEvent, SdpAgentFactory};
use crate::session::{CallSession, SessionError};
use crate::signaling::{InboundEvent, SignalingChannel, SignalingEvent};
use crate::participant::UserId;
use crate::types::{
    AttemptId, EndReason, MediaConstraints, RtcConfig, SessionEvent, SessionState,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

/// Service-level call errors
#[derive(Error, Debug)]
pub enum CallServiceError {
    /// Capture devices unavailable
    #[error("media error: {0}")]
    Media(#[from] crate::media::MediaError),

    /// Session state machine rejected the operation
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Peer connection could not be set up
    #[error("peer connection error: {0}")]
    Peer(#[from] PeerError),

    /// No active session for the given peer
    #[error("no active call with {0}")]
    NoActiveCall(UserId),

    /// The session ended while setup was still in flight
    #[error("call attempt canceled before setup completed")]
    Canceled,
}

/// Static service configuration
#[derive(Debug, Clone, Default)]
pub struct CallConfig {
    /// STUN/TURN servers handed to every new peer connection
    pub rtc: RtcConfig,
    /// Default capture constraints
    pub media: MediaConstraints,
}

type SessionTable = Arc<RwLock<HashMap<UserId, CallSession>>>;

/// Per-user call coordinator
///
/// Dropping the service aborts the router; call [`CallService::shutdown`]
/// first to hang up cleanly.
pub struct CallService {
    local: Participant,
    signaling: Arc<dyn SignalingChannel>,
    capture: Arc<dyn CaptureSource>,
    agents: Arc<dyn SdpAgentFactory>,
    config: CallConfig,
    sessions: SessionTable,
    events: broadcast::Sender<SessionEvent>,
    peer_events: mpsc::UnboundedSender<(UserId, PeerEvent)>,
    router: JoinHandle<()>,
}

impl CallService {
    /// Create the service and start routing `inbound` signaling events
    pub fn new(
        local: Participant,
        signaling: Arc<dyn SignalingChannel>,
        capture: Arc<dyn CaptureSource>,
        agents: Arc<dyn SdpAgentFactory>,
        config: CallConfig,
        inbound: mpsc::UnboundedReceiver<InboundEvent>,
    ) -> Self {
        let sessions: SessionTable = Arc::new(RwLock::new(HashMap::new()));
        let (events, _) = broadcast::channel(256);
        let (peer_events, peer_events_rx) = mpsc::unbounded_channel();

        let router = tokio::spawn(route_events(Router {
            local: local.clone(),
            signaling: Arc::clone(&signaling),
            capture: Arc::clone(&capture),
            sessions: Arc::clone(&sessions),
            events: events.clone(),
            inbound,
            peer_events: peer_events_rx,
        }));

        Self {
            local,
            signaling,
            capture,
            agents,
            config,
            sessions,
            events,
            peer_events,
            router,
        }
    }

    /// The local participant this service acts for
    pub fn local(&self) -> &Participant {
        &self.local
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start an outbound call with the service's default constraints
    ///
    /// # Errors
    ///
    /// Returns error if capture, peer setup, or negotiation fails; the
    /// session is torn down and no `call_initiate` has been sent.
    pub async fn start_call(
        &self,
        remote: Participant,
        service_id: &str,
    ) -> Result<(), CallServiceError> {
        self.start_call_with(remote, service_id, self.config.media)
            .await
    }

    /// Start an outbound call with explicit constraints
    ///
    /// If a session for this peer is already active it is torn down first;
    /// exactly one old session ends before the new attempt begins.
    ///
    /// # Errors
    ///
    /// Returns error if capture, peer setup, or negotiation fails.
    #[tracing::instrument(skip(self, remote), fields(local = %self.local.id, peer = %remote.id, service_id))]
    pub async fn start_call_with(
        &self,
        remote: Participant,
        service_id: &str,
        constraints: MediaConstraints,
    ) -> Result<(), CallServiceError> {
        let attempt_id = {
            let mut sessions = self.sessions.write().await;
            if let Some(mut old) = sessions.remove(&remote.id) {
                tracing::info!("Replacing active session with new attempt");
                old.teardown(EndReason::Replaced).await;
            }
            let session = CallSession::outgoing(
                self.local.clone(),
                remote.clone(),
                service_id,
                MediaGateway::new(Arc::clone(&self.capture)),
                Arc::clone(&self.signaling),
                self.events.clone(),
            );
            let attempt_id = session.attempt_id();
            sessions.insert(remote.id.clone(), session);
            attempt_id
        };

        // Device acquisition suspends; the table stays unlocked so inbound
        // events keep flowing meanwhile.
        let stream = match self.capture.acquire(&constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_setup(&remote.id, attempt_id, EndReason::MediaUnavailable(e.to_string()))
                    .await;
                return Err(e.into());
            }
        };
        let (agent, agent_rx) = match self.agents.create_agent(&self.config.rtc).await {
            Ok(pair) => pair,
            Err(e) => {
                stream.release();
                self.fail_setup(&remote.id, attempt_id, EndReason::ConnectivityLost)
                    .await;
                return Err(e.into());
            }
        };

        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions
            .get_mut(&remote.id)
            .filter(|s| s.attempt_id() == attempt_id && s.state().is_active())
        else {
            // The session died while acquisition was in flight.
            stream.release();
            let _ = agent.close().await;
            return Err(CallServiceError::Canceled);
        };
        session.media_mut().adopt(stream);
        if let Err(rejected) = session.attach_peer(PeerConnectionManager::new(
            agent,
            agent_rx,
            self.tagged_peer_sender(remote.id.clone()),
        )) {
            rejected.close().await;
            return Err(SessionError::AlreadyAnswered.into());
        }
        if let Err(e) = session.start().await {
            sessions.remove(&remote.id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Accept a ringing incoming call
    ///
    /// Media is acquired only now; on failure the caller is notified via
    /// `call_decline` so their ringing screen clears.
    ///
    /// # Errors
    ///
    /// Returns error if no session is ringing for `peer_id`, if the ring
    /// was already answered, or if capture, peer setup, or negotiation
    /// fails.
    #[tracing::instrument(skip(self), fields(local = %self.local.id, peer = %peer_id))]
    pub async fn accept(&self, peer_id: &UserId) -> Result<(), CallServiceError> {
        let attempt_id = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(peer_id)
                .ok_or_else(|| CallServiceError::NoActiveCall(peer_id.clone()))?;
            if session.state() != SessionState::Ringing {
                return Err(SessionError::InvalidState {
                    operation: "accept",
                    state: session.state(),
                }
                .into());
            }
            // An answered callee stays ringing until connectivity; a second
            // accept must not rebuild its connection.
            if session.peer_attached() {
                return Err(SessionError::AlreadyAnswered.into());
            }
            session.attempt_id()
        };

        let stream = match self.capture.acquire(&self.config.media).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_setup(peer_id, attempt_id, EndReason::MediaUnavailable(e.to_string()))
                    .await;
                return Err(e.into());
            }
        };
        let (agent, agent_rx) = match self.agents.create_agent(&self.config.rtc).await {
            Ok(pair) => pair,
            Err(e) => {
                stream.release();
                self.fail_setup(peer_id, attempt_id, EndReason::ConnectivityLost)
                    .await;
                return Err(e.into());
            }
        };

        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions
            .get_mut(peer_id)
            .filter(|s| {
                s.attempt_id() == attempt_id
                    && s.state() == SessionState::Ringing
                    && !s.peer_attached()
            })
        else {
            stream.release();
            let _ = agent.close().await;
            return Err(CallServiceError::Canceled);
        };
        session.media_mut().adopt(stream);
        if let Err(rejected) = session.attach_peer(PeerConnectionManager::new(
            agent,
            agent_rx,
            self.tagged_peer_sender(peer_id.clone()),
        )) {
            rejected.close().await;
            return Err(SessionError::AlreadyAnswered.into());
        }
        if let Err(e) = session.accept().await {
            sessions.remove(peer_id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Decline a ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns error if no session is ringing for `peer_id`.
    #[tracing::instrument(skip(self), fields(local = %self.local.id, peer = %peer_id))]
    pub async fn decline(&self, peer_id: &UserId) -> Result<(), CallServiceError> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(peer_id) else {
            return Err(CallServiceError::NoActiveCall(peer_id.clone()));
        };
        session.decline().await?;
        sessions.remove(peer_id);
        Ok(())
    }

    /// Hang up the call with `peer_id`, from any active state
    ///
    /// # Errors
    ///
    /// Returns error if no session exists for `peer_id`.
    #[tracing::instrument(skip(self), fields(local = %self.local.id, peer = %peer_id))]
    pub async fn hang_up(&self, peer_id: &UserId) -> Result<(), CallServiceError> {
        let Some(mut session) = self.sessions.write().await.remove(peer_id) else {
            return Err(CallServiceError::NoActiveCall(peer_id.clone()));
        };
        session.hang_up().await;
        Ok(())
    }

    /// Mute or unmute the local microphone for the call with `peer_id`
    ///
    /// # Errors
    ///
    /// Returns error if no session or no local stream exists.
    pub async fn set_audio_enabled(
        &self,
        peer_id: &UserId,
        enabled: bool,
    ) -> Result<(), CallServiceError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(peer_id)
            .ok_or_else(|| CallServiceError::NoActiveCall(peer_id.clone()))?;
        session.media().set_audio_enabled(enabled)?;
        Ok(())
    }

    /// Enable or disable the local camera for the call with `peer_id`
    ///
    /// # Errors
    ///
    /// Returns error if no session or no local stream exists.
    pub async fn set_video_enabled(
        &self,
        peer_id: &UserId,
        enabled: bool,
    ) -> Result<(), CallServiceError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(peer_id)
            .ok_or_else(|| CallServiceError::NoActiveCall(peer_id.clone()))?;
        session.media().set_video_enabled(enabled)?;
        Ok(())
    }

    /// Current state of the session with `peer_id`, if one exists
    pub async fn call_state(&self, peer_id: &UserId) -> Option<SessionState> {
        self.sessions.read().await.get(peer_id).map(|s| s.state())
    }

    /// When the session with `peer_id` first connected
    pub async fn call_started_at(&self, peer_id: &UserId) -> Option<DateTime<Utc>> {
        self.sessions
            .read()
            .await
            .get(peer_id)
            .and_then(|s| s.started_at())
    }

    /// Running duration of the session with `peer_id`, once connected
    pub async fn call_duration(&self, peer_id: &UserId) -> Option<Duration> {
        self.sessions
            .read()
            .await
            .get(peer_id)
            .and_then(|s| s.timer().elapsed())
    }

    /// Peers with an active session
    pub async fn active_calls(&self) -> Vec<UserId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Hang up everything and stop routing
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, mut session) in sessions.drain() {
            session.hang_up().await;
        }
        self.router.abort();
    }

    /// Per-session sender that tags peer events with the remote id
    fn tagged_peer_sender(&self, peer_id: UserId) -> mpsc::UnboundedSender<PeerEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let out = self.peer_events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if out.send((peer_id.clone(), event)).is_err() {
                    break;
                }
            }
        });
        tx
    }

    /// Tear down a session whose setup failed, if it is still the same attempt
    async fn fail_setup(
        &self,
        peer_id: &UserId,
        attempt_id: AttemptId,
        reason: EndReason,
    ) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions
            .get_mut(peer_id)
            .filter(|s| s.attempt_id() == attempt_id)
        {
            session.cancel_setup(reason).await;
            sessions.remove(peer_id);
        }
    }
}

impl Drop for CallService {
    fn drop(&mut self) {
        self.router.abort();
    }
}

struct Router {
    local: Participant,
    signaling: Arc<dyn SignalingChannel>,
    capture: Arc<dyn CaptureSource>,
    sessions: SessionTable,
    events: broadcast::Sender<SessionEvent>,
    inbound: mpsc::UnboundedReceiver<InboundEvent>,
    peer_events: mpsc::UnboundedReceiver<(UserId, PeerEvent)>,
}

async fn route_events(mut router: Router) {
    loop {
        tokio::select! {
            inbound = router.inbound.recv() => match inbound {
                Some((from, event)) => handle_signal(&mut router, from, event).await,
                None => break,
            },
            Some((peer_id, event)) = router.peer_events.recv() => {
                handle_peer_event(&mut router, peer_id, event).await;
            }
        }
    }
    tracing::debug!(local = %router.local.id, "Signaling stream closed, router stopping");
}

async fn handle_signal(router: &mut Router, from: UserId, event: SignalingEvent) {
    tracing::debug!(local = %router.local.id, %from, event = event.name(), "Inbound signaling event");
    match event {
        SignalingEvent::CallIncoming {
            caller_id,
            caller_name,
            caller_role,
            service_id,
            offer,
        } => {
            let mut sessions = router.sessions.write().await;
            if sessions.get(&caller_id).is_some_and(|s| s.state().is_active()) {
                tracing::debug!(%caller_id, "Duplicate incoming call ignored");
                return;
            }
            let caller = Participant::new(caller_id.clone(), caller_name, caller_role);
            let session = CallSession::incoming(
                router.local.clone(),
                caller.clone(),
                service_id.clone(),
                offer,
                MediaGateway::new(Arc::clone(&router.capture)),
                Arc::clone(&router.signaling),
                router.events.clone(),
            );
            sessions.insert(caller_id.clone(), session);
            let _ = router.events.send(SessionEvent::IncomingCall { caller, service_id });
            let _ = router.events.send(SessionEvent::StateChanged {
                peer: caller_id,
                state: SessionState::Ringing,
            });
        }
        SignalingEvent::CallAnswered { answerer_id, answer } => {
            let mut sessions = router.sessions.write().await;
            match sessions.get_mut(&answerer_id) {
                Some(session) => session.handle_answer(answer).await,
                None => tracing::debug!(%answerer_id, "Answer for unknown session dropped"),
            }
        }
        SignalingEvent::CallIceCandidate {
            from_user_id,
            candidate,
            ..
        } => {
            let peer_id = from_user_id.unwrap_or(from);
            let mut sessions = router.sessions.write().await;
            match sessions.get_mut(&peer_id) {
                Some(session) => session.handle_remote_candidate(candidate).await,
                None => tracing::debug!(%peer_id, "Candidate for unknown session dropped"),
            }
        }
        SignalingEvent::CallEnded {} => {
            let mut sessions = router.sessions.write().await;
            match sessions.remove(&from) {
                Some(mut session) => session.handle_remote_end().await,
                None => tracing::debug!(%from, "End for unknown session dropped"),
            }
        }
        SignalingEvent::CallDeclined {} => {
            let mut sessions = router.sessions.write().await;
            match sessions.remove(&from) {
                Some(mut session) => session.handle_remote_declined().await,
                None => tracing::debug!(%from, "Decline for unknown session dropped"),
            }
        }
        other => {
            // Client-emitted forms never arrive on the inbound stream.
            tracing::debug!(event = other.name(), "Unexpected inbound event ignored");
        }
    }
}

async fn handle_peer_event(router: &mut Router, peer_id: UserId, event: PeerEvent) {
    match event {
        PeerEvent::LocalCandidate(candidate) => {
            let sessions = router.sessions.read().await;
            if let Some(session) = sessions.get(&peer_id) {
                session.handle_local_candidate(candidate).await;
            }
        }
        PeerEvent::RemoteTrack(track) => {
            let mut sessions = router.sessions.write().await;
            if let Some(session) = sessions.get_mut(&peer_id) {
                session.handle_remote_track(track);
            }
        }
        PeerEvent::Connectivity(connectivity) => {
            let mut sessions = router.sessions.write().await;
            if let Some(session) = sessions.get_mut(&peer_id) {
                session.handle_connectivity(connectivity).await;
                if !session.state().is_active() {
                    sessions.remove(&peer_id);
                }
            }
        }
    }
}
