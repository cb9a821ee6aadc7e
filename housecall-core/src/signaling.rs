//! Call signaling over the visit platform's message bus
//!
//! The bus is already authenticated and addressed by target user id. It
//! guarantees neither delivery nor ordering across event kinds; in
//! particular, candidates may arrive before the offer or answer they belong
//! to. Higher layers must tolerate duplicates and loss.

use crate::participant::{Participant, Role, UserId};
use crate::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Event kind cannot be emitted by a client (relay-originated form)
    #[error("event {0} is relay-originated and cannot be emitted")]
    NotClientEmittable(&'static str),

    /// Underlying transport failed
    #[error("transport error: {0}")]
    TransportError(String),
}

/// Signaling event as exchanged over the bus
///
/// Client-emitted events carry a `targetUserId`; the relay rewrites them into
/// their counterpart form before delivery (initiate→incoming,
/// answer→answered, end→ended, decline→declined, target→from).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingEvent {
    /// Caller starts a call (caller → relay)
    #[serde(rename_all = "camelCase")]
    CallInitiate {
        /// Who is being called
        target_user_id: UserId,
        /// Visit this call belongs to
        service_id: String,
        /// SDP offer
        offer: SessionDescription,
        /// Caller display name for the ringing screen
        caller_name: String,
    },

    /// Incoming call notification (relay → callee)
    #[serde(rename_all = "camelCase")]
    CallIncoming {
        /// Caller user id
        caller_id: UserId,
        /// Caller display name
        caller_name: String,
        /// Caller clinical role
        caller_role: Role,
        /// Visit this call belongs to
        service_id: String,
        /// SDP offer
        offer: SessionDescription,
    },

    /// Callee answers (callee → relay)
    #[serde(rename_all = "camelCase")]
    CallAnswer {
        /// The caller
        target_user_id: UserId,
        /// SDP answer
        answer: SessionDescription,
    },

    /// Answer notification (relay → caller)
    #[serde(rename_all = "camelCase")]
    CallAnswered {
        /// Who answered
        answerer_id: UserId,
        /// SDP answer
        answer: SessionDescription,
    },

    /// ICE candidate, either direction
    ///
    /// Sent with `targetUserId`; received with `fromUserId`.
    #[serde(rename_all = "camelCase")]
    CallIceCandidate {
        /// Addressee when emitting
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<UserId>,
        /// Originator when receiving
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<UserId>,
        /// The candidate
        candidate: IceCandidate,
    },

    /// Hang up (either → relay)
    #[serde(rename_all = "camelCase")]
    CallEnd {
        /// The other party
        target_user_id: UserId,
    },

    /// Decline a ringing call (callee → relay)
    #[serde(rename_all = "camelCase")]
    CallDecline {
        /// The caller
        target_user_id: UserId,
    },

    /// Hang-up notification (relay → other party)
    CallEnded {},

    /// Decline notification (relay → caller)
    CallDeclined {},
}

impl SignalingEvent {
    /// Wire name, for tracing
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallInitiate { .. } => "call_initiate",
            Self::CallIncoming { .. } => "call_incoming",
            Self::CallAnswer { .. } => "call_answer",
            Self::CallAnswered { .. } => "call_answered",
            Self::CallIceCandidate { .. } => "call_ice_candidate",
            Self::CallEnd { .. } => "call_end",
            Self::CallDecline { .. } => "call_decline",
            Self::CallEnded {} => "call_ended",
            Self::CallDeclined {} => "call_declined",
        }
    }

    /// Addressee of a client-emitted event, if it has one
    pub fn target(&self) -> Option<&UserId> {
        match self {
            Self::CallInitiate { target_user_id, .. }
            | Self::CallAnswer { target_user_id, .. }
            | Self::CallEnd { target_user_id }
            | Self::CallDecline { target_user_id } => Some(target_user_id),
            Self::CallIceCandidate { target_user_id, .. } => target_user_id.as_ref(),
            _ => None,
        }
    }
}

/// Handle to the signaling bus for one authenticated user session
///
/// Each call session receives its own explicit handle rather than reaching
/// for a shared connection singleton, so listener state never leaks between
/// sessions.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Emit an event addressed to `to`
    ///
    /// Delivery is best-effort; a missing counter-party is not an error.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying transport rejects the event.
    async fn emit(&self, to: &UserId, event: SignalingEvent) -> Result<(), SignalingError>;
}

/// Inbound signaling event paired with its originator
pub type InboundEvent = (UserId, SignalingEvent);

/// In-process signaling relay
///
/// Routes events between registered participants with the same rewriting the
/// production relay performs, and records every emitted event so tests can
/// assert on the wire. Used by the CLI loopback demo and the integration
/// suites.
#[derive(Default)]
pub struct LocalRelay {
    inner: Mutex<RelayInner>,
}

#[derive(Default)]
struct RelayInner {
    participants: HashMap<UserId, Participant>,
    inboxes: HashMap<UserId, mpsc::UnboundedSender<InboundEvent>>,
    sent: Vec<(UserId, SignalingEvent)>,
}

impl LocalRelay {
    /// Create an empty relay
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a participant and obtain their channel handle plus inbox
    pub fn register(
        self: &Arc<Self>,
        participant: Participant,
    ) -> (Arc<RelayEndpoint>, mpsc::UnboundedReceiver<InboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let user = participant.id.clone();
        {
            let mut inner = self.inner.lock();
            inner.participants.insert(user.clone(), participant);
            inner.inboxes.insert(user.clone(), tx);
        }
        let endpoint = Arc::new(RelayEndpoint {
            relay: Arc::clone(self),
            user,
        });
        (endpoint, rx)
    }

    /// Every event emitted through this relay, in emission order
    pub fn sent_events(&self) -> Vec<(UserId, SignalingEvent)> {
        self.inner.lock().sent.clone()
    }

    fn route(
        &self,
        from: &UserId,
        to: &UserId,
        event: SignalingEvent,
    ) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        inner.sent.push((from.clone(), event.clone()));

        let delivered = match event {
            SignalingEvent::CallInitiate {
                service_id,
                offer,
                caller_name,
                ..
            } => {
                let caller_role = inner
                    .participants
                    .get(from)
                    .map(|p| p.role)
                    .unwrap_or(Role::Admin);
                SignalingEvent::CallIncoming {
                    caller_id: from.clone(),
                    caller_name,
                    caller_role,
                    service_id,
                    offer,
                }
            }
            SignalingEvent::CallAnswer { answer, .. } => SignalingEvent::CallAnswered {
                answerer_id: from.clone(),
                answer,
            },
            SignalingEvent::CallIceCandidate { candidate, .. } => {
                SignalingEvent::CallIceCandidate {
                    target_user_id: None,
                    from_user_id: Some(from.clone()),
                    candidate,
                }
            }
            SignalingEvent::CallEnd { .. } => SignalingEvent::CallEnded {},
            SignalingEvent::CallDecline { .. } => SignalingEvent::CallDeclined {},
            other => return Err(SignalingError::NotClientEmittable(other.name())),
        };

        match inner.inboxes.get(to) {
            Some(inbox) => {
                // A dropped inbox means the user went away; the bus offers no
                // delivery guarantee, so this is not an error.
                if inbox.send((from.clone(), delivered)).is_err() {
                    tracing::debug!(to = %to, "Dropping event for departed participant");
                }
            }
            None => {
                tracing::debug!(to = %to, "Dropping event for unknown participant");
            }
        }
        Ok(())
    }
}

/// Per-user handle onto a [`LocalRelay`]
pub struct RelayEndpoint {
    relay: Arc<LocalRelay>,
    user: UserId,
}

impl RelayEndpoint {
    /// The user this handle emits as
    pub fn user(&self) -> &UserId {
        &self.user
    }
}

#[async_trait]
impl SignalingChannel for RelayEndpoint {
    async fn emit(&self, to: &UserId, event: SignalingEvent) -> Result<(), SignalingError> {
        tracing::trace!(from = %self.user, to = %to, event = event.name(), "Emitting signaling event");
        self.relay.route(&self.user, to, event)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn doctor() -> Participant {
        Participant::new("doc-1", "Dr. Reyes", Role::Doctor)
    }

    fn nurse() -> Participant {
        Participant::new("nurse-1", "A. Okafor", Role::Nurse)
    }

    #[tokio::test]
    async fn test_initiate_rewritten_to_incoming() {
        let relay = LocalRelay::new();
        let (doc, _doc_rx) = relay.register(doctor());
        let (_nur, mut nur_rx) = relay.register(nurse());

        doc.emit(
            &UserId::new("nurse-1"),
            SignalingEvent::CallInitiate {
                target_user_id: UserId::new("nurse-1"),
                service_id: "visit-9".to_string(),
                offer: SessionDescription::offer("v=0\r\n"),
                caller_name: "Dr. Reyes".to_string(),
            },
        )
        .await
        .unwrap();

        let (from, event) = nur_rx.recv().await.unwrap();
        assert_eq!(from, UserId::new("doc-1"));
        match event {
            SignalingEvent::CallIncoming {
                caller_id,
                caller_role,
                service_id,
                ..
            } => {
                assert_eq!(caller_id, UserId::new("doc-1"));
                assert_eq!(caller_role, Role::Doctor);
                assert_eq!(service_id, "visit-9");
            }
            other => unreachable!("expected call_incoming, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_candidate_rewritten_to_from_form() {
        let relay = LocalRelay::new();
        let (doc, _doc_rx) = relay.register(doctor());
        let (_nur, mut nur_rx) = relay.register(nurse());

        doc.emit(
            &UserId::new("nurse-1"),
            SignalingEvent::CallIceCandidate {
                target_user_id: Some(UserId::new("nurse-1")),
                from_user_id: None,
                candidate: IceCandidate {
                    candidate: "candidate:1 1 UDP 1 10.0.0.1 4444 typ host".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                },
            },
        )
        .await
        .unwrap();

        let (_, event) = nur_rx.recv().await.unwrap();
        match event {
            SignalingEvent::CallIceCandidate {
                target_user_id,
                from_user_id,
                ..
            } => {
                assert_eq!(target_user_id, None);
                assert_eq!(from_user_id, Some(UserId::new("doc-1")));
            }
            other => unreachable!("expected call_ice_candidate, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_unknown_target_dropped_silently() {
        let relay = LocalRelay::new();
        let (doc, _doc_rx) = relay.register(doctor());

        let result = doc
            .emit(
                &UserId::new("nobody"),
                SignalingEvent::CallEnd {
                    target_user_id: UserId::new("nobody"),
                },
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_relay_form_events_not_emittable() {
        let relay = LocalRelay::new();
        let (doc, _doc_rx) = relay.register(doctor());

        let result = doc
            .emit(&UserId::new("nurse-1"), SignalingEvent::CallEnded {})
            .await;
        assert!(matches!(
            result,
            Err(SignalingError::NotClientEmittable("call_ended"))
        ));
    }

    #[test]
    fn test_wire_format() {
        let event = SignalingEvent::CallInitiate {
            target_user_id: UserId::new("nurse-1"),
            service_id: "visit-9".to_string(),
            offer: SessionDescription::offer("v=0\r\n"),
            caller_name: "Dr. Reyes".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"call_initiate\""));
        assert!(json.contains("\"targetUserId\":\"nurse-1\""));
        assert!(json.contains("\"serviceId\":\"visit-9\""));
        assert!(json.contains("\"callerName\""));

        let back: SignalingEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_ended_payload_is_empty() {
        let json = serde_json::to_string(&SignalingEvent::CallEnded {}).unwrap();
        assert_eq!(json, "{\"type\":\"call_ended\"}");
    }
}
