//! Service-level guard and monotonicity tests
//!
//! State sequences, the single-session-per-peer rule, duplicate-ring and
//! stale-event handling, all driven through two real services on one relay.

use housecall_core::peer::AgentEvent;
use housecall_core::prelude::*;
use housecall_core::signaling::{LocalRelay, RelayEndpoint, SignalingChannel};
use housecall_core::testing::{FakeCaptureSource, MockAgentFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct TestPair {
    factory: Arc<MockAgentFactory>,
    doctor: Participant,
    nurse: Participant,
    doctor_service: CallService,
    nurse_service: CallService,
    doctor_channel: Arc<RelayEndpoint>,
    nurse_channel: Arc<RelayEndpoint>,
}

fn pair() -> TestPair {
    let relay = LocalRelay::new();
    let factory = MockAgentFactory::new();
    let doctor = Participant::new("doctor-1", "Dr. Bello", Role::Doctor);
    let nurse = Participant::new("nurse-1", "Nurse Adeyemi", Role::Nurse);
    let (doctor_channel, doctor_inbound) = relay.register(doctor.clone());
    let (nurse_channel, nurse_inbound) = relay.register(nurse.clone());

    let doctor_service = CallService::new(
        doctor.clone(),
        doctor_channel.clone(),
        FakeCaptureSource::new(),
        factory.clone(),
        CallConfig::default(),
        doctor_inbound,
    );
    let nurse_service = CallService::new(
        nurse.clone(),
        nurse_channel.clone(),
        FakeCaptureSource::new(),
        factory.clone(),
        CallConfig::default(),
        nurse_inbound,
    );
    TestPair {
        factory,
        doctor,
        nurse,
        doctor_service,
        nurse_service,
        doctor_channel,
        nurse_channel,
    }
}

async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn ring_nurse(p: &TestPair) {
    let mut nurse_events = p.nurse_service.subscribe();
    p.doctor_service
        .start_call(p.nurse.clone(), "visit-7")
        .await
        .unwrap();
    loop {
        if matches!(
            next_event(&mut nurse_events).await,
            SessionEvent::IncomingCall { .. }
        ) {
            break;
        }
    }
}

#[tokio::test]
async fn state_sequence_is_a_prefix_of_the_lifecycle_order() {
    let p = pair();
    let mut doctor_events = p.doctor_service.subscribe();
    ring_nurse(&p).await;
    p.nurse_service.accept(&p.doctor.id).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while p.factory.agents().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    p.factory.agents()[0].inject(AgentEvent::Connectivity(ConnectivityState::Connected));

    tokio::time::timeout(Duration::from_secs(2), async {
        while p.doctor_service.call_state(&p.nurse.id).await != Some(SessionState::Connected) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    p.doctor_service.hang_up(&p.nurse.id).await.unwrap();

    let mut states = Vec::new();
    while let Ok(event) = doctor_events.try_recv() {
        if let SessionEvent::StateChanged { state, .. } = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            SessionState::Offering,
            SessionState::Connected,
            SessionState::Ended
        ]
    );
}

#[tokio::test]
async fn second_incoming_call_for_active_session_is_ignored() {
    let p = pair();
    let mut nurse_events = p.nurse_service.subscribe();
    ring_nurse(&p).await;
    while nurse_events.try_recv().is_ok() {}

    // A straggler initiate from the same caller while the first still rings.
    p.doctor_channel
        .emit(
            &p.nurse.id,
            SignalingEvent::CallInitiate {
                target_user_id: p.nurse.id.clone(),
                service_id: "visit-7".to_string(),
                offer: SessionDescription::offer("v=0\r\n"),
                caller_name: p.doctor.display_name.clone(),
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rings = std::iter::from_fn(|| nurse_events.try_recv().ok())
        .filter(|e| matches!(e, SessionEvent::IncomingCall { .. }))
        .count();
    assert_eq!(rings, 0, "duplicate ring must not surface");
    assert_eq!(
        p.nurse_service.call_state(&p.doctor.id).await,
        Some(SessionState::Ringing)
    );
}

#[tokio::test]
async fn stale_candidate_and_end_events_are_no_ops() {
    let p = pair();
    ring_nurse(&p).await;
    p.doctor_service.hang_up(&p.nurse.id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while p.nurse_service.call_state(&p.doctor.id).await.is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Late candidate and a second end, both for a session that is gone.
    p.nurse_channel
        .emit(
            &p.doctor.id,
            SignalingEvent::CallIceCandidate {
                target_user_id: Some(p.doctor.id.clone()),
                from_user_id: None,
                candidate: IceCandidate {
                    candidate: "candidate:9 1 UDP 1 10.0.0.9 5000 typ host".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                },
            },
        )
        .await
        .unwrap();
    p.nurse_channel
        .emit(
            &p.doctor.id,
            SignalingEvent::CallEnd {
                target_user_id: p.doctor.id.clone(),
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(p.doctor_service.call_state(&p.nurse.id).await, None);
    assert!(p.doctor_service.active_calls().await.is_empty());
}

#[tokio::test]
async fn hang_up_without_session_is_an_error() {
    let p = pair();
    let result = p.doctor_service.hang_up(&p.nurse.id).await;
    assert!(matches!(result, Err(CallServiceError::NoActiveCall(_))));
}

#[tokio::test]
async fn accept_outside_ringing_is_rejected() {
    let p = pair();
    p.doctor_service
        .start_call(p.nurse.clone(), "visit-7")
        .await
        .unwrap();
    // The caller side is offering, not ringing.
    let result = p.doctor_service.accept(&p.nurse.id).await;
    assert!(matches!(result, Err(CallServiceError::Session(_))));
    assert_eq!(
        p.doctor_service.call_state(&p.nurse.id).await,
        Some(SessionState::Offering)
    );
}

#[tokio::test]
async fn duplicate_accept_leaves_the_answered_session_intact() {
    let p = pair();
    let mut doctor_events = p.doctor_service.subscribe();
    ring_nurse(&p).await;
    p.nurse_service.accept(&p.doctor.id).await.unwrap();

    let result = p.nurse_service.accept(&p.doctor.id).await;
    assert!(matches!(
        result,
        Err(CallServiceError::Session(SessionError::AlreadyAnswered))
    ));

    // The answered session, and the connection that sent the answer, survive.
    assert_eq!(
        p.nurse_service.call_state(&p.doctor.id).await,
        Some(SessionState::Ringing)
    );
    assert_eq!(p.factory.agents().len(), 2);
    assert!(!p.factory.agents()[1].is_closed());

    // The caller keeps offering and never sees a decline.
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = doctor_events.try_recv() {
        assert!(
            !matches!(event, SessionEvent::Ended { .. }),
            "caller must not observe an ended session"
        );
    }
    assert_eq!(
        p.doctor_service.call_state(&p.nurse.id).await,
        Some(SessionState::Offering)
    );
}

#[tokio::test]
async fn decline_without_ring_is_rejected() {
    let p = pair();
    assert!(matches!(
        p.nurse_service.decline(&p.doctor.id).await,
        Err(CallServiceError::NoActiveCall(_))
    ));
}

#[tokio::test]
async fn callee_media_failure_on_accept_clears_the_caller() {
    let relay = LocalRelay::new();
    let factory = MockAgentFactory::new();
    let doctor = Participant::new("doctor-1", "Dr. Bello", Role::Doctor);
    let nurse = Participant::new("nurse-1", "Nurse Adeyemi", Role::Nurse);
    let (doctor_channel, doctor_inbound) = relay.register(doctor.clone());
    let (nurse_channel, nurse_inbound) = relay.register(nurse.clone());
    let nurse_capture = FakeCaptureSource::new();

    let doctor_service = CallService::new(
        doctor.clone(),
        doctor_channel,
        FakeCaptureSource::new(),
        factory.clone(),
        CallConfig::default(),
        doctor_inbound,
    );
    let nurse_service = CallService::new(
        nurse.clone(),
        nurse_channel,
        nurse_capture.clone(),
        factory,
        CallConfig::default(),
        nurse_inbound,
    );

    let mut doctor_events = doctor_service.subscribe();
    let mut nurse_events = nurse_service.subscribe();
    doctor_service
        .start_call(nurse.clone(), "visit-7")
        .await
        .unwrap();
    loop {
        if matches!(
            next_event(&mut nurse_events).await,
            SessionEvent::IncomingCall { .. }
        ) {
            break;
        }
    }

    nurse_capture.deny();
    let result = nurse_service.accept(&doctor.id).await;
    assert!(matches!(result, Err(CallServiceError::Media(_))));

    // The caller's ringing screen clears via the decline notification.
    loop {
        if let SessionEvent::Ended { reason, .. } = next_event(&mut doctor_events).await {
            assert_eq!(reason, EndReason::RemoteDeclined);
            break;
        }
    }
    assert_eq!(nurse_service.call_state(&doctor.id).await, None);
}
