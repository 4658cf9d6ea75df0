//! Two-party call flow tests over the in-process hub and simulated network

mod common;

use callcore::domain::call::event::CallEvent;
use callcore::domain::call::value_object::{
    CallDirection, CallKind, CallOutcome, EndReason, PeerLinkState, SessionState,
};
use callcore::domain::shared::value_objects::ParticipantId;
use callcore::config::CallConfig;
use callcore::domain::call::policy::AllowAll;
use callcore::domain::call::CallHistory;
use callcore::CallError;
use common::{wait_for_state, wait_until, Network};
use std::sync::Arc;
use std::time::Duration;

fn bob() -> ParticipantId {
    ParticipantId::from("bob")
}

fn alice() -> ParticipantId {
    ParticipantId::from("alice")
}

#[tokio::test]
async fn test_voice_call_connects_and_hangs_up() {
    let network = Network::new();
    let mut a = network.endpoint("alice");
    let mut b = network.endpoint("bob");

    let call = a
        .manager
        .request_outgoing_call(vec![bob()], CallKind::Voice)
        .await
        .unwrap();
    assert_eq!(call.state(), SessionState::Outgoing);
    assert_eq!(call.link_state(&bob()), Some(PeerLinkState::OfferSent));

    let answered = b.answer().await;
    assert_eq!(answered.call_id(), call.call_id());
    assert_eq!(answered.direction(), Some(CallDirection::Incoming));

    wait_for_state(&call, SessionState::Active).await;
    wait_for_state(&answered, SessionState::Active).await;
    assert_eq!(call.link_state(&bob()), Some(PeerLinkState::Connected));
    assert_eq!(answered.link_state(&alice()), Some(PeerLinkState::Connected));
    wait_until(|| a.media.attached() == vec![bob()]).await;
    wait_until(|| b.media.attached() == vec![alice()]).await;
    assert_eq!(call.remote_streams().len(), 1);
    assert!(!call.remote_stream(&bob()).unwrap().has_video());

    let stats = call.stats();
    assert_eq!(stats.connected_links, 1);
    assert!(stats.setup_time.is_some());

    call.end().await;
    wait_for_state(&answered, SessionState::Ended).await;
    assert_eq!(call.state(), SessionState::Ended);
    assert_eq!(answered.end_reason(), Some(EndReason::RemoteHangup));
    assert!(a.manager.current_session().is_none());
    assert!(b.manager.current_session().is_none());
    assert!(call.remote_streams().is_empty());

    assert_eq!(a.media.acquired(), 1);
    assert_eq!(a.media.released(), 1);
    wait_until(|| b.media.released() == 1).await;

    let outgoing = a.history.recent(10).await.unwrap();
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].direction, CallDirection::Outgoing);
    assert_eq!(outgoing[0].outcome, CallOutcome::Completed);
    assert!(outgoing[0].answered_at.is_some());
    let incoming = b.history.recent(10).await.unwrap();
    assert_eq!(incoming[0].outcome, CallOutcome::Completed);
    assert_eq!(incoming[0].remote_participants, vec![alice()]);

    let events = a.drain_events();
    assert!(events.iter().any(|envelope| matches!(
        &envelope.event,
        CallEvent::RemoteStreamAttached { participant, has_video: false, .. } if *participant == bob()
    )));
    let states: Vec<SessionState> = events
        .into_iter()
        .filter_map(|envelope| match envelope.event {
            CallEvent::SessionStateChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Outgoing,
            SessionState::Connecting,
            SessionState::Active,
            SessionState::Ended
        ]
    );
    assert!(b
        .drain_events()
        .iter()
        .any(|envelope| matches!(envelope.event, CallEvent::IncomingCall { kind: CallKind::Voice, .. })));
}

#[tokio::test]
async fn test_declined_call() {
    let network = Network::new();
    let a = network.endpoint("alice");
    let b = network.endpoint("bob");

    let call = a
        .manager
        .request_outgoing_call(vec![bob()], CallKind::Video)
        .await
        .unwrap();
    let ringing = b.wait_for_ring().await;
    assert_eq!(ringing.kind(), CallKind::Video);
    ringing.reject_incoming(call.call_id()).await.unwrap();

    wait_for_state(&call, SessionState::Ended).await;
    assert_eq!(call.end_reason(), Some(EndReason::RemoteDeclined));
    assert_eq!(ringing.end_reason(), Some(EndReason::Rejected));
    assert!(ringing.link(&alice()).is_none());
    assert_eq!(b.media.acquired(), 0);

    assert_eq!(a.history.recent(1).await.unwrap()[0].outcome, CallOutcome::Declined);
    assert_eq!(b.history.recent(1).await.unwrap()[0].outcome, CallOutcome::Declined);
}

#[tokio::test]
async fn test_caller_cancels_before_answer() {
    let network = Network::new();
    let a = network.endpoint("alice");
    let b = network.endpoint("bob");

    let call = a
        .manager
        .request_outgoing_call(vec![bob()], CallKind::Voice)
        .await
        .unwrap();
    let ringing = b.wait_for_ring().await;

    call.end().await;
    wait_for_state(&ringing, SessionState::Ended).await;

    assert!(matches!(ringing.accept().await, Err(CallError::SessionEnded(_))));
    assert_eq!(a.history.recent(1).await.unwrap()[0].outcome, CallOutcome::Cancelled);
    assert_eq!(b.history.recent(1).await.unwrap()[0].outcome, CallOutcome::Missed);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let network = Network::new();
    let mut a = network.endpoint("alice");
    let b = network.endpoint("bob");

    let call = a
        .manager
        .request_outgoing_call(vec![bob()], CallKind::Voice)
        .await
        .unwrap();
    let ringing = b.wait_for_ring().await;

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(call.state(), SessionState::Outgoing);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(call.state(), SessionState::Failed);
    assert_eq!(call.end_reason(), Some(EndReason::CallTimedOut));
    assert!(ringing.is_terminal());
    assert_eq!(a.media.released(), 1);

    assert_eq!(a.history.recent(1).await.unwrap()[0].outcome, CallOutcome::TimedOut);
    assert_eq!(b.history.recent(1).await.unwrap()[0].outcome, CallOutcome::Missed);

    let timed_out = a
        .drain_events()
        .iter()
        .any(|envelope| matches!(envelope.event, CallEvent::CallTimedOut { .. }));
    let by_remote = ringing.end_reason() == Some(EndReason::CallTimedOut)
        && call.end_reason() == Some(EndReason::CallTimedOut);
    assert!(timed_out || by_remote);
}

#[tokio::test]
async fn test_video_call_media_controls() {
    let network = Network::new();
    let mut a = network.endpoint("alice");
    let b = network.endpoint("bob");

    let call = a
        .manager
        .request_outgoing_call(vec![bob()], CallKind::Video)
        .await
        .unwrap();
    b.answer().await;
    wait_for_state(&call, SessionState::Active).await;

    let stream = call.local_stream().unwrap();
    assert!(stream.has_video());

    let flags = call.toggle_video();
    assert!(!flags.video_enabled);
    assert!(!stream.video_enabled());
    let flags = call.toggle_mute();
    assert!(flags.muted);
    assert!(!stream.audio_enabled());
    call.toggle_mute();
    assert!(stream.audio_enabled());

    call.switch_camera().await.unwrap();
    assert_eq!(a.media.camera_switches(), 1);

    let flag_events = a
        .drain_events()
        .iter()
        .filter(|envelope| matches!(envelope.event, CallEvent::MediaFlagsChanged { .. }))
        .count();
    assert_eq!(flag_events, 3);

    call.end().await;
    assert_eq!(call.toggle_mute(), call.media_flags());
}

#[tokio::test]
async fn test_ice_restart_recovers_active_call() {
    let network = Network::new();
    let mut a = network.endpoint("alice");
    let b = network.endpoint("bob");

    let call = a
        .manager
        .request_outgoing_call(vec![bob()], CallKind::Voice)
        .await
        .unwrap();
    let answered = b.answer().await;
    wait_for_state(&call, SessionState::Active).await;
    a.drain_events();

    let link = call.link(&bob()).unwrap();
    assert!(network.connections.fail_ice(&bob()).await);

    wait_until(|| link.restarts() == 1 && link.state() == PeerLinkState::Connected).await;
    assert!(!link.is_restarting());
    assert_eq!(call.state(), SessionState::Active);
    assert_eq!(answered.state(), SessionState::Active);

    let events = a.drain_events();
    assert!(events
        .iter()
        .any(|envelope| matches!(envelope.event, CallEvent::LinkFailed { .. })));
    assert!(events.iter().any(|envelope| matches!(
        envelope.event,
        CallEvent::LinkStateChanged { state: PeerLinkState::Disconnected, .. }
    )));
    // Remote media is rendered once, not again after the restart
    assert_eq!(a.media.attached(), vec![bob()]);

    call.end().await;
}

#[tokio::test]
async fn test_ice_failure_without_restarts_fails_call() {
    let network = Network::new();
    let config = CallConfig {
        max_ice_restarts: 0,
        ..CallConfig::default()
    };
    let a = network.endpoint_with("alice", config, Arc::new(AllowAll));
    let b = network.endpoint("bob");

    let call = a
        .manager
        .request_outgoing_call(vec![bob()], CallKind::Voice)
        .await
        .unwrap();
    let answered = b.answer().await;
    wait_for_state(&call, SessionState::Active).await;

    network.connections.fail_ice(&bob()).await;

    wait_for_state(&call, SessionState::Failed).await;
    assert_eq!(call.end_reason(), Some(EndReason::LinksFailed));
    wait_for_state(&answered, SessionState::Failed).await;
    assert_eq!(a.history.recent(1).await.unwrap()[0].outcome, CallOutcome::Failed);
    assert_eq!(a.media.live_streams(), 0);
}

#[tokio::test]
async fn test_unreachable_peer_fails_call() {
    let network = Network::new();
    let a = network.endpoint("alice");
    let b = network.endpoint("bob");
    network.connections.set_reachable(false);

    let call = a
        .manager
        .request_outgoing_call(vec![bob()], CallKind::Voice)
        .await
        .unwrap();
    let ringing = b.wait_for_ring().await;
    let _ = ringing.accept().await;

    wait_for_state(&call, SessionState::Failed).await;
    wait_for_state(&ringing, SessionState::Failed).await;
    assert!(call.stats().answered_at.is_none());
    assert_eq!(a.history.recent(1).await.unwrap()[0].outcome, CallOutcome::Failed);
    assert_eq!(b.history.recent(1).await.unwrap()[0].outcome, CallOutcome::Failed);
}

#[tokio::test]
async fn test_media_denied_frees_the_slot() {
    let network = Network::new();
    let a = network.endpoint("alice");
    let _b = network.endpoint("bob");
    a.media.deny_access(true);

    let err = a
        .manager
        .request_outgoing_call(vec![bob()], CallKind::Video)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::MediaUnavailable(_)));
    assert!(a.manager.current_session().is_none());

    a.media.deny_access(false);
    let call = a
        .manager
        .request_outgoing_call(vec![bob()], CallKind::Voice)
        .await
        .unwrap();
    assert_eq!(call.state(), SessionState::Outgoing);
}

#[tokio::test]
async fn test_second_caller_hears_busy() {
    let network = Network::new();
    let a = network.endpoint("alice");
    let b = network.endpoint("bob");
    let c = network.endpoint("carol");

    let call = a
        .manager
        .request_outgoing_call(vec![bob()], CallKind::Voice)
        .await
        .unwrap();
    b.answer().await;
    wait_for_state(&call, SessionState::Active).await;

    let intruding = c
        .manager
        .request_outgoing_call(vec![alice()], CallKind::Video)
        .await
        .unwrap();
    wait_for_state(&intruding, SessionState::Ended).await;
    assert_eq!(intruding.end_reason(), Some(EndReason::RemoteBusy));
    assert_eq!(c.history.recent(1).await.unwrap()[0].outcome, CallOutcome::Busy);
    assert_eq!(c.media.live_streams(), 0);

    let current = a.manager.current_session().unwrap();
    assert_eq!(current.call_id(), call.call_id());
    assert_eq!(call.state(), SessionState::Active);

    call.end().await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_ice_restart_fails_call() {
    let network = Network::new();
    let a = network.endpoint("alice");
    let b = network.endpoint("bob");

    let call = a
        .manager
        .request_outgoing_call(vec![bob()], CallKind::Voice)
        .await
        .unwrap();
    b.answer().await;
    wait_for_state(&call, SessionState::Active).await;

    // Bob vanishes, so the restart offer goes nowhere
    network.hub.disconnect(&bob());
    assert!(network.connections.fail_ice(&bob()).await);
    let link = call.link(&bob()).unwrap();
    wait_until(|| link.is_restarting()).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(call.state(), SessionState::Active);
    assert_eq!(call.stats().connected_links, 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(call.state(), SessionState::Failed);
    assert_eq!(call.end_reason(), Some(EndReason::LinksFailed));
    assert_eq!(link.state(), PeerLinkState::Closed);
    assert_eq!(a.media.live_streams(), 0);
    assert_eq!(a.history.recent(1).await.unwrap()[0].outcome, CallOutcome::Failed);
}
