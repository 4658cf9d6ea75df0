//! Group call tests: quorum aggregation and per-link failures

mod common;

use callcore::config::CallConfig;
use callcore::domain::call::policy::AllowAll;
use callcore::domain::call::value_object::{CallKind, EndReason, PeerLinkState, SessionState};
use callcore::domain::shared::value_objects::ParticipantId;
use common::{wait_for_state, wait_until, Network};
use std::sync::Arc;

fn participants() -> Vec<ParticipantId> {
    vec![ParticipantId::from("bob"), ParticipantId::from("carol")]
}

fn quorum(quorum: f64) -> CallConfig {
    CallConfig {
        quorum,
        ..CallConfig::default()
    }
}

#[tokio::test]
async fn test_full_quorum_waits_for_everyone() {
    let network = Network::new();
    let a = network.endpoint("alice");
    let b = network.endpoint("bob");
    let c = network.endpoint("carol");

    let call = a
        .manager
        .request_outgoing_call(participants(), CallKind::Voice)
        .await
        .unwrap();
    assert_eq!(call.link_state(&ParticipantId::from("carol")), Some(PeerLinkState::OfferSent));

    b.answer().await;
    wait_until(|| call.stats().connected_links == 1).await;
    assert_eq!(call.state(), SessionState::Connecting);

    let carol_call = c.answer().await;
    wait_for_state(&call, SessionState::Active).await;
    wait_for_state(&carol_call, SessionState::Active).await;
    assert_eq!(call.stats().connected_links, 2);

    let mut attached = a.media.attached();
    attached.sort();
    assert_eq!(attached, participants());

    call.end().await;
    wait_until(|| b.manager.current_session().is_none() && c.manager.current_session().is_none()).await;
}

#[tokio::test]
async fn test_partial_quorum_goes_active_early() {
    let network = Network::new();
    let a = network.endpoint_with("alice", quorum(0.5), Arc::new(AllowAll));
    let b = network.endpoint("bob");
    let c = network.endpoint("carol");

    let call = a
        .manager
        .request_outgoing_call(participants(), CallKind::Video)
        .await
        .unwrap();
    b.answer().await;
    wait_for_state(&call, SessionState::Active).await;
    assert_eq!(call.stats().connected_links, 1);

    // Carol can still join the active call
    c.answer().await;
    wait_until(|| call.stats().connected_links == 2).await;
    assert_eq!(call.state(), SessionState::Active);

    call.end().await;
}

#[tokio::test]
async fn test_one_decline_leaves_the_rest_connected() {
    let network = Network::new();
    let a = network.endpoint("alice");
    let b = network.endpoint("bob");
    let c = network.endpoint("carol");

    let call = a
        .manager
        .request_outgoing_call(participants(), CallKind::Voice)
        .await
        .unwrap();

    let declined = c.wait_for_ring().await;
    declined.reject_incoming(call.call_id()).await.unwrap();
    wait_until(|| call.link_state(&ParticipantId::from("carol")) == Some(PeerLinkState::Closed)).await;
    assert!(!call.is_terminal());

    b.answer().await;
    wait_for_state(&call, SessionState::Active).await;
    assert_eq!(call.stats().connected_links, 1);

    call.end().await;
}

#[tokio::test]
async fn test_everyone_declines() {
    let network = Network::new();
    let a = network.endpoint("alice");
    let b = network.endpoint("bob");
    let c = network.endpoint("carol");

    let call = a
        .manager
        .request_outgoing_call(participants(), CallKind::Voice)
        .await
        .unwrap();
    for endpoint in [&b, &c] {
        let ringing = endpoint.wait_for_ring().await;
        ringing.reject_incoming(call.call_id()).await.unwrap();
    }

    wait_for_state(&call, SessionState::Ended).await;
    assert_eq!(call.end_reason(), Some(EndReason::RemoteDeclined));
    assert_eq!(a.media.live_streams(), 0);
}

#[tokio::test]
async fn test_link_loss_within_quorum_keeps_call() {
    let network = Network::new();
    let config = CallConfig {
        quorum: 0.5,
        max_ice_restarts: 0,
        ..CallConfig::default()
    };
    let a = network.endpoint_with("alice", config, Arc::new(AllowAll));
    let b = network.endpoint("bob");
    let c = network.endpoint("carol");

    let call = a
        .manager
        .request_outgoing_call(participants(), CallKind::Voice)
        .await
        .unwrap();
    b.answer().await;
    c.answer().await;
    wait_until(|| call.stats().connected_links == 2).await;

    network.connections.fail_ice(&ParticipantId::from("bob")).await;
    wait_until(|| call.link_state(&ParticipantId::from("bob")) == Some(PeerLinkState::Closed)).await;
    assert_eq!(call.state(), SessionState::Active);
    assert_eq!(call.stats().connected_links, 1);

    network.connections.fail_ice(&ParticipantId::from("carol")).await;
    wait_for_state(&call, SessionState::Failed).await;
    assert_eq!(call.end_reason(), Some(EndReason::LinksFailed));
}
