//! Directory write failures, malformed records and negotiation errors.

use serde_json::json;

use squelch_core::core_directory::DirectoryStore;
use squelch_core::core_media::{IceCandidate, SessionDescription};
use squelch_core::core_model::records::Record;
use squelch_core::core_model::{CandidateRecord, OfferEpoch, OfferRecord, ParticipantId};
use squelch_core::core_signal::{ListenState, TransmitState};
use squelch_core::test_utils::*;
use squelch_core::{RemoteAudioEvent, SignalError};

fn offer_from(epoch: OfferEpoch, sdp: &str) -> serde_json::Value {
    OfferRecord {
        epoch,
        description: SessionDescription::offer(sdp),
    }
    .encode()
    .unwrap()
}

#[tokio::test]
async fn test_offer_publish_is_retried_once() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    let mut bob = net.join("bob");
    alice.client.attach_to_channel("01").await.unwrap();
    bob.client.attach_to_channel("01").await.unwrap();

    let offer = net.paths("01").offer(alice.id());
    net.store.fail_writes(offer.clone(), 1);

    alice.client.start_transmitting().await.unwrap();
    assert!(net.store.contains(&offer));
    recv_timeout(&mut bob.audio, DEFAULT_TEST_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_offer_publish_failure_is_reported_and_rolled_back() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    alice.client.attach_to_channel("01").await.unwrap();

    let offer = net.paths("01").offer(alice.id());
    net.store.fail_writes(offer.clone(), 2);

    let result = alice.client.start_transmitting().await;
    assert!(matches!(result, Err(SignalError::DirectoryWrite { .. })));

    let view = alice.snapshot().await;
    assert_eq!(view.transmit, TransmitState::Idle);
    assert_eq!(view.connections, 0);
    assert!(!net.store.contains(&offer));
    assert!(!alice.capture.is_held());
    assert_eq!(net.media.open_connections(), 0);
}

#[tokio::test]
async fn test_candidate_publish_failures_are_tolerated() {
    let net = TestNetwork::new();
    let mut alice = net.join("alice");
    let mut bob = net.join("bob");
    alice.client.attach_to_channel("01").await.unwrap();
    bob.client.attach_to_channel("01").await.unwrap();

    net.store
        .fail_writes(net.paths("01").candidates_of(alice.id()), 100);

    alice.client.start_transmitting().await.unwrap();
    recv_timeout(&mut bob.audio, DEFAULT_TEST_TIMEOUT).await.unwrap();
    alice.wait_for(|s| s.transmit == TransmitState::Active).await;
    assert_eq!(
        recv_timeout(&mut alice.errors, QUIET_PERIOD).await,
        Err(RecvTimeoutError::Timeout)
    );
}

#[tokio::test]
async fn test_malformed_records_are_ignored() {
    let net = TestNetwork::new();
    let mut bob = net.join("bob");
    bob.client.attach_to_channel("01").await.unwrap();

    let intruder = net.store.connect();
    let paths = net.paths("01");
    intruder
        .set(&paths.offer(&ParticipantId::new("mallory")), json!({"bogus": true}))
        .await
        .unwrap();
    intruder
        .append(&paths.candidates_of(&ParticipantId::new("mallory")), json!("not a record"))
        .await
        .unwrap();

    assert_eq!(
        recv_timeout(&mut bob.errors, QUIET_PERIOD).await,
        Err(RecvTimeoutError::Timeout)
    );
    let view = bob.snapshot().await;
    assert!(view.listeners.is_empty());
    assert_eq!(view.connections, 0);
}

#[tokio::test]
async fn test_bad_offer_fails_only_its_listener() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    let mut bob = net.join("bob");
    alice.client.attach_to_channel("01").await.unwrap();
    bob.client.attach_to_channel("01").await.unwrap();

    alice.client.start_transmitting().await.unwrap();
    recv_timeout(&mut bob.audio, DEFAULT_TEST_TIMEOUT).await.unwrap();

    let mallory = ParticipantId::new("mallory");
    net.store
        .connect()
        .set(
            &net.paths("01").offer(&mallory),
            offer_from(OfferEpoch::generate(), "garbage"),
        )
        .await
        .unwrap();

    let err = recv_timeout(&mut bob.errors, DEFAULT_TEST_TIMEOUT).await.unwrap();
    assert!(matches!(err, SignalError::Negotiation { ref remote, .. } if remote == "mallory"));

    let view = bob
        .wait_for(|s| s.listener_state(&mallory) == Some(ListenState::Closed))
        .await;
    assert_eq!(view.listener_state(alice.id()), Some(ListenState::Connected));
    assert_eq!(view.connections, 1);
    assert_eq!(alice.snapshot().await.transmit, TransmitState::Active);
}

#[tokio::test]
async fn test_replaced_offer_restarts_listener() {
    let net = TestNetwork::new();
    let bob = net.join("bob");
    bob.client.attach_to_channel("01").await.unwrap();

    let mallory = ParticipantId::new("mallory");
    let paths = net.paths("01");
    let session = net.store.connect();
    let first = offer_from(OfferEpoch::generate(), "loopback conn=9001 audio=sendonly");
    session.set(&paths.offer(&mallory), first.clone()).await.unwrap();

    let answer = paths.answer(&mallory, bob.id());
    let (store, answer) = (&net.store, &answer);
    let first_answer = wait_until(DEFAULT_TEST_TIMEOUT, || async move {
        store.entries_under(answer).into_iter().next().map(|(_, v)| v)
    })
    .await;

    // Redelivery of the same epoch keeps the listener as it is.
    session.set(&paths.offer(&mallory), first).await.unwrap();
    let view = bob.snapshot().await;
    assert_eq!(view.listener_state(&mallory), Some(ListenState::Answering));
    assert_eq!(view.connections, 1);

    let first_answer = &first_answer;
    let second = offer_from(OfferEpoch::generate(), "loopback conn=9002 audio=sendonly");
    session.set(&paths.offer(&mallory), second).await.unwrap();
    let second_answer = wait_until(DEFAULT_TEST_TIMEOUT, || async move {
        store
            .entries_under(answer)
            .into_iter()
            .next()
            .map(|(_, v)| v)
            .filter(|v| v != first_answer)
    })
    .await;
    assert_ne!(second_answer["offerEpoch"], serde_json::Value::Null);

    let view = bob.snapshot().await;
    assert_eq!(view.listeners.len(), 1);
    assert_eq!(view.listener_state(&mallory), Some(ListenState::Answering));
    assert_eq!(view.connections, 1);
}

#[tokio::test]
async fn test_bad_candidate_on_outgoing_connection_ends_transmission() {
    let net = TestNetwork::new();
    let mut alice = net.join("alice");
    let mut bob = net.join("bob");
    alice.client.attach_to_channel("01").await.unwrap();
    bob.client.attach_to_channel("01").await.unwrap();

    alice.client.start_transmitting().await.unwrap();
    recv_timeout(&mut bob.audio, DEFAULT_TEST_TIMEOUT).await.unwrap();
    alice.wait_for(|s| s.transmit == TransmitState::Active).await;

    let paths = net.paths("01");
    let offer = net
        .store
        .entries_under(&paths.offer(alice.id()))
        .into_iter()
        .next()
        .map(|(_, v)| OfferRecord::decode(&v).unwrap())
        .unwrap();
    let forged = CandidateRecord {
        offer_epoch: offer.epoch,
        target: Some(alice.id().clone()),
        candidate: IceCandidate::new("garbage"),
    };
    net.store
        .connect()
        .append(&paths.candidates_of(bob.id()), forged.encode().unwrap())
        .await
        .unwrap();

    let err = recv_timeout(&mut alice.errors, DEFAULT_TEST_TIMEOUT).await.unwrap();
    assert!(matches!(err, SignalError::Negotiation { ref remote, .. } if remote == "bob"));
    alice.wait_for(|s| s.transmit == TransmitState::Idle).await;

    let ended = recv_timeout(&mut bob.audio, DEFAULT_TEST_TIMEOUT).await.unwrap();
    assert_eq!(ended, RemoteAudioEvent::Ended { from: alice.id().clone() });
    assert!(!net.store.contains(&paths.offer(alice.id())));
}
