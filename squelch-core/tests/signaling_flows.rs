//! End-to-end transmit and listen flows over the in-memory directory and
//! loopback media.

use std::time::Duration;

use squelch_core::core_media::CaptureMode;
use squelch_core::core_signal::{ListenState, TransmitState};
use squelch_core::test_utils::*;
use squelch_core::{RemoteAudioEvent, SignalError};

#[tokio::test]
async fn test_round_trip_delivers_exactly_one_remote_audio() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    let mut bob = net.join("bob");
    alice.client.attach_to_channel("01").await.unwrap();
    bob.client.attach_to_channel("01").await.unwrap();

    alice.client.start_transmitting().await.unwrap();

    let event = recv_timeout(&mut bob.audio, DEFAULT_TEST_TIMEOUT).await.unwrap();
    match event {
        RemoteAudioEvent::Available { from, .. } => assert_eq!(&from, alice.id()),
        other => panic!("expected remote audio, got {other:?}"),
    }

    let snapshot = alice
        .wait_for(|s| s.transmit == TransmitState::Active)
        .await;
    assert_eq!(snapshot.responder.as_ref(), Some(bob.id()));
    assert_eq!(snapshot.connections, 1);

    let bob_view = bob
        .wait_for(|s| s.listener_state(alice.id()) == Some(ListenState::Connected))
        .await;
    assert_eq!(bob_view.connections, 1);

    assert_eq!(
        recv_timeout(&mut bob.audio, QUIET_PERIOD).await,
        Err(RecvTimeoutError::Timeout)
    );
}

#[tokio::test]
async fn test_offer_and_answer_records_land_in_channel_namespace() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    let bob = net.join("bob");
    alice.client.attach_to_channel("01").await.unwrap();
    bob.client.attach_to_channel("01").await.unwrap();

    alice.client.start_transmitting().await.unwrap();
    alice.wait_for(|s| s.transmit == TransmitState::Active).await;

    let paths = net.paths("01");
    assert!(net.store.contains(&paths.offer(alice.id())));
    assert!(net.store.contains(&paths.answer(alice.id(), bob.id())));
    assert!(net.records_under(&paths.candidates_of(alice.id())) > 0);
    assert!(net.records_under(&paths.candidates_of(bob.id())) > 0);
}

#[tokio::test]
async fn test_second_start_is_rejected_while_transmitting() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    alice.client.attach_to_channel("01").await.unwrap();

    let (first, second) = tokio::join!(
        alice.client.start_transmitting(),
        alice.client.start_transmitting()
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(SignalError::AlreadyTransmitting))));

    let snapshot = alice.snapshot().await;
    assert_eq!(snapshot.connections, 1);
    assert_eq!(net.records_under(&net.paths("01").offers()), 1);
    assert_eq!(alice.capture.acquisitions(), 1);
}

#[tokio::test]
async fn test_stop_while_idle_is_a_no_op() {
    let net = TestNetwork::new();
    let mut alice = net.join("alice");

    alice.client.stop_transmitting().await.unwrap();
    alice.client.attach_to_channel("01").await.unwrap();
    alice.client.stop_transmitting().await.unwrap();
    alice.client.stop_transmitting().await.unwrap();

    let snapshot = alice.snapshot().await;
    assert_eq!(snapshot.transmit, TransmitState::Idle);
    assert_eq!(snapshot.connections, 0);
    assert_eq!(
        recv_timeout(&mut alice.errors, QUIET_PERIOD).await,
        Err(RecvTimeoutError::Timeout)
    );
}

#[tokio::test]
async fn test_stop_withdraws_records_and_ends_remote_audio() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    let mut bob = net.join("bob");
    alice.client.attach_to_channel("01").await.unwrap();
    bob.client.attach_to_channel("01").await.unwrap();

    alice.client.start_transmitting().await.unwrap();
    recv_timeout(&mut bob.audio, DEFAULT_TEST_TIMEOUT).await.unwrap();

    alice.client.stop_transmitting().await.unwrap();
    let ended = recv_timeout(&mut bob.audio, DEFAULT_TEST_TIMEOUT).await.unwrap();
    assert_eq!(ended, RemoteAudioEvent::Ended { from: alice.id().clone() });

    let paths = net.paths("01");
    bob.wait_for(|s| s.listeners.is_empty() && s.connections == 0).await;
    assert!(!net.store.contains(&paths.offer(alice.id())));
    assert_eq!(net.records_under(&paths.answers_for(alice.id())), 0);
    assert_eq!(net.records_under(&paths.candidates_of(alice.id())), 0);
    assert!(!alice.capture.is_held());
    assert_eq!(net.media.open_connections(), 0);
}

#[tokio::test]
async fn test_restart_gives_listener_a_fresh_connection() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    let mut bob = net.join("bob");
    alice.client.attach_to_channel("01").await.unwrap();
    bob.client.attach_to_channel("01").await.unwrap();

    alice.client.start_transmitting().await.unwrap();
    recv_timeout(&mut bob.audio, DEFAULT_TEST_TIMEOUT).await.unwrap();
    alice.client.stop_transmitting().await.unwrap();
    alice.client.start_transmitting().await.unwrap();

    let ended = recv_matching(&mut bob.audio, DEFAULT_TEST_TIMEOUT, |e| {
        matches!(e, RemoteAudioEvent::Ended { .. })
    })
    .await
    .unwrap();
    assert_eq!(ended, RemoteAudioEvent::Ended { from: alice.id().clone() });
    recv_matching(&mut bob.audio, DEFAULT_TEST_TIMEOUT, |e| {
        matches!(e, RemoteAudioEvent::Available { .. })
    })
    .await
    .unwrap();

    let view = bob
        .wait_for(|s| s.listener_state(alice.id()) == Some(ListenState::Connected))
        .await;
    assert_eq!(view.listeners.len(), 1);
    assert_eq!(view.connections, 1);
    alice.wait_for(|s| s.transmit == TransmitState::Active).await;

    // The device is given back between transmissions and acquired again.
    assert_eq!(alice.capture.acquisitions(), 2);
    assert!(alice.capture.is_held());
}

#[tokio::test]
async fn test_only_first_answer_is_bound() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    let mut bob = net.join("bob");
    let mut carol = net.join("carol");
    for p in [&alice, &bob, &carol] {
        p.client.attach_to_channel("01").await.unwrap();
    }

    alice.client.start_transmitting().await.unwrap();
    let snapshot = alice
        .wait_for(|s| s.transmit == TransmitState::Active)
        .await;
    let responder = snapshot.responder.clone().unwrap();

    let (bound, other) = if &responder == bob.id() {
        (&mut bob, &mut carol)
    } else {
        assert_eq!(&responder, carol.id());
        (&mut carol, &mut bob)
    };

    recv_timeout(&mut bound.audio, DEFAULT_TEST_TIMEOUT).await.unwrap();
    bound
        .wait_for(|s| s.listener_state(alice.id()) == Some(ListenState::Connected))
        .await;

    // The late responder's answer reaches the directory but is ignored.
    let late_answer = net.paths("01").answer(alice.id(), other.id());
    let (store, late_answer) = (&net.store, &late_answer);
    wait_until(DEFAULT_TEST_TIMEOUT, || async move { store.contains(late_answer).then_some(()) }).await;
    assert_eq!(
        recv_timeout(&mut other.audio, QUIET_PERIOD).await,
        Err(RecvTimeoutError::Timeout)
    );
    let other_view = other.snapshot().await;
    assert_eq!(other_view.listener_state(alice.id()), Some(ListenState::Answering));

    let after = alice.snapshot().await;
    assert_eq!(after.responder, Some(responder));
    assert_eq!(after.connections, 1);
}

#[tokio::test]
async fn test_denied_microphone_leaves_no_trace() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    alice.client.attach_to_channel("01").await.unwrap();
    alice.capture.set_mode(CaptureMode::Denied);

    let result = alice.client.start_transmitting().await;
    assert!(matches!(result, Err(SignalError::MediaAcquisition(_))));

    let snapshot = alice.snapshot().await;
    assert_eq!(snapshot.transmit, TransmitState::Idle);
    assert_eq!(snapshot.connections, 0);
    assert_eq!(net.records_under(&net.paths("01").offers()), 0);
    assert_eq!(net.records_under(&net.paths("01").candidates()), 0);

    // A later attempt succeeds once the device is available again.
    alice.capture.set_mode(CaptureMode::Available);
    alice.client.start_transmitting().await.unwrap();
    assert!(net.store.contains(&net.paths("01").offer(alice.id())));
}

#[tokio::test]
async fn test_busy_microphone_is_reported() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    alice.client.attach_to_channel("01").await.unwrap();
    alice.capture.set_mode(CaptureMode::Busy);

    let result = alice.client.start_transmitting().await;
    assert!(matches!(result, Err(SignalError::MediaAcquisition(_))));
    assert_eq!(alice.snapshot().await.transmit, TransmitState::Idle);
}

#[tokio::test]
async fn test_stop_during_acquisition_cancels_start() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    alice.client.attach_to_channel("01").await.unwrap();
    alice.capture.set_delay(Some(Duration::from_millis(300)));

    let client = alice.client.clone();
    let pending = tokio::spawn(async move { client.start_transmitting().await });
    alice
        .wait_for(|s| s.transmit == TransmitState::AcquiringMedia)
        .await;
    alice.client.stop_transmitting().await.unwrap();

    let result = assert_completes_within(DEFAULT_TEST_TIMEOUT, pending).await.unwrap();
    assert_eq!(result, Err(SignalError::Cancelled));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let snapshot = alice.snapshot().await;
    assert_eq!(snapshot.transmit, TransmitState::Idle);
    assert_eq!(snapshot.connections, 0);
    assert!(!alice.capture.is_held());
    assert_eq!(net.records_under(&net.paths("01").offers()), 0);
}

#[tokio::test]
async fn test_toggle_hold_latches_transmission() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    alice.client.attach_to_channel("01").await.unwrap();

    assert_eq!(alice.client.toggle_hold().await, Ok(true));
    let held = alice.snapshot().await;
    assert!(held.hold);
    assert!(!held.transmit.is_idle());

    assert_eq!(alice.client.toggle_hold().await, Ok(false));
    let released = alice.snapshot().await;
    assert!(!released.hold);
    assert_eq!(released.transmit, TransmitState::Idle);
}

#[tokio::test]
async fn test_toggle_hold_during_push_to_talk_keeps_transmitting() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    alice.client.attach_to_channel("01").await.unwrap();

    alice.client.start_transmitting().await.unwrap();
    assert_eq!(alice.client.toggle_hold().await, Ok(true));
    assert!(alice.snapshot().await.hold);

    alice.client.stop_transmitting().await.unwrap();
    let snapshot = alice.snapshot().await;
    assert!(!snapshot.hold);
    assert_eq!(snapshot.transmit, TransmitState::Idle);
}

#[tokio::test]
async fn test_start_without_channel_is_rejected() {
    let net = TestNetwork::new();
    let alice = net.join("alice");
    assert_eq!(alice.client.start_transmitting().await, Err(SignalError::NotAttached));
}

#[tokio::test]
async fn test_two_transmitters_hear_each_other() {
    let net = TestNetwork::new();
    let mut alice = net.join("alice");
    let mut bob = net.join("bob");
    alice.client.attach_to_channel("01").await.unwrap();
    bob.client.attach_to_channel("01").await.unwrap();

    alice.client.start_transmitting().await.unwrap();
    bob.client.start_transmitting().await.unwrap();

    let heard_by_bob = recv_matching(&mut bob.audio, DEFAULT_TEST_TIMEOUT, |e| {
        matches!(e, RemoteAudioEvent::Available { .. })
    })
    .await
    .unwrap();
    let heard_by_alice = recv_matching(&mut alice.audio, DEFAULT_TEST_TIMEOUT, |e| {
        matches!(e, RemoteAudioEvent::Available { .. })
    })
    .await
    .unwrap();
    assert!(matches!(heard_by_bob, RemoteAudioEvent::Available { from, .. } if &from == alice.id()));
    assert!(matches!(heard_by_alice, RemoteAudioEvent::Available { from, .. } if &from == bob.id()));

    let view = alice
        .wait_for(|s| s.transmit == TransmitState::Active && s.connections == 2)
        .await;
    assert_eq!(view.listener_state(bob.id()), Some(ListenState::Connected));
}
