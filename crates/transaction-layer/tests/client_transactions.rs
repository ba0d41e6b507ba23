// Client transaction behavior against a recording transport
//
// All tests run on a paused clock with TransactionConfig::for_testing() timers
// (T1 = 10ms, T2 = 80ms, T4 = 100ms, 64*T1 = 640ms), so every send time is exact.

mod common;

use std::time::Duration;

use common::*;
use rvoip_transaction_layer::prelude::*;
use tokio::time::sleep;

fn final_status(event: Option<ClientEvent>) -> u16 {
    match event {
        Some(ClientEvent::Final(response)) => response.status,
        other => panic!("expected a final response, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn non_invite_retransmits_until_timeout() {
    let h = harness(TransactionConfig::for_testing());
    let (client, mut events) = RecordingClient::new();

    let options = request(Method::Options, "sip:bob@192.0.2.20", "nict-1", "z9hG4bKnict1", 1);
    h.manager.send_request(options, Some(client)).await.unwrap();

    assert_eq!(events.next(5_000).await, Some(ClientEvent::TimeOut));

    // Timer E doubles from T1 and is capped at T2; ten sends in all.
    let sent = h.transport.requests(Method::Options);
    assert_eq!(sent.len(), 10);
    assert_eq!(gaps(&sent), vec![10, 20, 40, 80, 80, 80, 80, 80, 80]);
    assert!(sent.iter().all(|s| s.to == udp("192.0.2.20", 5060)));

    // A silent destination is remembered.
    assert!(h.manager.is_unreachable(&udp("192.0.2.20", 5060)));
    assert_eq!(h.manager.counts().client, 0);
}

#[tokio::test(start_paused = true)]
async fn non_invite_final_stops_retransmission() {
    let h = harness(TransactionConfig::for_testing());
    let (client, mut events) = RecordingClient::new();

    let register = request(Method::Register, "sip:registrar.example.com", "nict-2", "z9hG4bKnict2", 1);
    let tx = h.manager.send_request(register, Some(client)).await.unwrap();

    sleep(Duration::from_millis(15)).await;
    assert_eq!(h.transport.requests(Method::Register).len(), 2);

    let ok = response_to(&tx.request(), 200, Some("reg-tag"));
    h.manager.process_message(ok.clone().into(), peer_source(), None).await;
    assert_eq!(final_status(events.next(100).await), 200);
    assert_eq!(tx.state(), TransactionState::Completed);

    // Retransmissions of the final are absorbed.
    h.manager.process_message(ok.into(), peer_source(), None).await;
    sleep(Duration::from_millis(50)).await;
    assert!(events.drain().is_empty());
    assert_eq!(h.transport.requests(Method::Register).len(), 2);

    // Timer K.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert!(h.manager.find_client_transaction(&tx.key()).is_none());
}

#[tokio::test(start_paused = true)]
async fn refused_destination_reports_icmp_error() {
    let h = harness(TransactionConfig::for_testing());
    h.transport.refuse(&udp("192.0.2.99", 5060));
    let (client, mut events) = RecordingClient::new();

    let options = request(Method::Options, "sip:bob@192.0.2.99", "nict-3", "z9hG4bKnict3", 1);
    h.manager.send_request(options, Some(client)).await.unwrap();

    assert_eq!(events.next(100).await, Some(ClientEvent::IcmpError));
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.manager.counts().client, 0);
}

#[tokio::test(start_paused = true)]
async fn invite_client_acks_every_2xx_retransmission() {
    let h = harness(TransactionConfig::for_testing());
    let stray = std::sync::Arc::new(StrayRecorder::default());
    h.manager.set_stray_interface(Some(stray.clone()));
    let (client, mut events) = RecordingClient::new();

    let tx = h
        .manager
        .send_request(invite("sip:bob@192.0.2.20", "ict-1", "z9hG4bKict1"), Some(client))
        .await
        .unwrap();
    assert!(tx.request().headers.supports("100rel"));

    let ok = response_to(&tx.request(), 200, Some("bob-tag"));
    h.manager.process_message(ok.clone().into(), peer_source(), None).await;
    assert_eq!(final_status(events.next(100).await), 200);
    assert_eq!(tx.state(), TransactionState::XCompleted);

    tx.ack(None).await.unwrap();
    let acks = h.transport.requests(Method::Ack);
    assert_eq!(acks.len(), 1);
    let ack = as_request(&acks[0]);
    assert_eq!(ack.to_tag(), Some("bob-tag"));
    assert_ne!(ack.top_via().unwrap().branch(), Some("z9hG4bKict1"));

    // Only one ACK per 2xx from the TU.
    assert!(matches!(tx.ack(None).await, Err(Error::AckAlreadySent)));

    // Each retransmitted 2xx gets exactly one more ACK.
    for expected in 2..=3 {
        h.manager.process_message(ok.clone().into(), peer_source(), None).await;
        assert_eq!(h.transport.requests(Method::Ack).len(), expected);
    }
    assert!(events.drain().is_empty());

    // After 64*T1 the transaction is gone and a late 2xx is stray.
    sleep(Duration::from_millis(700)).await;
    assert_eq!(tx.state(), TransactionState::XTerminated);
    assert!(h.manager.find_client_transaction(&tx.key()).is_none());

    h.manager.process_message(ok.into(), peer_source(), None).await;
    settle().await;
    assert_eq!(h.transport.requests(Method::Ack).len(), 3);
    assert_eq!(stray.responses.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn invite_client_acks_non_2xx_on_same_branch() {
    let h = harness(TransactionConfig::for_testing());
    let (client, mut events) = RecordingClient::new();

    let tx = h
        .manager
        .send_request(invite("sip:bob@192.0.2.20", "ict-2", "z9hG4bKict2"), Some(client))
        .await
        .unwrap();

    let busy = response_to(&tx.request(), 486, Some("busy-tag"));
    h.manager.process_message(busy.clone().into(), peer_source(), None).await;
    assert_eq!(final_status(events.next(100).await), 486);
    assert_eq!(tx.state(), TransactionState::Completed);

    tx.ack(None).await.unwrap();
    let acks = h.transport.requests(Method::Ack);
    assert_eq!(acks.len(), 1);
    let ack = as_request(&acks[0]);
    assert_eq!(ack.top_via().unwrap().branch(), Some("z9hG4bKict2"));
    assert_eq!(ack.cseq().unwrap().seq, 1);
    assert_eq!(ack.to_tag(), Some("busy-tag"));

    h.manager.process_message(busy.into(), peer_source(), None).await;
    assert_eq!(h.transport.requests(Method::Ack).len(), 2);
    assert!(events.drain().is_empty());

    sleep(Duration::from_millis(700)).await;
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert_eq!(h.manager.counts().client, 0);
}

#[tokio::test(start_paused = true)]
async fn service_unavailable_fails_over_to_next_server() {
    let h = harness(TransactionConfig::for_testing());
    let first = udp("192.0.2.21", 5060);
    let second = udp("192.0.2.22", 5060);
    h.resolver.answer("proxy.example.com", vec![first.clone(), second.clone()]);
    let (client, mut events) = RecordingClient::new();

    let tx = h
        .manager
        .send_request(invite("sip:bob@proxy.example.com", "su-1", "z9hG4bKsu1"), Some(client))
        .await
        .unwrap();
    let invites = h.transport.requests(Method::Invite);
    assert_eq!(invites.len(), 1);
    assert_eq!(invites[0].to, first);

    let unavailable = response_to(as_request(&invites[0]), 503, Some("p1"));
    h.manager.process_message(unavailable.clone().into(), peer_source(), None).await;
    settle().await;

    // The INVITE goes to the second server under a new branch.
    let invites = h.transport.requests(Method::Invite);
    assert_eq!(invites.len(), 2);
    assert_eq!(invites[1].to, second);
    let retried = as_request(&invites[1]).top_via().unwrap().branch().unwrap().to_string();
    assert_ne!(retried, "z9hG4bKsu1");
    assert_eq!(tx.key().branch(), Some(retried.as_str()));
    assert!(h.manager.is_unreachable(&first));

    // The 503 is ACKed on the old branch, over the old connection.
    let acks = h.transport.requests(Method::Ack);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].to, first);
    assert_eq!(as_request(&acks[0]).top_via().unwrap().branch(), Some("z9hG4bKsu1"));

    // A retransmitted 503 finds the handler, not the transaction.
    h.manager.process_message(unavailable.into(), peer_source(), None).await;
    assert_eq!(h.transport.requests(Method::Ack).len(), 2);
    assert!(events.drain().is_empty());

    // The second server answers normally.
    let ringing = response_to(as_request(&invites[1]), 180, Some("p2"));
    h.manager.process_message(ringing.into(), peer_source(), None).await;
    assert_eq!(events.next(100).await, Some(ClientEvent::Provisional(180)));
}

#[tokio::test(start_paused = true)]
async fn last_server_503_is_final() {
    let h = harness(TransactionConfig::for_testing());
    let (client, mut events) = RecordingClient::new();

    let tx = h
        .manager
        .send_request(invite("sip:bob@192.0.2.23", "su-2", "z9hG4bKsu2"), Some(client))
        .await
        .unwrap();
    let unavailable = response_to(&tx.request(), 503, Some("p1"));
    h.manager.process_message(unavailable.into(), peer_source(), None).await;

    assert_eq!(final_status(events.next(100).await), 503);
    assert_eq!(h.transport.requests(Method::Invite).len(), 1);
    assert_eq!(tx.state(), TransactionState::Completed);
}

#[tokio::test(start_paused = true)]
async fn cancel_follows_the_invite() {
    let h = harness(TransactionConfig::for_testing());
    let (client, mut events) = RecordingClient::new();
    let (cancel_client, mut cancel_events) = RecordingClient::new();

    let tx = h
        .manager
        .send_request(invite("sip:bob@192.0.2.20", "cancel-1", "z9hG4bKcan1"), Some(client))
        .await
        .unwrap();
    let ringing = response_to(&tx.request(), 180, Some("bob-tag"));
    h.manager.process_message(ringing.into(), peer_source(), None).await;
    assert_eq!(events.next(100).await, Some(ClientEvent::Provisional(180)));

    tx.cancel(Some(cancel_client)).await.unwrap();
    let cancels = h.transport.requests(Method::Cancel);
    assert_eq!(cancels.len(), 1);
    let cancel = as_request(&cancels[0]).clone();
    assert_eq!(cancels[0].to, udp("192.0.2.20", 5060));
    assert_eq!(cancel.top_via().unwrap().branch(), Some("z9hG4bKcan1"));
    assert_eq!(cancel.cseq().unwrap().method, Method::Cancel);

    // Cancelling twice sends nothing new.
    tx.cancel(None).await.unwrap();
    assert_eq!(h.transport.requests(Method::Cancel).len(), 1);
    assert!(tx.cancel_transaction().await.is_some());

    let ok = response_to(&cancel, 200, Some("bob-tag"));
    h.manager.process_message(ok.into(), peer_source(), None).await;
    assert_eq!(final_status(cancel_events.next(100).await), 200);

    let terminated = response_to(&tx.request(), 487, Some("bob-tag"));
    h.manager.process_message(terminated.into(), peer_source(), None).await;
    assert_eq!(final_status(events.next(100).await), 487);
}

#[tokio::test(start_paused = true)]
async fn cancel_after_timer_k_is_absorbed() {
    let h = harness(TransactionConfig::for_testing());
    let (client, mut events) = RecordingClient::new();

    let register = request(Method::Register, "sip:registrar.example.com", "cnl-k", "z9hG4bKcnlk", 1);
    let tx = h.manager.send_request(register, Some(client)).await.unwrap();
    let ok = response_to(&tx.request(), 200, Some("reg-tag"));
    h.manager.process_message(ok.into(), peer_source(), None).await;
    assert_eq!(final_status(events.next(100).await), 200);

    // A completed non-INVITE has nothing left to cancel.
    assert!(matches!(tx.cancel(None).await, Err(Error::StateMachine { .. })));

    sleep(Duration::from_millis(150)).await;
    assert_eq!(tx.state(), TransactionState::Terminated);
    tx.cancel(None).await.unwrap();
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert!(h.transport.requests(Method::Cancel).is_empty());
    assert!(events.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_after_timer_d_is_absorbed() {
    let h = harness(TransactionConfig::for_testing());
    let (client, mut events) = RecordingClient::new();

    let tx = h
        .manager
        .send_request(invite("sip:bob@192.0.2.20", "cnl-d", "z9hG4bKcnld"), Some(client))
        .await
        .unwrap();
    let busy = response_to(&tx.request(), 486, Some("busy-tag"));
    h.manager.process_message(busy.into(), peer_source(), None).await;
    assert_eq!(final_status(events.next(100).await), 486);
    tx.ack(None).await.unwrap();

    // COMPLETED absorbs the CANCEL without sending one.
    tx.cancel(None).await.unwrap();
    assert_eq!(tx.state(), TransactionState::Completed);

    sleep(Duration::from_millis(700)).await;
    assert_eq!(tx.state(), TransactionState::Terminated);
    tx.cancel(None).await.unwrap();
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert!(h.transport.requests(Method::Cancel).is_empty());
    assert!(events.drain().is_empty());
}
