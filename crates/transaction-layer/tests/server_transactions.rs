// Server transaction behavior: retransmission handling, reliable provisionals and
// CANCEL, driven through TransactionManager::process_message.

mod common;

use std::time::Duration;

use common::*;
use rvoip_transaction_layer::prelude::*;
use tokio::time::sleep;

fn responses_for(h: &Harness, status: u16, method: Method) -> Vec<Sent> {
    h.transport
        .responses(status)
        .into_iter()
        .filter(|s| as_response(s).cseq().is_ok_and(|c| c.method == method))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn request_retransmission_is_absorbed() {
    let h = harness(TransactionConfig::for_testing());
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Options, server);

    let options = inbound(Method::Options, "nist-1", "z9hG4bKnist1", 1);
    h.manager.process_message(options.clone().into(), source_of(&options), None).await;
    h.manager.process_message(options.clone().into(), source_of(&options), None).await;

    let tx = events.transaction(100).await.unwrap();
    settle().await;
    assert!(events.drain().is_empty(), "retransmission reached the TU");
    assert_eq!(h.manager.counts().server, 1);
    assert!(h.transport.sent().is_empty());

    tx.send_response(Some(create_response(tx.request(), 200))).await.unwrap();
    assert_eq!(tx.state(), TransactionState::Completed);
    assert_eq!(h.transport.responses(200).len(), 1);
    assert_eq!(h.transport.responses(200)[0].to, udp(PEER_HOST, 5060));

    // Retransmissions of the request now get the final response again.
    h.manager.process_message(options.clone().into(), source_of(&options), None).await;
    assert_eq!(h.transport.responses(200).len(), 2);

    // A different final is refused, the same one ignored.
    assert!(matches!(
        tx.send_response(Some(create_response(tx.request(), 486))).await,
        Err(Error::MultipleFinalResponses)
    ));

    // Timer J (64*T1 over UDP).
    sleep(Duration::from_millis(700)).await;
    assert_eq!(tx.state(), TransactionState::Terminated);
    assert_eq!(h.manager.counts().server, 0);
}

#[tokio::test(start_paused = true)]
async fn reliable_provisional_retransmits_until_prack() {
    let h = harness(TransactionConfig::for_testing());
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Invite, server);

    let mut invite = inbound(Method::Invite, "rel-1", "z9hG4bKrel1", 1);
    invite.headers.add_supported("100rel");
    h.manager.process_message(invite.clone().into(), source_of(&invite), None).await;

    let tx = events.transaction(100).await.unwrap();
    assert_eq!(h.transport.responses(100).len(), 1);

    tx.send_response(Some(create_response(tx.request(), 180))).await.unwrap();
    assert_eq!(tx.state(), TransactionState::WaitPrack);
    let ringing = h.transport.responses(180);
    assert_eq!(ringing.len(), 1);
    let reliable = as_response(&ringing[0]).clone();
    assert!(reliable.headers.requires("100rel"));
    assert_eq!(reliable.headers.rseq, Some(1));

    // No other provisional while one is unacknowledged.
    assert!(tx.send_response(Some(create_response(tx.request(), 183))).await.is_err());

    // T1 doubling: sent at 0, 10 and 30ms.
    sleep(Duration::from_millis(35)).await;
    let ringing = h.transport.responses(180);
    assert_eq!(ringing.len(), 3);
    assert_eq!(gaps(&ringing), vec![10, 20]);

    let prack = prack_for(&invite, &reliable, "z9hG4bKprack1");
    h.manager.process_message(prack.clone().into(), source_of(&prack), None).await;

    match events.next(100).await {
        Some(ServerEvent::Prack(received)) => assert_eq!(received.headers.rack, prack.headers.rack),
        other => panic!("expected PRACK, got {other:?}"),
    }
    settle().await;
    assert_eq!(responses_for(&h, 200, Method::Prack).len(), 1);
    assert_eq!(tx.state(), TransactionState::ReliableProceeding);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.transport.responses(180).len(), 3);

    // The next reliable provisional carries the next RSeq.
    tx.send_response(Some(create_response(tx.request(), 183))).await.unwrap();
    let progress = h.transport.responses(183);
    assert_eq!(as_response(&progress[0]).headers.rseq, Some(2));
}

#[tokio::test(start_paused = true)]
async fn prack_for_unknown_rseq_gets_481() {
    let h = harness(TransactionConfig::for_testing());
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Invite, server);

    let mut invite = inbound(Method::Invite, "rel-2", "z9hG4bKrel2", 1);
    invite.headers.add_supported("100rel");
    h.manager.process_message(invite.clone().into(), source_of(&invite), None).await;
    let tx = events.transaction(100).await.unwrap();
    tx.send_response(Some(create_response(tx.request(), 180))).await.unwrap();

    let mut reliable = as_response(&h.transport.responses(180)[0]).clone();
    reliable.headers.rseq = Some(7);
    let prack = prack_for(&invite, &reliable, "z9hG4bKprack2");
    h.manager.process_message(prack.clone().into(), source_of(&prack), None).await;
    settle().await;

    assert_eq!(responses_for(&h, 481, Method::Prack).len(), 1);
    assert_eq!(tx.state(), TransactionState::WaitPrack);
}

#[tokio::test(start_paused = true)]
async fn invite_error_response_is_retransmitted_until_ack() {
    let h = harness(TransactionConfig::for_testing());
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Invite, server);

    let invite = inbound(Method::Invite, "ist-1", "z9hG4bKist1", 1);
    h.manager.process_message(invite.clone().into(), source_of(&invite), None).await;
    let tx = events.transaction(100).await.unwrap();

    tx.send_response(Some(create_response(tx.request(), 486))).await.unwrap();
    assert_eq!(tx.state(), TransactionState::Completed);

    // Timer G: 0, 10, 30ms.
    sleep(Duration::from_millis(35)).await;
    let busy = h.transport.responses(486);
    assert_eq!(busy.len(), 3);
    assert_eq!(gaps(&busy), vec![10, 20]);

    let mut ack = inbound(Method::Ack, "ist-1", "z9hG4bKist1", 1);
    ack.headers.to = as_response(&busy[0]).headers.to.clone();
    h.manager.process_message(ack.into(), source_of(&invite), None).await;
    assert_eq!(tx.state(), TransactionState::Confirmed);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.responses(486).len(), 3);
    // The ACK of a non-2xx stays inside the transaction layer.
    assert!(events.drain().is_empty());

    // Timer I.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(tx.state(), TransactionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn invite_2xx_is_retransmitted_until_ack() {
    let h = harness(TransactionConfig::for_testing());
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Invite, server);

    let invite = inbound(Method::Invite, "ist-2", "z9hG4bKist2", 1);
    h.manager.process_message(invite.clone().into(), source_of(&invite), None).await;
    let tx = events.transaction(100).await.unwrap();

    tx.send_response(Some(create_response(tx.request(), 200))).await.unwrap();
    assert_eq!(tx.state(), TransactionState::XCompleted);

    sleep(Duration::from_millis(35)).await;
    let ok = h.transport.responses(200);
    assert_eq!(ok.len(), 3);

    // The ACK of a 2xx has its own branch and is matched without Via.
    let mut ack = inbound(Method::Ack, "ist-2", "z9hG4bKack2", 1);
    ack.headers.to = as_response(&ok[0]).headers.to.clone();
    h.manager.process_message(ack.clone().into(), source_of(&ack), None).await;
    assert_eq!(tx.state(), TransactionState::XConfirmed);
    match events.next(100).await {
        Some(ServerEvent::Ack(received)) => assert_eq!(received.top_via().unwrap().branch(), Some("z9hG4bKack2")),
        other => panic!("expected ACK, got {other:?}"),
    }

    // ACK retransmissions are absorbed.
    h.manager.process_message(ack.clone().into(), source_of(&ack), None).await;
    settle().await;
    assert!(events.drain().is_empty());
    assert_eq!(h.transport.responses(200).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_2xx_times_out() {
    let h = harness(TransactionConfig::for_testing());
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Invite, server);

    let invite = inbound(Method::Invite, "ist-3", "z9hG4bKist3", 1);
    h.manager.process_message(invite.clone().into(), source_of(&invite), None).await;
    let tx = events.transaction(100).await.unwrap();
    tx.send_response(Some(create_response(tx.request(), 200))).await.unwrap();

    assert!(matches!(events.next(1_000).await, Some(ServerEvent::TimeOut)));
    assert_eq!(tx.state(), TransactionState::XTerminated);
    assert_eq!(h.manager.counts().server, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_answers_200_and_487() {
    let h = harness(TransactionConfig::for_testing());
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Invite, server);

    let invite = inbound(Method::Invite, "cancel-2", "z9hG4bKcan2", 1);
    h.manager.process_message(invite.clone().into(), source_of(&invite), None).await;
    let tx = events.transaction(100).await.unwrap();
    tx.send_response(Some(create_response(tx.request(), 180))).await.unwrap();

    let cancel = inbound(Method::Cancel, "cancel-2", "z9hG4bKcan2", 1);
    h.manager.process_message(cancel.clone().into(), source_of(&cancel), None).await;

    assert!(matches!(events.next(100).await, Some(ServerEvent::Cancel(_))));
    assert_eq!(responses_for(&h, 200, Method::Cancel).len(), 1);
    assert_eq!(responses_for(&h, 487, Method::Invite).len(), 1);
    assert_eq!(tx.state(), TransactionState::Completed);

    // A retransmitted CANCEL gets the same 200 and the TU hears nothing more.
    h.manager.process_message(cancel.clone().into(), source_of(&cancel), None).await;
    settle().await;
    assert_eq!(responses_for(&h, 200, Method::Cancel).len(), 2);
    assert!(events.drain().is_empty());

    // The TU's own final is refused now.
    assert!(tx.send_response(Some(create_response(tx.request(), 200))).await.is_err());
}
