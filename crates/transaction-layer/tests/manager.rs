// TransactionManager dispatch: matching contexts, automatic responses, strays and the
// removal listener.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use rvoip_transaction_layer::message::RPort;
use rvoip_transaction_layer::prelude::*;
use rvoip_transaction_layer::transaction::KeyContext;
use rvoip_transaction_layer::{TransactionKind, TransactionRemovalListener};
use serial_test::serial;

#[tokio::test(start_paused = true)]
async fn response_falls_back_to_key_without_to_tag() {
    let h = harness(TransactionConfig::for_testing());
    let (client, mut events) = RecordingClient::new();

    let invite = invite("sip:bob@192.0.2.20", "abc123", "z9hG4bKxyz");
    let tx = h.manager.send_request(invite.clone(), Some(client)).await.unwrap();

    let via_key = TransactionKey::from_request(&invite, KeyContext::USE_VIA).unwrap();
    assert_eq!(via_key.to_string(), "abc123:1:INVITE;branch=z9hG4bKxyz");
    assert_eq!(tx.key(), via_key);
    assert!(h.manager.find_client_transaction(&via_key).is_some());

    // Without a To tag the response is matched on Via alone.
    let trying = response_to(&tx.request(), 100, None);
    h.manager.process_message(trying.into(), peer_source(), None).await;
    assert_eq!(events.next(100).await, Some(ClientEvent::Provisional(100)));

    // With a To tag, the tagged lookup misses and the Via key still matches.
    let ringing = response_to(&tx.request(), 180, Some("bob-tag"));
    let tagged = TransactionKey::from_response(&ringing, KeyContext::USE_VIA | KeyContext::USE_TO_TAG).unwrap();
    assert!(h.manager.find_client_transaction(&tagged).is_none());
    assert_eq!(TransactionKey::from_response(&ringing, KeyContext::USE_VIA).unwrap(), via_key);

    h.manager.process_message(ringing.into(), peer_source(), None).await;
    assert_eq!(events.next(100).await, Some(ClientEvent::Provisional(180)));

    // Another branch is another transaction.
    let mut other = response_to(&tx.request(), 200, Some("bob-tag"));
    other.headers.via[0].branch = Some("z9hG4bKother".to_string());
    let stray = Arc::new(StrayRecorder::default());
    h.manager.set_stray_interface(Some(stray.clone()));
    h.manager.process_message(other.into(), peer_source(), None).await;
    settle().await;
    assert_eq!(stray.responses.lock().unwrap().len(), 1);
    assert!(events.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn in_dialog_request_is_keyed_with_to_tag() {
    let h = harness(TransactionConfig::for_testing());
    let (client, mut events) = RecordingClient::new();

    let mut bye = request(Method::Bye, "sip:bob@192.0.2.20", "dialog-1", "z9hG4bKbye1", 2);
    bye.headers.to = bye.headers.to.take().map(|to| to.with_tag("bob-tag"));
    let tx = h.manager.send_request(bye.clone(), Some(client)).await.unwrap();

    let tagged = TransactionKey::from_request(&bye, KeyContext::USE_VIA | KeyContext::USE_TO_TAG).unwrap();
    let untagged = TransactionKey::from_request(&bye, KeyContext::USE_VIA).unwrap();
    assert!(h.manager.find_client_transaction(&tagged).is_some());
    assert!(h.manager.find_client_transaction(&untagged).is_none());

    let ok = response_to(&tx.request(), 200, None);
    h.manager.process_message(ok.into(), peer_source(), None).await;
    match events.next(100).await {
        Some(ClientEvent::Final(response)) => assert_eq!(response.status, 200),
        other => panic!("expected 200, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_method_gets_405_with_allow() {
    let h = harness(TransactionConfig::for_testing());
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Options, server.clone());
    h.manager.set_request_interface(Method::Invite, server);

    let message = inbound(Method::Message, "auto-405", "z9hG4bK405", 1);
    h.manager.process_message(message.clone().into(), source_of(&message), None).await;
    settle().await;

    let rejected = h.transport.responses(405);
    assert_eq!(rejected.len(), 1);
    let allow = &as_response(&rejected[0]).headers.allow;
    assert_eq!(
        allow,
        &vec![Method::Invite, Method::Options, Method::Ack, Method::Cancel, Method::Prack]
    );
    assert!(events.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn merged_request_gets_482() {
    let h = harness(TransactionConfig::for_testing());
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Invite, server);

    let first = inbound(Method::Invite, "merge-1", "z9hG4bKpath1", 1);
    h.manager.process_message(first.clone().into(), source_of(&first), None).await;
    let tx = events.transaction(100).await.unwrap();
    assert!(!tx.is_merged());

    // Same request, forked back to us over another path.
    let second = inbound(Method::Invite, "merge-1", "z9hG4bKpath2", 1);
    h.manager.process_message(second.clone().into(), source_of(&second), None).await;
    settle().await;

    let looped = h.transport.responses(482);
    assert_eq!(looped.len(), 1);
    let response = as_response(&looped[0]);
    assert_eq!(response.reason, "Merged Request");
    assert_eq!(response.top_via().unwrap().branch(), Some("z9hG4bKpath2"));
    assert!(events.drain().is_empty());
    assert_eq!(h.manager.counts().merged, 1);
}

#[tokio::test(start_paused = true)]
async fn stray_cancel_gets_481_or_goes_to_stray_interface() {
    let h = harness(TransactionConfig::for_testing());

    let cancel = inbound(Method::Cancel, "stray-1", "z9hG4bKstray1", 1);
    h.manager.process_message(cancel.clone().into(), source_of(&cancel), None).await;
    assert_eq!(h.transport.responses(481).len(), 1);

    let stray = Arc::new(StrayRecorder::default());
    h.manager.set_stray_interface(Some(stray.clone()));
    let cancel = inbound(Method::Cancel, "stray-2", "z9hG4bKstray2", 1);
    h.manager.process_message(cancel.clone().into(), source_of(&cancel), None).await;
    settle().await;
    assert_eq!(h.transport.responses(481).len(), 1);
    assert_eq!(stray.cancels.lock().unwrap().len(), 1);

    let ack = inbound(Method::Ack, "stray-3", "z9hG4bKstray3", 1);
    h.manager.process_message(ack.clone().into(), source_of(&ack), None).await;
    settle().await;
    assert_eq!(stray.acks.lock().unwrap().len(), 1);
    assert!(h.transport.sent().iter().all(|s| !s.message.is_request()));
}

#[tokio::test(start_paused = true)]
async fn stray_prack_gets_481() {
    let h = harness(TransactionConfig::for_testing());
    let stray = Arc::new(StrayRecorder::default());
    h.manager.set_stray_interface(Some(stray.clone()));

    let mut prack = inbound(Method::Prack, "stray-prack", "z9hG4bKsp1", 2);
    prack.headers.rack = Some(rvoip_transaction_layer::message::RAck {
        rseq: 1,
        cseq: 1,
        method: Method::Invite,
    });
    h.manager.process_message(prack.clone().into(), source_of(&prack), None).await;
    settle().await;

    assert_eq!(h.transport.responses(481).len(), 1);
    assert_eq!(stray.pracks.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn proxy_answers_483_when_max_forwards_is_exhausted() {
    let config = TransactionConfig::proxy().with_timers(TimerSettings::for_testing());
    let h = harness(config);
    let (server, mut events) = RecordingServer::new();
    h.manager.set_default_request_interface(Some(server));

    let mut invite = inbound(Method::Invite, "hops-1", "z9hG4bKhops1", 1);
    invite.headers.max_forwards = Some(0);
    h.manager.process_message(invite.clone().into(), source_of(&invite), None).await;
    settle().await;

    assert_eq!(h.transport.responses(483).len(), 1);
    // Proxies send no automatic 100.
    assert!(h.transport.responses(100).is_empty());
    assert!(events.drain().is_empty());

    // REGISTER is exempt.
    let mut register = inbound(Method::Register, "hops-2", "z9hG4bKhops2", 1);
    register.headers.max_forwards = Some(0);
    h.manager.process_message(register.clone().into(), source_of(&register), None).await;
    assert!(events.transaction(100).await.is_some());
    assert_eq!(h.transport.responses(483).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn too_many_pending_requests_get_503() {
    let mut config = TransactionConfig::for_testing();
    config.max_pending_requests = Some(1);
    let h = harness(config);
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Options, server);

    let first = inbound(Method::Options, "busy-1", "z9hG4bKbusy1", 1);
    h.manager.process_message(first.clone().into(), source_of(&first), None).await;
    assert!(events.transaction(100).await.is_some());

    let second = inbound(Method::Options, "busy-2", "z9hG4bKbusy2", 1);
    h.manager.process_message(second.clone().into(), source_of(&second), None).await;
    settle().await;

    assert_eq!(h.transport.responses(503).len(), 1);
    assert!(events.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_request_is_answered_and_malformed_response_dropped() {
    let h = harness(TransactionConfig::for_testing());
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Options, server);

    let options = inbound(Method::Options, "bad-1", "z9hG4bKbad1", 1);
    h.manager
        .process_message(options.clone().into(), source_of(&options), Some(("Bad Contact".to_string(), 0)))
        .await;
    settle().await;

    let rejected = h.transport.responses(400);
    assert_eq!(rejected.len(), 1);
    assert_eq!(as_response(&rejected[0]).body.as_ref(), b"Bad Contact");
    assert!(events.drain().is_empty());

    let stray = Arc::new(StrayRecorder::default());
    h.manager.set_stray_interface(Some(stray.clone()));
    let response = response_to(&options, 200, Some("x"));
    h.manager
        .process_message(response.into(), peer_source(), Some(("Bad Via".to_string(), 400)))
        .await;
    settle().await;
    assert!(stray.responses.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn responses_follow_rport_and_received() {
    let h = harness(TransactionConfig::for_testing());
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Options, server);

    let mut options = inbound(Method::Options, "nat-1", "z9hG4bKnat1", 1);
    options.headers.via[0].rport = Some(RPort::Requested);
    let behind_nat = MessageSource::new(udp("198.51.100.9", 6000));
    h.manager.process_message(options.into(), behind_nat, None).await;

    let tx = events.transaction(100).await.unwrap();
    let via = tx.request().top_via().unwrap();
    assert_eq!(via.received.as_deref(), Some("198.51.100.9"));
    assert_eq!(via.rport, Some(RPort::Value(6000)));

    tx.send_response(Some(create_response(tx.request(), 200))).await.unwrap();
    assert_eq!(h.transport.responses(200)[0].to, udp("198.51.100.9", 6000));
}

#[derive(Default)]
struct RemovalLog(Mutex<Vec<TransactionKind>>);

impl TransactionRemovalListener for RemovalLog {
    fn transaction_removed(&self, _key: &TransactionKey, kind: TransactionKind) {
        self.0.lock().unwrap().push(kind);
    }
}

#[tokio::test(start_paused = true)]
#[serial]
async fn removal_listener_sees_every_transaction_leave() {
    init_tracing();
    let h = harness(TransactionConfig::for_testing());
    let log = Arc::new(RemovalLog::default());
    h.manager.set_removal_listener(Some(log.clone()));
    let (server, mut events) = RecordingServer::new();
    h.manager.set_request_interface(Method::Options, server);

    let options = inbound(Method::Options, "removal-1", "z9hG4bKrm1", 1);
    h.manager.process_message(options.clone().into(), source_of(&options), None).await;
    let tx = events.transaction(100).await.unwrap();
    tx.send_response(Some(create_response(tx.request(), 200))).await.unwrap();

    let (client, _client_events) = RecordingClient::new();
    let outgoing = request(Method::Options, "sip:carol@192.0.2.40", "removal-2", "z9hG4bKrm2", 1);
    let sent = h.manager.send_request(outgoing, Some(client)).await.unwrap();
    let ok = response_to(&sent.request(), 200, Some("carol"));
    h.manager.process_message(ok.into(), peer_source(), None).await;

    let counts = h.manager.counts();
    assert_eq!((counts.client, counts.server), (1, 1));

    tokio::time::sleep(Duration::from_millis(700)).await;
    let counts = h.manager.counts();
    assert_eq!((counts.client, counts.server), (0, 0));
    assert_eq!(counts.clients_created, 1);
    assert_eq!(counts.servers_created, 1);

    let mut removed = log.0.lock().unwrap().clone();
    removed.sort_by_key(|kind| kind.to_string());
    assert_eq!(removed, vec![TransactionKind::ClientNonInvite, TransactionKind::ServerNonInvite]);
}
