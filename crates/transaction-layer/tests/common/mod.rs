// Shared fixtures for the transaction layer integration tests
//
// A mock transport records every message put on the "wire" together with the (paused)
// tokio clock, so retransmission schedules can be checked exactly. The recording TU
// interfaces forward every callback into channels the tests wait on.

#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use rvoip_transaction_layer::message::{NameAddr, RAck, SipUri, TransportType, Via};
use rvoip_transaction_layer::prelude::*;

/// Local address of the UA under test.
pub const LOCAL_HOST: &str = "192.0.2.1";

/// Peer UA used by the server-side tests.
pub const PEER_HOST: &str = "192.0.2.30";

// ---- wire log -----------------------------------------------------------------------

/// One message handed to a connection.
#[derive(Debug, Clone)]
pub struct Sent {
    pub at: Instant,
    pub to: Endpoint,
    pub message: Message,
}

#[derive(Debug, Default)]
struct Wire {
    sent: Vec<Sent>,
    refused: HashSet<Endpoint>,
    failing: HashSet<Endpoint>,
}

#[derive(Debug)]
pub struct MockConnection {
    remote: Endpoint,
    wire: Arc<Mutex<Wire>>,
}

#[async_trait]
impl Connection for MockConnection {
    fn remote(&self) -> &Endpoint {
        &self.remote
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let mut wire = self.wire.lock().unwrap();
        if wire.failing.contains(&self.remote) {
            return Err(Error::Transport(format!("send to {} failed", self.remote)));
        }
        wire.sent.push(Sent {
            at: Instant::now(),
            to: self.remote.clone(),
            message: message.clone(),
        });
        Ok(())
    }
}

/// Transport handing out recording connections, one per endpoint.
#[derive(Debug, Default)]
pub struct MockTransport {
    wire: Arc<Mutex<Wire>>,
    connections: Mutex<HashMap<Endpoint, Arc<MockConnection>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `get_connection` fails for `endpoint`.
    pub fn refuse(&self, endpoint: &Endpoint) {
        self.wire.lock().unwrap().refused.insert(endpoint.clone());
    }

    /// Sends to `endpoint` fail with a transport error.
    pub fn fail_sends(&self, endpoint: &Endpoint) {
        self.wire.lock().unwrap().failing.insert(endpoint.clone());
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.wire.lock().unwrap().sent.clone()
    }

    pub fn clear(&self) {
        self.wire.lock().unwrap().sent.clear();
    }

    /// Requests with `method`, in send order.
    pub fn requests(&self, method: Method) -> Vec<Sent> {
        self.sent()
            .into_iter()
            .filter(|s| matches!(&s.message, Message::Request(r) if r.method == method))
            .collect()
    }

    /// Responses with `status`, in send order.
    pub fn responses(&self, status: u16) -> Vec<Sent> {
        self.sent()
            .into_iter()
            .filter(|s| matches!(&s.message, Message::Response(r) if r.status == status))
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get_connection(&self, remote: &Endpoint) -> Result<Arc<dyn Connection>> {
        if self.wire.lock().unwrap().refused.contains(remote) {
            return Err(Error::Transport(format!("connection to {remote} refused")));
        }
        let mut connections = self.connections.lock().unwrap();
        let connection = connections
            .entry(remote.clone())
            .or_insert_with(|| {
                Arc::new(MockConnection {
                    remote: remote.clone(),
                    wire: self.wire.clone(),
                })
            })
            .clone();
        Ok(connection)
    }
}

/// Gaps between consecutive sends, in milliseconds.
pub fn gaps(sent: &[Sent]) -> Vec<u64> {
    sent.windows(2)
        .map(|pair| (pair[1].at - pair[0].at).as_millis() as u64)
        .collect()
}

pub fn as_request(sent: &Sent) -> &Request {
    match &sent.message {
        Message::Request(request) => request,
        Message::Response(response) => panic!("expected a request, got {response}"),
    }
}

pub fn as_response(sent: &Sent) -> &Response {
    match &sent.message {
        Message::Response(response) => response,
        Message::Request(request) => panic!("expected a response, got {request}"),
    }
}

// ---- resolver -----------------------------------------------------------------------

/// Resolver with fixed answers per host; unknown hosts are taken literally.
#[derive(Debug, Default)]
pub struct ScriptedResolver {
    answers: Mutex<HashMap<String, Vec<Endpoint>>>,
}

impl ScriptedResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, host: &str, endpoints: Vec<Endpoint>) {
        self.answers
            .lock()
            .unwrap()
            .insert(host.to_string(), endpoints);
    }
}

#[async_trait]
impl Resolver for ScriptedResolver {
    async fn resolve(
        &self,
        host: &str,
        port: Option<u16>,
        transport: Option<TransportType>,
    ) -> Result<Vec<Endpoint>> {
        if let Some(endpoints) = self.answers.lock().unwrap().get(host) {
            return Ok(endpoints.clone());
        }
        LiteralResolver.resolve(host, port, transport).await
    }
}

pub fn udp(host: &str, port: u16) -> Endpoint {
    Endpoint::new(host, port, TransportType::Udp)
}

// ---- TU interfaces ------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Provisional(u16),
    ReliableProvisional(Response),
    Final(Response),
    TimeOut,
    IcmpError,
    MultipleFinal(Response),
}

/// Client interface forwarding every callback into a channel.
pub struct RecordingClient {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

pub struct ClientEvents {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl RecordingClient {
    pub fn new() -> (Arc<Self>, ClientEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), ClientEvents { rx })
    }
}

impl ClientEvents {
    /// Next event, or `None` if nothing arrives within `ms` (virtual) milliseconds.
    pub async fn next(&mut self, ms: u64) -> Option<ClientEvent> {
        timeout(Duration::from_millis(ms), self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Events already queued.
    pub fn drain(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[async_trait]
impl ClientTransactionInterface for RecordingClient {
    async fn provisional_response(&self, _transaction: Arc<ClientTransaction>, response: Response) {
        let _ = self.tx.send(ClientEvent::Provisional(response.status));
    }

    async fn reliable_provisional_response(&self, _transaction: Arc<ClientTransaction>, response: Response) {
        let _ = self.tx.send(ClientEvent::ReliableProvisional(response));
    }

    async fn final_response(&self, _transaction: Arc<ClientTransaction>, response: Response) {
        let _ = self.tx.send(ClientEvent::Final(response));
    }

    async fn time_out(&self, _transaction: Arc<ClientTransaction>) {
        let _ = self.tx.send(ClientEvent::TimeOut);
    }

    async fn icmp_error(&self, _transaction: Arc<ClientTransaction>) {
        let _ = self.tx.send(ClientEvent::IcmpError);
    }

    async fn multiple_final_response(
        &self,
        _original: Arc<ClientTransaction>,
        _copy: Arc<ClientTransaction>,
        response: Response,
    ) {
        let _ = self.tx.send(ClientEvent::MultipleFinal(response));
    }
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Request(Arc<ServerTransaction>),
    Ack(Request),
    Cancel(Request),
    Prack(Request),
    TimeOut,
    IcmpError,
}

/// Request and server-transaction interface in one. New transactions get this object as
/// their interface. PRACKs are answered with 200, the other events only recorded.
pub struct RecordingServer {
    this: std::sync::Weak<RecordingServer>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

pub struct ServerEvents {
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl RecordingServer {
    pub fn new() -> (Arc<Self>, ServerEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            tx,
        });
        (server, ServerEvents { rx })
    }
}

impl ServerEvents {
    pub async fn next(&mut self, ms: u64) -> Option<ServerEvent> {
        timeout(Duration::from_millis(ms), self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Waits for the next new request.
    pub async fn transaction(&mut self, ms: u64) -> Option<Arc<ServerTransaction>> {
        match self.next(ms).await? {
            ServerEvent::Request(transaction) => Some(transaction),
            other => panic!("expected a request, got {other:?}"),
        }
    }

    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[async_trait]
impl RequestInterface for RecordingServer {
    async fn request(&self, transaction: Arc<ServerTransaction>) {
        if let Some(this) = self.this.upgrade() {
            transaction.set_interface(Some(this));
        }
        let _ = self.tx.send(ServerEvent::Request(transaction));
    }
}

#[async_trait]
impl ServerTransactionInterface for RecordingServer {
    async fn ack(&self, _transaction: Arc<ServerTransaction>, ack: Request) {
        let _ = self.tx.send(ServerEvent::Ack(ack));
    }

    async fn cancel(&self, _transaction: Arc<ServerTransaction>, cancel: Request) {
        let _ = self.tx.send(ServerEvent::Cancel(cancel));
    }

    async fn prack(&self, _transaction: Arc<ServerTransaction>, prack: Arc<ServerTransaction>) {
        let _ = self.tx.send(ServerEvent::Prack(prack.request().clone()));
        let ok = create_response(prack.request(), 200);
        prack.send_response(Some(ok)).await.unwrap();
    }

    async fn time_out(&self, _transaction: Arc<ServerTransaction>) {
        let _ = self.tx.send(ServerEvent::TimeOut);
    }

    async fn icmp_error(&self, _transaction: Arc<ServerTransaction>) {
        let _ = self.tx.send(ServerEvent::IcmpError);
    }
}

/// Stray message sink.
#[derive(Default)]
pub struct StrayRecorder {
    pub acks: Mutex<Vec<Request>>,
    pub cancels: Mutex<Vec<Request>>,
    pub pracks: Mutex<Vec<Request>>,
    pub responses: Mutex<Vec<Response>>,
}

#[async_trait]
impl StrayMessageInterface for StrayRecorder {
    async fn stray_ack(&self, ack: Request) {
        self.acks.lock().unwrap().push(ack);
    }

    async fn stray_cancel(&self, cancel: Request) {
        self.cancels.lock().unwrap().push(cancel);
    }

    async fn stray_prack(&self, prack: Request) {
        self.pracks.lock().unwrap().push(prack);
    }

    async fn stray_response(&self, response: Response) {
        self.responses.lock().unwrap().push(response);
    }
}

// ---- messages -----------------------------------------------------------------------

pub fn uri(s: &str) -> SipUri {
    s.parse().unwrap()
}

/// A request from `via_host` with the given Call-ID, branch and CSeq.
pub fn request_from(
    method: Method,
    target: &str,
    via_host: &str,
    call_id: &str,
    branch: &str,
    cseq: u32,
) -> Request {
    RequestBuilder::new(method, uri(target))
        .via(Via::new(TransportType::Udp, via_host, Some(5060), branch))
        .from(NameAddr::new(uri("sip:alice@example.com")).with_tag("alice-tag"))
        .to(NameAddr::new(uri("sip:bob@example.com")))
        .call_id(call_id)
        .cseq(cseq)
        .max_forwards(70)
        .build()
}

/// An outgoing request of the UA under test.
pub fn request(method: Method, target: &str, call_id: &str, branch: &str, cseq: u32) -> Request {
    request_from(method, target, LOCAL_HOST, call_id, branch, cseq)
}

pub fn invite(target: &str, call_id: &str, branch: &str) -> Request {
    request(Method::Invite, target, call_id, branch, 1)
}

/// A request arriving from the peer UA.
pub fn inbound(method: Method, call_id: &str, branch: &str, cseq: u32) -> Request {
    request_from(method, "sip:bob@192.0.2.1", PEER_HOST, call_id, branch, cseq)
}

/// A response to `request` as the peer would send it.
pub fn response_to(request: &Request, status: u16, to_tag: Option<&str>) -> Response {
    let builder = ResponseBuilder::new(status).from_request(request);
    match to_tag {
        Some(tag) => builder.with_to_tag(tag).build(),
        None => builder.build(),
    }
}

/// A PRACK from the peer acknowledging `provisional`.
pub fn prack_for(invite: &Request, provisional: &Response, branch: &str) -> Request {
    let mut prack = inbound(Method::Prack, invite.call_id().unwrap(), branch, 2);
    prack.headers.to = provisional.headers.to.clone();
    prack.headers.rack = Some(RAck {
        rseq: provisional.headers.rseq.unwrap(),
        cseq: invite.cseq().unwrap().seq,
        method: Method::Invite,
    });
    prack
}

/// Where a request of the peer comes from.
pub fn source_of(request: &Request) -> MessageSource {
    let via = request.top_via().unwrap();
    MessageSource::new(udp(&via.host, via.sent_by_port()))
}

/// Where responses to our own requests come from.
pub fn peer_source() -> MessageSource {
    MessageSource::new(udp(PEER_HOST, 5060))
}

// ---- setup --------------------------------------------------------------------------

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub manager: TransactionManager,
    pub transport: Arc<MockTransport>,
    pub resolver: Arc<ScriptedResolver>,
}

pub fn harness(config: TransactionConfig) -> Harness {
    let transport = MockTransport::new();
    let resolver = ScriptedResolver::new();
    let manager = TransactionManager::new(config, transport.clone(), resolver.clone());
    Harness {
        manager,
        transport,
        resolver,
    }
}

/// Lets queued callbacks and spawned tasks run without moving the clock far.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
