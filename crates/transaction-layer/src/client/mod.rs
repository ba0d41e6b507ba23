//! # Client transactions (RFC 3261 section 17.1)
//!
//! A [`ClientTransaction`] sends one request and tracks its responses. Both flavors share
//! this type; the transition table and the handler set are picked by [`TransactionKind`]:
//!
//! - [`non_invite`]: CALLING, PROCEEDING, COMPLETED, TERMINATED (timers E, F, K).
//! - [`invite`]: adds RELIABLE_PROCEEDING (RFC 3262), ACK generation, the post-2xx
//!   sub-machine and CANCEL/PRACK sub-transactions (timers A, B, D).
//!
//! Every entry point (TU call, inbound response, timer) takes the transaction lock and feeds
//! one input to `run`, which drains a small queue: handlers never call
//! back into the machine, they queue the follow-up input (`NEXT_SERVER`, `IO_EXCEPTION`, ...)
//! instead. TU callbacks go through the callback pool and never run under the lock.

mod invite;
mod non_invite;
pub mod service_unavailable;

pub use service_unavailable::ServiceUnavailableHandler;

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::ReliableProvisionalSupport;
use crate::connection::ConnectionWrapper;
use crate::error::{Error, Result};
use crate::interfaces::ClientTransactionInterface;
use crate::manager::context::TransactionContext;
use crate::manager::registry::ClientEntry;
use crate::message::{
    create_ack_for_non_2xx, create_cancel, create_prack, Message, Method, Request, Response,
    OPTION_100REL,
};
use crate::timer::{TimerEvent, TimerSet, TimerTarget};
use crate::transaction::transitions::{initial_client_table, CLIENT_INVITE, CLIENT_INVITE_X};
use crate::transaction::{
    next_serial, AtomicTransactionState, ClientInput, KeyContext, StateTable, TransactionKey,
    TransactionKind, TransactionState, Transition,
};
use crate::utils::generate_branch;

/// Smallest and largest RSeq a reliable provisional may carry (RFC 3262 section 3).
const MIN_RSEQ: u32 = 1;
const MAX_RSEQ: u32 = (1 << 31) - 1;

/// Status codes already received, to tell retransmissions apart without looking at the
/// message again.
#[derive(Debug, Default)]
struct SeenStatuses(Vec<u16>);

impl SeenStatuses {
    const CAPACITY: usize = 8;

    /// Records `status`; returns `true` if it had been seen before.
    fn record(&mut self, status: u16) -> bool {
        if self.0.contains(&status) {
            return true;
        }
        if self.0.len() == Self::CAPACITY {
            self.0.remove(0);
        }
        self.0.push(status);
        false
    }
}

/// Callbacks queued for the TU.
enum Notification {
    Provisional(Response),
    ReliableProvisional(Response),
    Final(Response),
    TimeOut,
    IcmpError,
    MultipleFinal {
        original: Arc<ClientTransaction>,
        response: Response,
    },
}

/// Mutable part of a client transaction, only touched under its lock.
struct ClientInner {
    table: StateTable<ClientInput>,
    connection: ConnectionWrapper,
    timers: TimerSet,
    /// Inputs produced while handling the current one.
    pending: VecDeque<ClientInput>,
    /// The response being handled.
    incoming: Option<Response>,
    retries: u32,
    interval: Duration,
    seen: SeenStatuses,
    /// The last candidate was given up on because of I/O errors rather than silence.
    io_failed: bool,
    cleaned_up: bool,

    // INVITE only.
    to_tag: Option<String>,
    /// ACK supplied by the TU, or the one generated and sent.
    ack: Option<Request>,
    ack_connection: Option<ConnectionWrapper>,
    acked_non_2xx: bool,
    acked_2xx: bool,
    /// Final non-2xx over a reliable transport: TERMINATED was entered right away and the
    /// ACK is still expected there.
    ack_in_terminated: bool,
    last_rseq: Option<u32>,
    reliable_provisional: Option<Response>,
    local_cseq: u32,
    cancel: Option<Arc<ClientTransaction>>,
    cancel_interface: Option<Arc<dyn ClientTransactionInterface>>,
    prack_request: Option<(Request, Option<Arc<dyn ClientTransactionInterface>>)>,
    prack: Option<Arc<ClientTransaction>>,
}

/// One outbound request and its responses.
pub struct ClientTransaction {
    this: Weak<ClientTransaction>,
    serial: u64,
    kind: TransactionKind,
    method: Method,
    ctx: Arc<TransactionContext>,
    key: RwLock<TransactionKey>,
    state: AtomicTransactionState,
    request: RwLock<Request>,
    /// Best response so far; a final is never replaced by a provisional.
    response: RwLock<Option<Response>>,
    interface: RwLock<Option<Arc<dyn ClientTransactionInterface>>>,
    inner: Mutex<ClientInner>,
}

impl fmt::Debug for ClientTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransaction")
            .field("key", &*self.key.read())
            .field("kind", &self.kind)
            .field("state", &self.state.get())
            .finish()
    }
}

impl ClientTransaction {
    pub(crate) fn new(
        ctx: Arc<TransactionContext>,
        request: Request,
        key: TransactionKey,
        interface: Option<Arc<dyn ClientTransactionInterface>>,
        connection: ConnectionWrapper,
    ) -> Arc<Self> {
        let method = request.method().clone();
        let kind = TransactionKind::client(method.is_invite());
        let local_cseq = request.cseq().map(|c| c.seq).unwrap_or_default();
        let t1 = ctx.config.timers.t1;
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            serial: next_serial(),
            kind,
            method,
            key: RwLock::new(key),
            state: AtomicTransactionState::new(TransactionState::Initial),
            request: RwLock::new(request),
            response: RwLock::new(None),
            interface: RwLock::new(interface),
            inner: Mutex::new(ClientInner {
                table: StateTable::new(initial_client_table(kind.is_invite())),
                connection,
                timers: TimerSet::new(),
                pending: VecDeque::new(),
                incoming: None,
                retries: 0,
                interval: t1,
                seen: SeenStatuses::default(),
                io_failed: false,
                cleaned_up: false,
                to_tag: None,
                ack: None,
                ack_connection: None,
                acked_non_2xx: false,
                acked_2xx: false,
                ack_in_terminated: false,
                last_rseq: None,
                reliable_provisional: None,
                local_cseq,
                cancel: None,
                cancel_interface: None,
                prack_request: None,
                prack: None,
            }),
            ctx,
        })
    }

    pub fn key(&self) -> TransactionKey {
        self.key.read().clone()
    }

    /// Stable identity of this object; unlike the key it survives failover.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    pub fn is_invite(&self) -> bool {
        self.kind.is_invite()
    }

    pub fn is_proxy(&self) -> bool {
        self.ctx.is_proxy()
    }

    /// The request as last sent (the branch changes on failover).
    pub fn request(&self) -> Request {
        self.request.read().clone()
    }

    /// The best response received so far.
    pub fn response(&self) -> Option<Response> {
        self.response.read().clone()
    }

    pub fn set_interface(&self, interface: Option<Arc<dyn ClientTransactionInterface>>) {
        *self.interface.write() = interface;
    }

    /// The CANCEL transaction spawned by [`cancel`](Self::cancel), once there is one.
    pub async fn cancel_transaction(&self) -> Option<Arc<ClientTransaction>> {
        self.inner.lock().await.cancel.clone()
    }

    fn arc(&self) -> Result<Arc<ClientTransaction>> {
        self.this
            .upgrade()
            .ok_or_else(|| Error::Other("client transaction dropped".to_string()))
    }

    // ---- TU entry points ----------------------------------------------------------

    /// Registers the transaction and sends the request.
    pub fn start(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.start_inner())
    }

    async fn start_inner(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.table.is_started() || inner.cleaned_up {
            return Err(Error::StateMachine {
                table: inner.table.table_name(),
                state: inner.table.current().to_string(),
                input: ClientInput::Start.to_string(),
            });
        }

        if self.is_invite() && !self.is_proxy() {
            let mut request = self.request.write();
            match self.ctx.config.reliable_provisional {
                ReliableProvisionalSupport::Require => request.headers.add_require(OPTION_100REL),
                ReliableProvisionalSupport::Supported => request.headers.add_supported(OPTION_100REL),
                ReliableProvisionalSupport::Unsupported => {}
            }
        }

        self.ctx
            .registry
            .add_client(self.key(), ClientEntry::Transaction(self.arc()?))?;

        let timers = &self.ctx.config.timers;
        inner
            .timers
            .schedule(self.this.clone(), TimerEvent::Tn, timers.client_tn);
        if self.is_invite() && !self.is_proxy() {
            let expires = self.request.read().headers.expires;
            let expiration = expires
                .map(|secs| Duration::from_secs(u64::from(secs)))
                .or(self.ctx.config.default_invite_expiration);
            if let Some(expiration) = expiration {
                inner
                    .timers
                    .schedule(self.this.clone(), TimerEvent::Expiration, expiration);
            }
        }

        self.run(&mut inner, ClientInput::Start).await
    }

    /// Cancels a pending request: spawns a CANCEL client transaction, whose responses go
    /// to `interface`, and arms the cancel timer. Cancelling again, an INVITE that already
    /// has its final response, or a terminated transaction sends nothing and returns `Ok`.
    ///
    /// Fails with [`Error::StateMachine`] before [`start`](Self::start), in the COMPLETED
    /// state of a non-INVITE request and once an INVITE's post-2xx state has ended.
    pub async fn cancel(&self, interface: Option<Arc<dyn ClientTransactionInterface>>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.cancel_interface = interface;
        self.run(&mut inner, ClientInput::Cancel).await
    }

    /// ACKs the final response of an INVITE. Without `ack` one is built from the response.
    /// Each final class can be acknowledged once; a second ACK is an error outside proxy
    /// mode.
    pub async fn ack(&self, ack: Option<Request>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(ack) = ack {
            inner.ack = Some(ack);
        }
        if inner.table.current() == TransactionState::Terminated && inner.ack_in_terminated {
            inner.ack_in_terminated = false;
            let result = self.send_ack_non_2xx(&mut inner).await;
            self.cleanup(&mut inner);
            return result;
        }
        self.run(&mut inner, ClientInput::Ack).await
    }

    /// PRACKs the last reliable provisional (RFC 3262). Without `prack` one is built from
    /// the provisional. Returns the PRACK client transaction; its responses go to
    /// `interface`.
    pub async fn prack(
        &self,
        prack: Option<Request>,
        interface: Option<Arc<dyn ClientTransactionInterface>>,
    ) -> Result<Arc<ClientTransaction>> {
        if !self.is_invite() {
            return Err(Error::ReliableProvisional(format!(
                "PRACK belongs to an INVITE, not {}",
                self.method
            )));
        }
        if !self.ctx.config.handles_100rel() {
            return Err(Error::ReliableProvisional("100rel is not supported".to_string()));
        }
        let mut inner = self.inner.lock().await;
        let provisional = inner
            .reliable_provisional
            .clone()
            .filter(|p| p.headers.requires(OPTION_100REL))
            .ok_or_else(|| {
                Error::ReliableProvisional("no reliable provisional response to PRACK".to_string())
            })?;
        let prack = match prack {
            Some(prack) => prack,
            None => {
                inner.local_cseq += 1;
                create_prack(&self.request(), &provisional, inner.local_cseq)?
            }
        };
        inner.prack_request = Some((prack, interface));
        self.run(&mut inner, ClientInput::Prack).await?;
        inner
            .prack
            .take()
            .ok_or_else(|| Error::Other("PRACK transaction was not created".to_string()))
    }

    /// Ends the transaction without further notification (a proxy's Timer C).
    pub async fn terminate(&self) {
        let mut inner = self.inner.lock().await;
        inner.timers.cancel(TimerEvent::Tn);
        self.cleanup(&mut inner);
    }

    // ---- inbound ------------------------------------------------------------------

    /// A response matched to this transaction. `matched_to_tag` is set when the lookup
    /// succeeded with the To tag included.
    pub(crate) async fn on_response(&self, response: Response, matched_to_tag: bool) {
        let proxy = self.is_proxy();
        if !proxy && response.headers.via.len() > 1 {
            warn!(id = %self.key(), vias = response.headers.via.len(), "response with more than one Via dropped");
            return;
        }

        let mut inner = self.inner.lock().await;
        let best_is_final = self.response.read().as_ref().is_some_and(|r| r.is_final());
        if response.is_provisional() && best_is_final {
            warn!(id = %self.key(), status = response.status, "provisional after final response dropped");
            return;
        }

        if self.is_invite() && response.is_final() && !matched_to_tag {
            if let Some(tag) = response.to_tag() {
                let known = inner.to_tag.clone();
                match known.as_deref() {
                    None => inner.to_tag = Some(tag.to_string()),
                    Some(known) if known != tag && self.ctx.config.multiple_final_responses => {
                        let connection = inner.connection.share();
                        drop(inner);
                        self.fork(response, connection).await;
                        return;
                    }
                    Some(_) => {}
                }
            }
        }

        let input = match self.classify(&mut inner, &response) {
            Some(input) => input,
            None => return,
        };

        if !response.is_provisional() || !best_is_final {
            *self.response.write() = Some(response.clone());
        }
        inner.incoming = Some(response);
        if let Err(e) = self.run(&mut inner, input).await {
            debug!(id = %self.key(), error = %e, "response not accepted");
        }
    }

    /// Picks the input for a response, or `None` when it must be dropped.
    fn classify(&self, inner: &mut ClientInner, response: &Response) -> Option<ClientInput> {
        if response.status == 503 {
            return Some(ClientInput::ServiceUnavailable);
        }
        match response.class() {
            1 => self.classify_provisional(inner, response),
            2 => Some(ClientInput::Success),
            _ => Some(ClientInput::Failure),
        }
    }

    fn classify_provisional(&self, inner: &mut ClientInner, response: &Response) -> Option<ClientInput> {
        if !self.is_invite() {
            return Some(ClientInput::Provisional);
        }
        let state = inner.table.current();
        if response.status == 100 && state == TransactionState::ReliableProceeding {
            trace!(id = %self.key(), "100 while reliable proceeding ignored");
            return None;
        }
        let config = &self.ctx.config;
        let required = response.headers.requires(OPTION_100REL);
        if config.handles_100rel() && required && response.status != 100 {
            let Some(rseq) = response.headers.rseq else {
                warn!(id = %self.key(), status = response.status, "reliable provisional without RSeq dropped");
                return None;
            };
            if !(MIN_RSEQ..=MAX_RSEQ).contains(&rseq) {
                warn!(id = %self.key(), rseq, "RSeq out of range, provisional dropped");
                return None;
            }
            match inner.last_rseq {
                Some(last) if rseq <= last => {
                    debug!(id = %self.key(), rseq, "reliable provisional retransmission dropped");
                    return None;
                }
                Some(last) if rseq != last + 1 => {
                    warn!(id = %self.key(), rseq, expected = last + 1, "out of order RSeq, provisional dropped");
                    return None;
                }
                _ => {}
            }
            inner.last_rseq = Some(rseq);
            inner.reliable_provisional = Some(response.clone());
            return Some(ClientInput::ReliableProvisional);
        }
        if !self.is_proxy()
            && config.reliable_provisional == ReliableProvisionalSupport::Require
            && response.status != 100
            && !required
        {
            warn!(id = %self.key(), status = response.status, "unreliable provisional dropped, 100rel required");
            return None;
        }
        Some(ClientInput::Provisional)
    }

    /// The connection carrying this transaction failed underneath it.
    pub(crate) async fn on_connection_error(&self) {
        let mut inner = self.inner.lock().await;
        inner.connection.mark_unreachable();
        if let Err(e) = self.run(&mut inner, ClientInput::IoException).await {
            debug!(id = %self.key(), error = %e, "connection error ignored");
        }
    }

    /// Whether the transaction currently sends to `endpoint`.
    pub(crate) async fn uses_endpoint(&self, endpoint: &crate::transport::Endpoint) -> bool {
        self.inner.lock().await.connection.endpoint().as_ref() == Some(endpoint)
    }

    /// A final response from another fork: a copy of this transaction takes it, keyed
    /// with the new To tag.
    async fn fork(&self, response: Response, connection: ConnectionWrapper) {
        let key = match TransactionKey::from_response(&response, KeyContext::USE_VIA | KeyContext::USE_TO_TAG) {
            Ok(key) => key,
            Err(e) => {
                warn!(id = %self.key(), error = %e, "cannot key forked response");
                return;
            }
        };
        let copy = ClientTransaction::new(
            self.ctx.clone(),
            self.request(),
            key.clone(),
            self.interface.read().clone(),
            connection,
        );
        if let Err(e) = self
            .ctx
            .registry
            .add_client(key, ClientEntry::Transaction(copy.clone()))
        {
            debug!(id = %self.key(), error = %e, "forked transaction already exists");
            return;
        }
        match self.arc() {
            Ok(original) => copy.accept_forked_final(original, response).await,
            Err(e) => warn!(error = %e, "original transaction gone, fork dropped"),
        }
    }

    async fn accept_forked_final(&self, original: Arc<ClientTransaction>, response: Response) {
        let mut inner = self.inner.lock().await;
        inner.to_tag = response.to_tag().map(str::to_string);
        inner.seen.record(response.status);
        *self.response.write() = Some(response.clone());
        inner.incoming = Some(response.clone());
        if response.is_success() {
            self.enter_post_2xx(&mut inner);
        } else {
            inner.table.switch_table(&CLIENT_INVITE, TransactionState::Completed);
            self.state.set(TransactionState::Completed);
            self.arm_completion(&mut inner);
        }
        debug!(id = %self.key(), status = response.status, "forked final response");
        self.notify(Notification::MultipleFinal { original, response });
        let pending = std::mem::take(&mut inner.pending);
        for input in pending {
            if let Err(e) = self.run(&mut inner, input).await {
                debug!(id = %self.key(), error = %e, "forked transaction input rejected");
            }
        }
    }

    // ---- the machine --------------------------------------------------------------

    /// Feeds `input` and every input it produces. Errors of the first input are returned
    /// to the caller; transport failures become `IO_EXCEPTION`, anything else
    /// `OTHER_EXCEPTION`.
    async fn run(&self, inner: &mut ClientInner, input: ClientInput) -> Result<()> {
        inner.pending.push_back(input);
        let mut first = true;
        let mut outcome = Ok(());
        while let Some(input) = inner.pending.pop_front() {
            let from_caller = std::mem::replace(&mut first, false);
            let Err(e) = self.step(inner, input).await else {
                continue;
            };
            if e.is_rejection() {
                if from_caller {
                    outcome = Err(e);
                } else {
                    error!(id = %self.key(), %input, error = %e, "illegal transition on internal input");
                }
            } else if e.is_transport() {
                warn!(id = %self.key(), %input, error = %e, "transport failure");
                inner.connection.mark_unreachable();
                inner.pending.push_back(ClientInput::IoException);
            } else {
                warn!(id = %self.key(), %input, error = %e, "handler failed");
                inner.pending.push_back(ClientInput::OtherException);
            }
        }
        outcome
    }

    async fn step(&self, inner: &mut ClientInner, input: ClientInput) -> Result<()> {
        let transition = inner.table.switch_state(input)?;
        self.state.set(transition.to);
        if self.is_invite() {
            self.on_invite_transition(inner, transition).await
        } else {
            self.on_non_invite_transition(inner, transition).await
        }
    }

    // ---- shared handlers ----------------------------------------------------------

    /// INITIAL -> CALLING: connect if needed, send, arm T1. T1 also runs on reliable
    /// transports, where it only bounds the wait.
    async fn send_initial(&self, inner: &mut ClientInner) -> Result<()> {
        let request = self.request();
        if !inner.connection.is_set() {
            inner.connection.resolve_request(&request).await?;
        }
        inner.retries = 0;
        inner.interval = self.ctx.config.timers.t1;
        inner
            .timers
            .schedule(self.this.clone(), TimerEvent::T1, inner.interval);
        debug!(id = %self.key(), endpoint = ?inner.connection.endpoint(), "sending request");
        inner.connection.send(&Message::Request(request)).await
    }

    /// T1 fired in CALLING (or PROCEEDING for non-INVITE).
    async fn retransmit(&self, inner: &mut ClientInner, proceeding: bool) -> Result<()> {
        let timers = &self.ctx.config.timers;
        if inner.retries < timers.retry_limit(self.kind) {
            inner.retries += 1;
            inner.interval = if proceeding {
                timers.t2
            } else {
                timers.backoff(self.kind, inner.interval)
            };
            inner
                .timers
                .schedule(self.this.clone(), TimerEvent::T1, inner.interval);
            if !inner.connection.is_reliable() {
                trace!(id = %self.key(), retry = inner.retries, "retransmitting request");
                inner.connection.send(&Message::Request(self.request())).await?;
            }
            return Ok(());
        }

        debug!(id = %self.key(), retries = inner.retries, "no response, giving up on destination");
        // Requests inside a dialog say nothing about the destination as a whole.
        let in_dialog = self.request.read().to_tag().is_some();
        if !in_dialog {
            inner.connection.mark_unreachable();
        }
        if proceeding {
            inner.pending.push_back(ClientInput::T1Expired);
        } else if inner.connection.try_next().await {
            inner.pending.push_back(ClientInput::NextServer);
        } else {
            inner.pending.push_back(ClientInput::NoServer);
        }
        Ok(())
    }

    /// I/O failure while CALLING: next candidate or give up.
    async fn io_failover(&self, inner: &mut ClientInner) -> Result<()> {
        inner.io_failed = true;
        if inner.connection.try_next().await {
            inner.pending.push_back(ClientInput::NextServer);
        } else {
            inner.pending.push_back(ClientInput::NoServer);
        }
        Ok(())
    }

    /// CALLING -> INITIAL: a new branch on the new destination, then START again.
    fn next_server(&self, inner: &mut ClientInner) -> Result<()> {
        inner.timers.cancel(TimerEvent::T1);
        inner.retries = 0;
        inner.interval = self.ctx.config.timers.t1;

        let branch = generate_branch();
        if let Some(via) = self.request.write().headers.via.first_mut() {
            via.branch = Some(branch.clone());
        }
        let old = self.key();
        let new = old.with_branch(branch);
        *self.key.write() = new.clone();
        self.ctx.registry.rekey_client(&old, new.clone(), self.arc()?);
        debug!(%old, %new, endpoint = ?inner.connection.endpoint(), "trying next server");
        inner.pending.push_back(ClientInput::Start);
        Ok(())
    }

    /// A 503 is a failed destination. With another candidate, a
    /// [`ServiceUnavailableHandler`] takes over the old key to ACK the 503 and the
    /// transaction retries; otherwise the 503 is the final response.
    async fn service_unavailable(&self, inner: &mut ClientInner) -> Result<()> {
        let response = inner
            .incoming
            .clone()
            .ok_or_else(|| Error::Other("503 without response".to_string()))?;
        inner.connection.mark_unreachable();
        let previous = inner.connection.share();
        if !inner.connection.try_next().await {
            debug!(id = %self.key(), "503 and no other server");
            inner.pending.push_back(ClientInput::Failure);
            return Ok(());
        }

        let old_key = self.key();
        let ack = if self.is_invite() {
            Some(create_ack_for_non_2xx(&self.request(), &response)?)
        } else {
            None
        };
        let handler = ServiceUnavailableHandler::new(self.ctx.clone(), old_key.clone(), self.kind, ack, previous);
        self.ctx
            .registry
            .replace_client(old_key, ClientEntry::ServiceUnavailable(handler.clone()));
        handler.start().await;

        *self.response.write() = None;
        inner.to_tag = None;
        inner.last_rseq = None;
        inner.reliable_provisional = None;
        inner.pending.push_back(ClientInput::NextServer);
        Ok(())
    }

    /// Creates and starts the CANCEL transaction once, then arms the cancel timer.
    async fn send_cancel(&self, inner: &mut ClientInner) -> Result<()> {
        if inner.cancel.is_some() {
            trace!(id = %self.key(), "already cancelled");
            return Ok(());
        }
        let cancel = create_cancel(&self.request())?;
        // A CANCEL goes wherever the request went (RFC 3261 section 9.1).
        let connection = inner.connection.connection().cloned();
        let transaction = self
            .ctx
            .create_client(cancel, inner.cancel_interface.take(), connection)?;
        transaction.start().await?;
        inner.cancel = Some(transaction);
        inner.timers.schedule(
            self.this.clone(),
            TimerEvent::CancelTimer,
            self.ctx.config.timers.cancel_timer,
        );
        Ok(())
    }

    /// Delivers a final response and arms the completion wait.
    fn complete(&self, inner: &mut ClientInner) {
        inner.timers.cancel(TimerEvent::T1);
        inner.timers.cancel(TimerEvent::Tn);
        inner.timers.cancel(TimerEvent::Expiration);
        inner.timers.cancel(TimerEvent::CancelTimer);
        if let Some(response) = inner.incoming.clone() {
            inner.seen.record(response.status);
            self.notify(Notification::Final(response));
        }
        self.arm_completion(inner);
    }

    /// Arms `To`. Reliable transports have none and time out at once; an INVITE then
    /// still takes its ACK in TERMINATED.
    fn arm_completion(&self, inner: &mut ClientInner) {
        let wait = self
            .ctx
            .config
            .timers
            .completion_timeout(self.kind, inner.connection.is_reliable());
        if wait.is_zero() {
            if self.is_invite() {
                inner.ack_in_terminated = true;
                inner.timers.schedule(
                    self.this.clone(),
                    TimerEvent::Removal,
                    self.ctx.config.timers.ack_wait(),
                );
            }
            inner.pending.push_back(ClientInput::Timeout);
        } else {
            inner.timers.schedule(self.this.clone(), TimerEvent::Timeout, wait);
        }
    }

    /// Switches an INVITE onto the post-2xx sub-machine.
    fn enter_post_2xx(&self, inner: &mut ClientInner) {
        inner.table.switch_table(&CLIENT_INVITE_X, TransactionState::XCompleted);
        self.state.set(TransactionState::XCompleted);
        let timers = &self.ctx.config.timers;
        if self.is_proxy() {
            inner.timers.schedule(self.this.clone(), TimerEvent::Tn, timers.tu1);
        } else {
            inner
                .timers
                .schedule(self.this.clone(), TimerEvent::Timeout, timers.ack_wait());
        }
    }

    /// TERMINATED reached: tell the TU why, then clean up.
    fn terminated(&self, inner: &mut ClientInner, transition: Transition<ClientInput>) {
        match transition.input {
            ClientInput::NoServer if inner.io_failed => self.notify(Notification::IcmpError),
            ClientInput::NoServer
            | ClientInput::T1Expired
            | ClientInput::Tn
            | ClientInput::CancelTimer => self.notify(Notification::TimeOut),
            ClientInput::OtherException if !self.response().is_some_and(|r| r.is_final()) => {
                self.notify(Notification::TimeOut)
            }
            _ => {}
        }
        debug!(id = %self.key(), from = %transition.from, input = %transition.input, "client transaction terminated");
        self.cleanup(inner);
    }

    /// Sends the ACK for a non-2xx final, building it if the TU gave none.
    async fn send_ack_non_2xx(&self, inner: &mut ClientInner) -> Result<()> {
        let ack = match inner.ack.take() {
            Some(ack) => ack,
            None => {
                let response = self
                    .response()
                    .ok_or_else(|| Error::Other("ACK without final response".to_string()))?;
                create_ack_for_non_2xx(&self.request(), &response)?
            }
        };
        inner.acked_non_2xx = true;
        inner.ack = Some(ack.clone());
        inner.connection.send(&Message::Request(ack)).await
    }

    /// Re-sends the ACK already sent for the current final.
    async fn resend_ack(&self, inner: &mut ClientInner) -> Result<()> {
        let Some(ack) = inner.ack.clone() else {
            return Ok(());
        };
        trace!(id = %self.key(), "re-sending ACK");
        let message = Message::Request(ack);
        match inner.ack_connection.as_ref() {
            Some(connection) => connection.send(&message).await,
            None => inner.connection.send(&message).await,
        }
    }

    /// Queues a callback for the TU. Callbacks of one transaction stay in order.
    fn notify(&self, notification: Notification) {
        let Some(interface) = self.interface.read().clone() else {
            trace!(id = %self.key(), "no client interface, callback dropped");
            return;
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.ctx.callbacks.spawn(self.serial, async move {
            match notification {
                Notification::Provisional(r) => interface.provisional_response(this, r).await,
                Notification::ReliableProvisional(r) => {
                    interface.reliable_provisional_response(this, r).await
                }
                Notification::Final(r) => interface.final_response(this, r).await,
                Notification::TimeOut => interface.time_out(this).await,
                Notification::IcmpError => interface.icmp_error(this).await,
                Notification::MultipleFinal { original, response } => {
                    interface.multiple_final_response(original, this, response).await
                }
            }
        });
    }

    /// Leaves the tables and releases the connection. Idempotent.
    fn cleanup(&self, inner: &mut ClientInner) {
        if inner.cleaned_up {
            return;
        }
        inner.cleaned_up = true;
        inner.timers.cancel_all();
        inner.connection.release();
        if let Some(mut connection) = inner.ack_connection.take() {
            connection.release();
        }
        let key = self.key();
        self.ctx.registry.remove_client(&key, self.serial, self.kind);
        debug!(id = %key, "client transaction removed");
    }
}

#[async_trait]
impl TimerTarget for ClientTransaction {
    async fn on_timer(self: Arc<Self>, event: TimerEvent, generation: u64) {
        let mut inner = self.inner.lock().await;
        if !inner.timers.claim(event, generation) {
            return;
        }
        let input = match event {
            TimerEvent::T1 => ClientInput::T1,
            TimerEvent::Timeout => ClientInput::Timeout,
            TimerEvent::Tn => ClientInput::Tn,
            TimerEvent::CancelTimer => ClientInput::CancelTimer,
            // An expired INVITE is cancelled.
            TimerEvent::Expiration => ClientInput::Cancel,
            TimerEvent::Removal => {
                if inner.ack_in_terminated {
                    debug!(id = %self.key(), "ACK never came, removing transaction");
                }
                self.cleanup(&mut inner);
                return;
            }
            TimerEvent::TProvisional => return,
        };
        trace!(id = %self.key(), %event, "client timer fired");
        if let Err(e) = self.run(&mut inner, input).await {
            debug!(id = %self.key(), %event, error = %e, "timer input rejected");
        }
    }
}
