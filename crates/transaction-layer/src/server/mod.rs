//! # Server transactions (RFC 3261 section 17.2)
//!
//! A [`ServerTransaction`] owns one received request and the responses the TU sends for it.
//! As on the client side one type covers both flavors:
//!
//! - [`non_invite`]: CALLING, PROCEEDING, COMPLETED, TERMINATED (timer J), plus the delayed
//!   automatic 100 (TU3).
//! - [`invite`]: adds WAIT_PRACK/RELIABLE_PROCEEDING for RFC 3262 reliable provisionals,
//!   CONFIRMED (timers G, H, I) and the post-2xx sub-machine that retransmits the 2xx
//!   until the ACK arrives.
//!
//! Responses go back over a [`ResponseRoute`]: the connection the request arrived on, then
//! the Via `rport`/`maddr`/`received`/sent-by candidates. A send failure becomes an
//! `IO_EXCEPTION` input, which advances the route (`NEXT_CLIENT`) or gives up
//! (`NO_CLIENT`).

mod invite;
mod non_invite;

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
use crate::connection::{ConnectionWrapper, ResponseRoute};
use crate::error::{Error, Result};
use crate::interfaces::ServerTransactionInterface;
use crate::manager::context::TransactionContext;
use crate::message::{
    create_response, create_trying, make_reliable, Message, Method, Request, Response,
    ResponseBuilder, Via, OPTION_100REL,
};
use crate::timer::{TimerEvent, TimerSet, TimerTarget};
use crate::transaction::transitions::initial_server_table;
use crate::transaction::{
    next_serial, AtomicTransactionState, DialogId, ServerInput, StateTable, TransactionKey,
    TransactionKind, TransactionState, Transition,
};
use crate::transport::MessageSource;

/// Callbacks queued for the TU.
enum Notification {
    Ack(Request),
    Cancel(Request),
    Prack(Arc<ServerTransaction>),
    TimeOut,
    IcmpError,
}

/// Mutable part of a server transaction, only touched under its lock.
struct ServerInner {
    table: StateTable<ServerInput>,
    connection: ConnectionWrapper,
    route: ResponseRoute,
    timers: TimerSet,
    pending: VecDeque<ServerInput>,
    /// The response to send on the current transition, and to re-send for request
    /// retransmissions.
    current: Option<Response>,
    /// Status of the final response, once one was sent.
    final_status: Option<u16>,
    retries: u32,
    interval: Duration,
    cleaned_up: bool,

    /// CANCEL being processed, delivered to the TU once.
    cancel: Option<Request>,
    cancel_delivered: bool,
    /// CANCEL server transaction that arrived before this transaction started. It is
    /// answered when the transaction starts.
    early_cancel: Option<Arc<ServerTransaction>>,
    /// ACK being processed.
    ack: Option<Request>,

    // INVITE only.
    rseq: u32,
    /// Reliable provisional awaiting its PRACK.
    unacknowledged: Option<Response>,
    prack: Option<Arc<ServerTransaction>>,
    dialog: Option<DialogId>,
}

/// One received request and its responses.
pub struct ServerTransaction {
    this: Weak<ServerTransaction>,
    serial: u64,
    kind: TransactionKind,
    method: Method,
    key: TransactionKey,
    /// Same request as an existing transaction, arrived over another path.
    merged: bool,
    ctx: Arc<TransactionContext>,
    request: Request,
    source: MessageSource,
    state: AtomicTransactionState,
    response: RwLock<Option<Response>>,
    interface: RwLock<Option<Arc<dyn ServerTransactionInterface>>>,
    /// A CANCEL that arrived while no interface was set; handed over by `set_interface`.
    missed_cancel: parking_lot::Mutex<Option<Request>>,
    inner: Mutex<ServerInner>,
}

impl fmt::Debug for ServerTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTransaction")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("state", &self.state.get())
            .field("merged", &self.merged)
            .finish()
    }
}

impl ServerTransaction {
    pub(crate) fn new(
        ctx: Arc<TransactionContext>,
        request: Request,
        key: TransactionKey,
        merged: bool,
        via: Via,
        source: MessageSource,
    ) -> Arc<Self> {
        let method = request.method().clone();
        let kind = TransactionKind::server(method.is_invite());
        let t1 = ctx.config.timers.t1;
        let connection = ctx.new_connection();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            serial: next_serial(),
            kind,
            method,
            key,
            merged,
            request,
            state: AtomicTransactionState::new(TransactionState::Initial),
            response: RwLock::new(None),
            interface: RwLock::new(None),
            missed_cancel: parking_lot::Mutex::new(None),
            inner: Mutex::new(ServerInner {
                table: StateTable::new(initial_server_table(kind.is_invite())),
                connection,
                route: ResponseRoute::new(via, source.clone()),
                timers: TimerSet::new(),
                pending: VecDeque::new(),
                current: None,
                final_status: None,
                retries: 0,
                interval: t1,
                cleaned_up: false,
                cancel: None,
                cancel_delivered: false,
                early_cancel: None,
                ack: None,
                rseq: 0,
                unacknowledged: None,
                prack: None,
                dialog: None,
            }),
            source,
            ctx,
        })
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

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

    pub fn is_merged(&self) -> bool {
        self.merged
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Where the request came from.
    pub fn source(&self) -> &MessageSource {
        &self.source
    }

    /// The last response handed to this transaction.
    pub fn response(&self) -> Option<Response> {
        self.response.read().clone()
    }

    pub fn reliable_provisional_support(&self) -> ReliableProvisionalSupport {
        self.ctx.config.reliable_provisional
    }

    /// Sets the interface for ACK, CANCEL, PRACK and failure events. A CANCEL that
    /// arrived before any interface was set is delivered to the new one right away.
    pub fn set_interface(&self, interface: Option<Arc<dyn ServerTransactionInterface>>) {
        *self.interface.write() = interface.clone();
        if interface.is_none() {
            return;
        }
        let missed = self.missed_cancel.lock().take();
        if let Some(cancel) = missed {
            debug!(id = %self.key, "replaying CANCEL to new interface");
            self.notify(Notification::Cancel(cancel));
        }
    }

    fn arc(&self) -> Result<Arc<ServerTransaction>> {
        self.this
            .upgrade()
            .ok_or_else(|| Error::Other("server transaction dropped".to_string()))
    }

    // ---- lifecycle ----------------------------------------------------------------

    /// Arms the lifetime timers and enters CALLING. If a CANCEL got here first it is
    /// answered and processed instead.
    pub(crate) async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.table.is_started() {
            return Ok(());
        }

        let timers = &self.ctx.config.timers;
        inner
            .timers
            .schedule(self.this.clone(), TimerEvent::Tn, timers.server_tn);
        if !self.is_invite() {
            if let Some(tu3) = timers.tu3.filter(|d| !d.is_zero()) {
                inner
                    .timers
                    .schedule(self.this.clone(), TimerEvent::TProvisional, tu3);
            }
        } else if !self.is_proxy() {
            let expiration = self
                .request
                .headers
                .expires
                .map(|secs| Duration::from_secs(u64::from(secs)))
                .or(self.ctx.config.default_invite_expiration);
            if let Some(expiration) = expiration {
                inner
                    .timers
                    .schedule(self.this.clone(), TimerEvent::Expiration, expiration);
            }
        }

        let input = if inner.early_cancel.is_some() {
            ServerInput::Cancel
        } else {
            ServerInput::Start
        };
        self.run(&mut inner, input).await
    }

    /// Records a CANCEL server transaction for a request that has not started yet.
    /// Returns `false` when the transaction is already running.
    pub(crate) async fn try_mark_cancelled(&self, cancel: Arc<ServerTransaction>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.table.is_started() {
            return false;
        }
        inner.cancel = Some(cancel.request().clone());
        inner.early_cancel = Some(cancel);
        true
    }

    /// Drops the transaction without telling the TU.
    pub async fn abort(&self) {
        let mut inner = self.inner.lock().await;
        debug!(id = %self.key, "server transaction aborted");
        self.cleanup(&mut inner);
    }

    // ---- TU entry points ----------------------------------------------------------

    /// Sends a response. `None` sends 100 Trying.
    ///
    /// A provisional after the final response is ignored; a final response with a status
    /// other than the one already sent fails with [`Error::MultipleFinalResponses`]. For
    /// a UAS INVITE whose peer offered 100rel, non-100 provisionals are sent reliably
    /// with the next RSeq; if the peer requires 100rel and it is not supported, the
    /// request is rejected with 420 instead and [`Error::UnsupportedExtension`] returned.
    pub fn send_response(
        &self,
        response: Option<Response>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.send_response_inner(response))
    }

    async fn send_response_inner(&self, response: Option<Response>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.table.current();

        let Some(mut response) = response else {
            if inner.final_status.is_some() || !before_final(state) {
                return Ok(());
            }
            if matches!(state, TransactionState::WaitPrack | TransactionState::ReliableProceeding) {
                return Err(Error::ReliableProvisional(
                    "no 100 Trying after a reliable provisional".to_string(),
                ));
            }
            let input = self.stage(&mut inner, create_trying(&self.request));
            return self.run(&mut inner, input).await;
        };

        if let Some(sent) = inner.final_status {
            if response.is_provisional() {
                trace!(id = %self.key, status = response.status, "provisional after final ignored");
                return Ok(());
            }
            if response.status != sent {
                warn!(id = %self.key, sent, status = response.status, "second final response refused");
                return Err(Error::MultipleFinalResponses);
            }
            if response.is_success() && state.is_extra() {
                // A proxy forwarding retransmissions of the 2xx.
                return self.retransmit_2xx(&mut inner, response).await;
            }
            trace!(id = %self.key, status = sent, "final response already sent");
            return Ok(());
        }

        if response.headers.via.is_empty() {
            return Err(Error::MissingHeader("Via"));
        }

        let input = if response.is_provisional() {
            if state == TransactionState::WaitPrack {
                return Err(Error::ReliableProvisional(
                    "previous reliable provisional not acknowledged yet".to_string(),
                ));
            }
            if self.is_invite() && response.status != 100 && !self.is_proxy() {
                self.register_dialog(&mut inner, &response);
                if self.request.headers.requires(OPTION_100REL)
                    && self.reliable_provisional_support() == ReliableProvisionalSupport::Unsupported
                {
                    return self.reject_100rel(&mut inner).await;
                }
            }
            if self.sends_reliably(&response) {
                inner.rseq += 1;
                make_reliable(&mut response, inner.rseq);
                ServerInput::ReliableProvisional
            } else {
                if state == TransactionState::ReliableProceeding {
                    return Err(Error::ReliableProvisional(
                        "no unreliable provisional after a reliable one".to_string(),
                    ));
                }
                ServerInput::Provisional
            }
        } else {
            if self.is_invite() && response.is_success() && !self.is_proxy() {
                self.register_dialog(&mut inner, &response);
            }
            if response.is_success() { ServerInput::Success } else { ServerInput::Failure }
        };

        self.stage(&mut inner, response);
        self.run(&mut inner, input).await
    }

    /// Whether a provisional to this request goes out reliably (RFC 3262 section 3).
    fn sends_reliably(&self, response: &Response) -> bool {
        self.is_invite()
            && !self.is_proxy()
            && response.status != 100
            && self.reliable_provisional_support() != ReliableProvisionalSupport::Unsupported
            && self.request.requires_or_supports(OPTION_100REL)
    }

    /// The peer requires 100rel and we do not support it: 420 with `Unsupported: 100rel`.
    async fn reject_100rel(&self, inner: &mut ServerInner) -> Result<()> {
        warn!(id = %self.key, "peer requires 100rel, rejecting with 420");
        let rejection = ResponseBuilder::new(420)
            .from_request(&self.request)
            .with_generated_to_tag()
            .unsupported(OPTION_100REL)
            .build();
        let input = self.stage(inner, rejection);
        self.run(inner, input).await?;
        Err(Error::UnsupportedExtension(OPTION_100REL.to_string()))
    }

    /// Makes `response` the current one and returns the input that sends it.
    fn stage(&self, inner: &mut ServerInner, response: Response) -> ServerInput {
        let input = match response.class() {
            1 => ServerInput::Provisional,
            2 => ServerInput::Success,
            _ => ServerInput::Failure,
        };
        if response.is_final() {
            inner.final_status = Some(response.status);
        }
        *self.response.write() = Some(response.clone());
        inner.current = Some(response);
        input
    }

    fn register_dialog(&self, inner: &mut ServerInner, response: &Response) {
        if inner.dialog.is_some() {
            return;
        }
        let Ok(dialog) = DialogId::from_response(response) else {
            return;
        };
        match self.arc() {
            Ok(this) => {
                self.ctx.registry.add_dialog(dialog.clone(), this);
                inner.dialog = Some(dialog);
            }
            Err(e) => warn!(id = %self.key, error = %e, "dialog not registered"),
        }
    }

    // ---- inbound ------------------------------------------------------------------

    /// The request arrived again.
    pub(crate) async fn on_request_retransmission(&self) {
        let mut inner = self.inner.lock().await;
        trace!(id = %self.key, "request retransmission");
        if let Err(e) = self.run(&mut inner, ServerInput::Request).await {
            debug!(id = %self.key, error = %e, "request retransmission ignored");
        }
    }

    /// A CANCEL matched this transaction. The CANCEL's own 200 has been sent already.
    pub(crate) async fn on_cancel(&self, cancel: Request) {
        let mut inner = self.inner.lock().await;
        inner.cancel = Some(cancel);
        if let Err(e) = self.run(&mut inner, ServerInput::Cancel).await {
            debug!(id = %self.key, error = %e, "CANCEL ignored");
        }
    }

    /// An ACK matched this transaction, by key or by dialog.
    pub(crate) async fn on_ack(&self, ack: Request) {
        let mut inner = self.inner.lock().await;
        inner.ack = Some(ack);
        if let Err(e) = self.run(&mut inner, ServerInput::Ack).await {
            debug!(id = %self.key, error = %e, "ACK ignored");
        }
    }

    /// A PRACK (with its own server transaction) for one of our reliable provisionals.
    /// A PRACK that acknowledges nothing pending is answered with 481.
    pub(crate) async fn on_prack(&self, prack: Arc<ServerTransaction>) {
        let mut inner = self.inner.lock().await;
        let rack = prack.request().headers.rack.clone();
        let acknowledges = match (&rack, &inner.unacknowledged) {
            (Some(rack), Some(provisional)) => {
                provisional.headers.rseq == Some(rack.rseq) && self.request.cseq().is_ok_and(|c| c.seq == rack.cseq)
            }
            _ => false,
        };
        if !acknowledges {
            debug!(id = %self.key, ?rack, "PRACK matches no unacknowledged provisional");
            drop(inner);
            self.answer_prack(&prack, 481).await;
            return;
        }
        inner.prack = Some(prack.clone());
        if let Err(e) = self.run(&mut inner, ServerInput::Prack).await {
            debug!(id = %self.key, error = %e, "PRACK not accepted");
            drop(inner);
            self.answer_prack(&prack, 481).await;
        }
    }

    async fn answer_prack(&self, prack: &ServerTransaction, status: u16) {
        let response = create_response(prack.request(), status);
        if let Err(e) = prack.send_response(Some(response)).await {
            warn!(id = %self.key, status, error = %e, "failed to answer PRACK");
        }
    }

    /// The connection carrying our responses failed underneath us.
    pub(crate) async fn on_connection_error(&self) {
        let mut inner = self.inner.lock().await;
        inner.connection.mark_unreachable();
        if let Err(e) = self.run(&mut inner, ServerInput::IoException).await {
            debug!(id = %self.key, error = %e, "connection error ignored");
        }
    }

    /// Whether our responses currently go to `endpoint`.
    pub(crate) async fn uses_endpoint(&self, endpoint: &crate::transport::Endpoint) -> bool {
        self.inner.lock().await.connection.endpoint().as_ref() == Some(endpoint)
    }

    // ---- the machine --------------------------------------------------------------

    /// Feeds `input` and every input it produces, like the client side: rejections of the
    /// first input go back to the caller, transport failures become `IO_EXCEPTION`,
    /// anything else `OTHER_EXCEPTION`.
    async fn run(&self, inner: &mut ServerInner, input: ServerInput) -> Result<()> {
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
                    error!(id = %self.key, %input, error = %e, "illegal transition on internal input");
                }
            } else if e.is_transport() {
                warn!(id = %self.key, %input, error = %e, "response not delivered");
                inner.connection.mark_unreachable();
                inner.pending.push_back(ServerInput::IoException);
            } else {
                warn!(id = %self.key, %input, error = %e, "handler failed");
                inner.pending.push_back(ServerInput::OtherException);
            }
        }
        outcome
    }

    async fn step(&self, inner: &mut ServerInner, input: ServerInput) -> Result<()> {
        let transition = inner.table.switch_state(input)?;
        self.state.set(transition.to);
        if self.is_invite() {
            self.on_invite_transition(inner, transition).await
        } else {
            self.on_non_invite_transition(inner, transition).await
        }
    }

    // ---- shared handlers ----------------------------------------------------------

    /// Sends the current response, establishing the response connection first.
    async fn send_current(&self, inner: &mut ServerInner) -> Result<()> {
        let Some(response) = inner.current.clone() else {
            return Ok(());
        };
        if !inner.connection.is_set() {
            inner.route.connect(&mut inner.connection).await?;
        }
        trace!(id = %self.key, status = response.status, stage = ?inner.route.stage(), "sending response");
        inner.connection.send(&Message::Response(response)).await
    }

    /// Send failure: move down the response route.
    async fn next_client(&self, inner: &mut ServerInner) -> Result<()> {
        let advanced = match inner.route.next(&mut inner.connection).await {
            Ok(advanced) => advanced,
            Err(e) => {
                debug!(id = %self.key, error = %e, "response route exhausted");
                false
            }
        };
        if advanced {
            debug!(id = %self.key, stage = ?inner.route.stage(), endpoint = ?inner.connection.endpoint(), "next response connection");
            inner.pending.push_back(ServerInput::NextClient);
        } else {
            inner.pending.push_back(ServerInput::NoClient);
        }
        Ok(())
    }

    /// CANCEL while the request is pending: 487 on the UA's behalf, then the TU hears of
    /// it, once.
    fn cancelled(&self, inner: &mut ServerInner) {
        if let Some(early) = inner.early_cancel.take() {
            // Answered here because the CANCEL arrived before the transaction started.
            let ok = create_response(early.request(), 200);
            let key = self.key.clone();
            tokio::spawn(async move {
                if let Err(e) = early.send_response(Some(ok)).await {
                    warn!(id = %key, error = %e, "failed to answer early CANCEL");
                }
            });
        }
        if !self.is_proxy() && self.ctx.config.auto_487_on_cancel && inner.final_status.is_none() {
            let terminated = create_response(&self.request, 487);
            let input = self.stage(inner, terminated);
            inner.pending.push_back(input);
        }
        if inner.cancel_delivered {
            trace!(id = %self.key, "CANCEL already delivered");
            return;
        }
        if let Some(cancel) = inner.cancel.take() {
            inner.cancel_delivered = true;
            self.notify(Notification::Cancel(cancel));
        }
    }

    /// Arms the completion wait, or times out at once on reliable transports.
    fn arm_completion(&self, inner: &mut ServerInner) {
        let wait = self
            .ctx
            .config
            .timers
            .completion_timeout(self.kind, inner.connection.is_reliable());
        if wait.is_zero() {
            inner.pending.push_back(ServerInput::Timeout);
        } else {
            inner.timers.schedule(self.this.clone(), TimerEvent::Timeout, wait);
        }
    }

    /// TERMINATED or XTERMINATED reached: tell the TU why, then clean up.
    fn terminated(&self, inner: &mut ServerInner, transition: Transition<ServerInput>) {
        match transition.input {
            ServerInput::NoClient | ServerInput::IoException => self.notify(Notification::IcmpError),
            ServerInput::Tn | ServerInput::T1Expired | ServerInput::OtherException => {
                self.notify(Notification::TimeOut)
            }
            _ => {}
        }
        debug!(id = %self.key, from = %transition.from, input = %transition.input, "server transaction terminated");
        self.cleanup(inner);
    }

    /// The Expires interval of a UAS INVITE ran out before a final response: 487 and a
    /// timeout callback.
    async fn expire(&self, inner: &mut ServerInner) {
        if inner.final_status.is_some() {
            return;
        }
        debug!(id = %self.key, "request expired");
        let terminated = create_response(&self.request, 487);
        let input = self.stage(inner, terminated);
        if let Err(e) = self.run(inner, input).await {
            warn!(id = %self.key, error = %e, "failed to reject expired request");
        }
        self.notify(Notification::TimeOut);
    }

    /// Queues a callback for the TU. Callbacks of one transaction stay in order.
    fn notify(&self, notification: Notification) {
        let interface = self.interface.read().clone();
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let Some(interface) = interface else {
            match notification {
                Notification::Cancel(cancel) => {
                    trace!(id = %self.key, "no server interface yet, keeping CANCEL");
                    *self.missed_cancel.lock() = Some(cancel);
                }
                Notification::Prack(prack) => {
                    // Nobody to ask: the PRACK is simply accepted.
                    self.ctx.callbacks.spawn(self.serial, async move {
                        let ok = create_response(prack.request(), 200);
                        if let Err(e) = prack.send_response(Some(ok)).await {
                            warn!(error = %e, "failed to answer PRACK");
                        }
                    });
                }
                _ => trace!(id = %self.key, "no server interface, callback dropped"),
            }
            return;
        };
        self.ctx.callbacks.spawn(self.serial, async move {
            match notification {
                Notification::Ack(ack) => interface.ack(this, ack).await,
                Notification::Cancel(cancel) => interface.cancel(this, cancel).await,
                Notification::Prack(prack) => interface.prack(this, prack).await,
                Notification::TimeOut => interface.time_out(this).await,
                Notification::IcmpError => interface.icmp_error(this).await,
            }
        });
    }

    /// Leaves the tables and releases the connection. Idempotent.
    fn cleanup(&self, inner: &mut ServerInner) {
        if inner.cleaned_up {
            return;
        }
        inner.cleaned_up = true;
        inner.timers.cancel_all();
        inner.connection.release();
        if let Some(dialog) = inner.dialog.take() {
            self.ctx.registry.remove_dialog(&dialog, self.serial);
        }
        inner.prack = None;
        self.ctx.registry.remove_server(self);
        debug!(id = %self.key, "server transaction removed");
    }
}

/// States in which no final response has been sent yet.
fn before_final(state: TransactionState) -> bool {
    matches!(
        state,
        TransactionState::Initial
            | TransactionState::Calling
            | TransactionState::Proceeding
            | TransactionState::WaitPrack
            | TransactionState::ReliableProceeding
    )
}

#[async_trait]
impl TimerTarget for ServerTransaction {
    async fn on_timer(self: Arc<Self>, event: TimerEvent, generation: u64) {
        let mut inner = self.inner.lock().await;
        if !inner.timers.claim(event, generation) || inner.cleaned_up {
            return;
        }
        trace!(id = %self.key, %event, "server timer fired");
        let input = match event {
            TimerEvent::T1 => ServerInput::T1,
            TimerEvent::Timeout => ServerInput::Timeout,
            TimerEvent::Tn => ServerInput::Tn,
            TimerEvent::TProvisional => ServerInput::TProvisional,
            TimerEvent::Expiration => {
                self.expire(&mut inner).await;
                return;
            }
            TimerEvent::CancelTimer | TimerEvent::Removal => return,
        };
        if let Err(e) = self.run(&mut inner, input).await {
            debug!(id = %self.key, %event, error = %e, "timer input rejected");
        }
    }
}
