//! # Transaction manager
//!
//! The [`TransactionManager`] is the layer's entry point. Inbound messages from the
//! transport are handed to [`process_message`](TransactionManager::process_message), which
//! matches them to live transactions or creates server transactions for new requests.
//! The TU creates client transactions through the manager and registers one
//! [`RequestInterface`] per method to receive new requests.
//!
//! All shared state (tables, dialog map, unreachable destinations, configuration and the
//! callback pool) lives in a [`TransactionContext`] the manager owns and hands to every
//! transaction it creates.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rvoip_transaction_layer::prelude::*;
//!
//! # async fn example(transport: Arc<dyn Transport>, options: Arc<dyn RequestInterface>) {
//! let manager = TransactionManager::new(TransactionConfig::default(), transport, Arc::new(LiteralResolver));
//! manager.set_request_interface(Method::Options, options);
//! # }
//! ```

pub mod context;
mod handlers;
pub mod registry;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::client::ClientTransaction;
use crate::config::TransactionConfig;
use crate::error::Result;
use crate::interfaces::{
    ClientTransactionInterface, RequestInterface, StrayMessageInterface, TransactionRemovalListener,
};
use crate::message::{Message, Method, RPort, Request};
use crate::server::ServerTransaction;
use crate::transaction::{KeyContext, TransactionKey};
use crate::transport::{Connection, Endpoint, MessageSource, Resolver, Transport};

use context::TransactionContext;
pub use registry::{ClientEntry, TransactionCounts};

/// Owns the transaction tables and dispatches inbound messages.
pub struct TransactionManager {
    ctx: Arc<TransactionContext>,
    request_interfaces: RwLock<HashMap<Method, Arc<dyn RequestInterface>>>,
    default_interface: RwLock<Option<Arc<dyn RequestInterface>>>,
    stray: RwLock<Option<Arc<dyn StrayMessageInterface>>>,
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("proxy", &self.ctx.is_proxy())
            .field("registry", &self.ctx.registry)
            .finish()
    }
}

impl TransactionManager {
    /// Creates a manager. Must be called inside a tokio runtime: the callback workers are
    /// spawned here.
    pub fn new(
        config: TransactionConfig,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        debug!(proxy = config.proxy_mode, reliable_provisional = ?config.reliable_provisional, "transaction manager created");
        Self {
            ctx: TransactionContext::new(config, transport, resolver),
            request_interfaces: RwLock::new(HashMap::new()),
            default_interface: RwLock::new(None),
            stray: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.ctx.config
    }

    pub fn is_proxy(&self) -> bool {
        self.ctx.is_proxy()
    }

    /// Registers the receiver of new requests with `method`. CANCEL, ACK and PRACK are
    /// matched to their INVITE and never delivered here.
    pub fn set_request_interface(&self, method: Method, interface: Arc<dyn RequestInterface>) {
        debug!(%method, "request interface registered");
        self.request_interfaces.write().insert(method, interface);
    }

    pub fn remove_request_interface(&self, method: &Method) {
        self.request_interfaces.write().remove(method);
    }

    /// Receiver of requests whose method has no interface of its own.
    pub fn set_default_request_interface(&self, interface: Option<Arc<dyn RequestInterface>>) {
        *self.default_interface.write() = interface;
    }

    pub fn set_stray_interface(&self, interface: Option<Arc<dyn StrayMessageInterface>>) {
        *self.stray.write() = interface;
    }

    pub fn set_removal_listener(&self, listener: Option<Arc<dyn TransactionRemovalListener>>) {
        self.ctx.registry.set_removal_listener(listener);
    }

    fn request_interface(&self, method: &Method) -> Option<Arc<dyn RequestInterface>> {
        self.request_interfaces
            .read()
            .get(method)
            .cloned()
            .or_else(|| self.default_interface.read().clone())
    }

    fn stray_interface(&self) -> Option<Arc<dyn StrayMessageInterface>> {
        self.stray.read().clone()
    }

    /// Methods for the `Allow` header of a 405.
    fn allowed_methods(&self) -> Vec<Method> {
        let mut methods: Vec<Method> = self.request_interfaces.read().keys().cloned().collect();
        methods.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        methods.push(Method::Ack);
        methods.push(Method::Cancel);
        if self.ctx.config.handles_100rel() {
            methods.push(Method::Prack);
        }
        methods
    }

    // ---- client transactions ------------------------------------------------------

    /// Builds a client transaction for `request`. It is registered and sent by
    /// [`ClientTransaction::start`].
    pub fn create_client_transaction(
        &self,
        request: Request,
        interface: Option<Arc<dyn ClientTransactionInterface>>,
    ) -> Result<Arc<ClientTransaction>> {
        self.ctx.create_client(request, interface, None)
    }

    /// Like [`create_client_transaction`](Self::create_client_transaction), but the
    /// request always goes over `connection`.
    pub fn create_client_transaction_on(
        &self,
        request: Request,
        interface: Option<Arc<dyn ClientTransactionInterface>>,
        connection: Arc<dyn Connection>,
    ) -> Result<Arc<ClientTransaction>> {
        self.ctx.create_client(request, interface, Some(connection))
    }

    /// Creates and starts a client transaction.
    pub async fn send_request(
        &self,
        request: Request,
        interface: Option<Arc<dyn ClientTransactionInterface>>,
    ) -> Result<Arc<ClientTransaction>> {
        let transaction = self.create_client_transaction(request, interface)?;
        transaction.start().await?;
        Ok(transaction)
    }

    // ---- lookups ------------------------------------------------------------------

    pub fn find_client_transaction(&self, key: &TransactionKey) -> Option<Arc<ClientTransaction>> {
        self.ctx
            .registry
            .find_client(key)
            .and_then(|entry| entry.transaction().cloned())
    }

    /// The server transaction of `request` (a CANCEL, ACK or PRACK finds its INVITE).
    pub fn find_server_transaction(&self, request: &Request) -> Option<Arc<ServerTransaction>> {
        let key = TransactionKey::from_request(request, KeyContext::USE_VIA).ok()?;
        self.ctx.registry.find_server_target(&key, false)
    }

    pub fn counts(&self) -> TransactionCounts {
        self.ctx.registry.counts()
    }

    /// Callbacks queued for the TU and not yet started.
    pub fn pending_callbacks(&self) -> usize {
        self.ctx.callbacks.pending()
    }

    /// Whether `endpoint` is currently skipped as unreachable.
    pub fn is_unreachable(&self, endpoint: &Endpoint) -> bool {
        self.ctx.registry.unreachable().contains(endpoint)
    }

    // ---- inbound ------------------------------------------------------------------

    /// Dispatches a message received from the transport.
    ///
    /// `bad` is set by the parser when the message was only partly understood: requests
    /// are then answered with that status and reason (400 when the status is 0) and never
    /// reach the TU; bad responses are dropped.
    pub async fn process_message(&self, message: Message, source: MessageSource, bad: Option<(String, u16)>) {
        match message {
            Message::Request(mut request) => {
                stamp_source(&mut request, &source);
                trace!(method = %request.method(), from = %source.endpoint, "request received");
                let result = match request.method() {
                    Method::Ack => self.process_ack(request, bad).await,
                    Method::Cancel => self.process_cancel(request, source, bad).await,
                    Method::Prack if !self.is_proxy() => self.process_prack(request, source, bad).await,
                    _ => self.process_request(request, source, bad).await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "request dropped");
                }
            }
            Message::Response(response) => {
                if let Some((reason, status)) = bad {
                    warn!(status = response.status, bad_status = status, %reason, "malformed response dropped");
                    return;
                }
                if let Err(e) = self.process_response(response).await {
                    warn!(error = %e, "response dropped");
                }
            }
        }
    }

    /// A connection reported an error: every client transaction sending over it fails
    /// over.
    pub async fn on_connection_error(&self, endpoint: &Endpoint) {
        debug!(%endpoint, "connection error");
        self.ctx.registry.unreachable().add(endpoint);
        for transaction in self.ctx.registry.client_transactions() {
            if transaction.uses_endpoint(endpoint).await {
                transaction.on_connection_error().await;
            }
        }
    }
}

/// RFC 3261 section 18.2.1 and RFC 3581: records where the request really came from in
/// its top Via.
fn stamp_source(request: &mut Request, source: &MessageSource) {
    let Some(via) = request.headers.via.first_mut() else {
        return;
    };
    if via.host != source.endpoint.host {
        via.received = Some(source.endpoint.host.clone());
    }
    if via.rport == Some(RPort::Requested) {
        via.rport = Some(RPort::Value(source.endpoint.port));
        via.received = Some(source.endpoint.host.clone());
    }
}
