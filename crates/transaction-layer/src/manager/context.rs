//! What every transaction of a manager shares: configuration, tables, connection factory
//! and the callback pool.

use std::sync::Arc;

use tracing::debug;

use crate::callback::CallbackPool;
use crate::client::ClientTransaction;
use crate::config::TransactionConfig;
use crate::connection::{ConnectionContext, ConnectionWrapper, UnreachableDestinationTable};
use crate::error::{Error, Result};
use crate::interfaces::ClientTransactionInterface;
use crate::message::{Method, Request};
use crate::transaction::{KeyContext, TransactionKey};
use crate::transport::{Connection, Resolver, Transport};
use crate::utils::generate_branch;

use super::registry::TransactionRegistry;

/// Handed to every transaction at creation, in place of process-wide singletons.
#[derive(Debug)]
pub(crate) struct TransactionContext {
    pub config: Arc<TransactionConfig>,
    pub registry: TransactionRegistry,
    pub connections: ConnectionContext,
    pub callbacks: CallbackPool,
}

impl TransactionContext {
    pub fn new(
        config: TransactionConfig,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn Resolver>,
    ) -> Arc<Self> {
        let unreachable = Arc::new(UnreachableDestinationTable::new(config.unreachable_timeout));
        let connections = ConnectionContext {
            transport,
            resolver,
            unreachable: config.use_unreachable_table.then(|| unreachable.clone()),
            distribution: config.load_distribution,
        };
        let callbacks = CallbackPool::new(config.callback_workers, config.callback_queue_warn);
        Arc::new(Self {
            config: Arc::new(config),
            registry: TransactionRegistry::new(unreachable),
            connections,
            callbacks,
        })
    }

    pub fn is_proxy(&self) -> bool {
        self.config.proxy_mode
    }

    /// An empty connection wrapper.
    pub fn new_connection(&self) -> ConnectionWrapper {
        ConnectionWrapper::new(self.connections.clone())
    }

    /// Builds (but neither registers nor starts) a client transaction for `request`.
    ///
    /// A top Via without a branch gets a fresh RFC 3261 branch. With `connection` set the
    /// transaction sends over it and never resolves.
    pub fn create_client(
        self: &Arc<Self>,
        mut request: Request,
        interface: Option<Arc<dyn ClientTransactionInterface>>,
        connection: Option<Arc<dyn Connection>>,
    ) -> Result<Arc<ClientTransaction>> {
        if request.method() == &Method::Ack {
            return Err(Error::InvalidMessage("ACK never creates a transaction".to_string()));
        }
        let via = request
            .headers
            .via
            .first_mut()
            .ok_or(Error::MissingHeader("Via"))?;
        if via.branch.is_none() {
            via.branch = Some(generate_branch());
        }

        let key = client_key(&request)?;
        let wrapper = match connection {
            Some(connection) => ConnectionWrapper::pinned(self.connections.clone(), connection),
            None => self.new_connection(),
        };
        debug!(%key, method = %request.method(), "client transaction created");
        Ok(ClientTransaction::new(self.clone(), request, key, interface, wrapper))
    }
}

/// The key a client transaction is stored under. CANCEL and PRACK share their Via branch
/// with another transaction and are told apart by method; requests inside a dialog are
/// matched with their To tag.
pub(crate) fn client_key(request: &Request) -> Result<TransactionKey> {
    let context = if request.method().needs_method_context() {
        KeyContext::USE_VIA | KeyContext::USE_METHOD
    } else if request.to_tag().is_some() {
        KeyContext::USE_VIA | KeyContext::USE_TO_TAG
    } else {
        KeyContext::USE_VIA
    };
    TransactionKey::from_request(request, context)
}
