//! The contracts this layer needs from the transport and resolver below it.
//!
//! Sockets, listeners and DNS are implemented elsewhere. The transaction layer asks a
//! [`Transport`] for connections to an [`Endpoint`], sends through them, and asks a
//! [`Resolver`] for the ordered candidates of a host.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{Message, TransportType};

/// A remote address, port and transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub transport: TransportType,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, transport: TransportType) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, transport: TransportType) -> Self {
        Self::new(addr.ip().to_string(), addr.port(), transport)
    }

    pub fn is_reliable(&self) -> bool {
        self.transport.is_reliable()
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

/// Format: `host:port:TRANSPORT`, also the key of the unreachable-destination table.
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.transport)
    }
}

/// A connection to one remote endpoint, owned by the transport and shared by the
/// transactions using it.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// The endpoint this connection sends to.
    fn remote(&self) -> &Endpoint;

    /// Serializes and sends `message`. Failures surface as [`Error::Transport`] or
    /// [`Error::Io`](crate::error::Error::Io) and make the transaction fail over.
    ///
    /// [`Error::Transport`]: crate::error::Error::Transport
    async fn send(&self, message: &Message) -> Result<()>;

    fn is_reliable(&self) -> bool {
        self.remote().is_reliable()
    }

    /// Called when a transaction starts using this connection.
    fn add_reference(&self) {}

    /// Called when a transaction stops using this connection.
    fn remove_reference(&self) {}
}

/// Hands out connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens, or reuses, a connection to `remote`.
    async fn get_connection(&self, remote: &Endpoint) -> Result<Arc<dyn Connection>>;

    /// An established connection to `remote`, if any. Responses over reliable transports
    /// go back over the connection the request arrived on.
    fn find_connection(&self, _remote: &Endpoint) -> Option<Arc<dyn Connection>> {
        None
    }

    /// Whether the local network is behind a NAT, in which case responses are sent to the
    /// packet source rather than to the Via sent-by.
    fn behind_nat(&self) -> bool {
        false
    }
}

/// Turns a host into ordered candidate endpoints (RFC 3263).
#[async_trait]
pub trait Resolver: Send + Sync {
    /// `port` and `transport` are `None` when the URI or Via left them out, which is what
    /// allows SRV lookups.
    async fn resolve(
        &self,
        host: &str,
        port: Option<u16>,
        transport: Option<TransportType>,
    ) -> Result<Vec<Endpoint>>;
}

/// Resolver that takes the host literally: one candidate with the default port and UDP
/// unless the URI says otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralResolver;

#[async_trait]
impl Resolver for LiteralResolver {
    async fn resolve(
        &self,
        host: &str,
        port: Option<u16>,
        transport: Option<TransportType>,
    ) -> Result<Vec<Endpoint>> {
        let transport = transport.unwrap_or(TransportType::Udp);
        let port = port.unwrap_or_else(|| transport.default_port());
        Ok(vec![Endpoint::new(host, port, transport)])
    }
}

/// Where an inbound message came from.
#[derive(Debug, Clone)]
pub struct MessageSource {
    /// Packet source address.
    pub endpoint: Endpoint,
    /// The connection it arrived on, for reliable transports.
    pub connection: Option<Arc<dyn Connection>>,
}

impl MessageSource {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connection: None,
        }
    }

    pub fn with_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }
}
