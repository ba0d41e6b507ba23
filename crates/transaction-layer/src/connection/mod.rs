//! Connection handling for transactions.
//!
//! A [`ConnectionWrapper`] holds the one connection a transaction currently sends over,
//! together with the candidates left from the last resolution. Failover is a matter of
//! calling [`ConnectionWrapper::try_next`]: the old connection reference is released before
//! the next one is taken.

pub mod response;
pub mod unreachable;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, trace, warn};

use crate::config::LoadDistribution;
use crate::error::{Error, Result};
use crate::message::{Message, Request, SipUri, TransportType};
use crate::transport::{Connection, Endpoint, Resolver, Transport};

pub use response::{ResponseRoute, ResponseStage};
pub use unreachable::UnreachableDestinationTable;

/// What every wrapper needs to open connections.
#[derive(Clone)]
pub struct ConnectionContext {
    pub transport: Arc<dyn Transport>,
    pub resolver: Arc<dyn Resolver>,
    pub unreachable: Option<Arc<UnreachableDestinationTable>>,
    pub distribution: LoadDistribution,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("distribution", &self.distribution)
            .field("unreachable", &self.unreachable.as_ref().map(|t| t.len()))
            .finish()
    }
}

impl ConnectionContext {
    pub fn is_unreachable(&self, endpoint: &Endpoint) -> bool {
        self.unreachable
            .as_ref()
            .is_some_and(|table| table.contains(endpoint))
    }

    pub fn mark_unreachable(&self, endpoint: &Endpoint) {
        if let Some(table) = &self.unreachable {
            table.add(endpoint);
        }
    }
}

/// The connection a transaction sends over, plus the candidates it can still fail over to.
pub struct ConnectionWrapper {
    ctx: ConnectionContext,
    connection: Option<Arc<dyn Connection>>,
    candidates: VecDeque<Endpoint>,
    /// Bound to one connection by the TU; never resolves or fails over.
    pinned: bool,
}

impl fmt::Debug for ConnectionWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionWrapper")
            .field("endpoint", &self.endpoint())
            .field("candidates", &self.candidates.len())
            .field("pinned", &self.pinned)
            .finish()
    }
}

impl ConnectionWrapper {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self {
            ctx,
            connection: None,
            candidates: VecDeque::new(),
            pinned: false,
        }
    }

    /// A wrapper bound to `connection` for its whole life.
    pub fn pinned(ctx: ConnectionContext, connection: Arc<dyn Connection>) -> Self {
        let mut wrapper = Self::new(ctx);
        wrapper.replace(Some(connection));
        wrapper.pinned = true;
        wrapper
    }

    /// A second wrapper sharing the current connection, with its own reference and no
    /// candidates. Used to hand the connection of a failed attempt to a 503 handler.
    pub fn share(&self) -> Self {
        let mut wrapper = Self::new(self.ctx.clone());
        wrapper.replace(self.connection.clone());
        wrapper.pinned = true;
        wrapper
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.connection.is_some()
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.connection.as_ref().map(|c| c.remote().clone())
    }

    pub fn is_reliable(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_reliable())
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Candidates not tried yet.
    pub fn remaining(&self) -> usize {
        self.candidates.len()
    }

    /// Swaps the held connection, releasing the old reference before taking the new one.
    pub fn replace(&mut self, connection: Option<Arc<dyn Connection>>) {
        let same = match (&self.connection, &connection) {
            (Some(old), Some(new)) => Arc::ptr_eq(old, new),
            (None, None) => true,
            _ => false,
        };
        if same {
            return;
        }
        if let Some(old) = self.connection.take() {
            old.remove_reference();
        }
        if let Some(new) = &connection {
            new.add_reference();
            trace!(endpoint = %new.remote(), "connection replaced");
        }
        self.connection = connection;
    }

    /// Drops the held connection reference. Idempotent.
    pub fn release(&mut self) {
        self.replace(None);
        self.candidates.clear();
    }

    /// Resolves where `request` must go (first Route, else the Request-URI; `maddr`
    /// overrides the host) and connects to the first usable candidate.
    pub async fn resolve_request(&mut self, request: &Request) -> Result<()> {
        if self.pinned {
            return if self.is_set() { Ok(()) } else { Err(Error::NoCandidate) };
        }
        let target = request_target(request);
        let transport = target
            .transport
            .or(if target.secure { Some(TransportType::Tls) } else { None });
        let host = target.maddr.as_deref().unwrap_or(&target.host);
        self.resolve(host, target.port, transport).await
    }

    /// Loads the candidates for `host` and connects to the first usable one. Known
    /// unreachable destinations are moved to the back of the list.
    pub async fn resolve(
        &mut self,
        host: &str,
        port: Option<u16>,
        transport: Option<TransportType>,
    ) -> Result<()> {
        let mut candidates = self.ctx.resolver.resolve(host, port, transport).await?;
        if self.ctx.distribution == LoadDistribution::Random {
            candidates.shuffle(&mut rand::thread_rng());
        }
        let (reachable, unreachable): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| !self.ctx.is_unreachable(c));
        if !unreachable.is_empty() {
            debug!(host, skipped = unreachable.len(), "deprioritizing unreachable candidates");
        }
        self.candidates = reachable.into_iter().chain(unreachable).collect();

        if self.try_next().await {
            Ok(())
        } else {
            Err(Error::NoCandidate)
        }
    }

    /// Connects directly to `endpoint`, bypassing the resolver.
    pub async fn connect_to(&mut self, endpoint: &Endpoint) -> Result<()> {
        match self.ctx.transport.get_connection(endpoint).await {
            Ok(connection) => {
                self.replace(Some(connection));
                Ok(())
            }
            Err(e) => {
                self.ctx.mark_unreachable(endpoint);
                Err(e)
            }
        }
    }

    /// Moves to the next candidate that accepts a connection. Returns `false`, keeping the
    /// current connection, when none is left.
    pub async fn try_next(&mut self) -> bool {
        if self.pinned {
            return false;
        }
        while let Some(candidate) = self.candidates.pop_front() {
            match self.ctx.transport.get_connection(&candidate).await {
                Ok(connection) => {
                    debug!(endpoint = %candidate, "using candidate");
                    self.replace(Some(connection));
                    return true;
                }
                Err(e) => {
                    warn!(endpoint = %candidate, error = %e, "candidate refused connection");
                    self.ctx.mark_unreachable(&candidate);
                }
            }
        }
        false
    }

    /// Records the current endpoint as unreachable.
    pub fn mark_unreachable(&self) {
        if let Some(endpoint) = self.endpoint() {
            self.ctx.mark_unreachable(&endpoint);
        }
    }

    /// Sends over the current connection.
    pub async fn send(&self, message: &Message) -> Result<()> {
        match &self.connection {
            Some(connection) => {
                trace!(endpoint = %connection.remote(), %message, "sending");
                connection.send(message).await
            }
            None => Err(Error::Transport("no connection".to_string())),
        }
    }
}

impl Drop for ConnectionWrapper {
    fn drop(&mut self) {
        self.replace(None);
    }
}

/// Where a request is sent: the first Route entry when there is one, otherwise the
/// Request-URI.
pub fn request_target(request: &Request) -> SipUri {
    request
        .headers
        .route
        .first()
        .and_then(|route| parse_route(route))
        .unwrap_or_else(|| request.uri.clone())
}

fn parse_route(route: &str) -> Option<SipUri> {
    let route = route.trim();
    let inner = match (route.find('<'), route.find('>')) {
        (Some(start), Some(end)) if start < end => &route[start + 1..end],
        _ => route,
    };
    inner.parse().ok()
}
