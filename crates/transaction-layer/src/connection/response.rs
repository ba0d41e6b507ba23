//! Picking the connection a server transaction answers over (RFC 3261 section 18.2.2,
//! RFC 3581).
//!
//! The order is: the connection the request arrived on (reliable transports), the packet
//! source when `rport` is present or the host is behind a NAT, then the Via `maddr`, the
//! `received` address and finally the sent-by, resolved through the [`Resolver`].
//! [`ResponseRoute::next`] walks down that list after a send failure.
//!
//! [`Resolver`]: crate::transport::Resolver

use tracing::debug;

use super::ConnectionWrapper;
use crate::error::{Error, Result};
use crate::message::{RPort, TransportType, Via};
use crate::transport::{Endpoint, MessageSource};

/// Which rule produced the current response connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStage {
    Unresolved,
    /// Reusing the connection the request came in on.
    Reliable,
    /// Packet source address with the `rport` port.
    RPort,
    /// Packet source address, local host behind a NAT.
    Nat,
    Maddr,
    Received,
    /// Sent-by candidates from the resolver.
    SentBy,
}

/// Response routing state of one server transaction.
#[derive(Debug, Clone)]
pub struct ResponseRoute {
    via: Via,
    source: MessageSource,
    stage: ResponseStage,
    retry_on_io: bool,
}

impl ResponseRoute {
    pub fn new(via: Via, source: MessageSource) -> Self {
        Self {
            via,
            source,
            stage: ResponseStage::Unresolved,
            retry_on_io: true,
        }
    }

    pub fn stage(&self) -> ResponseStage {
        self.stage
    }

    pub fn source(&self) -> &MessageSource {
        &self.source
    }

    /// Establishes the first response connection on `wrapper`.
    pub async fn connect(&mut self, wrapper: &mut ConnectionWrapper) -> Result<()> {
        if self.source.endpoint.is_reliable() {
            let existing = self.source.connection.clone().or_else(|| {
                wrapper
                    .context()
                    .transport
                    .find_connection(&self.source.endpoint)
            });
            if let Some(connection) = existing {
                self.stage = ResponseStage::Reliable;
                wrapper.replace(Some(connection));
                return Ok(());
            }
        }
        self.connect_via(wrapper).await
    }

    async fn connect_via(&mut self, wrapper: &mut ConnectionWrapper) -> Result<()> {
        let transport = self.via.transport;
        let source = &self.source.endpoint;

        if let Some(rport) = self.via.rport {
            let port = match rport {
                RPort::Value(port) => port,
                RPort::Requested => source.port,
            };
            self.stage = ResponseStage::RPort;
            let endpoint = Endpoint::new(source.host.clone(), port, transport);
            debug!(%endpoint, "response via rport");
            return wrapper.connect_to(&endpoint).await;
        }

        if wrapper.context().transport.behind_nat() {
            self.stage = ResponseStage::Nat;
            let endpoint = Endpoint::new(source.host.clone(), source.port, transport);
            debug!(%endpoint, "response to NAT binding");
            return wrapper.connect_to(&endpoint).await;
        }

        if let Some(maddr) = self.via.maddr.clone() {
            self.stage = ResponseStage::Maddr;
            return wrapper.connect_to(&self.via_endpoint(maddr)).await;
        }
        if let Some(received) = self.via.received.clone() {
            self.stage = ResponseStage::Received;
            return wrapper.connect_to(&self.via_endpoint(received)).await;
        }
        self.connect_sent_by(wrapper).await
    }

    async fn connect_sent_by(&mut self, wrapper: &mut ConnectionWrapper) -> Result<()> {
        self.stage = ResponseStage::SentBy;
        let host = self.via.host.clone();
        wrapper.resolve(&host, self.via.port, Some(self.via.transport)).await
    }

    fn via_endpoint(&self, host: String) -> Endpoint {
        Endpoint::new(host, self.via.sent_by_port(), self.via.transport)
    }

    /// Moves to the next response connection after a send failure. Returns `Ok(false)`
    /// when nothing is left to try.
    pub async fn next(&mut self, wrapper: &mut ConnectionWrapper) -> Result<bool> {
        match self.stage {
            ResponseStage::Unresolved => self.connect(wrapper).await.map(|_| true),
            ResponseStage::Reliable => Ok(self.connect_via(wrapper).await.is_ok()),
            ResponseStage::Maddr => {
                if let Some(received) = self.via.received.clone() {
                    self.stage = ResponseStage::Received;
                    if wrapper.connect_to(&self.via_endpoint(received)).await.is_ok() {
                        return Ok(true);
                    }
                }
                Ok(self.connect_sent_by(wrapper).await.is_ok())
            }
            ResponseStage::Received => Ok(self.connect_sent_by(wrapper).await.is_ok()),
            ResponseStage::SentBy => Ok(wrapper.try_next().await),
            ResponseStage::RPort | ResponseStage::Nat => {
                // A stream connection may simply have been closed; reopen it once.
                if self.retry_on_io && self.source.endpoint.transport != TransportType::Udp {
                    self.retry_on_io = false;
                    self.connect_via(wrapper).await?;
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadDistribution;
    use crate::connection::ConnectionContext;
    use crate::message::Message;
    use crate::transport::{Connection, LiteralResolver, Transport};
    use async_trait::async_trait;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Stub(Endpoint);

    #[async_trait]
    impl Connection for Stub {
        fn remote(&self) -> &Endpoint {
            &self.0
        }

        async fn send(&self, _message: &Message) -> Result<()> {
            Ok(())
        }
    }

    struct Refusing(Vec<String>);

    #[async_trait]
    impl Transport for Refusing {
        async fn get_connection(&self, remote: &Endpoint) -> Result<Arc<dyn Connection>> {
            if self.0.contains(&remote.host) {
                return Err(Error::Transport("unreachable".into()));
            }
            Ok(Arc::new(Stub(remote.clone())))
        }
    }

    fn wrapper(refused: &[&str]) -> ConnectionWrapper {
        ConnectionWrapper::new(ConnectionContext {
            transport: Arc::new(Refusing(refused.iter().map(|s| s.to_string()).collect())),
            resolver: Arc::new(LiteralResolver),
            unreachable: None,
            distribution: LoadDistribution::Deterministic,
        })
    }

    fn via() -> Via {
        let mut via = Via::new(TransportType::Udp, "client.example.com", Some(5062), "z9hG4bKr");
        via.maddr = Some("239.0.0.1".to_string());
        via.received = Some("198.51.100.7".to_string());
        via
    }

    fn udp_source() -> MessageSource {
        MessageSource::new(Endpoint::new("198.51.100.7", 40000, TransportType::Udp))
    }

    #[tokio::test]
    async fn maddr_then_received_then_sent_by() {
        let mut wrapper = wrapper(&["239.0.0.1", "198.51.100.7"]);
        let mut route = ResponseRoute::new(via(), udp_source());

        assert!(route.connect(&mut wrapper).await.is_err());
        assert_eq!(route.stage(), ResponseStage::Maddr);

        assert!(route.next(&mut wrapper).await.unwrap());
        assert_eq!(route.stage(), ResponseStage::SentBy);
        assert_eq!(
            wrapper.endpoint(),
            Some(Endpoint::new("client.example.com", 5062, TransportType::Udp))
        );
        assert!(!route.next(&mut wrapper).await.unwrap());
    }

    #[tokio::test]
    async fn rport_uses_packet_source() {
        let mut wrapper = wrapper(&[]);
        let mut v = via();
        v.rport = Some(RPort::Requested);
        let mut route = ResponseRoute::new(v, udp_source());
        route.connect(&mut wrapper).await.unwrap();
        assert_eq!(route.stage(), ResponseStage::RPort);
        assert_eq!(wrapper.endpoint().unwrap().port, 40000);
        assert!(!route.next(&mut wrapper).await.unwrap());
    }

    #[tokio::test]
    async fn reliable_request_reuses_its_connection() {
        let incoming: Arc<dyn Connection> =
            Arc::new(Stub(Endpoint::new("198.51.100.7", 50000, TransportType::Tcp)));
        let source = MessageSource::new(incoming.remote().clone()).with_connection(incoming);
        let mut wrapper = wrapper(&[]);
        let mut v = via();
        v.transport = TransportType::Tcp;
        let mut route = ResponseRoute::new(v, source);
        route.connect(&mut wrapper).await.unwrap();
        assert_eq!(route.stage(), ResponseStage::Reliable);
        assert_eq!(wrapper.endpoint().unwrap().port, 50000);

        // Falls back to the Via when the stream fails.
        assert!(route.next(&mut wrapper).await.unwrap());
        assert_eq!(route.stage(), ResponseStage::Maddr);
    }
}
