//! Typed header values used by the transaction layer.
//!
//! Only the headers that influence transaction matching, routing of responses and
//! RFC 3262 reliability are modelled; anything else travels in [`Headers::extra`].

use std::fmt;
use std::str::FromStr;

use super::Method;
use crate::error::{Error, Result};

/// Transport protocol named in a Via or URI `transport` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    Udp,
    Tcp,
    Tls,
    Sctp,
}

impl TransportType {
    /// Reliable transports do not need application-level retransmission.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportType::Udp)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::Tls => 5061,
            _ => 5060,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Udp => "UDP",
            TransportType::Tcp => "TCP",
            TransportType::Tls => "TLS",
            TransportType::Sctp => "SCTP",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportType::Udp),
            "TCP" => Ok(TransportType::Tcp),
            "TLS" => Ok(TransportType::Tls),
            "SCTP" => Ok(TransportType::Sctp),
            other => Err(Error::InvalidMessage(format!("unknown transport {}", other))),
        }
    }
}

/// A `sip:` URI reduced to the parts that drive request routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub secure: bool,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub transport: Option<TransportType>,
    pub maddr: Option<String>,
}

impl SipUri {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            secure: false,
            user: None,
            host: host.into(),
            port: None,
            transport: None,
            maddr: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_maddr(mut self, maddr: impl Into<String>) -> Self {
        self.maddr = Some(maddr.into());
        self
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.secure { "sips:" } else { "sip:" })?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(transport) = self.transport {
            write!(f, ";transport={}", transport.as_str().to_ascii_lowercase())?;
        }
        if let Some(maddr) = &self.maddr {
            write!(f, ";maddr={}", maddr)?;
        }
        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = Error;

    /// Accepts `sip:[user@]host[:port][;transport=x][;maddr=y]`; other parameters are ignored.
    fn from_str(s: &str) -> Result<Self> {
        let (secure, rest) = if let Some(rest) = s.strip_prefix("sips:") {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix("sip:") {
            (false, rest)
        } else {
            return Err(Error::InvalidMessage(format!("not a SIP URI: {}", s)));
        };

        let mut parts = rest.split(';');
        let addr = parts.next().unwrap_or_default();
        let (user, hostport) = match addr.split_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, addr),
        };
        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidMessage(format!("bad port in {}", s)))?;
                (host.to_string(), Some(port))
            }
            _ => (hostport.to_string(), None),
        };
        if host.is_empty() {
            return Err(Error::InvalidMessage(format!("missing host in {}", s)));
        }

        let mut uri = SipUri::new(host);
        uri.secure = secure;
        uri.user = user;
        uri.port = port;
        for param in parts {
            match param.split_once('=') {
                Some(("transport", value)) => uri.transport = Some(value.parse()?),
                Some(("maddr", value)) => uri.maddr = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(uri)
    }
}

/// The `rport` Via parameter (RFC 3581): requested by the client, filled in by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RPort {
    Requested,
    Value(u16),
}

/// A single Via header field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Via {
    pub transport: TransportType,
    pub host: String,
    pub port: Option<u16>,
    pub branch: Option<String>,
    pub maddr: Option<String>,
    pub received: Option<String>,
    pub rport: Option<RPort>,
}

impl Via {
    pub fn new(transport: TransportType, host: impl Into<String>, port: Option<u16>, branch: impl Into<String>) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
            branch: Some(branch.into()),
            maddr: None,
            received: None,
            rport: None,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// The `host[:port]` sent-by value used for transaction matching.
    pub fn sent_by(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// Port to use when the sent-by carries none.
    pub fn sent_by_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.transport.default_port())
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by())?;
        if let Some(branch) = &self.branch {
            write!(f, ";branch={}", branch)?;
        }
        if let Some(maddr) = &self.maddr {
            write!(f, ";maddr={}", maddr)?;
        }
        if let Some(received) = &self.received {
            write!(f, ";received={}", received)?;
        }
        match self.rport {
            Some(RPort::Requested) => f.write_str(";rport")?,
            Some(RPort::Value(port)) => write!(f, ";rport={}", port)?,
            None => {}
        }
        Ok(())
    }
}

/// A From/To style name-addr with its tag parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: SipUri,
    pub tag: Option<String>,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={}", tag)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        Self { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (seq, method) = s
            .trim()
            .split_once(' ')
            .ok_or_else(|| Error::InvalidMessage(format!("bad CSeq {}", s)))?;
        let seq = seq
            .parse::<u32>()
            .map_err(|_| Error::InvalidMessage(format!("bad CSeq number {}", s)))?;
        Ok(CSeq::new(seq, method.trim().parse()?))
    }
}

/// RAck header (RFC 3262 section 7.2).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RAck {
    pub rseq: u32,
    pub cseq: u32,
    pub method: Method,
}

impl fmt::Display for RAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.rseq, self.cseq, self.method)
    }
}

/// Header set shared by requests and responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    /// Via values, topmost first.
    pub via: Vec<Via>,
    pub from: Option<NameAddr>,
    pub to: Option<NameAddr>,
    pub call_id: Option<String>,
    pub cseq: Option<CSeq>,
    pub max_forwards: Option<u32>,
    pub route: Vec<String>,
    pub contact: Option<String>,
    pub require: Vec<String>,
    pub supported: Vec<String>,
    pub unsupported: Vec<String>,
    pub allow: Vec<Method>,
    pub rseq: Option<u32>,
    pub rack: Option<RAck>,
    pub expires: Option<u32>,
    pub content_type: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl Headers {
    pub fn top_via(&self) -> Option<&Via> {
        self.via.first()
    }

    pub fn call_id(&self) -> Result<&str> {
        self.call_id.as_deref().ok_or(Error::MissingHeader("Call-ID"))
    }

    pub fn cseq(&self) -> Result<&CSeq> {
        self.cseq.as_ref().ok_or(Error::MissingHeader("CSeq"))
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.as_ref().and_then(|f| f.tag())
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.as_ref().and_then(|t| t.tag())
    }

    pub fn requires(&self, option: &str) -> bool {
        contains_token(&self.require, option)
    }

    pub fn supports(&self, option: &str) -> bool {
        contains_token(&self.supported, option)
    }

    /// Adds an option tag to the Require list if it is not there yet.
    pub fn add_require(&mut self, option: &str) {
        if !self.requires(option) {
            self.require.push(option.to_string());
        }
    }

    pub fn add_supported(&mut self, option: &str) {
        if !self.supports(option) {
            self.supported.push(option.to_string());
        }
    }
}

fn contains_token(list: &[String], option: &str) -> bool {
    list.iter().any(|t| t.eq_ignore_ascii_case(option))
}
