//! # SIP message model
//!
//! Wire parsing and serialization live outside the transaction layer. This module is the
//! typed view the layer works against: request and response start lines, the headers used for
//! matching and routing, and a body that is carried opaquely.

pub mod builders;
pub mod headers;

pub use builders::*;
pub use headers::*;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Option tag for RFC 3262 reliable provisional responses.
pub const OPTION_100REL: &str = "100rel";

/// SIP request methods.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Prack,
    Update,
    Info,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
    Extension(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Info => "INFO",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Message => "MESSAGE",
            Method::Publish => "PUBLISH",
            Method::Extension(name) => name,
        }
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, Method::Invite)
    }

    /// CANCEL and PRACK are matched with their own method because they share
    /// a Via branch or dialog with the request they refer to.
    pub fn needs_method_context(&self) -> bool {
        matches!(self, Method::Cancel | Method::Prack)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)) {
            return Err(Error::InvalidMessage(format!("bad method token {:?}", s)));
        }
        Ok(match s {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "PRACK" => Method::Prack,
            "UPDATE" => Method::Update,
            "INFO" => Method::Info,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            "MESSAGE" => Method::Message,
            "PUBLISH" => Method::Publish,
            other => Method::Extension(other.to_string()),
        })
    }
}

/// Default reason phrase for the status codes the transaction layer generates itself.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        420 => "Bad Extension",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        _ => match status / 100 {
            1 => "Provisional",
            2 => "Success",
            3 => "Redirection",
            4 => "Client Error",
            5 => "Server Error",
            _ => "Global Failure",
        },
    }
}

/// A SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: SipUri,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            method,
            uri,
            headers: Headers::default(),
            body: Bytes::new(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.headers.top_via()
    }

    pub fn call_id(&self) -> Result<&str> {
        self.headers.call_id()
    }

    pub fn cseq(&self) -> Result<&CSeq> {
        self.headers.cseq()
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.headers.from_tag()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.to_tag()
    }

    /// Whether the peer asked for (Require) or offered (Supported) an option tag.
    pub fn requires_or_supports(&self, option: &str) -> bool {
        self.headers.requires(option) || self.headers.supports(option)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0", self.method, self.uri)
    }
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::default(),
            body: Bytes::new(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Status class: 1 for provisional, 2 for success, and so on.
    pub fn class(&self) -> u16 {
        self.status / 100
    }

    pub fn is_provisional(&self) -> bool {
        self.class() == 1
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }

    pub fn is_final(&self) -> bool {
        self.status >= 200
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.headers.top_via()
    }

    pub fn call_id(&self) -> Result<&str> {
        self.headers.call_id()
    }

    pub fn cseq(&self) -> Result<&CSeq> {
        self.headers.cseq()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.to_tag()
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.headers.from_tag()
    }

    /// The CSeq method, which identifies the request this response answers.
    pub fn method(&self) -> Result<&Method> {
        Ok(&self.cseq()?.method)
    }

    /// A reliable provisional carries `Require: 100rel` and an RSeq.
    pub fn is_reliable_provisional(&self) -> bool {
        self.is_provisional() && self.status != 100 && self.headers.requires(OPTION_100REL)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}", self.status, self.reason)
    }
}

/// Either side of an exchange, as handed over by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => r.fmt(f),
            Message::Response(r) => r.fmt(f),
        }
    }
}
