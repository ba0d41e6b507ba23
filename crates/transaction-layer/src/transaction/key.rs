use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::BitOr;

use crate::error::{Error, Result};
use crate::message::{Headers, Method, Request, Response};

/// Selects which parts of a message participate in key comparison.
///
/// A key is only equal to keys built under the same context. Lookups that must fall back
/// (with To tag, then without; with Via, then without) build one key per context and try
/// them in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyContext(u8);

impl KeyContext {
    /// Call-ID, CSeq number, method and From tag only. Used for merged-request detection
    /// and for ACK/CANCEL/PRACK target lookup on the server side.
    pub const NONE: KeyContext = KeyContext(0);
    /// Adds the top Via branch and sent-by (RFC 3261 sections 17.1.3 and 17.2.3).
    pub const USE_VIA: KeyContext = KeyContext(0x01);
    /// Adds the To tag.
    pub const USE_TO_TAG: KeyContext = KeyContext(0x02);
    /// Compares the raw method instead of folding ACK and CANCEL onto INVITE.
    pub const USE_METHOD: KeyContext = KeyContext(0x04);

    pub fn contains(self, other: KeyContext) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: KeyContext) -> KeyContext {
        KeyContext(self.0 & !other.0)
    }
}

impl BitOr for KeyContext {
    type Output = KeyContext;

    fn bitor(self, rhs: KeyContext) -> KeyContext {
        KeyContext(self.0 | rhs.0)
    }
}

impl fmt::Display for KeyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(KeyContext::USE_VIA) {
            parts.push("VIA");
        }
        if self.contains(KeyContext::USE_TO_TAG) {
            parts.push("TO_TAG");
        }
        if self.contains(KeyContext::USE_METHOD) {
            parts.push("METHOD");
        }
        if parts.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&parts.join("|"))
        }
    }
}

/// Identifies a transaction under a given [`KeyContext`].
///
/// All components are kept so a key can be re-contextualised (`with_context`), but only the
/// components selected by the context take part in equality and hashing.
#[derive(Clone)]
pub struct TransactionKey {
    call_id: String,
    cseq: u32,
    method: Method,
    from_tag: Option<String>,
    to_tag: Option<String>,
    branch: Option<String>,
    sent_by: Option<String>,
    context: KeyContext,
}

impl TransactionKey {
    pub fn new(call_id: impl Into<String>, cseq: u32, method: Method, context: KeyContext) -> Self {
        Self {
            call_id: call_id.into(),
            cseq,
            method,
            from_tag: None,
            to_tag: None,
            branch: None,
            sent_by: None,
            context,
        }
    }

    fn from_headers(headers: &Headers, method: &Method, context: KeyContext) -> Result<Self> {
        let call_id = headers.call_id()?;
        let cseq = headers.cseq()?;
        let via = headers.top_via();
        if context.contains(KeyContext::USE_VIA) && via.is_none() {
            return Err(Error::MissingHeader("Via"));
        }
        Ok(Self {
            call_id: call_id.to_string(),
            cseq: cseq.seq,
            method: method.clone(),
            from_tag: headers.from_tag().map(str::to_string),
            to_tag: headers.to_tag().map(str::to_string),
            branch: via.and_then(|v| v.branch()).map(str::to_string),
            sent_by: via.map(|v| v.sent_by().to_ascii_lowercase()),
            context,
        })
    }

    /// Key of the transaction a request belongs to.
    pub fn from_request(request: &Request, context: KeyContext) -> Result<Self> {
        Self::from_headers(&request.headers, request.method(), context)
    }

    /// Key of the client transaction a response answers; the method comes from CSeq.
    pub fn from_response(response: &Response, context: KeyContext) -> Result<Self> {
        let method = response.method()?.clone();
        Self::from_headers(&response.headers, &method, context)
    }

    /// Key of the INVITE a PRACK acknowledges, taken from its RAck header.
    pub fn prack_target(prack: &Request) -> Result<Self> {
        let rack = prack.headers.rack.as_ref().ok_or(Error::MissingHeader("RAck"))?;
        let mut key = Self::from_request(prack, KeyContext::NONE)?;
        key.cseq = rack.cseq;
        key.method = rack.method.clone();
        Ok(key)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    /// The raw method this key was built from.
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to_tag.as_deref()
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from_tag.as_deref()
    }

    pub fn context(&self) -> KeyContext {
        self.context
    }

    /// Same components, compared under another context.
    pub fn with_context(&self, context: KeyContext) -> Self {
        Self {
            context,
            ..self.clone()
        }
    }

    /// Returns a new key with a different method, e.g. the INVITE targeted by a CANCEL.
    pub fn with_method(&self, method: Method) -> Self {
        Self {
            method,
            ..self.clone()
        }
    }

    pub fn with_branch(&self, branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            ..self.clone()
        }
    }

    pub fn with_sent_by(&self, sent_by: impl Into<String>) -> Self {
        Self {
            sent_by: Some(sent_by.into().to_ascii_lowercase()),
            ..self.clone()
        }
    }

    pub fn with_from_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            from_tag: Some(tag.into()),
            ..self.clone()
        }
    }

    /// Sets the To tag, as done when a client INVITE learns it from its final response.
    pub fn set_to_tag(&mut self, tag: impl Into<String>) {
        self.to_tag = Some(tag.into());
    }

    /// Whether both keys were built from the same top Via (branch and sent-by), whatever
    /// their contexts. Tells a retransmission from a merged request.
    pub fn via_equals(&self, other: &TransactionKey) -> bool {
        self.branch == other.branch && self.sent_by == other.sent_by
    }

    /// Method used for comparison: without `USE_METHOD`, ACK and CANCEL match their INVITE.
    fn matching_method(&self) -> &Method {
        if !self.context.contains(KeyContext::USE_METHOD)
            && matches!(self.method, Method::Ack | Method::Cancel)
        {
            &Method::Invite
        } else {
            &self.method
        }
    }
}

impl PartialEq for TransactionKey {
    fn eq(&self, other: &Self) -> bool {
        if self.context != other.context
            || self.cseq != other.cseq
            || self.call_id != other.call_id
            || self.from_tag != other.from_tag
            || self.matching_method() != other.matching_method()
        {
            return false;
        }
        if self.context.contains(KeyContext::USE_VIA)
            && (self.branch != other.branch || self.sent_by != other.sent_by)
        {
            return false;
        }
        if self.context.contains(KeyContext::USE_TO_TAG) && self.to_tag != other.to_tag {
            return false;
        }
        true
    }
}

impl Eq for TransactionKey {}

impl Hash for TransactionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.context.hash(state);
        self.call_id.hash(state);
        self.cseq.hash(state);
        self.from_tag.hash(state);
        self.matching_method().hash(state);
        if self.context.contains(KeyContext::USE_VIA) {
            self.branch.hash(state);
            self.sent_by.hash(state);
        }
        if self.context.contains(KeyContext::USE_TO_TAG) {
            self.to_tag.hash(state);
        }
    }
}

/// Format: `call-id:cseq:METHOD[;branch=..][;to-tag=..]`
impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.cseq, self.method)?;
        if self.context.contains(KeyContext::USE_VIA) {
            if let Some(branch) = &self.branch {
                write!(f, ";branch={}", branch)?;
            }
        }
        if self.context.contains(KeyContext::USE_TO_TAG) {
            if let Some(tag) = &self.to_tag {
                write!(f, ";to-tag={}", tag)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({} [{}])", self, self.context)
    }
}
