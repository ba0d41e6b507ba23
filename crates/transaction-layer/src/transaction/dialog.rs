use std::fmt;

use crate::error::{Error, Result};
use crate::message::{Request, Response};

/// Dialog identifier as seen by a server INVITE transaction: the Call-ID, the local
/// tag (To tag of our responses) and the remote tag (From tag of the request).
///
/// Registered once the first tagged provisional or 2xx goes out, so a PRACK or ACK that
/// carries the dialog's tags can still find its INVITE when the Via-based lookup fails.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// The dialog a UAS response establishes.
    pub fn from_response(response: &Response) -> Result<Self> {
        let local = response.to_tag().ok_or(Error::MissingHeader("To tag"))?;
        let remote = response.from_tag().ok_or(Error::MissingHeader("From tag"))?;
        Ok(Self::new(response.call_id()?, local, remote))
    }

    /// The dialog an in-dialog request (ACK, PRACK) received by the UAS belongs to.
    pub fn from_request(request: &Request) -> Option<Self> {
        let call_id = request.call_id().ok()?;
        let local = request.to_tag()?;
        let remote = request.from_tag()?;
        Some(Self::new(call_id, local, remote))
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};local={};remote={}", self.call_id, self.local_tag, self.remote_tag)
    }
}
