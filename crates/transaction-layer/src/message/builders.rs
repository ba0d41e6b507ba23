//! Builders for the requests and responses the transaction layer generates on its own:
//! automatic responses (100, 420, 481, 482, 483, 487, 503, 504), ACKs for final
//! responses, CANCELs and PRACKs.

use bytes::Bytes;

use super::{
    CSeq, Headers, Method, NameAddr, RAck, Request, Response, SipUri, Via, OPTION_100REL,
};
use crate::error::{Error, Result};
use crate::utils::{generate_branch, generate_tag};

/// Fluent builder for requests originated by a UA or by the transaction layer.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            request: Request::new(method, uri),
        }
    }

    pub fn via(mut self, via: Via) -> Self {
        self.request.headers.via.push(via);
        self
    }

    pub fn from(mut self, from: NameAddr) -> Self {
        self.request.headers.from = Some(from);
        self
    }

    pub fn to(mut self, to: NameAddr) -> Self {
        self.request.headers.to = Some(to);
        self
    }

    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.request.headers.call_id = Some(call_id.into());
        self
    }

    /// Sets CSeq with the request's own method.
    pub fn cseq(mut self, seq: u32) -> Self {
        self.request.headers.cseq = Some(CSeq::new(seq, self.request.method.clone()));
        self
    }

    pub fn max_forwards(mut self, hops: u32) -> Self {
        self.request.headers.max_forwards = Some(hops);
        self
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.request.headers.route.push(route.into());
        self
    }

    pub fn contact(mut self, contact: impl Into<String>) -> Self {
        self.request.headers.contact = Some(contact.into());
        self
    }

    pub fn require(mut self, option: &str) -> Self {
        self.request.headers.add_require(option);
        self
    }

    pub fn supported(mut self, option: &str) -> Self {
        self.request.headers.add_supported(option);
        self
    }

    pub fn expires(mut self, seconds: u32) -> Self {
        self.request.headers.expires = Some(seconds);
        self
    }

    pub fn rack(mut self, rack: RAck) -> Self {
        self.request.headers.rack = Some(rack);
        self
    }

    pub fn body(mut self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.request.headers.content_type = Some(content_type.into());
        self.request.body = body.into();
        self
    }

    pub fn build(self) -> Request {
        self.request
    }
}

/// Builder for responses, initialised from the request being answered.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    pub fn new(status: u16) -> Self {
        Self {
            response: Response::new(status),
        }
    }

    /// Copies Via, From, To, Call-ID and CSeq from the request (RFC 3261 section 8.2.6.2).
    pub fn from_request(mut self, request: &Request) -> Self {
        let headers = &mut self.response.headers;
        headers.via = request.headers.via.clone();
        headers.from = request.headers.from.clone();
        headers.to = request.headers.to.clone();
        headers.call_id = request.headers.call_id.clone();
        headers.cseq = request.headers.cseq.clone();
        self
    }

    pub fn reason_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.response.reason = phrase.into();
        self
    }

    /// Sets the To tag unless the request already carried one.
    pub fn with_to_tag(mut self, tag: impl Into<String>) -> Self {
        if let Some(to) = self.response.headers.to.as_mut() {
            if to.tag.is_none() {
                to.tag = Some(tag.into());
            }
        }
        self
    }

    pub fn with_generated_to_tag(self) -> Self {
        self.with_to_tag(generate_tag())
    }

    pub fn contact(mut self, contact: impl Into<String>) -> Self {
        self.response.headers.contact = Some(contact.into());
        self
    }

    pub fn require(mut self, option: &str) -> Self {
        self.response.headers.add_require(option);
        self
    }

    pub fn unsupported(mut self, option: &str) -> Self {
        self.response.headers.unsupported.push(option.to_string());
        self
    }

    pub fn allow(mut self, methods: Vec<Method>) -> Self {
        self.response.headers.allow = methods;
        self
    }

    pub fn rseq(mut self, rseq: u32) -> Self {
        self.response.headers.rseq = Some(rseq);
        self
    }

    pub fn body(mut self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.response.headers.content_type = Some(content_type.into());
        self.response.body = body.into();
        self
    }

    pub fn build(self) -> Response {
        self.response
    }
}

/// A response to `request` with the default reason phrase. Non-100 responses get a To tag
/// when the request had none.
pub fn create_response(request: &Request, status: u16) -> Response {
    let builder = ResponseBuilder::new(status).from_request(request);
    if status > 100 {
        builder.with_generated_to_tag().build()
    } else {
        builder.build()
    }
}

/// A 100 Trying for `request`.
pub fn create_trying(request: &Request) -> Response {
    create_response(request, 100)
}

/// An automatic error response whose body explains why the request was refused.
pub fn create_error_response(request: &Request, status: u16, reason: &str) -> Response {
    let builder = ResponseBuilder::new(status)
        .from_request(request)
        .with_generated_to_tag();
    if reason.is_empty() {
        builder.build()
    } else {
        builder.body("text/plain", Bytes::copy_from_slice(reason.as_bytes())).build()
    }
}

/// ACK for a non-2xx final response (RFC 3261 section 17.1.1.3): same Request-URI, the
/// original top Via only, the original Route set and the To of the response.
pub fn create_ack_for_non_2xx(original: &Request, response: &Response) -> Result<Request> {
    let via = original.top_via().cloned().ok_or(Error::MissingHeader("Via"))?;
    let cseq = original.cseq()?;
    let mut ack = Request::new(Method::Ack, original.uri.clone());
    ack.headers = Headers {
        via: vec![via],
        from: original.headers.from.clone(),
        to: response.headers.to.clone().or_else(|| original.headers.to.clone()),
        call_id: Some(original.call_id()?.to_string()),
        cseq: Some(CSeq::new(cseq.seq, Method::Ack)),
        max_forwards: Some(70),
        route: original.headers.route.clone(),
        ..Headers::default()
    };
    Ok(ack)
}

/// ACK for a 2xx, sent end to end with a fresh branch towards the Contact of the response.
pub fn create_ack_for_2xx(original: &Request, response: &Response) -> Result<Request> {
    let mut ack = create_ack_for_non_2xx(original, response)?;
    if let Some(contact) = response.headers.contact.as_deref() {
        let target = contact.trim_start_matches('<').trim_end_matches('>');
        if let Ok(uri) = target.parse::<SipUri>() {
            ack.uri = uri;
        }
    }
    if let Some(via) = ack.headers.via.first_mut() {
        via.branch = Some(generate_branch());
    }
    Ok(ack)
}

/// CANCEL for a pending request (RFC 3261 section 9.1).
pub fn create_cancel(original: &Request) -> Result<Request> {
    let via = original.top_via().cloned().ok_or(Error::MissingHeader("Via"))?;
    let cseq = original.cseq()?;
    let mut cancel = Request::new(Method::Cancel, original.uri.clone());
    cancel.headers = Headers {
        via: vec![via],
        from: original.headers.from.clone(),
        to: original.headers.to.clone(),
        call_id: Some(original.call_id()?.to_string()),
        cseq: Some(CSeq::new(cseq.seq, Method::Cancel)),
        max_forwards: Some(70),
        route: original.headers.route.clone(),
        ..Headers::default()
    };
    Ok(cancel)
}

/// PRACK acknowledging a reliable provisional (RFC 3262 section 7.1). `seq` is the next
/// CSeq number of the dialog.
pub fn create_prack(original: &Request, provisional: &Response, seq: u32) -> Result<Request> {
    let rseq = provisional
        .headers
        .rseq
        .ok_or(Error::MissingHeader("RSeq"))?;
    let invite_cseq = provisional.cseq()?;
    let mut via = original.top_via().cloned().ok_or(Error::MissingHeader("Via"))?;
    via.branch = Some(generate_branch());

    let mut prack = Request::new(Method::Prack, original.uri.clone());
    prack.headers = Headers {
        via: vec![via],
        from: original.headers.from.clone(),
        to: provisional.headers.to.clone(),
        call_id: Some(original.call_id()?.to_string()),
        cseq: Some(CSeq::new(seq, Method::Prack)),
        max_forwards: Some(70),
        route: original.headers.route.clone(),
        rack: Some(RAck {
            rseq,
            cseq: invite_cseq.seq,
            method: invite_cseq.method.clone(),
        }),
        ..Headers::default()
    };
    Ok(prack)
}

/// Marks a provisional as reliable: `Require: 100rel` plus the given RSeq.
pub fn make_reliable(response: &mut Response, rseq: u32) {
    response.headers.add_require(OPTION_100REL);
    response.headers.rseq = Some(rseq);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TransportType;

    fn invite() -> Request {
        RequestBuilder::new(Method::Invite, "sip:bob@biloxi.com".parse().unwrap())
            .via(Via::new(TransportType::Udp, "pc33.atlanta.com", Some(5060), "z9hG4bKnashds8"))
            .via(Via::new(TransportType::Udp, "proxy.atlanta.com", None, "z9hG4bK77ef4c2312983.1"))
            .from(NameAddr::new("sip:alice@atlanta.com".parse().unwrap()).with_tag("1928301774"))
            .to(NameAddr::new("sip:bob@biloxi.com".parse().unwrap()))
            .call_id("a84b4c76e66710")
            .cseq(314159)
            .max_forwards(70)
            .route("<sip:proxy.atlanta.com;lr>")
            .build()
    }

    #[test]
    fn response_copies_dialog_headers() {
        let request = invite();
        let response = create_response(&request, 180);
        assert_eq!(response.headers.via, request.headers.via);
        assert_eq!(response.headers.call_id, request.headers.call_id);
        assert_eq!(response.headers.cseq, request.headers.cseq);
        assert!(response.to_tag().is_some());

        let trying = create_trying(&request);
        assert!(trying.to_tag().is_none());
    }

    #[test]
    fn ack_for_non_2xx_keeps_top_via_and_route() {
        let request = invite();
        let response = create_response(&request, 486);
        let ack = create_ack_for_non_2xx(&request, &response).unwrap();

        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.uri, request.uri);
        assert_eq!(ack.headers.via.len(), 1);
        assert_eq!(ack.top_via().unwrap().branch(), Some("z9hG4bKnashds8"));
        assert_eq!(ack.headers.route, request.headers.route);
        assert_eq!(ack.to_tag(), response.to_tag());
        assert_eq!(ack.cseq().unwrap(), &CSeq::new(314159, Method::Ack));
    }

    #[test]
    fn ack_for_2xx_uses_new_branch() {
        let request = invite();
        let mut response = create_response(&request, 200);
        response.headers.contact = Some("<sip:bob@192.0.2.4>".to_string());
        let ack = create_ack_for_2xx(&request, &response).unwrap();
        assert_ne!(ack.top_via().unwrap().branch(), Some("z9hG4bKnashds8"));
        assert_eq!(ack.uri.host, "192.0.2.4");
    }

    #[test]
    fn cancel_and_prack() {
        let request = invite();
        let cancel = create_cancel(&request).unwrap();
        assert_eq!(cancel.cseq().unwrap().method, Method::Cancel);
        assert_eq!(cancel.top_via(), request.top_via());

        let mut provisional = create_response(&request, 183);
        assert!(create_prack(&request, &provisional, 314160).is_err());
        make_reliable(&mut provisional, 1);
        let prack = create_prack(&request, &provisional, 314160).unwrap();
        assert_eq!(
            prack.headers.rack,
            Some(RAck { rseq: 1, cseq: 314159, method: Method::Invite })
        );
        assert_eq!(prack.to_tag(), provisional.to_tag());
    }

    #[test]
    fn error_response_carries_reason_body() {
        let request = invite();
        let response = create_error_response(&request, 400, "Missing Call-ID");
        assert_eq!(response.status, 400);
        assert_eq!(response.headers.content_type.as_deref(), Some("text/plain"));
        assert_eq!(&response.body[..], b"Missing Call-ID");
    }
}
