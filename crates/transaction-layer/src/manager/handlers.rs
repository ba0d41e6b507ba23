//! Per-method dispatch of inbound messages.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::message::{create_error_response, create_response, Method, Request, Response, ResponseBuilder};
use crate::server::ServerTransaction;
use crate::transaction::{DialogId, KeyContext, TransactionKey};
use crate::transport::MessageSource;

use super::registry::{ClientEntry, ServerLookup};
use super::TransactionManager;

/// Status used for a malformed request when the parser gave none.
const DEFAULT_BAD_REQUEST: u16 = 400;

impl TransactionManager {
    /// New requests and their retransmissions (everything but ACK, CANCEL and, in UA mode,
    /// PRACK).
    pub(super) async fn process_request(
        &self,
        mut request: Request,
        source: MessageSource,
        bad: Option<(String, u16)>,
    ) -> Result<()> {
        let hops = request.headers.max_forwards;
        if let Some(remaining) = request.headers.max_forwards.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }

        let via = request.top_via().cloned().ok_or(Error::MissingHeader("Via"))?;
        let via_key = TransactionKey::from_request(&request, KeyContext::USE_VIA)?;
        let lookup = self.ctx.registry.find_or_create_server(&via_key, |key, merged| {
            ServerTransaction::new(self.ctx.clone(), request.clone(), key, merged, via, source.clone())
        });
        let transaction = match lookup {
            ServerLookup::Existing(transaction) => {
                transaction.on_request_retransmission().await;
                return Ok(());
            }
            ServerLookup::Created(transaction) => transaction,
        };
        transaction.start().await?;

        let config = &self.ctx.config;
        let proxy = self.is_proxy();

        if let Some(max) = config.max_pending_requests {
            if self.ctx.registry.pending_requests() > max {
                warn!(key = %transaction.key(), max, "too many pending requests, answering 503");
                return self.reject(&transaction, create_response(&request, 503)).await;
            }
        }

        if let Some((reason, status)) = bad {
            let status = if status == 0 { DEFAULT_BAD_REQUEST } else { status };
            debug!(key = %transaction.key(), status, %reason, "malformed request rejected");
            return self
                .reject(&transaction, create_error_response(&request, status, &reason))
                .await;
        }

        if transaction.is_merged() && !proxy {
            debug!(key = %transaction.key(), "merged request, answering 482");
            let looped = ResponseBuilder::new(482)
                .from_request(&request)
                .with_generated_to_tag()
                .reason_phrase("Merged Request")
                .build();
            return self.reject(&transaction, looped).await;
        }

        let Some(interface) = self.request_interface(request.method()) else {
            debug!(method = %request.method(), "no request interface, answering 405");
            let not_allowed = ResponseBuilder::new(405)
                .from_request(&request)
                .with_generated_to_tag()
                .allow(self.allowed_methods())
                .build();
            return self.reject(&transaction, not_allowed).await;
        };

        if proxy && hops == Some(0) && request.method() != &Method::Register {
            debug!(key = %transaction.key(), "Max-Forwards exhausted, answering 483");
            return self.reject(&transaction, create_response(&request, 483)).await;
        }

        if !proxy && request.method().is_invite() && config.send_100_on_invite {
            if let Err(e) = transaction.send_response(None).await {
                debug!(key = %transaction.key(), error = %e, "100 Trying not sent");
            }
        }

        trace!(key = %transaction.key(), "delivering request");
        let delivered = transaction.clone();
        self.ctx.callbacks.spawn(transaction.serial(), async move {
            interface.request(delivered).await;
        });
        Ok(())
    }

    /// Answers a new request on the TU's behalf; the TU never sees it.
    async fn reject(&self, transaction: &Arc<ServerTransaction>, response: Response) -> Result<()> {
        if let Err(e) = transaction.send_response(Some(response)).await {
            warn!(key = %transaction.key(), error = %e, "automatic response failed");
            transaction.abort().await;
        }
        Ok(())
    }

    /// ACK: to the INVITE by key (merged table first, then without Via so the ACK of a
    /// 2xx with its own branch matches too), then by dialog.
    pub(super) async fn process_ack(&self, ack: Request, bad: Option<(String, u16)>) -> Result<()> {
        if let Some((reason, _)) = bad {
            debug!(%reason, "malformed ACK dropped");
            return Ok(());
        }
        if self.is_proxy() && ack.headers.max_forwards == Some(0) {
            debug!("ACK with Max-Forwards 0 dropped");
            return Ok(());
        }
        let key = TransactionKey::from_request(&ack, KeyContext::USE_VIA)?;
        let target = self.ctx.registry.find_server_target(&key, false).or_else(|| {
            if self.is_proxy() {
                return None;
            }
            DialogId::from_request(&ack).and_then(|dialog| self.ctx.registry.find_dialog(&dialog))
        });
        match target {
            Some(transaction) if transaction.is_invite() => {
                trace!(key = %transaction.key(), "ACK matched");
                transaction.on_ack(ack).await;
            }
            _ => {
                debug!(%key, "stray ACK");
                if let Some(stray) = self.stray_interface() {
                    self.ctx.callbacks.spawn(0, async move { stray.stray_ack(ack).await });
                }
            }
        }
        Ok(())
    }

    /// CANCEL: gets its own server transaction and a 200, then the INVITE (same Via) hears
    /// of it. A CANCEL that matches nothing gets 481.
    pub(super) async fn process_cancel(
        &self,
        cancel: Request,
        source: MessageSource,
        bad: Option<(String, u16)>,
    ) -> Result<()> {
        let via = cancel.top_via().cloned().ok_or(Error::MissingHeader("Via"))?;
        let key = TransactionKey::from_request(&cancel, KeyContext::USE_VIA | KeyContext::USE_METHOD)?;
        let lookup = self.ctx.registry.find_or_create_cancel(&key, |key| {
            ServerTransaction::new(self.ctx.clone(), cancel.clone(), key, false, via, source.clone())
        });
        let transaction = match lookup {
            ServerLookup::Existing(transaction) => {
                transaction.on_request_retransmission().await;
                return Ok(());
            }
            ServerLookup::Created(transaction) => transaction,
        };
        transaction.start().await?;

        if let Some((reason, status)) = bad {
            let status = if status == 0 { DEFAULT_BAD_REQUEST } else { status };
            return self
                .reject(&transaction, create_error_response(&cancel, status, &reason))
                .await;
        }

        let target_key = key.with_context(KeyContext::USE_VIA).with_method(Method::Invite);
        let Some(target) = self.ctx.registry.find_server_target(&target_key, true) else {
            debug!(%key, "CANCEL matches no transaction");
            if let Some(stray) = self.stray_interface() {
                transaction.abort().await;
                self.ctx.callbacks.spawn(transaction.serial(), async move {
                    stray.stray_cancel(cancel).await
                });
            } else if self.ctx.config.auto_481_on_stray_cancel {
                self.reject(&transaction, create_response(&cancel, 481)).await?;
            } else {
                transaction.abort().await;
            }
            return Ok(());
        };

        if target.try_mark_cancelled(transaction.clone()).await {
            debug!(key = %target.key(), "CANCEL before the request started");
            return Ok(());
        }
        if self.is_proxy() && cancel.headers.max_forwards == Some(0) {
            debug!(%key, "CANCEL with Max-Forwards 0 dropped");
            transaction.abort().await;
            return Ok(());
        }
        if let Err(e) = transaction.send_response(Some(create_response(&cancel, 200))).await {
            warn!(%key, error = %e, "200 for CANCEL not sent");
        }
        target.on_cancel(cancel).await;
        Ok(())
    }

    /// PRACK (UA mode): its own server transaction, handed to the INVITE whose reliable
    /// provisional it acknowledges. The INVITE is found by dialog, else by the RAck.
    pub(super) async fn process_prack(
        &self,
        prack: Request,
        source: MessageSource,
        bad: Option<(String, u16)>,
    ) -> Result<()> {
        let via = prack.top_via().cloned().ok_or(Error::MissingHeader("Via"))?;
        let key = TransactionKey::from_request(&prack, KeyContext::USE_VIA | KeyContext::USE_METHOD)?;
        let lookup = self.ctx.registry.find_or_create_prack(&key, |key| {
            ServerTransaction::new(self.ctx.clone(), prack.clone(), key, false, via, source.clone())
        });
        let transaction = match lookup {
            ServerLookup::Existing(transaction) => {
                transaction.on_request_retransmission().await;
                return Ok(());
            }
            ServerLookup::Created(transaction) => transaction,
        };
        transaction.start().await?;

        if let Some((reason, status)) = bad {
            let status = if status == 0 { DEFAULT_BAD_REQUEST } else { status };
            return self
                .reject(&transaction, create_error_response(&prack, status, &reason))
                .await;
        }

        let target = DialogId::from_request(&prack)
            .and_then(|dialog| self.ctx.registry.find_dialog(&dialog))
            .or_else(|| {
                let invite = TransactionKey::prack_target(&prack).ok()?;
                self.ctx.registry.find_server_target(&invite, false)
            });
        let Some(target) = target.filter(|t| t.is_invite()) else {
            debug!(%key, "PRACK matches no transaction");
            self.reject(&transaction, create_response(&prack, 481)).await?;
            if let Some(stray) = self.stray_interface() {
                self.ctx.callbacks.spawn(transaction.serial(), async move {
                    stray.stray_prack(prack).await
                });
            }
            return Ok(());
        };

        if !self.ctx.config.handles_100rel() {
            debug!(%key, "PRACK while 100rel is unsupported, answering 405");
            let not_allowed = ResponseBuilder::new(405)
                .from_request(&prack)
                .with_generated_to_tag()
                .allow(self.allowed_methods())
                .build();
            return self.reject(&transaction, not_allowed).await;
        }

        target.on_prack(transaction).await;
        Ok(())
    }

    /// Responses: CANCEL and PRACK by method; everything else with the To tag first, then
    /// without it.
    pub(super) async fn process_response(&self, response: Response) -> Result<()> {
        let method = response.method()?.clone();
        let registry = &self.ctx.registry;

        let (entry, matched_to_tag) = if method.needs_method_context() {
            let key = TransactionKey::from_response(&response, KeyContext::USE_VIA | KeyContext::USE_METHOD)?;
            (registry.find_client(&key), false)
        } else {
            let tagged = match response.to_tag() {
                Some(_) => {
                    let key = TransactionKey::from_response(&response, KeyContext::USE_VIA | KeyContext::USE_TO_TAG)?;
                    registry.find_client(&key)
                }
                None => None,
            };
            match tagged {
                Some(entry) => (Some(entry), true),
                None => {
                    let key = TransactionKey::from_response(&response, KeyContext::USE_VIA)?;
                    (registry.find_client(&key), false)
                }
            }
        };

        match entry {
            Some(ClientEntry::Transaction(transaction)) => {
                transaction.on_response(response, matched_to_tag).await;
            }
            Some(ClientEntry::ServiceUnavailable(handler)) => handler.on_response(response).await,
            None => {
                debug!(status = response.status, %method, "stray response");
                if let Some(stray) = self.stray_interface() {
                    self.ctx.callbacks.spawn(0, async move { stray.stray_response(response).await });
                }
            }
        }
        Ok(())
    }
}
