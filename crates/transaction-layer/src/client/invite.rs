//! Handlers of the client INVITE machine (RFC 3261 section 17.1.1, RFC 3262).
//!
//! A 2xx ends the normal machine at once. Unless this is a proxy that drops its state, the
//! transaction moves onto the post-2xx table, where it stays for 64*T1 to answer every
//! retransmitted 2xx with the ACK the TU sent.

use tracing::{debug, trace, warn};

use super::{ClientInner, ClientTransaction, Notification};
use crate::error::{Error, Result};
use crate::message::{create_ack_for_2xx, Message};
use crate::timer::TimerEvent;
use crate::transaction::{ClientInput as In, TransactionState as S, Transition};

impl ClientTransaction {
    pub(super) async fn on_invite_transition(
        &self,
        inner: &mut ClientInner,
        transition: Transition<In>,
    ) -> Result<()> {
        match (transition.from, transition.input, transition.to) {
            (S::Terminated, input, _) => {
                trace!(id = %self.key(), %input, "already terminated");
                Ok(())
            }
            (S::Calling | S::Proceeding | S::ReliableProceeding, In::Success, _) => {
                self.first_success(inner);
                Ok(())
            }
            (S::Completed, In::Timeout, _) if inner.ack_in_terminated => {
                trace!(id = %self.key(), "TERMINATED, still waiting for the ACK");
                Ok(())
            }
            (_, input, S::XTerminated) => {
                if input == In::Tn && !self.is_proxy() {
                    self.notify(Notification::TimeOut);
                }
                self.cleanup(inner);
                Ok(())
            }
            (_, _, S::Terminated) => {
                self.terminated(inner, transition);
                Ok(())
            }

            (S::Initial, In::Start, _) => self.send_initial(inner).await,
            (S::Calling, In::NextServer, _) => self.next_server(inner),
            (S::Calling, In::IoException, _) => self.io_failover(inner).await,
            (S::Calling, In::T1, _) => self.retransmit(inner, false).await,
            (S::Calling | S::Proceeding | S::ReliableProceeding, In::ServiceUnavailable, _) => {
                self.service_unavailable(inner).await
            }
            (S::Calling | S::Proceeding | S::ReliableProceeding, In::Cancel, _) => {
                self.send_cancel(inner).await
            }

            (S::Calling | S::Proceeding, In::Provisional, _) => {
                inner.timers.cancel(TimerEvent::T1);
                if let Some(response) = inner.incoming.clone() {
                    inner.seen.record(response.status);
                    self.notify(Notification::Provisional(response));
                }
                Ok(())
            }
            (S::Calling | S::Proceeding | S::ReliableProceeding, In::ReliableProvisional, _) => {
                inner.timers.cancel(TimerEvent::T1);
                if let Some(response) = inner.reliable_provisional.clone() {
                    self.notify(Notification::ReliableProvisional(response));
                }
                Ok(())
            }
            (S::ReliableProceeding, In::Prack, _) => self.send_prack(inner).await,
            (S::Calling | S::Proceeding | S::ReliableProceeding, In::Failure, _) => {
                self.complete(inner);
                Ok(())
            }

            (S::Completed, In::Ack, _) => {
                if !inner.acked_non_2xx {
                    self.send_ack_non_2xx(inner).await
                } else if self.is_proxy() {
                    self.resend_ack(inner).await
                } else {
                    Err(Error::AckAlreadySent)
                }
            }
            (S::Completed, In::Failure | In::ServiceUnavailable, _) => {
                if let Some(status) = inner.incoming.as_ref().map(|r| r.status) {
                    let again = inner.seen.record(status);
                    trace!(id = %self.key(), status, retransmission = again, "final response in COMPLETED");
                }
                if inner.acked_non_2xx {
                    self.resend_ack(inner).await?;
                }
                Ok(())
            }

            (S::XCompleted, In::Ack, _) => self.ack_2xx(inner).await,
            (S::XCompleted, In::Success, _) => {
                let status = inner.incoming.as_ref().map(|r| r.status);
                if let Some(status) = status {
                    inner.seen.record(status);
                }
                if self.is_proxy() {
                    if let Some(response) = inner.incoming.clone() {
                        self.notify(Notification::Final(response));
                    }
                    Ok(())
                } else if inner.acked_2xx {
                    self.resend_ack(inner).await
                } else {
                    trace!(id = %self.key(), "2xx retransmission before the TU's ACK");
                    Ok(())
                }
            }

            (from, input, _) => {
                trace!(id = %self.key(), %from, %input, "nothing to do");
                Ok(())
            }
        }
    }

    /// A first 2xx: deliver it and either drop the transaction (proxy) or move onto the
    /// post-2xx table.
    fn first_success(&self, inner: &mut ClientInner) {
        for event in [
            TimerEvent::T1,
            TimerEvent::Tn,
            TimerEvent::Expiration,
            TimerEvent::CancelTimer,
        ] {
            inner.timers.cancel(event);
        }
        if let Some(response) = inner.incoming.clone() {
            inner.seen.record(response.status);
            if inner.to_tag.is_none() {
                inner.to_tag = response.to_tag().map(str::to_string);
            }
            self.notify(Notification::Final(response));
        }
        if self.is_proxy() && !self.ctx.config.x200_terminated {
            debug!(id = %self.key(), "2xx forwarded, proxy drops the transaction");
            self.cleanup(inner);
        } else {
            self.enter_post_2xx(inner);
        }
    }

    /// ACK for the 2xx. It is sent end to end, so it is routed on its own rather than
    /// over the INVITE's connection when possible.
    async fn ack_2xx(&self, inner: &mut ClientInner) -> Result<()> {
        if inner.acked_2xx && !self.is_proxy() {
            return Err(Error::AckAlreadySent);
        }
        let ack = match inner.ack.take() {
            Some(ack) => ack,
            None => {
                let response = self
                    .response()
                    .ok_or_else(|| Error::Other("ACK without 2xx".to_string()))?;
                create_ack_for_2xx(&self.request(), &response)?
            }
        };
        inner.acked_2xx = true;
        inner.ack = Some(ack.clone());

        if inner.ack_connection.is_none() && !inner.connection.is_pinned() {
            let mut connection = self.ctx.new_connection();
            match connection.resolve_request(&ack).await {
                Ok(()) => inner.ack_connection = Some(connection),
                Err(e) => debug!(id = %self.key(), error = %e, "ACK target unresolved, using the INVITE connection"),
            }
        }
        let message = Message::Request(ack);
        match inner.ack_connection.as_ref() {
            Some(connection) => connection.send(&message).await?,
            None => inner.connection.send(&message).await?,
        }

        if self.ctx.config.cleanup_on_terminate && !self.is_proxy() {
            debug!(id = %self.key(), "2xx ACKed, removing transaction early");
            self.cleanup(inner);
        }
        Ok(())
    }

    /// RELIABLE_PROCEEDING | PRACK: start the PRACK as its own client transaction.
    async fn send_prack(&self, inner: &mut ClientInner) -> Result<()> {
        let (prack, interface) = inner
            .prack_request
            .take()
            .ok_or_else(|| Error::ReliableProvisional("no PRACK to send".to_string()))?;
        // A PRACK that cannot be sent must not take the INVITE down with it.
        let contained = |e: Error| {
            if e.is_rejection() {
                e
            } else {
                warn!(error = %e, "PRACK failed");
                Error::ReliableProvisional(e.to_string())
            }
        };
        let transaction = self
            .ctx
            .create_client(prack, interface, None)
            .map_err(contained)?;
        transaction.start().await.map_err(contained)?;
        inner.prack = Some(transaction);
        Ok(())
    }
}
