//! Handlers of the server INVITE machine (RFC 3261 section 17.2.1, RFC 3262, RFC 6026).
//!
//! Non-2xx finals are retransmitted on timer G until the ACK arrives. A 2xx ends the
//! normal machine; a UAS then moves onto the post-2xx table and retransmits the 2xx itself
//! until the ACK comes in or 64*T1 have passed. Proxies drop the transaction instead
//! unless `x200_terminated` is set, in which case they keep it to forward 2xx
//! retransmissions and ACKs.

use tracing::{debug, trace, warn};

use super::{Notification, ServerInner, ServerTransaction};
use crate::error::{Error, Result};
use crate::message::{create_response, Message, Response};
use crate::timer::TimerEvent;
use crate::transaction::transitions::SERVER_INVITE_X;
use crate::transaction::{ServerInput as In, TransactionState as S, Transition};

impl ServerTransaction {
    pub(super) async fn on_invite_transition(
        &self,
        inner: &mut ServerInner,
        transition: Transition<In>,
    ) -> Result<()> {
        match (transition.from, transition.input, transition.to) {
            (_, In::Success, S::Terminated) => self.first_success(inner).await,
            (_, input, S::XTerminated) => {
                match input {
                    In::Tn | In::T1Expired if !self.is_proxy() => self.notify(Notification::TimeOut),
                    In::IoException | In::NoClient => self.notify(Notification::IcmpError),
                    _ => {}
                }
                debug!(id = %self.key(), %input, "post-2xx transaction terminated");
                self.cleanup(inner);
                Ok(())
            }
            (_, _, S::Terminated) => {
                self.terminated(inner, transition);
                Ok(())
            }

            (S::Initial, In::Start, _) => Ok(()),
            (S::Initial | S::Calling | S::Proceeding | S::WaitPrack | S::ReliableProceeding, In::Cancel, _) => {
                self.cancelled(inner);
                Ok(())
            }

            (S::Initial | S::Calling | S::Proceeding, In::Provisional | In::TProvisional, _) => {
                self.send_current(inner).await
            }
            (S::Proceeding | S::ReliableProceeding, In::Request, _) => self.send_current(inner).await,

            (_, In::ReliableProvisional, S::WaitPrack) => self.send_reliable(inner).await,
            (S::WaitPrack, In::T1, _) => self.retransmit_reliable(inner).await,
            (S::WaitPrack, In::IoException, _) => {
                // Timer retransmissions carry on over whatever the route offers next.
                if let Err(e) = inner.route.next(&mut inner.connection).await {
                    debug!(id = %self.key(), error = %e, "no further response connection");
                }
                Ok(())
            }
            (S::WaitPrack | S::ReliableProceeding, In::Prack, _) => {
                inner.timers.cancel(TimerEvent::T1);
                inner.unacknowledged = None;
                if let Some(prack) = inner.prack.take() {
                    self.notify(Notification::Prack(prack));
                }
                Ok(())
            }

            (_, In::Failure, S::Completed) if transition.from != S::Completed => self.complete_non_2xx(inner).await,
            (S::Completed, In::T1, _) => {
                let limit = self.ctx.config.timers.retry_limit(self.kind());
                if inner.retries >= limit {
                    inner.pending.push_back(In::T1Expired);
                    return Ok(());
                }
                inner.retries += 1;
                if !inner.connection.is_reliable() {
                    trace!(id = %self.key(), retries = inner.retries, "retransmitting final response");
                    self.send_current(inner).await?;
                }
                inner.interval = self.ctx.config.timers.backoff(self.kind(), inner.interval);
                inner.timers.schedule(self.this.clone(), TimerEvent::T1, inner.interval);
                Ok(())
            }
            (S::Completed, In::Request, _) => self.send_current(inner).await,
            (S::Completed, In::Ack, S::Confirmed) => {
                inner.timers.cancel(TimerEvent::T1);
                let ack = inner.ack.take();
                if self.is_proxy() {
                    if let Some(ack) = ack {
                        self.notify(Notification::Ack(ack));
                    }
                    if self.ctx.config.cleanup_on_terminate {
                        self.cleanup(inner);
                        return Ok(());
                    }
                }
                self.arm_completion(inner);
                Ok(())
            }

            (S::Proceeding | S::ReliableProceeding | S::Completed, In::IoException, _) => {
                self.next_client(inner).await
            }
            (S::Proceeding | S::ReliableProceeding | S::Completed, In::NextClient, _) => {
                self.send_current(inner).await
            }

            (S::XInitial, In::Start, S::XCompleted) => {
                self.enter_post_2xx(inner);
                Ok(())
            }
            (S::XCompleted, In::T1, _) => {
                self.send_current(inner).await?;
                inner.interval = self.ctx.config.timers.backoff(self.kind(), inner.interval);
                inner.timers.schedule(self.this.clone(), TimerEvent::T1, inner.interval);
                Ok(())
            }
            (S::XCompleted, In::Request | In::NextClient, _) => self.send_current(inner).await,
            (S::XCompleted, In::Ack, S::XConfirmed) => {
                inner.timers.cancel(TimerEvent::T1);
                if let Some(ack) = inner.ack.take() {
                    self.notify(Notification::Ack(ack));
                }
                if self.ctx.config.cleanup_on_terminate {
                    debug!(id = %self.key(), "2xx ACKed, removing transaction early");
                    self.cleanup(inner);
                } else {
                    self.arm_completion(inner);
                }
                Ok(())
            }
            (S::XConfirmed, In::Ack, _) => {
                let ack = inner.ack.take();
                if self.is_proxy() {
                    // End-to-end ACK retransmissions are forwarded by the proxy core.
                    if let Some(ack) = ack {
                        self.notify(Notification::Ack(ack));
                    }
                } else {
                    trace!(id = %self.key(), "ACK retransmission absorbed");
                }
                Ok(())
            }

            (from, input, _) => {
                trace!(id = %self.key(), %from, %input, "nothing to do");
                Ok(())
            }
        }
    }

    /// First reliable provisional since the last PRACK: send it and start retransmitting
    /// on T1 (RFC 3262 section 3).
    async fn send_reliable(&self, inner: &mut ServerInner) -> Result<()> {
        inner.unacknowledged = inner.current.clone();
        inner.retries = 0;
        inner.interval = self.ctx.config.timers.t1;
        inner.timers.cancel(TimerEvent::T1);
        inner
            .timers
            .schedule(self.this.clone(), TimerEvent::T1, inner.interval);
        self.send_current(inner).await
    }

    /// T1 in WAIT_PRACK. Over reliable transports the provisional is not re-sent, the timer
    /// only bounds the wait. Once the retries are used up the request fails with 504.
    async fn retransmit_reliable(&self, inner: &mut ServerInner) -> Result<()> {
        let limit = self.ctx.config.timers.retry_limit(self.kind());
        if inner.retries >= limit {
            warn!(id = %self.key(), "reliable provisional never PRACKed, answering 504");
            inner.unacknowledged = None;
            let timeout = create_response(self.request(), 504);
            self.stage(inner, timeout);
            if let Err(e) = self.send_current(inner).await {
                debug!(id = %self.key(), error = %e, "504 not delivered");
            }
            inner.pending.push_back(In::T1Expired);
            return Ok(());
        }
        inner.retries += 1;
        inner.interval = inner.interval.saturating_mul(2);
        inner
            .timers
            .schedule(self.this.clone(), TimerEvent::T1, inner.interval);
        if inner.connection.is_reliable() {
            return Ok(());
        }
        let Some(provisional) = inner.unacknowledged.clone() else {
            return Ok(());
        };
        trace!(id = %self.key(), retries = inner.retries, "retransmitting reliable provisional");
        inner.connection.send(&Message::Response(provisional)).await
    }

    /// Non-2xx final: send it and retransmit on timer G until the ACK, for at most
    /// 64*T1 (timer H, counted by the retry limit).
    async fn complete_non_2xx(&self, inner: &mut ServerInner) -> Result<()> {
        for event in [TimerEvent::T1, TimerEvent::Tn, TimerEvent::Expiration] {
            inner.timers.cancel(event);
        }
        inner.unacknowledged = None;
        inner.retries = 0;
        inner.interval = self.ctx.config.timers.t1;
        inner
            .timers
            .schedule(self.this.clone(), TimerEvent::T1, inner.interval);
        self.send_current(inner).await
    }

    /// First 2xx: deliver it over the first route that works, then either leave (proxy)
    /// or switch to the post-2xx table.
    async fn first_success(&self, inner: &mut ServerInner) -> Result<()> {
        for event in [TimerEvent::T1, TimerEvent::Tn, TimerEvent::Expiration] {
            inner.timers.cancel(event);
        }
        inner.unacknowledged = None;

        // TERMINATED takes no more inputs, so route failover happens in place.
        loop {
            match self.send_current(inner).await {
                Ok(()) => break,
                Err(e) if e.is_transport() => {
                    inner.connection.mark_unreachable();
                    let advanced = inner.route.next(&mut inner.connection).await.unwrap_or(false);
                    if !advanced {
                        warn!(id = %self.key(), error = %e, "2xx could not be delivered");
                        self.notify(Notification::IcmpError);
                        self.cleanup(inner);
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if self.is_proxy() && !self.ctx.config.x200_terminated {
            debug!(id = %self.key(), "2xx forwarded, proxy drops the transaction");
            self.cleanup(inner);
            return Ok(());
        }
        inner.table.switch_table(&SERVER_INVITE_X, S::XInitial);
        self.state.set(S::XInitial);
        inner.pending.push_back(In::Start);
        Ok(())
    }

    /// XCOMPLETED entered: a UAS retransmits the 2xx itself until the ACK (64*T1); a proxy
    /// only waits TU1 for retransmissions to forward.
    fn enter_post_2xx(&self, inner: &mut ServerInner) {
        let timers = &self.ctx.config.timers;
        inner.retries = 0;
        inner.interval = timers.t1;
        if self.is_proxy() {
            inner
                .timers
                .schedule(self.this.clone(), TimerEvent::Tn, timers.tu1);
        } else {
            if !inner.connection.is_reliable() {
                inner
                    .timers
                    .schedule(self.this.clone(), TimerEvent::T1, inner.interval);
            }
            inner
                .timers
                .schedule(self.this.clone(), TimerEvent::Tn, timers.ack_wait());
        }
    }

    /// A proxy forwarding a retransmitted 2xx downstream.
    pub(super) async fn retransmit_2xx(
        &self,
        inner: &mut ServerInner,
        response: Response,
    ) -> Result<()> {
        if inner.cleaned_up {
            return Err(Error::Other("transaction already terminated".to_string()));
        }
        trace!(id = %self.key(), status = response.status, "forwarding 2xx retransmission");
        *self.response.write() = Some(response.clone());
        inner.current = Some(response);
        self.send_current(inner).await
    }
}
