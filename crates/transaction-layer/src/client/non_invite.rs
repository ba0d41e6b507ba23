//! Handlers of the client non-INVITE machine (RFC 3261 section 17.1.2).

use tracing::trace;

use super::{ClientInner, ClientTransaction, Notification};
use crate::error::Result;
use crate::transaction::{ClientInput as In, TransactionState as S, Transition};

impl ClientTransaction {
    pub(super) async fn on_non_invite_transition(
        &self,
        inner: &mut ClientInner,
        transition: Transition<In>,
    ) -> Result<()> {
        if transition.from == S::Terminated {
            trace!(id = %self.key(), input = %transition.input, "already terminated");
            return Ok(());
        }
        if transition.to == S::Terminated {
            self.terminated(inner, transition);
            return Ok(());
        }
        match (transition.from, transition.input) {
            (S::Initial, In::Start) => self.send_initial(inner).await,
            (S::Calling, In::NextServer) => self.next_server(inner),
            (S::Calling, In::IoException) => self.io_failover(inner).await,
            (S::Calling, In::T1) => self.retransmit(inner, false).await,
            (S::Proceeding, In::T1) => self.retransmit(inner, true).await,
            (S::Calling | S::Proceeding, In::Cancel) => self.send_cancel(inner).await,
            (S::Calling | S::Proceeding, In::ServiceUnavailable) => self.service_unavailable(inner).await,
            (S::Calling, In::Provisional) => {
                // Timer E now runs at T2 (RFC 3261 section 17.1.2.2).
                inner.interval = self.ctx.config.timers.t2;
                self.deliver_provisional(inner);
                Ok(())
            }
            (S::Proceeding, In::Provisional) => {
                self.deliver_provisional(inner);
                Ok(())
            }
            (S::Calling | S::Proceeding, In::Success | In::Failure) => {
                self.complete(inner);
                Ok(())
            }
            (S::Completed, In::ServiceUnavailable) => {
                inner.connection.mark_unreachable();
                Ok(())
            }
            (S::Completed, input) => {
                if let Some(response) = inner.incoming.as_ref().filter(|_| input != In::T1) {
                    let status = response.status;
                    let again = inner.seen.record(status);
                    trace!(id = %self.key(), %input, status, retransmission = again, "absorbed in COMPLETED");
                }
                Ok(())
            }
            (from, input) => {
                trace!(id = %self.key(), %from, %input, "nothing to do");
                Ok(())
            }
        }
    }

    fn deliver_provisional(&self, inner: &mut ClientInner) {
        if let Some(response) = inner.incoming.clone() {
            inner.seen.record(response.status);
            self.notify(Notification::Provisional(response));
        }
    }
}
