//! Handlers of the server non-INVITE machine (RFC 3261 section 17.2.2).

use tracing::trace;

use super::{ServerInner, ServerTransaction};
use crate::error::Result;
use crate::message::create_trying;
use crate::timer::TimerEvent;
use crate::transaction::{ServerInput as In, TransactionState as S, Transition};

impl ServerTransaction {
    pub(super) async fn on_non_invite_transition(
        &self,
        inner: &mut ServerInner,
        transition: Transition<In>,
    ) -> Result<()> {
        if transition.to == S::Terminated {
            self.terminated(inner, transition);
            return Ok(());
        }
        match (transition.from, transition.input) {
            (S::Initial, In::Start) => Ok(()),
            (S::Initial | S::Calling | S::Proceeding, In::Cancel) => {
                self.cancelled(inner);
                Ok(())
            }

            (S::Initial | S::Calling, In::TProvisional) => {
                // TU3 expired before the TU said anything.
                trace!(id = %self.key(), "sending delayed 100 Trying");
                let trying = create_trying(self.request());
                self.stage(inner, trying);
                self.send_current(inner).await
            }
            (S::Initial | S::Calling, In::Provisional) => self.send_current(inner).await,
            (S::Proceeding, In::Provisional | In::Request) => self.send_current(inner).await,

            (S::Initial | S::Calling | S::Proceeding, In::Success | In::Failure) => {
                self.send_final(inner).await
            }
            (S::Completed, In::Request) => self.send_current(inner).await,

            (S::Proceeding | S::Completed, In::IoException) => self.next_client(inner).await,
            (S::Proceeding, In::NextClient) => self.send_current(inner).await,
            (S::Completed, In::NextClient) => {
                self.send_current(inner).await?;
                inner.timers.cancel(TimerEvent::Timeout);
                self.arm_completion(inner);
                Ok(())
            }

            (from, input) => {
                trace!(id = %self.key(), %from, %input, "nothing to do");
                Ok(())
            }
        }
    }

    /// First final response: send it, stop the lifetime timers, wait out retransmissions
    /// of the request (timer J).
    async fn send_final(&self, inner: &mut ServerInner) -> Result<()> {
        for event in [TimerEvent::Tn, TimerEvent::TProvisional, TimerEvent::Expiration] {
            inner.timers.cancel(event);
        }
        self.send_current(inner).await?;
        self.arm_completion(inner);
        Ok(())
    }
}
