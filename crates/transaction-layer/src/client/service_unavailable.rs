//! Stand-in for a client transaction that left a server after a 503.
//!
//! The transaction retries on the next server under a new branch. The 503 from the old
//! server still needs its ACK, and retransmissions of it must keep finding something under
//! the old key, so this handler takes that key over, ACKs every copy of the 503 over the old
//! connection and removes itself once the server has stopped retransmitting.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionWrapper;
use crate::manager::context::TransactionContext;
use crate::message::{Message, Request, Response};
use crate::timer::{TimerEvent, TimerSet, TimerTarget};
use crate::transaction::{next_serial, TransactionKey, TransactionKind};

struct HandlerState {
    connection: ConnectionWrapper,
    timers: TimerSet,
    acks_sent: usize,
    done: bool,
}

pub struct ServiceUnavailableHandler {
    this: Weak<ServiceUnavailableHandler>,
    serial: u64,
    key: TransactionKey,
    kind: TransactionKind,
    /// ACK for the 503; only INVITEs have one.
    ack: Option<Request>,
    ctx: Arc<TransactionContext>,
    state: Mutex<HandlerState>,
}

impl fmt::Debug for ServiceUnavailableHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceUnavailableHandler")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish()
    }
}

impl ServiceUnavailableHandler {
    pub(crate) fn new(
        ctx: Arc<TransactionContext>,
        key: TransactionKey,
        kind: TransactionKind,
        ack: Option<Request>,
        connection: ConnectionWrapper,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            serial: next_serial(),
            key,
            kind,
            ack,
            ctx,
            state: Mutex::new(HandlerState {
                connection,
                timers: TimerSet::new(),
                acks_sent: 0,
                done: false,
            }),
        })
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Number of ACKs sent for the 503 so far.
    pub async fn acks_sent(&self) -> usize {
        self.state.lock().await.acks_sent
    }

    /// ACKs the 503 and arms removal. Over a reliable transport nothing is retransmitted,
    /// so the handler leaves right away.
    pub(crate) async fn start(&self) {
        let mut state = self.state.lock().await;
        self.send_ack(&mut state).await;
        let wait = self
            .ctx
            .config
            .timers
            .completion_timeout(self.kind, state.connection.is_reliable());
        if wait.is_zero() {
            self.finish(&mut state);
        } else {
            state
                .timers
                .schedule(self.this.clone(), TimerEvent::Removal, wait);
        }
    }

    /// A retransmitted response of the abandoned attempt.
    pub(crate) async fn on_response(&self, response: Response) {
        let mut state = self.state.lock().await;
        if state.done {
            return;
        }
        trace!(key = %self.key, status = response.status, "response for abandoned attempt");
        self.send_ack(&mut state).await;
    }

    async fn send_ack(&self, state: &mut HandlerState) {
        let Some(ack) = self.ack.clone() else {
            return;
        };
        match state.connection.send(&Message::Request(ack)).await {
            Ok(()) => state.acks_sent += 1,
            Err(e) => warn!(key = %self.key, error = %e, "ACK for 503 not sent"),
        }
    }

    fn finish(&self, state: &mut HandlerState) {
        if state.done {
            return;
        }
        state.done = true;
        state.timers.cancel_all();
        state.connection.release();
        self.ctx
            .registry
            .remove_client(&self.key, self.serial, self.kind);
        debug!(key = %self.key, acks = state.acks_sent, "503 handler removed");
    }
}

#[async_trait]
impl TimerTarget for ServiceUnavailableHandler {
    async fn on_timer(self: Arc<Self>, event: TimerEvent, generation: u64) {
        let mut state = self.state.lock().await;
        if state.timers.claim(event, generation) && event == TimerEvent::Removal {
            self.finish(&mut state);
        }
    }
}
