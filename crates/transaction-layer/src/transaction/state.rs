use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// State of a SIP transaction.
///
/// One enum covers all six transition tables. Client tables use `Calling`, `Proceeding`,
/// `ReliableProceeding`, `Completed` and `Terminated`; server tables add `WaitPrack` and
/// `Confirmed`. The `X*` states form the sub-machine an INVITE transaction switches to after
/// its first 2xx, where further 2xx retransmissions and their ACKs are absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Created but not started. Client: request not yet sent. Server: not yet handed to the TU.
    Initial,
    /// Client: request sent, nothing received. Server: request delivered to the TU.
    Calling,
    /// Server INVITE only: a reliable provisional was sent and its PRACK is awaited.
    WaitPrack,
    /// A reliable provisional was received (client) or PRACKed (server).
    ReliableProceeding,
    /// A provisional was received (client) or sent (server).
    Proceeding,
    /// Final response received (client) or sent (server); absorbing retransmissions.
    Completed,
    /// Server INVITE only: ACK for a non-2xx final response received.
    Confirmed,
    Terminated,
    XInitial,
    XCompleted,
    XConfirmed,
    XTerminated,
    /// Sentinel stored in transition tables for illegal (state, input) pairs.
    Undefined,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Initial => "INITIAL",
            TransactionState::Calling => "CALLING",
            TransactionState::WaitPrack => "WAIT_PRACK",
            TransactionState::ReliableProceeding => "RELIABLE_PROCEEDING",
            TransactionState::Proceeding => "PROCEEDING",
            TransactionState::Completed => "COMPLETED",
            TransactionState::Confirmed => "CONFIRMED",
            TransactionState::Terminated => "TERMINATED",
            TransactionState::XInitial => "XINITIAL",
            TransactionState::XCompleted => "XCOMPLETED",
            TransactionState::XConfirmed => "XCONFIRMED",
            TransactionState::XTerminated => "XTERMINATED",
            TransactionState::Undefined => "UNDEFINED",
        }
    }

    /// Terminal states accept no further input.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TransactionState::Terminated | TransactionState::XTerminated | TransactionState::Undefined
        )
    }

    /// Whether the transaction is on the post-2xx sub-machine.
    pub fn is_extra(&self) -> bool {
        matches!(
            self,
            TransactionState::XInitial
                | TransactionState::XCompleted
                | TransactionState::XConfirmed
                | TransactionState::XTerminated
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const STATES: [TransactionState; 13] = [
    TransactionState::Initial,
    TransactionState::Calling,
    TransactionState::WaitPrack,
    TransactionState::ReliableProceeding,
    TransactionState::Proceeding,
    TransactionState::Completed,
    TransactionState::Confirmed,
    TransactionState::Terminated,
    TransactionState::XInitial,
    TransactionState::XCompleted,
    TransactionState::XConfirmed,
    TransactionState::XTerminated,
    TransactionState::Undefined,
];

fn to_u8(state: TransactionState) -> u8 {
    STATES.iter().position(|s| *s == state).unwrap_or(STATES.len() - 1) as u8
}

fn from_u8(value: u8) -> TransactionState {
    STATES
        .get(value as usize)
        .copied()
        .unwrap_or(TransactionState::Undefined)
}

/// Lock-free mirror of a transaction's current state.
///
/// The authoritative cursor lives in the transaction's locked state table; this copy lets
/// the manager and the TU read the state without waiting for the transaction lock.
#[derive(Debug)]
pub struct AtomicTransactionState {
    value: AtomicU8,
}

impl AtomicTransactionState {
    pub fn new(state: TransactionState) -> Self {
        Self {
            value: AtomicU8::new(to_u8(state)),
        }
    }

    pub fn get(&self) -> TransactionState {
        from_u8(self.value.load(Ordering::Acquire))
    }

    /// Stores `new_state` and returns the previous state.
    pub fn set(&self, new_state: TransactionState) -> TransactionState {
        from_u8(self.value.swap(to_u8(new_state), Ordering::AcqRel))
    }
}
