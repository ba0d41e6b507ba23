//! Transaction identity, state and the table-driven state machine shared by the client
//! and server transactions.

pub mod dialog;
pub mod key;
pub mod state;
pub mod state_table;
pub mod transitions;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use dialog::DialogId;
pub use key::{KeyContext, TransactionKey};
pub use state::{AtomicTransactionState, TransactionState};
pub use state_table::{ClientInput, ServerInput, StateTable, Transition, TransitionTable};

/// The four RFC 3261 transaction flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// Non-INVITE client transaction (NICT).
    ClientNonInvite,
    /// INVITE client transaction (ICT).
    ClientInvite,
    /// Non-INVITE server transaction (NIST).
    ServerNonInvite,
    /// INVITE server transaction (IST).
    ServerInvite,
}

impl TransactionKind {
    pub fn client(invite: bool) -> Self {
        if invite { TransactionKind::ClientInvite } else { TransactionKind::ClientNonInvite }
    }

    pub fn server(invite: bool) -> Self {
        if invite { TransactionKind::ServerInvite } else { TransactionKind::ServerNonInvite }
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, TransactionKind::ClientInvite | TransactionKind::ServerInvite)
    }

    pub fn is_client(&self) -> bool {
        matches!(self, TransactionKind::ClientInvite | TransactionKind::ClientNonInvite)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionKind::ClientNonInvite => "NICT",
            TransactionKind::ClientInvite => "ICT",
            TransactionKind::ServerNonInvite => "NIST",
            TransactionKind::ServerInvite => "IST",
        })
    }
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Process-unique serial number of a transaction object. Unlike its key, which can change
/// when a client transaction moves to another server, the serial is stable for the
/// lifetime of the object.
pub(crate) fn next_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}
