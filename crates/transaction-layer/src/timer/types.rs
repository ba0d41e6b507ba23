//! Timer values and the closed set of timer events a transaction can receive.
//!
//! RFC 3261 names a dozen timers (A through K). This layer folds them into a few roles:
//!
//! - **T1**: retransmission of a request (A, E) or of a final/reliable provisional
//!   response (G, and the RFC 3262 equivalent). Starts at `t1` and backs off.
//! - **Timeout**: the wait in COMPLETED/CONFIRMED that absorbs retransmissions
//!   (D, I, J, K). Called `To` below; zero on reliable transports.
//! - **Tn**: the overall lifetime bound of a transaction (B, F, H).
//!
//! plus the layer's own timers: the delayed automatic 100 (TU3), the 32 s cancel guard,
//! INVITE expiration, and the removal timer of a 503 handler.

use std::fmt;
use std::time::Duration;

use crate::transaction::TransactionKind;

/// Configuration for SIP transaction timer durations and retry caps.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use rvoip_transaction_layer::timer::TimerSettings;
///
/// let defaults = TimerSettings::default();
/// assert_eq!(defaults.t1, Duration::from_millis(500));
/// assert_eq!(defaults.t2, Duration::from_secs(4));
///
/// // A slower network: double the RTT estimate, keep everything else.
/// let slow = TimerSettings {
///     t1: Duration::from_secs(1),
///     t2: Duration::from_secs(8),
///     ..Default::default()
/// };
/// assert_eq!(slow.t4, defaults.t4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSettings {
    /// **T1: RTT estimate (default 500 ms).** Initial retransmission interval.
    pub t1: Duration,

    /// **T2: maximum retransmission interval (default 4 s)** for everything except the
    /// INVITE request itself, whose interval keeps doubling.
    pub t2: Duration,

    /// **T4: maximum time a message stays in the network (default 5 s).** The completion
    /// wait of client non-INVITE and server INVITE transactions.
    pub t4: Duration,

    /// **TU1 (default 5 s):** lifetime of a proxy's post-2xx state.
    pub tu1: Duration,

    /// **TU2 (default 32 s):** completion wait of client INVITE and server non-INVITE
    /// transactions.
    pub tu2: Duration,

    /// **TU3 (default disabled):** delay after which a server non-INVITE transaction sends
    /// an automatic 100 if the TU has not answered.
    pub tu3: Option<Duration>,

    /// Lifetime bound of a client transaction (default 64 s).
    pub client_tn: Duration,

    /// Lifetime bound of a server transaction (default 64 s).
    pub server_tn: Duration,

    /// Time a cancelled client transaction waits for a final response (default 32 s).
    pub cancel_timer: Duration,

    /// Retransmissions of an INVITE before giving up on the server (default 5).
    pub invite_client_retries: u32,

    /// Retransmissions of a non-INVITE request (default 9).
    pub client_retries: u32,

    /// Retransmissions of a final or reliable provisional response to an INVITE (default 9).
    pub invite_server_retries: u32,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            tu1: Duration::from_secs(5),
            tu2: Duration::from_secs(32),
            tu3: None,
            client_tn: Duration::from_secs(64),
            server_tn: Duration::from_secs(64),
            cancel_timer: Duration::from_secs(32),
            invite_client_retries: 5,
            client_retries: 9,
            invite_server_retries: 9,
        }
    }
}

impl TimerSettings {
    /// Millisecond-scale values with the default ratios, for tests.
    pub fn for_testing() -> Self {
        Self {
            t1: Duration::from_millis(10),
            t2: Duration::from_millis(80),
            t4: Duration::from_millis(100),
            tu1: Duration::from_millis(100),
            tu2: Duration::from_millis(640),
            tu3: None,
            client_tn: Duration::from_millis(1280),
            server_tn: Duration::from_millis(1280),
            cancel_timer: Duration::from_millis(640),
            ..Self::default()
        }
    }

    /// The completion wait (`To`) of a transaction. Reliable transports need none.
    pub fn completion_timeout(&self, kind: TransactionKind, reliable: bool) -> Duration {
        if reliable {
            return Duration::ZERO;
        }
        match kind {
            TransactionKind::ClientNonInvite => self.t4,
            TransactionKind::ClientInvite => self.tu2,
            TransactionKind::ServerNonInvite => self.tu2,
            TransactionKind::ServerInvite => self.t4,
        }
    }

    /// How many times a transaction of this kind retransmits before giving up.
    pub fn retry_limit(&self, kind: TransactionKind) -> u32 {
        match kind {
            TransactionKind::ClientInvite => self.invite_client_retries,
            TransactionKind::ClientNonInvite => self.client_retries,
            TransactionKind::ServerInvite | TransactionKind::ServerNonInvite => {
                self.invite_server_retries
            }
        }
    }

    /// Retransmission interval following `current`: the INVITE request doubles without
    /// bound, everything else doubles up to T2.
    pub fn backoff(&self, kind: TransactionKind, current: Duration) -> Duration {
        let doubled = current.saturating_mul(2);
        if kind == TransactionKind::ClientInvite {
            doubled
        } else {
            doubled.min(self.t2)
        }
    }

    /// How long a UA keeps the post-2xx state to absorb 2xx retransmissions (64*T1).
    pub fn ack_wait(&self) -> Duration {
        self.t1.saturating_mul(64)
    }
}

/// The events a transaction timer can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerEvent {
    /// Retransmission interval elapsed.
    T1,
    /// Completion wait elapsed.
    Timeout,
    /// Transaction lifetime elapsed.
    Tn,
    /// Delayed automatic 100 Trying (server non-INVITE).
    TProvisional,
    /// A cancelled client INVITE got no final response in time.
    CancelTimer,
    /// The Expires interval of an INVITE elapsed.
    Expiration,
    /// A 503 handler may drop out of the client table.
    Removal,
}

impl fmt::Display for TimerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimerEvent::T1 => "T1",
            TimerEvent::Timeout => "TIMEOUT",
            TimerEvent::Tn => "Tn",
            TimerEvent::TProvisional => "TPROVISIONAL",
            TimerEvent::CancelTimer => "CANCEL_TIMER",
            TimerEvent::Expiration => "EXPIRATION",
            TimerEvent::Removal => "REMOVAL",
        })
    }
}
