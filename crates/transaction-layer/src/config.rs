//! Configuration of the transaction layer.
//!
//! A [`TransactionConfig`] is built once, wrapped in an `Arc` by the
//! [`TransactionManager`](crate::manager::TransactionManager) and handed to every
//! transaction it creates. Nothing in it changes at runtime.

use std::time::Duration;

use crate::timer::TimerSettings;

/// Local level of RFC 3262 reliable provisional response support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReliableProvisionalSupport {
    /// Outgoing INVITEs carry `Require: 100rel`; incoming provisionals must be reliable.
    Require,
    /// Outgoing INVITEs carry `Supported: 100rel`.
    #[default]
    Supported,
    /// 100rel is neither offered nor accepted.
    Unsupported,
}

/// How the candidates returned by the resolver are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadDistribution {
    /// Candidates are tried in resolver order.
    #[default]
    Deterministic,
    /// Candidates are shuffled before they are tried.
    Random,
}

/// Immutable settings shared by every transaction of a manager.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    pub timers: TimerSettings,

    /// Stateful proxy behavior: no automatic responses on the UA's behalf, Max-Forwards
    /// enforcement, no 100rel handling.
    pub proxy_mode: bool,

    pub reliable_provisional: ReliableProvisionalSupport,

    /// Remove a transaction as soon as its post-2xx state would only absorb
    /// retransmissions, instead of waiting out the timer.
    pub cleanup_on_terminate: bool,

    /// In proxy mode, keep INVITE transactions on the post-2xx sub-machine after the
    /// first 2xx rather than dropping them.
    pub x200_terminated: bool,

    /// Answer a CANCELled INVITE with 487 automatically (UA mode).
    pub auto_487_on_cancel: bool,

    /// Answer a CANCEL that matches nothing with 481 when no stray interface is set.
    pub auto_481_on_stray_cancel: bool,

    /// Send 100 Trying as soon as an INVITE is received (UA mode).
    pub send_100_on_invite: bool,

    /// Fork-aware INVITE clients: final responses with a different To tag create a copy
    /// of the transaction and are reported through `multiple_final_response`.
    pub multiple_final_responses: bool,

    /// How long a failed destination is skipped by later resolutions.
    pub unreachable_timeout: Duration,

    pub use_unreachable_table: bool,

    pub load_distribution: LoadDistribution,

    /// Expiration applied to outgoing and incoming INVITEs without an Expires header.
    pub default_invite_expiration: Option<Duration>,

    /// Number of workers delivering TU callbacks.
    pub callback_workers: usize,

    /// Queue depth of a callback worker above which a warning is logged.
    pub callback_queue_warn: usize,

    /// Live server transactions above which new requests are refused with 503.
    pub max_pending_requests: Option<usize>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timers: TimerSettings::default(),
            proxy_mode: false,
            reliable_provisional: ReliableProvisionalSupport::Supported,
            cleanup_on_terminate: false,
            x200_terminated: false,
            auto_487_on_cancel: true,
            auto_481_on_stray_cancel: true,
            send_100_on_invite: true,
            multiple_final_responses: false,
            unreachable_timeout: Duration::from_secs(180),
            use_unreachable_table: true,
            load_distribution: LoadDistribution::Deterministic,
            default_invite_expiration: None,
            callback_workers: 4,
            callback_queue_warn: 1000,
            max_pending_requests: None,
        }
    }
}

impl TransactionConfig {
    /// Stateful proxy defaults: no automatic 100/487, 100rel passed through untouched.
    pub fn proxy() -> Self {
        Self {
            proxy_mode: true,
            auto_487_on_cancel: false,
            send_100_on_invite: false,
            reliable_provisional: ReliableProvisionalSupport::Unsupported,
            ..Self::default()
        }
    }

    /// UA defaults with millisecond-scale timers.
    pub fn for_testing() -> Self {
        Self {
            timers: TimerSettings::for_testing(),
            unreachable_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_reliable_provisional(mut self, support: ReliableProvisionalSupport) -> Self {
        self.reliable_provisional = support;
        self
    }

    /// Whether 100rel is handled at all (never in proxy mode).
    pub fn handles_100rel(&self) -> bool {
        !self.proxy_mode && self.reliable_provisional != ReliableProvisionalSupport::Unsupported
    }
}
