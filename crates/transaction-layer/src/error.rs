use crate::transaction::TransactionKey;
use std::io;
use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in SIP transaction handling
#[derive(Error, Debug)]
pub enum Error {
    /// An input arrived for which the transition table has no next state.
    #[error("State Table:{table}, Current State: {state}, Input: {input}")]
    StateMachine {
        table: &'static str,
        state: String,
        input: String,
    },

    /// The transport could not deliver a message (connection refused, closed, ICMP error).
    #[error("SIP transport error: {0}")]
    Transport(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No candidate endpoint is left to try.
    #[error("No more candidate endpoints")]
    NoCandidate,

    /// Transaction not found for the given key.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionKey),

    /// Transaction with the given key already exists.
    #[error("Transaction already exists: {0}")]
    TransactionExists(TransactionKey),

    /// The TU tried to send a second, different final response.
    #[error("Can't send more than one final response")]
    MultipleFinalResponses,

    /// The TU tried to ACK the same final response class twice.
    #[error("ACK was already sent for this final response")]
    AckAlreadySent,

    /// Misuse of RFC 3262 reliable provisional responses.
    #[error("Reliable provisional error: {0}")]
    ReliableProvisional(String),

    /// The peer requires an extension this stack does not support (answered with 420).
    #[error("Unsupported extension required: {0}")]
    UnsupportedExtension(String),

    /// A header needed to build a key or a derived message is absent.
    #[error("Missing mandatory header: {0}")]
    MissingHeader(&'static str),

    /// The message is structurally unusable.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Internal channel error (e.g., receiver dropped).
    #[error("Internal channel closed")]
    ChannelClosed,

    /// Other miscellaneous errors.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Failures that the state machines turn into an I/O-exception input and retry
    /// against the next candidate.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_) | Error::NoCandidate)
    }

    /// Whether this error came from an undefined state-table entry.
    pub fn is_state_machine(&self) -> bool {
        matches!(self, Error::StateMachine { .. })
    }

    /// Errors caused by the caller asking for something the transaction cannot do right
    /// now. They are returned as is and never turned into an exception input.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::StateMachine { .. }
                | Error::AckAlreadySent
                | Error::MultipleFinalResponses
                | Error::ReliableProvisional(_)
                | Error::TransactionExists(_)
        )
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
