//! # RVOIP Transaction Layer
//!
//! The SIP transaction layer of RFC 3261 section 17, with RFC 3262 reliable provisional
//! responses, RFC 3581 `rport` handling and RFC 6026 treatment of 2xx responses to INVITE.
//!
//! A transaction is one request together with every response and retransmission that
//! belongs to it. This crate keeps one state machine per transaction and drives it from
//! three sources: the transaction user (TU) sending requests and responses, messages
//! arriving from the transport, and timers.
//!
//! ## Architecture
//!
//! ```text
//! +----------------------------------+
//! |        Transaction User          |   RequestInterface, *TransactionInterface
//! +----------------------------------+
//!        |  ^                  ^
//!        v  |  callback pool   |
//! +----------------------------------+
//! |       TransactionManager         |   process_message, create_client_transaction
//! |  +-------------+ +-------------+ |
//! |  |   client    | |   server    | |   table-driven state machines
//! |  +-------------+ +-------------+ |
//! |  TransactionRegistry, timers     |
//! +----------------------------------+
//!        |                  ^
//!        v                  |
//! +----------------------------------+
//! |   Transport / Resolver traits    |   supplied by the embedding application
//! +----------------------------------+
//! ```
//!
//! - [`transaction`]: keys, states, and the transition tables of the four machines
//!   (client/server, INVITE/non-INVITE) plus the post-2xx INVITE sub-machines.
//! - [`client`] and [`server`]: the transactions themselves. Each serializes its inputs
//!   behind its own lock and never calls the TU while holding it.
//! - [`manager`]: matching of inbound messages, automatic responses (100, 405, 481, 482,
//!   483, 487, 503) and the shared tables.
//! - [`connection`]: candidate resolution and failover for requests, and the RFC 3261
//!   section 18.2.2 response route for server transactions.
//! - [`timer`]: RFC 3261 timer values and per-transaction timer bookkeeping.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use rvoip_transaction_layer::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl RequestInterface for Echo {
//!     async fn request(&self, transaction: Arc<ServerTransaction>) {
//!         let ok = create_response(transaction.request(), 200);
//!         let _ = transaction.send_response(Some(ok)).await;
//!     }
//! }
//!
//! # async fn run(transport: Arc<dyn Transport>) {
//! let manager = TransactionManager::new(TransactionConfig::default(), transport, Arc::new(LiteralResolver));
//! manager.set_request_interface(Method::Options, Arc::new(Echo));
//! // Feed every received message to manager.process_message(...)
//! # }
//! ```

pub mod callback;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod interfaces;
pub mod manager;
pub mod message;
pub mod server;
pub mod timer;
pub mod transaction;
pub mod transport;
pub mod utils;

pub use client::{ClientTransaction, ServiceUnavailableHandler};
pub use config::{LoadDistribution, ReliableProvisionalSupport, TransactionConfig};
pub use error::{Error, Result};
pub use interfaces::{
    ClientTransactionInterface, RequestInterface, ServerTransactionInterface, StrayMessageInterface,
    TransactionRemovalListener,
};
pub use manager::{TransactionCounts, TransactionManager};
pub use server::ServerTransaction;
pub use timer::{TimerEvent, TimerSettings};
pub use transaction::{
    DialogId, KeyContext, TransactionKey, TransactionKind, TransactionState,
};
pub use transport::{Connection, Endpoint, LiteralResolver, MessageSource, Resolver, Transport};

/// Re-exports for applications embedding the transaction layer.
pub mod prelude {
    pub use crate::client::ClientTransaction;
    pub use crate::config::{ReliableProvisionalSupport, TransactionConfig};
    pub use crate::error::{Error, Result};
    pub use crate::interfaces::{
        ClientTransactionInterface, RequestInterface, ServerTransactionInterface,
        StrayMessageInterface, TransactionRemovalListener,
    };
    pub use crate::manager::TransactionManager;
    pub use crate::message::{
        create_ack_for_2xx, create_cancel, create_prack, create_response, Message, Method,
        Request, RequestBuilder, Response, ResponseBuilder,
    };
    pub use crate::server::ServerTransaction;
    pub use crate::timer::TimerSettings;
    pub use crate::transaction::{TransactionKey, TransactionKind, TransactionState};
    pub use crate::transport::{Connection, Endpoint, LiteralResolver, MessageSource, Resolver, Transport};
}
