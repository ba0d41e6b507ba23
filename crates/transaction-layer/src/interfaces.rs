//! Interfaces between the transaction layer and its transaction user (TU).
//!
//! Every method is invoked from a callback worker, never from inside a transaction's
//! lock, so implementations may call straight back into the transaction (send a
//! response, ACK, CANCEL) without deadlocking.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::ClientTransaction;
use crate::message::{create_response, Request, Response};
use crate::server::ServerTransaction;
use crate::transaction::{TransactionKey, TransactionKind};

/// Receives new server transactions, registered per method with the manager.
/// CANCEL, ACK and PRACK are matched to their INVITE and never come through here.
#[async_trait]
pub trait RequestInterface: Send + Sync {
    async fn request(&self, transaction: Arc<ServerTransaction>);
}

/// Progress of a client transaction.
#[async_trait]
pub trait ClientTransactionInterface: Send + Sync {
    async fn provisional_response(&self, transaction: Arc<ClientTransaction>, response: Response);

    /// A provisional sent reliably (RFC 3262); the TU is expected to PRACK it.
    async fn reliable_provisional_response(
        &self,
        transaction: Arc<ClientTransaction>,
        response: Response,
    ) {
        self.provisional_response(transaction, response).await
    }

    async fn final_response(&self, transaction: Arc<ClientTransaction>, response: Response);

    /// No final response arrived in time.
    async fn time_out(&self, transaction: Arc<ClientTransaction>);

    /// Every candidate destination failed at the transport level.
    async fn icmp_error(&self, transaction: Arc<ClientTransaction>);

    /// A forked INVITE got a final response from a further branch. `copy` is a new
    /// transaction for that branch.
    async fn multiple_final_response(
        &self,
        _original: Arc<ClientTransaction>,
        copy: Arc<ClientTransaction>,
        response: Response,
    ) {
        self.final_response(copy, response).await
    }
}

/// Events on a server transaction after it was handed to the TU.
#[async_trait]
pub trait ServerTransactionInterface: Send + Sync {
    async fn ack(&self, transaction: Arc<ServerTransaction>, ack: Request);

    async fn cancel(&self, transaction: Arc<ServerTransaction>, cancel: Request);

    /// A PRACK for one of our reliable provisionals. `prack` is its own server
    /// transaction; by default it is answered with 200.
    async fn prack(&self, _transaction: Arc<ServerTransaction>, prack: Arc<ServerTransaction>) {
        let ok = create_response(prack.request(), 200);
        if let Err(e) = prack.send_response(Some(ok)).await {
            tracing::warn!(error = %e, "failed to answer PRACK");
        }
    }

    /// The transaction ended without the expected ACK or before the TU answered.
    async fn time_out(&self, transaction: Arc<ServerTransaction>);

    /// No return path for our responses is left.
    async fn icmp_error(&self, transaction: Arc<ServerTransaction>);
}

/// Messages that matched no transaction.
#[async_trait]
pub trait StrayMessageInterface: Send + Sync {
    async fn stray_ack(&self, _ack: Request) {}

    async fn stray_cancel(&self, _cancel: Request) {}

    async fn stray_prack(&self, _prack: Request) {}

    async fn stray_response(&self, _response: Response) {}
}

/// Told whenever a transaction leaves the manager's tables.
pub trait TransactionRemovalListener: Send + Sync {
    fn transaction_removed(&self, key: &TransactionKey, kind: TransactionKind);
}
