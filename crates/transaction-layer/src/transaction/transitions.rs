//! The six transition tables.
//!
//! Pairs that are not listed are `Undefined`. `OTHER_EXCEPTION` is legal in every
//! non-terminal state and leads to TERMINATED (XTERMINATED on the post-2xx tables), so a
//! failure re-injected as an input always ends in a terminal state. The only input a
//! terminated client transaction still takes is CANCEL, which leaves it where it is.

use lazy_static::lazy_static;

use super::state::TransactionState::{self, *};
use super::state_table::{ClientInput, ServerInput, TransitionTable};

lazy_static! {
    /// Client non-INVITE.
    pub static ref CLIENT_NON_INVITE: TransitionTable<ClientInput> = {
        use ClientInput::*;
        TransitionTable::builder("Client non-INVITE")
            .row(Initial, &[
                (Start, Calling),
                (T1Expired, Terminated),
                (Tn, Terminated),
                (OtherException, Terminated),
            ])
            .row(Calling, &[
                (T1, Calling),
                (T1Expired, Terminated),
                (Tn, Terminated),
                (Cancel, Calling),
                (CancelTimer, Terminated),
                (Provisional, Proceeding),
                (Success, Completed),
                (Failure, Completed),
                (ServiceUnavailable, Calling),
                (NextServer, Initial),
                (NoServer, Terminated),
                (IoException, Calling),
                (OtherException, Terminated),
            ])
            .row(Proceeding, &[
                (T1, Proceeding),
                (T1Expired, Terminated),
                (Tn, Terminated),
                (Cancel, Proceeding),
                (CancelTimer, Terminated),
                (Provisional, Proceeding),
                (Success, Completed),
                (Failure, Completed),
                (ServiceUnavailable, Calling),
                (OtherException, Terminated),
            ])
            .row(Completed, &[
                (T1, Completed),
                (Timeout, Terminated),
                (Tn, Terminated),
                (CancelTimer, Completed),
                (Provisional, Completed),
                (Success, Completed),
                (Failure, Completed),
                (ServiceUnavailable, Completed),
                (OtherException, Terminated),
            ])
            .row(Terminated, &[(Cancel, Terminated)])
            .build()
    };

    /// Client INVITE.
    pub static ref CLIENT_INVITE: TransitionTable<ClientInput> = {
        use ClientInput::*;
        TransitionTable::builder("Client INVITE")
            .row(Initial, &[
                (Start, Calling),
                (T1Expired, Terminated),
                (Tn, Terminated),
                (OtherException, Terminated),
            ])
            .row(Calling, &[
                (T1, Calling),
                (T1Expired, Terminated),
                (Tn, Terminated),
                (Cancel, Calling),
                (CancelTimer, Terminated),
                (Provisional, Proceeding),
                (Success, Terminated),
                (Failure, Completed),
                (ServiceUnavailable, Calling),
                (NextServer, Initial),
                (NoServer, Terminated),
                (IoException, Calling),
                (OtherException, Terminated),
                (ReliableProvisional, ReliableProceeding),
            ])
            .row(Proceeding, &[
                (T1, Proceeding),
                (T1Expired, Terminated),
                (Tn, Terminated),
                (Cancel, Proceeding),
                (CancelTimer, Terminated),
                (Provisional, Proceeding),
                (Success, Terminated),
                (Failure, Completed),
                (ServiceUnavailable, Calling),
                (OtherException, Terminated),
                (ReliableProvisional, ReliableProceeding),
            ])
            .row(ReliableProceeding, &[
                (T1, ReliableProceeding),
                (T1Expired, Terminated),
                (Tn, Terminated),
                (Cancel, ReliableProceeding),
                (CancelTimer, Terminated),
                (Success, Terminated),
                (Failure, Completed),
                (ServiceUnavailable, Calling),
                (OtherException, Terminated),
                (ReliableProvisional, ReliableProceeding),
                (Prack, ReliableProceeding),
            ])
            .row(Completed, &[
                (T1, Completed),
                (Timeout, Terminated),
                (Tn, Terminated),
                (Cancel, Completed),
                (CancelTimer, Completed),
                (Ack, Completed),
                (Provisional, Completed),
                (Success, Terminated),
                (Failure, Completed),
                (ServiceUnavailable, Completed),
                (IoException, Terminated),
                (OtherException, Terminated),
            ])
            .row(Terminated, &[(Cancel, Terminated)])
            .build()
    };

    /// Client INVITE after the first 2xx.
    pub static ref CLIENT_INVITE_X: TransitionTable<ClientInput> = {
        use ClientInput::*;
        TransitionTable::builder("XClient INVITE")
            .row(XInitial, &[
                (Start, XCompleted),
                (OtherException, XTerminated),
            ])
            .row(XCompleted, &[
                (T1, XCompleted),
                (Timeout, XTerminated),
                (Tn, XTerminated),
                (Cancel, XCompleted),
                (CancelTimer, XCompleted),
                (Ack, XCompleted),
                (Provisional, XCompleted),
                (Success, XCompleted),
                (IoException, XTerminated),
                (OtherException, XTerminated),
            ])
            .build()
    };

    /// Server non-INVITE.
    pub static ref SERVER_NON_INVITE: TransitionTable<ServerInput> = {
        use ServerInput::*;
        TransitionTable::builder("Server non-INVITE")
            .row(Initial, &[
                (Start, Calling),
                (Provisional, Proceeding),
                (TProvisional, Proceeding),
                (Success, Completed),
                (Failure, Completed),
                (Cancel, Calling),
                (Tn, Terminated),
                (OtherException, Terminated),
            ])
            .row(Calling, &[
                (Request, Calling),
                (Provisional, Proceeding),
                (TProvisional, Proceeding),
                (Success, Completed),
                (Failure, Completed),
                (Cancel, Calling),
                (Tn, Terminated),
                (OtherException, Terminated),
            ])
            .row(Proceeding, &[
                (Request, Proceeding),
                (Provisional, Proceeding),
                (TProvisional, Proceeding),
                (Success, Completed),
                (Failure, Completed),
                (Cancel, Proceeding),
                (Tn, Terminated),
                (IoException, Proceeding),
                (NextClient, Proceeding),
                (NoClient, Terminated),
                (OtherException, Terminated),
            ])
            .row(Completed, &[
                (Request, Completed),
                (Success, Completed),
                (Failure, Completed),
                (Cancel, Completed),
                (Timeout, Terminated),
                (Tn, Terminated),
                (IoException, Completed),
                (NextClient, Completed),
                (NoClient, Terminated),
                (OtherException, Terminated),
            ])
            .build()
    };

    /// Server INVITE.
    pub static ref SERVER_INVITE: TransitionTable<ServerInput> = {
        use ServerInput::*;
        TransitionTable::builder("Server INVITE")
            .row(Initial, &[
                (Start, Calling),
                (Provisional, Proceeding),
                (TProvisional, Proceeding),
                (Success, Terminated),
                (Failure, Completed),
                (Cancel, Calling),
                (T1, Initial),
                (Tn, Terminated),
                (ReliableProvisional, WaitPrack),
                (OtherException, Terminated),
            ])
            .row(Calling, &[
                (Request, Calling),
                (Provisional, Proceeding),
                (TProvisional, Proceeding),
                (Success, Terminated),
                (Failure, Completed),
                (Cancel, Calling),
                (T1, Calling),
                (T1Expired, Terminated),
                (Tn, Terminated),
                (ReliableProvisional, WaitPrack),
                (OtherException, Terminated),
            ])
            .row(Proceeding, &[
                (Request, Proceeding),
                (Provisional, Proceeding),
                (TProvisional, Proceeding),
                (Success, Terminated),
                (Failure, Completed),
                (Cancel, Proceeding),
                (T1, Proceeding),
                (T1Expired, Terminated),
                (Tn, Terminated),
                (IoException, Proceeding),
                (NextClient, Proceeding),
                (NoClient, Terminated),
                (ReliableProvisional, WaitPrack),
                (OtherException, Terminated),
            ])
            .row(WaitPrack, &[
                (Success, Terminated),
                (Failure, Completed),
                (Cancel, WaitPrack),
                (T1, WaitPrack),
                (T1Expired, Terminated),
                (Tn, Terminated),
                (IoException, WaitPrack),
                (Prack, ReliableProceeding),
                (OtherException, Terminated),
            ])
            .row(ReliableProceeding, &[
                (Success, Terminated),
                (Failure, Completed),
                (Cancel, ReliableProceeding),
                (T1, ReliableProceeding),
                (T1Expired, Terminated),
                (Tn, Terminated),
                (IoException, ReliableProceeding),
                (NextClient, ReliableProceeding),
                (NoClient, Terminated),
                (ReliableProvisional, WaitPrack),
                (Prack, ReliableProceeding),
                (OtherException, Terminated),
            ])
            .row(Completed, &[
                (Request, Completed),
                (Failure, Completed),
                (Cancel, Completed),
                (T1, Completed),
                (T1Expired, Terminated),
                (Tn, Terminated),
                (Ack, Confirmed),
                (IoException, Completed),
                (NextClient, Completed),
                (NoClient, Terminated),
                (OtherException, Terminated),
            ])
            .row(Confirmed, &[
                (Request, Confirmed),
                (Cancel, Confirmed),
                (Timeout, Terminated),
                (T1, Confirmed),
                (Tn, Terminated),
                (Ack, Confirmed),
                (IoException, Confirmed),
                (OtherException, Terminated),
            ])
            .build()
    };

    /// Server INVITE after the first 2xx was sent.
    pub static ref SERVER_INVITE_X: TransitionTable<ServerInput> = {
        use ServerInput::*;
        TransitionTable::builder("XServer INVITE")
            .row(XInitial, &[
                (Start, XCompleted),
                (OtherException, XTerminated),
            ])
            .row(XCompleted, &[
                (Request, XCompleted),
                (Cancel, XCompleted),
                (T1, XCompleted),
                (T1Expired, XTerminated),
                (Tn, XTerminated),
                (Ack, XConfirmed),
                (IoException, XTerminated),
                (NextClient, XCompleted),
                (NoClient, XTerminated),
                (Prack, XCompleted),
                (OtherException, XTerminated),
            ])
            .row(XConfirmed, &[
                (Request, XConfirmed),
                (Cancel, XConfirmed),
                (Timeout, XTerminated),
                (T1, XConfirmed),
                (Tn, XTerminated),
                (Ack, XConfirmed),
                (IoException, XConfirmed),
                (Prack, XConfirmed),
                (OtherException, XTerminated),
            ])
            .build()
    };
}

/// The table a fresh transaction of the given flavor starts on.
pub fn initial_client_table(invite: bool) -> &'static TransitionTable<ClientInput> {
    if invite { &CLIENT_INVITE } else { &CLIENT_NON_INVITE }
}

pub fn initial_server_table(invite: bool) -> &'static TransitionTable<ServerInput> {
    if invite { &SERVER_INVITE } else { &SERVER_NON_INVITE }
}

/// States that make up the rows of each table, for exhaustive checks.
pub fn client_states(table: &TransitionTable<ClientInput>) -> Vec<TransactionState> {
    let mut states: Vec<_> = table.states().collect();
    states.sort_by_key(|s| s.as_str());
    states
}
