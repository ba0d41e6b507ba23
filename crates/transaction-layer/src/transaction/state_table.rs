//! Table-driven state machine engine shared by every transaction flavor.
//!
//! A [`TransitionTable`] maps `(state, input)` to a next state, using
//! [`TransactionState::Undefined`] for illegal pairs. A [`StateTable`] is the per-transaction
//! cursor over one of those tables. Switching yields a [`Transition`], the composite of the
//! previous state and the input, which handlers match on to tell apart the different ways
//! of arriving in the same next state.

use std::collections::HashMap;
use std::fmt;

use tracing::trace;

use super::state::TransactionState;
use crate::error::{Error, Result};

/// An input alphabet for a transition table.
pub trait MachineInput: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Number of inputs; the width of every table row.
    const COUNT: usize;

    /// Column of this input in a table row.
    fn index(self) -> usize;
}

macro_rules! machine_input {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
        }

        impl MachineInput for $name {
            const COUNT: usize = $name::ALL.len();

            fn index(self) -> usize {
                self as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(match self {
                    $($name::$variant => $text),+
                })
            }
        }
    };
}

machine_input! {
    /// Inputs of the client transaction tables.
    pub enum ClientInput {
        Start => "START",
        T1 => "T1",
        T1Expired => "T1_EXPIRED",
        Timeout => "TIMEOUT",
        Tn => "Tn",
        Cancel => "CANCEL",
        CancelTimer => "CANCEL_TIMER",
        Ack => "ACK",
        Provisional => "PROVISIONAL",
        Success => "2XX",
        Failure => "3TO6XX",
        ServiceUnavailable => "SERVICE_UNAVAILABLE",
        NextServer => "NEXT_SERVER",
        NoServer => "NO_SERVER",
        IoException => "IO_EXCEPTION",
        OtherException => "OTHER_EXCEPTION",
        ReliableProvisional => "REL_PROVISIONAL",
        Prack => "PRACK",
    }
}

machine_input! {
    /// Inputs of the server transaction tables.
    pub enum ServerInput {
        Start => "START",
        Request => "REQUEST",
        Provisional => "PROVISIONAL",
        TProvisional => "TPROVISIONAL",
        Success => "2XX",
        Failure => "3TO6XX",
        Cancel => "CANCEL",
        Timeout => "TIMEOUT",
        T1 => "T1",
        T1Expired => "T1_EXPIRED",
        Tn => "Tn",
        Ack => "ACK",
        IoException => "IO_EXCEPTION",
        OtherException => "OTHER_EXCEPTION",
        NextClient => "NEXT_CLIENT",
        NoClient => "NO_CLIENT",
        ReliableProvisional => "REL_PROVISIONAL",
        Prack => "PRACK",
    }
}

/// Immutable `[state][input] -> state` table shared by every transaction of one flavor.
pub struct TransitionTable<I: MachineInput> {
    name: &'static str,
    rows: HashMap<TransactionState, Vec<TransactionState>>,
    _input: std::marker::PhantomData<I>,
}

impl<I: MachineInput> TransitionTable<I> {
    pub fn builder(name: &'static str) -> TransitionTableBuilder<I> {
        TransitionTableBuilder {
            table: TransitionTable {
                name,
                rows: HashMap::new(),
                _input: std::marker::PhantomData,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Next state for `(state, input)`; `Undefined` when the pair is illegal. States without
    /// a row never transition.
    pub fn next(&self, state: TransactionState, input: I) -> TransactionState {
        self.rows
            .get(&state)
            .and_then(|row| row.get(input.index()))
            .copied()
            .unwrap_or(TransactionState::Undefined)
    }

    /// States that have a row in this table.
    pub fn states(&self) -> impl Iterator<Item = TransactionState> + '_ {
        self.rows.keys().copied()
    }
}

impl<I: MachineInput> fmt::Debug for TransitionTable<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionTable")
            .field("name", &self.name)
            .field("states", &self.rows.len())
            .finish()
    }
}

pub struct TransitionTableBuilder<I: MachineInput> {
    table: TransitionTable<I>,
}

impl<I: MachineInput> TransitionTableBuilder<I> {
    /// Adds the row for `state`; inputs not listed stay `Undefined`.
    pub fn row(mut self, state: TransactionState, transitions: &[(I, TransactionState)]) -> Self {
        let mut row = vec![TransactionState::Undefined; I::COUNT];
        for (input, next) in transitions {
            row[input.index()] = *next;
        }
        self.table.rows.insert(state, row);
        self
    }

    pub fn build(self) -> TransitionTable<I> {
        self.table
    }
}

/// The composite `previousState | input` produced by a successful switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<I> {
    pub from: TransactionState,
    pub input: I,
    pub to: TransactionState,
}

/// Current-state cursor over a (swappable) transition table.
#[derive(Debug)]
pub struct StateTable<I: MachineInput> {
    table: &'static TransitionTable<I>,
    current: TransactionState,
}

impl<I: MachineInput> StateTable<I> {
    pub fn new(table: &'static TransitionTable<I>) -> Self {
        Self {
            table,
            current: TransactionState::Initial,
        }
    }

    pub fn current(&self) -> TransactionState {
        self.current
    }

    pub fn table_name(&self) -> &'static str {
        self.table.name()
    }

    pub fn is_started(&self) -> bool {
        self.current != TransactionState::Initial
    }

    /// Moves onto another table with the cursor at `state`, as done when an INVITE
    /// transaction enters its post-2xx sub-machine.
    pub fn switch_table(&mut self, table: &'static TransitionTable<I>, state: TransactionState) {
        trace!(from = self.table.name(), to = table.name(), state = %state, "switching state table");
        self.table = table;
        self.current = state;
    }

    /// Applies `input`. An undefined entry leaves the cursor untouched and yields
    /// [`Error::StateMachine`].
    pub fn switch_state(&mut self, input: I) -> Result<Transition<I>> {
        let from = self.current;
        let to = self.table.next(from, input);
        if to == TransactionState::Undefined {
            trace!("STATECHANGE {} {} {} {}", self.table.name(), from, input, from);
            return Err(Error::StateMachine {
                table: self.table.name(),
                state: from.to_string(),
                input: input.to_string(),
            });
        }
        trace!("STATECHANGE {} {} {} {}", self.table.name(), from, input, to);
        self.current = to;
        Ok(Transition { from, input, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::transitions::{CLIENT_INVITE, CLIENT_NON_INVITE};

    #[test]
    fn input_alphabets() {
        assert_eq!(ClientInput::COUNT, 18);
        assert_eq!(ServerInput::COUNT, 18);
        assert_eq!(ClientInput::Prack.index(), 17);
        assert_eq!(ServerInput::ALL.len(), ServerInput::COUNT);
        assert_eq!(ClientInput::Failure.to_string(), "3TO6XX");
    }

    #[test]
    fn undefined_transition_does_not_move_cursor() {
        let mut table = StateTable::new(&CLIENT_INVITE);
        let err = table.switch_state(ClientInput::Ack).unwrap_err();
        assert_eq!(
            err.to_string(),
            "State Table:Client INVITE, Current State: INITIAL, Input: ACK"
        );
        assert_eq!(table.current(), TransactionState::Initial);
        assert!(!table.is_started());
    }

    #[test]
    fn transition_carries_previous_state() {
        let mut table = StateTable::new(&CLIENT_NON_INVITE);
        let t = table.switch_state(ClientInput::Start).unwrap();
        assert_eq!(t.from, TransactionState::Initial);
        assert_eq!(t.to, TransactionState::Calling);
        let t = table.switch_state(ClientInput::Provisional).unwrap();
        assert_eq!((t.from, t.input), (TransactionState::Calling, ClientInput::Provisional));
        assert!(table.is_started());
    }

    #[test]
    fn terminated_accepts_only_cancel() {
        let mut table = StateTable::new(&CLIENT_NON_INVITE);
        table.switch_state(ClientInput::Start).unwrap();
        table.switch_state(ClientInput::NoServer).unwrap();
        assert_eq!(table.current(), TransactionState::Terminated);
        for input in ClientInput::ALL.iter().filter(|i| **i != ClientInput::Cancel) {
            assert!(table.switch_state(*input).is_err());
        }
        let t = table.switch_state(ClientInput::Cancel).unwrap();
        assert_eq!((t.from, t.to), (TransactionState::Terminated, TransactionState::Terminated));
    }
}
