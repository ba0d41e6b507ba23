//! The keyed stores of live transactions.
//!
//! | table   | key context                   | holds                                  |
//! |---------|-------------------------------|----------------------------------------|
//! | client  | `VIA` (+`TO_TAG` or `METHOD`) | client transactions and 503 handlers   |
//! | server  | `NONE`                        | server transactions                    |
//! | merged  | `VIA`                         | requests that merged with another one  |
//! | cancel  | `VIA\|METHOD`                 | CANCEL server transactions             |
//! | prack   | `VIA\|METHOD`                 | PRACK server transactions (UA mode)    |
//!
//! plus the dialog map used to match PRACK and ACK to a server INVITE. The server and merged
//! tables share a lock so that find-or-create is atomic across both.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::client::{ClientTransaction, ServiceUnavailableHandler};
use crate::connection::UnreachableDestinationTable;
use crate::error::{Error, Result};
use crate::interfaces::TransactionRemovalListener;
use crate::message::Method;
use crate::server::ServerTransaction;
use crate::transaction::{DialogId, KeyContext, TransactionKey, TransactionKind};

/// What the client table can hold under a key.
#[derive(Clone)]
pub enum ClientEntry {
    Transaction(Arc<ClientTransaction>),
    /// Stands in for a client transaction that moved to another server after a 503.
    ServiceUnavailable(Arc<ServiceUnavailableHandler>),
}

impl ClientEntry {
    pub fn serial(&self) -> u64 {
        match self {
            ClientEntry::Transaction(t) => t.serial(),
            ClientEntry::ServiceUnavailable(h) => h.serial(),
        }
    }

    pub fn transaction(&self) -> Option<&Arc<ClientTransaction>> {
        match self {
            ClientEntry::Transaction(t) => Some(t),
            ClientEntry::ServiceUnavailable(_) => None,
        }
    }
}

impl fmt::Debug for ClientEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEntry::Transaction(t) => write!(f, "Transaction({})", t.key()),
            ClientEntry::ServiceUnavailable(h) => write!(f, "ServiceUnavailable({})", h.key()),
        }
    }
}

/// Outcome of looking up an incoming request.
pub enum ServerLookup {
    /// First copy of the request; the transaction was just created.
    Created(Arc<ServerTransaction>),
    /// A retransmission of a request we already have.
    Existing(Arc<ServerTransaction>),
}

impl ServerLookup {
    pub fn transaction(&self) -> &Arc<ServerTransaction> {
        match self {
            ServerLookup::Created(t) | ServerLookup::Existing(t) => t,
        }
    }
}

#[derive(Default)]
struct ServerTables {
    server: HashMap<TransactionKey, Arc<ServerTransaction>>,
    merged: HashMap<TransactionKey, Arc<ServerTransaction>>,
}

/// Sizes of the tables and totals since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionCounts {
    pub client: usize,
    pub server: usize,
    pub merged: usize,
    pub cancel: usize,
    pub prack: usize,
    pub dialogs: usize,
    pub clients_created: usize,
    pub servers_created: usize,
}

/// All live transactions of one manager.
pub struct TransactionRegistry {
    client: Mutex<HashMap<TransactionKey, ClientEntry>>,
    server: Mutex<ServerTables>,
    cancel: Mutex<HashMap<TransactionKey, Arc<ServerTransaction>>>,
    prack: Mutex<HashMap<TransactionKey, Arc<ServerTransaction>>>,
    dialogs: Mutex<HashMap<DialogId, Arc<ServerTransaction>>>,
    unreachable: Arc<UnreachableDestinationTable>,
    removal_listener: RwLock<Option<Arc<dyn TransactionRemovalListener>>>,
    clients_created: AtomicUsize,
    servers_created: AtomicUsize,
}

impl fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("counts", &self.counts())
            .finish()
    }
}

impl TransactionRegistry {
    pub fn new(unreachable: Arc<UnreachableDestinationTable>) -> Self {
        Self {
            client: Mutex::new(HashMap::new()),
            server: Mutex::new(ServerTables::default()),
            cancel: Mutex::new(HashMap::new()),
            prack: Mutex::new(HashMap::new()),
            dialogs: Mutex::new(HashMap::new()),
            unreachable,
            removal_listener: RwLock::new(None),
            clients_created: AtomicUsize::new(0),
            servers_created: AtomicUsize::new(0),
        }
    }

    pub fn unreachable(&self) -> &Arc<UnreachableDestinationTable> {
        &self.unreachable
    }

    pub fn set_removal_listener(&self, listener: Option<Arc<dyn TransactionRemovalListener>>) {
        *self.removal_listener.write() = listener;
    }

    fn notify_removed(&self, key: &TransactionKey, kind: TransactionKind) {
        let listener = self.removal_listener.read().clone();
        if let Some(listener) = listener {
            listener.transaction_removed(key, kind);
        }
    }

    // ---- client side ----------------------------------------------------------------

    /// Adds a client entry; fails if the key is taken.
    pub fn add_client(&self, key: TransactionKey, entry: ClientEntry) -> Result<()> {
        let mut client = self.client.lock();
        if client.contains_key(&key) {
            return Err(Error::TransactionExists(key));
        }
        trace!(%key, "client transaction added");
        client.insert(key, entry);
        self.clients_created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Puts `entry` under `key`, displacing whatever was there.
    pub fn replace_client(&self, key: TransactionKey, entry: ClientEntry) {
        debug!(%key, ?entry, "client entry replaced");
        self.client.lock().insert(key, entry);
    }

    pub fn find_client(&self, key: &TransactionKey) -> Option<ClientEntry> {
        self.client.lock().get(key).cloned()
    }

    /// Removes the entry under `key` if it is still the object with `serial`.
    pub fn remove_client(&self, key: &TransactionKey, serial: u64, kind: TransactionKind) -> bool {
        let removed = {
            let mut client = self.client.lock();
            match client.get(key) {
                Some(entry) if entry.serial() == serial => client.remove(key).is_some(),
                _ => false,
            }
        };
        if removed {
            trace!(%key, "client transaction removed");
            self.notify_removed(key, kind);
        }
        removed
    }

    /// Moves a client transaction from `old` to `new` (new branch after failover). The old
    /// key is only vacated if it still maps to this transaction.
    pub fn rekey_client(&self, old: &TransactionKey, new: TransactionKey, transaction: Arc<ClientTransaction>) {
        let serial = transaction.serial();
        let mut client = self.client.lock();
        if client.get(old).is_some_and(|e| e.serial() == serial) {
            client.remove(old);
        }
        debug!(%old, %new, "client transaction re-keyed");
        client.insert(new, ClientEntry::Transaction(transaction));
    }

    /// Every live client transaction.
    pub fn client_transactions(&self) -> Vec<Arc<ClientTransaction>> {
        self.client
            .lock()
            .values()
            .filter_map(|e| e.transaction().cloned())
            .collect()
    }

    // ---- server side ----------------------------------------------------------------

    /// Finds the transaction of an incoming request, or creates it with `create`.
    ///
    /// The request is first looked up as a merged request (Via included), then without
    /// Via. A match without Via but with a different Via is a new merged request.
    /// `create` receives the key to store under and whether it is merged.
    pub fn find_or_create_server<F>(&self, via_key: &TransactionKey, create: F) -> ServerLookup
    where
        F: FnOnce(TransactionKey, bool) -> Arc<ServerTransaction>,
    {
        let mut tables = self.server.lock();
        if let Some(existing) = tables.merged.get(via_key) {
            return ServerLookup::Existing(existing.clone());
        }
        let base_key = via_key.with_context(KeyContext::NONE);
        let merged = match tables.server.get(&base_key) {
            Some(existing) if existing.key().via_equals(via_key) => {
                return ServerLookup::Existing(existing.clone());
            }
            Some(_) => true,
            None => false,
        };
        let (key, transaction) = if merged {
            let key = via_key.with_context(KeyContext::USE_VIA);
            (key.clone(), create(key, true))
        } else {
            (base_key.clone(), create(base_key, false))
        };
        if merged {
            debug!(%key, "merged request");
            tables.merged.insert(key, transaction.clone());
        } else {
            tables.server.insert(key, transaction.clone());
        }
        self.servers_created.fetch_add(1, Ordering::Relaxed);
        ServerLookup::Created(transaction)
    }

    /// Finds the server transaction a CANCEL, ACK or PRACK refers to: merged table with
    /// Via, then the server table. When `check_via` is set, the server-table match must
    /// have arrived with the same Via.
    pub fn find_server_target(&self, key: &TransactionKey, check_via: bool) -> Option<Arc<ServerTransaction>> {
        let tables = self.server.lock();
        if !tables.merged.is_empty() {
            if let Some(found) = tables.merged.get(&key.with_context(KeyContext::USE_VIA)) {
                return Some(found.clone());
            }
        }
        let found = tables.server.get(&key.with_context(KeyContext::NONE))?;
        if check_via && !found.key().via_equals(key) {
            return None;
        }
        Some(found.clone())
    }

    /// Finds or creates the transaction of an incoming CANCEL.
    pub fn find_or_create_cancel<F>(&self, key: &TransactionKey, create: F) -> ServerLookup
    where
        F: FnOnce(TransactionKey) -> Arc<ServerTransaction>,
    {
        Self::find_or_create_in(&self.cancel, key, create, &self.servers_created)
    }

    /// Finds or creates the transaction of an incoming PRACK (UA mode).
    pub fn find_or_create_prack<F>(&self, key: &TransactionKey, create: F) -> ServerLookup
    where
        F: FnOnce(TransactionKey) -> Arc<ServerTransaction>,
    {
        Self::find_or_create_in(&self.prack, key, create, &self.servers_created)
    }

    fn find_or_create_in<F>(
        table: &Mutex<HashMap<TransactionKey, Arc<ServerTransaction>>>,
        key: &TransactionKey,
        create: F,
        created: &AtomicUsize,
    ) -> ServerLookup
    where
        F: FnOnce(TransactionKey) -> Arc<ServerTransaction>,
    {
        let key = key.with_context(KeyContext::USE_VIA | KeyContext::USE_METHOD);
        let mut table = table.lock();
        if let Some(existing) = table.get(&key) {
            return ServerLookup::Existing(existing.clone());
        }
        let transaction = create(key.clone());
        table.insert(key, transaction.clone());
        created.fetch_add(1, Ordering::Relaxed);
        ServerLookup::Created(transaction)
    }

    /// Removes a server transaction from whichever table holds it.
    pub fn remove_server(&self, transaction: &ServerTransaction) -> bool {
        let key = transaction.key();
        let serial = transaction.serial();
        let same = |t: &Arc<ServerTransaction>| t.serial() == serial;
        let removed = match transaction.method() {
            Method::Cancel => remove_if(&mut self.cancel.lock(), key, same),
            Method::Prack if !transaction.is_proxy() => remove_if(&mut self.prack.lock(), key, same),
            _ if transaction.is_merged() => remove_if(&mut self.server.lock().merged, key, same),
            _ => remove_if(&mut self.server.lock().server, key, same),
        };
        if removed {
            trace!(%key, "server transaction removed");
            self.notify_removed(key, transaction.kind());
        }
        removed
    }

    /// Number of live server transactions, for throttling.
    pub fn pending_requests(&self) -> usize {
        let tables = self.server.lock();
        tables.server.len() + tables.merged.len()
    }

    // ---- dialogs ----------------------------------------------------------------------

    pub fn add_dialog(&self, dialog: DialogId, transaction: Arc<ServerTransaction>) {
        trace!(%dialog, "dialog registered");
        self.dialogs.lock().insert(dialog, transaction);
    }

    pub fn find_dialog(&self, dialog: &DialogId) -> Option<Arc<ServerTransaction>> {
        self.dialogs.lock().get(dialog).cloned()
    }

    pub fn remove_dialog(&self, dialog: &DialogId, serial: u64) {
        remove_if(&mut self.dialogs.lock(), dialog, |t| t.serial() == serial);
    }

    pub fn counts(&self) -> TransactionCounts {
        let (server, merged) = {
            let tables = self.server.lock();
            (tables.server.len(), tables.merged.len())
        };
        TransactionCounts {
            client: self.client.lock().len(),
            server,
            merged,
            cancel: self.cancel.lock().len(),
            prack: self.prack.lock().len(),
            dialogs: self.dialogs.lock().len(),
            clients_created: self.clients_created.load(Ordering::Relaxed),
            servers_created: self.servers_created.load(Ordering::Relaxed),
        }
    }
}

fn remove_if<K, V, F>(map: &mut HashMap<K, V>, key: &K, pred: F) -> bool
where
    K: std::hash::Hash + Eq,
    F: FnOnce(&V) -> bool,
{
    match map.get(key) {
        Some(value) if pred(value) => map.remove(key).is_some(),
        _ => false,
    }
}
