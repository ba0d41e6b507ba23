use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::transport::Endpoint;

/// Destinations that recently failed, skipped by resolution until their entry expires.
///
/// Keys are `addr:port:transport`. Re-adding a destination restarts its expiry. Entries
/// are purged lazily on lookup.
#[derive(Debug)]
pub struct UnreachableDestinationTable {
    entries: Mutex<HashMap<String, Instant>>,
    timeout: Duration,
}

impl UnreachableDestinationTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn add(&self, endpoint: &Endpoint) {
        let key = endpoint.to_string();
        debug!(destination = %key, timeout = ?self.timeout, "marking destination unreachable");
        self.entries.lock().insert(key, Instant::now() + self.timeout);
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        let key = endpoint.to_string();
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                entries.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        self.entries.lock().remove(&endpoint.to_string()).is_some()
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expiry| *expiry > now);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
