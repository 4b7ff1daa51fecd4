//! Relay Registry — live address ↔ connection bookkeeping
//!
//! Both directions are kept in one map pair behind one lock, so a connection
//! never maps back to more than one address and forwarding never scans.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one relay connection for the lifetime of its socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
struct RegistryInner<H> {
    /// address -> (owning connection, transport handle)
    by_address: HashMap<String, (ConnectionId, H)>,
    /// connection -> address
    by_connection: HashMap<ConnectionId, String>,
}

/// Registry of connected parties, generic over the transport handle type
#[derive(Debug)]
pub struct Registry<H> {
    inner: RwLock<RegistryInner<H>>,
    next_id: AtomicU64,
}

impl<H: Clone> Registry<H> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                by_address: HashMap::new(),
                by_connection: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Hand out a fresh connection identity
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind `address` to a connection.
    ///
    /// An address already held by another connection is taken over; the
    /// displaced connection stays open but no longer owns any address and is
    /// returned. A connection re-registering under a new address gives up
    /// its old one.
    pub fn register(&self, address: &str, id: ConnectionId, handle: H) -> Option<ConnectionId> {
        let mut inner = self.inner.write();

        if let Some(previous) = inner.by_connection.insert(id, address.to_string()) {
            if previous != address {
                inner.by_address.remove(&previous);
            }
        }

        let displaced = inner
            .by_address
            .insert(address.to_string(), (id, handle))
            .map(|(old_id, _)| old_id)
            .filter(|old_id| *old_id != id);

        if let Some(old_id) = displaced {
            inner.by_connection.remove(&old_id);
        }

        displaced
    }

    /// Drop whatever address `id` owns. Unknown connections are a no-op.
    pub fn unregister(&self, id: ConnectionId) -> Option<String> {
        let mut inner = self.inner.write();
        let address = inner.by_connection.remove(&id)?;

        // Only remove the forward entry if it still points at this connection.
        if inner
            .by_address
            .get(&address)
            .map_or(false, |(owner, _)| *owner == id)
        {
            inner.by_address.remove(&address);
        }

        Some(address)
    }

    /// Transport handle currently registered for `address`
    pub fn lookup(&self, address: &str) -> Option<H> {
        self.inner
            .read()
            .by_address
            .get(address)
            .map(|(_, handle)| handle.clone())
    }

    /// Address currently owned by a connection
    pub fn address_of(&self, id: ConnectionId) -> Option<String> {
        self.inner.read().by_connection.get(&id).cloned()
    }

    /// All registered addresses, sorted
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.inner.read().by_address.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: Clone> Default for Registry<H> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
