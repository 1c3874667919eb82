//! Connection identity and the registry of live connections.
//!
//! `ConnectionRegistry` stores non-owning weak references to connection state
//! so that introspection never keeps a torn-down connection alive. The owning
//! connection task removes its entry during teardown; entries whose
//! connection vanished without that (a panic, for instance) are pruned
//! lazily.
use std::sync::{
    Arc,
    Weak,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use serde::Serialize;

use crate::connection::{ConnectionShared, ConnectionSnapshot};

/// Identifier assigned to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    /// Create a new [`ConnectionId`] with the provided value.
    #[must_use]
    pub const fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// Source of unique connection ids.
///
/// Handed to the server at construction; tests can start from a known value.
#[derive(Debug)]
pub struct ConnectionIdGenerator(AtomicU64);

impl ConnectionIdGenerator {
    #[must_use]
    pub fn starting_at(first: u64) -> Self { Self(AtomicU64::new(first)) }

    /// Allocate the next id.
    pub fn next_id(&self) -> ConnectionId { ConnectionId(self.0.fetch_add(1, Ordering::Relaxed)) }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self { Self::starting_at(1) }
}

/// Concurrent registry of live connections keyed by [`ConnectionId`].
#[derive(Default)]
pub struct ConnectionRegistry(DashMap<ConnectionId, Weak<ConnectionShared>>);

impl ConnectionRegistry {
    pub(crate) fn insert(&self, id: ConnectionId, connection: &Arc<ConnectionShared>) {
        self.0.insert(id, Arc::downgrade(connection));
    }

    /// Remove a connection, typically on teardown.
    pub fn remove(&self, id: &ConnectionId) { self.0.remove(id); }

    /// Whether `id` names a connection that is still alive.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool { self.snapshot(id).is_some() }

    /// Describe the connection, if it is still alive.
    #[must_use]
    pub fn snapshot(&self, id: &ConnectionId) -> Option<ConnectionSnapshot> {
        let guard = self.0.get(id);
        let connection = guard.as_ref().and_then(|weak| weak.upgrade());
        drop(guard);
        if connection.is_none() {
            self.0.remove_if(id, |_, weak| weak.strong_count() == 0);
        }
        connection.map(|c| c.snapshot())
    }

    /// Remove all stale weak references.
    pub fn prune(&self) { self.0.retain(|_, weak| weak.strong_count() > 0); }

    /// Prune stale weak references, then return the IDs of the live connections.
    #[must_use]
    pub fn active_ids(&self) -> Vec<ConnectionId> {
        let mut ids = Vec::with_capacity(self.0.len());
        self.0.retain(|id, weak| {
            if weak.strong_count() > 0 {
                ids.push(*id);
                true
            } else {
                false
            }
        });
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize { self.active_ids().len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
