//! Do-not-cache side-table.
//!
//! Connections obtained outside the pool are tagged here so they are never
//! offered back to it. Tags are keyed by [`ConnectionId`]. A tag is removed
//! when the connection is discarded, or swept on a later mark once every
//! handle to the connection has been dropped.

use crate::manager::provider::Sweep;
use crate::socket::client::{Connection, ConnectionId, WeakConnection};
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct CacheTags {
    do_not_cache: DashMap<ConnectionId, WeakConnection>,
    sweep: Sweep,
}

impl CacheTags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn mark_do_not_cache(&self, connection: &Connection) {
        if self.do_not_cache.insert(connection.id(), connection.downgrade()).is_none() {
            tracing::trace!(id = %connection.id(), "tagged do-not-cache");
            self.sweep.after_insert(&self.do_not_cache, |handle| handle);
        }
    }

    pub fn is_cacheable(&self, connection: &Connection) -> bool {
        !self.do_not_cache.contains_key(&connection.id())
    }

    pub fn forget(&self, connection: &Connection) {
        self.do_not_cache.remove(&connection.id());
    }

    pub fn len(&self) -> usize {
        self.do_not_cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.do_not_cache.is_empty()
    }
}
