//! Bookkeeping hooks the manager reports connection lifecycle events to.

use crate::socket::client::{Connection, ConnectionId, WeakConnection};
use crate::urlrequest::Request;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Side tables are not swept below this many entries.
pub(crate) const SWEEP_FLOOR: usize = 64;

/// Amortized removal of side-table entries whose connection was dropped.
///
/// A sweep runs once the table outgrows twice the size it had after the
/// previous sweep.
#[derive(Debug)]
pub(crate) struct Sweep {
    next_at: AtomicUsize,
}

impl Default for Sweep {
    fn default() -> Self {
        Self { next_at: AtomicUsize::new(SWEEP_FLOOR) }
    }
}

impl Sweep {
    pub(crate) fn after_insert<V>(&self, map: &DashMap<ConnectionId, V>, handle: impl Fn(&V) -> &WeakConnection) {
        if map.len() <= self.next_at.load(Ordering::Relaxed) {
            return;
        }
        let before = map.len();
        map.retain(|_, v| handle(&*v).is_live());
        let after = map.len();
        self.next_at.store(SWEEP_FLOOR.max(after * 2), Ordering::Relaxed);
        tracing::trace!(before, after, "swept dropped connections");
    }
}

/// How long a connection may sit unused before it is considered stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTimeout {
    /// Managed by the pool; never expires on its own.
    Forever,
    After(Duration),
}

/// Receives idle-timeout decisions for individual connections.
pub trait IdleTimeoutResolver: Send + Sync {
    fn set_timeout(&self, connection: &Connection, timeout: IdleTimeout);
}

/// Told about every connection handed to a request.
pub trait ConnectionProvider: Send + Sync {
    /// A connection was just attached to `request`.
    fn touch_connection(&self, connection: &Connection, request: &Request);

    fn idle_timeout_resolver(&self) -> Option<&dyn IdleTimeoutResolver>;

    /// `connection` was discarded; drop anything kept for it.
    fn forget_connection(&self, _connection: &Connection) {}
}

#[derive(Debug, Clone)]
struct IdleEntry {
    handle: WeakConnection,
    timeout: IdleTimeout,
    touched_at: Instant,
}

impl IdleEntry {
    fn new(connection: &Connection, timeout: IdleTimeout) -> Self {
        Self { handle: connection.downgrade(), timeout, touched_at: Instant::now() }
    }
}

/// Default provider: remembers when each connection was last attached and
/// which idle timeout applies to it.
///
/// Touched connections get the request idle timeout, if one is configured.
/// Connections returned to the pool are switched to [`IdleTimeout::Forever`].
/// Entries go away when the connection is discarded, or on a later insert
/// once every handle to the connection has been dropped.
#[derive(Debug, Default)]
pub struct IdleTimeoutTracker {
    entries: DashMap<ConnectionId, IdleEntry>,
    request_idle_timeout: Option<Duration>,
    touches: AtomicUsize,
    sweep: Sweep,
}

impl IdleTimeoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections attached to a request expire after `timeout` of inactivity.
    pub fn with_request_idle_timeout(mut self, timeout: Duration) -> Self {
        self.request_idle_timeout = Some(timeout);
        self
    }

    pub fn timeout_for(&self, connection: &Connection) -> Option<IdleTimeout> {
        self.entries.get(&connection.id()).map(|e| e.timeout)
    }

    /// True once an `After` timeout has run out since the last touch.
    pub fn is_expired(&self, connection: &Connection) -> bool {
        self.entries.get(&connection.id()).is_some_and(|e| match e.timeout {
            IdleTimeout::Forever => false,
            IdleTimeout::After(limit) => e.touched_at.elapsed() >= limit,
        })
    }

    pub fn forget(&self, connection: &Connection) {
        self.entries.remove(&connection.id());
    }

    /// Total `touch_connection` calls seen.
    pub fn touch_count(&self) -> usize {
        self.touches.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ConnectionProvider for IdleTimeoutTracker {
    fn touch_connection(&self, connection: &Connection, request: &Request) {
        self.touches.fetch_add(1, Ordering::Relaxed);
        let timeout = self.request_idle_timeout.map_or(IdleTimeout::Forever, IdleTimeout::After);
        self.entries.insert(connection.id(), IdleEntry::new(connection, timeout));
        self.sweep.after_insert(&self.entries, |e| &e.handle);
        tracing::trace!(id = %connection.id(), url = %request.url(), "connection attached to request");
    }

    fn idle_timeout_resolver(&self) -> Option<&dyn IdleTimeoutResolver> {
        Some(self)
    }

    fn forget_connection(&self, connection: &Connection) {
        self.forget(connection);
    }
}

impl IdleTimeoutResolver for IdleTimeoutTracker {
    fn set_timeout(&self, connection: &Connection, timeout: IdleTimeout) {
        self.entries
            .entry(connection.id())
            .and_modify(|e| e.timeout = timeout)
            .or_insert_with(|| IdleEntry::new(connection, timeout));
        self.sweep.after_insert(&self.entries, |e| &e.handle);
    }
}
