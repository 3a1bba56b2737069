use crate::base::context::TimeoutResultExt;
use crate::base::neterror::NetError;
use crate::socket::client::{Connection, ConnectionId};
use crate::socket::completion::{deliver, CompletionHandler, ConnectPromise};
use crate::socket::endpoint::EndpointKey;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Lends and reclaims connections per endpoint.
///
/// Implementations enforce per-host and total limits. Hitting the total limit
/// fails the take with `NetError::PreconnectMaxSocketLimit`; cancellation is
/// reported as `NetError::Aborted`.
pub trait ConnectionPool: Send + Sync {
    /// Lease a connection for `key`, reusing an idle one if possible.
    fn take(&self, key: &Arc<EndpointKey>) -> BoxFuture<'static, Result<Connection, NetError>>;

    /// Like `take`, but reports through `handler` and returns immediately.
    fn take_with(&self, key: &Arc<EndpointKey>, handler: Arc<dyn CompletionHandler>);

    /// Give a leased connection back. False if the pool did not take it.
    fn release(&self, connection: &Connection) -> bool;

    /// Forget a leased connection that will not come back.
    fn discard(&self, _connection: &Connection) {}

    fn close(&self);
}

/// Limits and timeouts for [`EndpointPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_per_host: usize,
    pub max_total: usize,
    /// Bounds both opening a connection and waiting for a per-host slot.
    pub connect_timeout: Option<Duration>,
    /// How long an idle connection may sit in the pool.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_per_host: 6,
            max_total: 256,
            connect_timeout: Some(Duration::from_secs(60)),
            idle_timeout: Some(Duration::from_secs(60)),
        }
    }
}

type Waiter = oneshot::Sender<Result<Connection, NetError>>;

/// Idle connection with the time it was returned.
struct IdleConnection {
    connection: Connection,
    since: Instant,
}

/// Per-endpoint state.
struct Group {
    endpoint: Arc<EndpointKey>,
    idle: VecDeque<IdleConnection>,
    active: usize,
    waiters: VecDeque<Waiter>,
}

impl Group {
    fn new(endpoint: Arc<EndpointKey>) -> Self {
        Self { endpoint, idle: VecDeque::new(), active: 0, waiters: VecDeque::new() }
    }

    fn pop_live_waiter(&mut self) -> Option<Waiter> {
        while let Some(waiter) = self.waiters.pop_front() {
            if !waiter.is_closed() {
                return Some(waiter);
            }
        }
        None
    }
}

enum Reservation {
    Idle(Connection),
    Connect,
    Wait(oneshot::Receiver<Result<Connection, NetError>>),
}

struct PoolInner {
    limits: PoolLimits,
    groups: DashMap<String, Group>,
    /// Leased connection -> group key.
    leased: DashMap<ConnectionId, String>,
    /// Open connections, idle and leased.
    total: AtomicUsize,
    closed: AtomicBool,
}

/// Default [`ConnectionPool`]: idle reuse per endpoint, a per-host limit that
/// queues callers, and a total limit that fails fast.
#[derive(Clone)]
pub struct EndpointPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointPool")
            .field("limits", &self.inner.limits)
            .field("total", &self.total_count())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for EndpointPool {
    fn default() -> Self {
        Self::new(PoolLimits::default())
    }
}

impl EndpointPool {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                limits,
                groups: DashMap::new(),
                leased: DashMap::new(),
                total: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.inner.limits
    }

    fn try_reserve_total(&self) -> bool {
        let max = self.inner.limits.max_total;
        self.inner.total.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1)).is_ok()
    }

    fn drop_total(&self, n: usize) {
        let _ = self.inner.total.fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| Some(t.saturating_sub(n)));
    }

    fn reserve(&self, endpoint: &Arc<EndpointKey>) -> Result<Reservation, NetError> {
        {
            let mut group = self
                .inner
                .groups
                .entry(endpoint.key().to_string())
                .or_insert_with(|| Group::new(Arc::clone(endpoint)));

            let idle_timeout = self.inner.limits.idle_timeout;
            while let Some(idle) = group.idle.pop_back() {
                let fresh = idle_timeout.map_or(true, |t| idle.since.elapsed() < t);
                if fresh && idle.connection.is_connected() {
                    group.active += 1;
                    return Ok(Reservation::Idle(idle.connection));
                }
                idle.connection.close();
                self.drop_total(1);
            }

            if group.active >= self.inner.limits.max_per_host {
                let (tx, rx) = oneshot::channel();
                group.waiters.push_back(tx);
                tracing::trace!(key = %endpoint.key(), waiting = group.waiters.len(), "per-host limit reached, queueing");
                return Ok(Reservation::Wait(rx));
            }

            if self.try_reserve_total() {
                group.active += 1;
                return Ok(Reservation::Connect);
            }
        }

        // At the total cap. Make room by closing an idle connection elsewhere.
        if self.evict_idle_except(endpoint.key()) {
            let mut group = self
                .inner
                .groups
                .entry(endpoint.key().to_string())
                .or_insert_with(|| Group::new(Arc::clone(endpoint)));
            if group.active < self.inner.limits.max_per_host && self.try_reserve_total() {
                group.active += 1;
                return Ok(Reservation::Connect);
            }
        }

        tracing::debug!(key = %endpoint.key(), max_total = self.inner.limits.max_total, "pool at capacity");
        Err(NetError::PreconnectMaxSocketLimit)
    }

    fn evict_idle_except(&self, key: &str) -> bool {
        for mut entry in self.inner.groups.iter_mut() {
            if entry.key() == key {
                continue;
            }
            if let Some(idle) = entry.value_mut().idle.pop_front() {
                idle.connection.close();
                self.drop_total(1);
                return true;
            }
        }
        false
    }

    async fn acquire(&self, endpoint: Arc<EndpointKey>) -> Result<Connection, NetError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(NetError::ConnectionAborted);
        }

        match self.reserve(&endpoint)? {
            Reservation::Idle(connection) => {
                tracing::trace!(key = %endpoint.key(), id = %connection.id(), "reusing idle connection");
                self.inner.leased.insert(connection.id(), endpoint.key().to_string());
                Ok(connection)
            }
            Reservation::Connect => self.open(endpoint).await,
            Reservation::Wait(rx) => {
                let waited = async { rx.await.unwrap_or(Err(NetError::ConnectionAborted)) };
                match self.inner.limits.connect_timeout {
                    Some(limit) => tokio::time::timeout(limit, waited).await.or_timed_out(),
                    None => waited.await,
                }
            }
        }
    }

    /// Open a connection into an already reserved slot.
    fn open(&self, endpoint: Arc<EndpointKey>) -> BoxFuture<'static, Result<Connection, NetError>> {
        let pool = self.clone();
        Box::pin(async move {
            let (promise, pending) = ConnectPromise::new(None);
            endpoint.connector().connect(endpoint.remote(), endpoint.local(), promise);

            let result = match pool.inner.limits.connect_timeout {
                Some(limit) => tokio::time::timeout(limit, pending).await.or_timed_out(),
                None => pending.await,
            };

            match result {
                Ok(connection) => {
                    tracing::debug!(key = %endpoint.key(), id = %connection.id(), "opened pooled connection");
                    pool.inner.leased.insert(connection.id(), endpoint.key().to_string());
                    Ok(connection)
                }
                Err(e) => {
                    pool.free_slot(endpoint.key());
                    Err(e)
                }
            }
        })
    }

    /// Release an active slot and hand it to the next waiter, if any.
    fn free_slot(&self, key: &str) {
        self.drop_total(1);
        let handoff = {
            let Some(mut group) = self.inner.groups.get_mut(key) else {
                return;
            };
            group.active = group.active.saturating_sub(1);
            match group.pop_live_waiter() {
                Some(waiter) if self.try_reserve_total() => {
                    group.active += 1;
                    Some((waiter, Arc::clone(&group.endpoint)))
                }
                Some(waiter) => {
                    let _ = waiter.send(Err(NetError::PreconnectMaxSocketLimit));
                    None
                }
                None => None,
            }
        };

        if let Some((waiter, endpoint)) = handoff {
            let pool = self.clone();
            tokio::spawn(async move {
                let result = pool.open(endpoint).await;
                if let Err(Ok(orphan)) = waiter.send(result) {
                    pool.release(&orphan);
                }
            });
        }
    }

    /// Evict idle connections past the idle timeout or no longer connected.
    pub fn cleanup_idle_connections(&self) {
        let now = Instant::now();
        let timeout = self.inner.limits.idle_timeout;
        let mut evicted = 0;

        for mut entry in self.inner.groups.iter_mut() {
            entry.value_mut().idle.retain(|idle| {
                let fresh = timeout.map_or(true, |t| now.duration_since(idle.since) < t);
                let keep = fresh && idle.connection.is_connected();
                if !keep {
                    idle.connection.close();
                    evicted += 1;
                }
                keep
            });
        }
        self.drop_total(evicted);

        self.inner.groups.retain(|_, g| !g.idle.is_empty() || g.active > 0 || !g.waiters.is_empty());
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle connections");
        }
    }

    /// Periodically clean up idle connections until the pool is closed or dropped.
    ///
    /// Returns false, starting nothing, outside a tokio runtime.
    pub fn start_cleanup_task(&self, interval: Duration) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no runtime, idle cleanup task not started");
            return false;
        };
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                EndpointPool { inner }.cleanup_idle_connections();
            }
        });
        true
    }

    pub fn total_count(&self) -> usize {
        self.inner.total.load(Ordering::Acquire)
    }

    pub fn leased_count(&self) -> usize {
        self.inner.leased.len()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.groups.iter().map(|g| g.idle.len()).sum()
    }

    pub fn waiting_count(&self, key: &str) -> usize {
        self.inner.groups.get(key).map_or(0, |g| g.waiters.iter().filter(|w| !w.is_closed()).count())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl ConnectionPool for EndpointPool {
    fn take(&self, key: &Arc<EndpointKey>) -> BoxFuture<'static, Result<Connection, NetError>> {
        let pool = self.clone();
        let key = Arc::clone(key);
        Box::pin(async move { pool.acquire(key).await })
    }

    fn take_with(&self, key: &Arc<EndpointKey>, handler: Arc<dyn CompletionHandler>) {
        let taking = self.take(key);
        tokio::spawn(async move {
            deliver(handler.as_ref(), taking.await);
        });
    }

    fn release(&self, connection: &Connection) -> bool {
        let Some((_, key)) = self.inner.leased.remove(&connection.id()) else {
            tracing::debug!(id = %connection.id(), "release of connection not leased from this pool");
            return false;
        };

        if self.is_closed() || !connection.is_connected() {
            connection.close();
            self.free_slot(&key);
            return false;
        }

        let Some(mut group) = self.inner.groups.get_mut(&key) else {
            connection.close();
            self.drop_total(1);
            return false;
        };

        while let Some(waiter) = group.pop_live_waiter() {
            if waiter.send(Ok(connection.clone())).is_ok() {
                self.inner.leased.insert(connection.id(), key.clone());
                tracing::trace!(key = %key, id = %connection.id(), "handed released connection to waiter");
                return true;
            }
        }

        group.active = group.active.saturating_sub(1);
        group.idle.push_back(IdleConnection { connection: connection.clone(), since: Instant::now() });
        true
    }

    fn discard(&self, connection: &Connection) {
        if let Some((_, key)) = self.inner.leased.remove(&connection.id()) {
            connection.close();
            self.free_slot(&key);
        }
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut closed = 0;
        for mut entry in self.inner.groups.iter_mut() {
            let group = entry.value_mut();
            for idle in group.idle.drain(..) {
                idle.connection.close();
                closed += 1;
            }
            for waiter in group.waiters.drain(..) {
                let _ = waiter.send(Err(NetError::ConnectionAborted));
            }
        }
        self.drop_total(closed);
        tracing::debug!(closed, "connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::connector::Connector;
    use crate::socket::endpoint::HostPortPair;
    use std::net::SocketAddr;

    struct InstantConnector;

    impl Connector for InstantConnector {
        fn connect(
            &self,
            remote: &HostPortPair,
            local: Option<SocketAddr>,
            handler: Arc<dyn CompletionHandler>,
        ) {
            handler.completed(Connection::detached(remote.clone(), local));
        }
    }

    struct RefusingConnector;

    impl Connector for RefusingConnector {
        fn connect(&self, _: &HostPortPair, _: Option<SocketAddr>, handler: Arc<dyn CompletionHandler>) {
            handler.failed(NetError::ConnectionRefused);
        }
    }

    fn endpoint(host: &str, connector: Arc<dyn Connector>) -> Arc<EndpointKey> {
        Arc::new(EndpointKey::new(
            format!("http://{}:80", host),
            HostPortPair::new(host, 80),
            None,
            connector,
        ))
    }

    fn limits(per_host: usize, total: usize) -> PoolLimits {
        PoolLimits {
            max_per_host: per_host,
            max_total: total,
            connect_timeout: Some(Duration::from_millis(200)),
            idle_timeout: Some(Duration::from_secs(60)),
        }
    }

    #[tokio::test]
    async fn test_release_then_reuse() {
        let pool = EndpointPool::new(limits(2, 4));
        let key = endpoint("a.com", Arc::new(InstantConnector));

        let first = pool.take(&key).await.unwrap();
        assert_eq!(pool.total_count(), 1);
        assert!(pool.release(&first));
        assert_eq!(pool.idle_count(), 1);

        let again = pool.take(&key).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(pool.total_count(), 1);
    }

    #[tokio::test]
    async fn test_double_release_rejected() {
        let pool = EndpointPool::new(limits(2, 4));
        let key = endpoint("a.com", Arc::new(InstantConnector));
        let conn = pool.take(&key).await.unwrap();

        assert!(pool.release(&conn));
        assert!(!pool.release(&conn));
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_foreign_connection_rejected() {
        let pool = EndpointPool::new(limits(2, 4));
        let stranger = Connection::detached(HostPortPair::new("a.com", 80), None);
        assert!(!pool.release(&stranger));
    }

    #[tokio::test]
    async fn test_total_cap_fails_fast() {
        let pool = EndpointPool::new(limits(6, 2));
        let a = endpoint("a.com", Arc::new(InstantConnector));
        let b = endpoint("b.com", Arc::new(InstantConnector));
        let c = endpoint("c.com", Arc::new(InstantConnector));

        let _a = pool.take(&a).await.unwrap();
        let _b = pool.take(&b).await.unwrap();
        assert_eq!(pool.take(&c).await, Err(NetError::PreconnectMaxSocketLimit));
    }

    #[tokio::test]
    async fn test_total_cap_evicts_idle_elsewhere() {
        let pool = EndpointPool::new(limits(6, 1));
        let a = endpoint("a.com", Arc::new(InstantConnector));
        let b = endpoint("b.com", Arc::new(InstantConnector));

        let conn = pool.take(&a).await.unwrap();
        assert!(pool.release(&conn));

        let other = pool.take(&b).await.unwrap();
        assert_eq!(other.peer().host(), "b.com");
        assert!(!conn.is_connected());
        assert_eq!(pool.total_count(), 1);
    }

    #[tokio::test]
    async fn test_per_host_limit_queues_until_release() {
        let pool = EndpointPool::new(limits(1, 4));
        let key = endpoint("a.com", Arc::new(InstantConnector));
        let held = pool.take(&key).await.unwrap();

        let waiting = tokio::spawn(pool.take(&key));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.waiting_count(key.key()), 1);

        assert!(pool.release(&held));
        assert_eq!(waiting.await.unwrap(), Ok(held));
    }

    #[tokio::test]
    async fn test_per_host_wait_times_out() {
        let pool = EndpointPool::new(limits(1, 4));
        let key = endpoint("a.com", Arc::new(InstantConnector));
        let _held = pool.take(&key).await.unwrap();

        assert_eq!(pool.take(&key).await, Err(NetError::ConnectionTimedOut));
    }

    #[tokio::test]
    async fn test_failed_connect_frees_slot() {
        let pool = EndpointPool::new(limits(1, 1));
        let key = endpoint("a.com", Arc::new(RefusingConnector));

        assert_eq!(pool.take(&key).await, Err(NetError::ConnectionRefused));
        assert_eq!(pool.total_count(), 0);
        assert_eq!(pool.take(&key).await, Err(NetError::ConnectionRefused));
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let pool = EndpointPool::new(limits(1, 1));
        let key = endpoint("a.com", Arc::new(InstantConnector));
        let conn = pool.take(&key).await.unwrap();

        pool.discard(&conn);
        assert!(!conn.is_connected());
        assert_eq!(pool.total_count(), 0);
        assert!(pool.take(&key).await.is_ok());
    }

    #[tokio::test]
    async fn test_dead_connection_not_pooled() {
        let pool = EndpointPool::new(limits(2, 2));
        let key = endpoint("a.com", Arc::new(InstantConnector));
        let conn = pool.take(&key).await.unwrap();
        conn.close();

        assert!(!pool.release(&conn));
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.total_count(), 0);
    }

    #[tokio::test]
    async fn test_take_with_delivers_to_handler() {
        let pool = EndpointPool::new(limits(1, 1));
        let key = endpoint("a.com", Arc::new(InstantConnector));
        let (promise, pending) = ConnectPromise::new(None);

        pool.take_with(&key, promise);
        let conn = pending.await.unwrap();
        assert_eq!(conn.peer().host(), "a.com");
    }

    #[tokio::test]
    async fn test_close_rejects_takes_and_closes_idle() {
        let pool = EndpointPool::new(limits(2, 2));
        let key = endpoint("a.com", Arc::new(InstantConnector));
        let idle = pool.take(&key).await.unwrap();
        let leased = pool.take(&key).await.unwrap();
        pool.release(&idle);

        pool.close();
        assert!(pool.is_closed());
        assert!(!idle.is_connected());
        assert_eq!(pool.take(&key).await, Err(NetError::ConnectionAborted));
        assert!(!pool.release(&leased));
        assert_eq!(pool.total_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_expired_idle() {
        let pool = EndpointPool::new(PoolLimits {
            idle_timeout: Some(Duration::from_millis(10)),
            ..limits(2, 2)
        });
        let key = endpoint("a.com", Arc::new(InstantConnector));
        let conn = pool.take(&key).await.unwrap();
        pool.release(&conn);

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.cleanup_idle_connections();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.total_count(), 0);
        assert!(!conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_closes_idle_without_take() {
        let pool = EndpointPool::new(PoolLimits {
            idle_timeout: Some(Duration::from_secs(10)),
            ..limits(2, 2)
        });
        assert!(pool.start_cleanup_task(Duration::from_secs(2)));
        let key = endpoint("a.com", Arc::new(InstantConnector));
        let conn = pool.take(&key).await.unwrap();
        assert!(pool.release(&conn));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.total_count(), 0);
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_cleanup_task_needs_runtime() {
        let pool = EndpointPool::new(limits(1, 1));
        assert!(!pool.start_cleanup_task(Duration::from_secs(2)));
    }
}
