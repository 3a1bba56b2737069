//! Connection acquisition.
//!
//! [`ConnectionManager`] resolves a request to its cached [`EndpointKey`] and
//! obtains a connection for it in one of two ways:
//!
//! - **tracked**: through the [`ConnectionPool`], with the outcome reported
//!   to a [`CompletionHandler`]. The call either waits for the pool or hands
//!   the handler to it and returns, depending on
//!   [`ConnectionManagerConfig::async_connect`].
//! - **direct**: a fresh connect outside the pool. The caller owns the
//!   connection, which is tagged do-not-cache so it never enters the pool.
//!
//! After use, [`ConnectionManager::return_connection`] offers a connection
//! back to the pool unless it carries the do-not-cache tag.
//!
//! ```rust,ignore
//! use netpool::manager::{ConnectionManager, ConnectionManagerConfig};
//! use netpool::manager::provider::IdleTimeoutTracker;
//! use netpool::urlrequest::{Request, RequestFuture};
//! use std::sync::Arc;
//!
//! let manager = ConnectionManager::new(Arc::new(IdleTimeoutTracker::new()), ConnectionManagerConfig::default());
//! let request = Request::get("http://example.com/")?;
//! let conn = manager.obtain_connection(&request, &RequestFuture::new()).await?;
//! assert!(!manager.is_connection_cacheable(&conn));
//! ```

pub mod cacheability;
pub mod config;
pub mod provider;

pub use cacheability::CacheTags;
pub use config::ConnectionManagerConfig;
pub use provider::{ConnectionProvider, IdleTimeout, IdleTimeoutResolver, IdleTimeoutTracker};

use crate::base::context::TimeoutResultExt;
use crate::base::neterror::NetError;
use crate::socket::client::Connection;
use crate::socket::completion::{CompletionBridge, CompletionHandler, ConnectPromise};
use crate::socket::connector::ConnectorFactory;
use crate::socket::endpoint::{local_address, remote_address, EndpointKey, EndpointKeyCache};
use crate::socket::pool::{ConnectionPool, EndpointPool};
use crate::socket::transport::{TcpTransport, Transport};
use crate::urlrequest::{Request, RequestFuture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct ConnectionManager {
    pool: Arc<dyn ConnectionPool>,
    /// Only a pool this manager created is closed by `destroy`.
    owns_pool: bool,
    provider: Arc<dyn ConnectionProvider>,
    endpoints: EndpointKeyCache,
    factory: ConnectorFactory,
    tags: CacheTags,
    config: ConnectionManagerConfig,
    destroyed: AtomicBool,
}

impl ConnectionManager {
    /// Manager with its own [`EndpointPool`] over a [`TcpTransport`].
    pub fn new(provider: Arc<dyn ConnectionProvider>, config: ConnectionManagerConfig) -> Self {
        Self::with_transport(Arc::new(TcpTransport::new()), provider, config)
    }

    /// Manager with its own [`EndpointPool`] over a custom transport.
    ///
    /// Inside a tokio runtime the pool sweeps idle connections every
    /// [`keep_alive_check_interval`](ConnectionManagerConfig::keep_alive_check_interval).
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        provider: Arc<dyn ConnectionProvider>,
        config: ConnectionManagerConfig,
    ) -> Self {
        let pool = Arc::new(EndpointPool::new(config.pool_limits()));
        if let Some(interval) = config.keep_alive_check_interval {
            pool.start_cleanup_task(interval);
        }
        Self::build(pool, true, transport, provider, config)
    }

    /// Manager borrowing an external pool. The pool outlives `destroy`.
    pub fn with_pool(
        pool: Arc<dyn ConnectionPool>,
        provider: Arc<dyn ConnectionProvider>,
        config: ConnectionManagerConfig,
    ) -> Self {
        Self::build(pool, false, Arc::new(TcpTransport::new()), provider, config)
    }

    fn build(
        pool: Arc<dyn ConnectionPool>,
        owns_pool: bool,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn ConnectionProvider>,
        config: ConnectionManagerConfig,
    ) -> Self {
        let factory = ConnectorFactory::new(
            transport,
            config.secure_chain.clone(),
            config.non_secure_chain.clone(),
        );
        Self {
            pool,
            owns_pool,
            provider,
            endpoints: EndpointKeyCache::new(),
            factory,
            tags: CacheTags::new(),
            config,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.config
    }

    pub fn owns_pool(&self) -> bool {
        self.owns_pool
    }

    /// The cached descriptor for `request`'s endpoint.
    pub fn endpoint_key(&self, request: &Request) -> Result<Arc<EndpointKey>, NetError> {
        self.endpoints.get(request, &self.factory)
    }

    pub fn endpoints(&self) -> &EndpointKeyCache {
        &self.endpoints
    }

    /// Handler that attaches a connected connection to `future`, reports it to
    /// the provider and forwards every outcome to `wrapped` when given.
    pub fn completion_handler(
        &self,
        request: &Request,
        future: &RequestFuture,
        wrapped: Option<Arc<dyn CompletionHandler>>,
    ) -> Arc<dyn CompletionHandler> {
        Arc::new(CompletionBridge::new(
            request.clone(),
            future.clone(),
            Arc::clone(&self.provider),
            wrapped,
        ))
    }

    /// Acquire a pooled connection and report it to `handler`.
    ///
    /// A supplied handler is used as is; build it with
    /// [`completion_handler`](Self::completion_handler) to have the connection
    /// attached to `future`. Without one, a bridge over `future` is used.
    ///
    /// Returns `Err` only for configuration errors and, when waiting on the
    /// pool, for `NetError::PreconnectMaxSocketLimit`. Every other outcome is
    /// delivered to the handler. In async mode the pool delivers capacity
    /// exhaustion to the handler as a failure like any other.
    pub async fn do_tracked_connection(
        &self,
        request: &Request,
        future: &RequestFuture,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> Result<(), NetError> {
        let key = self.endpoint_key(request)?;
        let handler = handler.unwrap_or_else(|| self.completion_handler(request, future, None));

        if self.config.async_connect {
            tracing::trace!(key = %key.key(), "handing tracked connect to pool");
            self.pool.take_with(&key, handler);
            return Ok(());
        }

        match self.pool.take(&key).await {
            Ok(connection) => {
                tracing::trace!(key = %key.key(), id = %connection.id(), "tracked connect completed");
                handler.completed(connection);
            }
            Err(e) if e.is_aborted() => handler.cancelled(),
            Err(e) if e.is_capacity_exhausted() => {
                tracing::debug!(key = %key.key(), "pool exhausted");
                return Err(e);
            }
            Err(e) => handler.failed(e),
        }
        Ok(())
    }

    /// Open a connection outside the pool. The returned connection is tagged
    /// do-not-cache; the caller owns it until it is discarded.
    pub async fn obtain_connection(
        &self,
        request: &Request,
        future: &RequestFuture,
    ) -> Result<Connection, NetError> {
        let remote = remote_address(request)?;
        let connector = self.factory.build(request);
        let bridge = self.completion_handler(request, future, None);
        let (promise, pending) = ConnectPromise::new(Some(bridge));

        connector.connect(&remote, local_address(request), promise);

        let result = match self.config.effective_connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, pending).await.or_timed_out(),
            None => pending.await,
        };

        match result {
            Ok(connection) => {
                self.tags.mark_do_not_cache(&connection);
                tracing::debug!(remote = %remote, id = %connection.id(), "direct connection obtained");
                Ok(connection)
            }
            Err(e) => {
                if e == NetError::ConnectionTimedOut {
                    tracing::debug!(remote = %remote, "direct connect timed out");
                    future.abort(NetError::ConnectionTimedOut);
                }
                Err(e)
            }
        }
    }

    pub fn is_connection_cacheable(&self, connection: &Connection) -> bool {
        self.tags.is_cacheable(connection)
    }

    /// Offer `connection` back to the pool.
    ///
    /// True only when it is cacheable and the pool accepted it; the idle
    /// timeout is then reset to [`IdleTimeout::Forever`].
    pub fn return_connection(&self, connection: &Connection) -> bool {
        if !self.tags.is_cacheable(connection) {
            tracing::trace!(id = %connection.id(), "not returning do-not-cache connection");
            return false;
        }
        if !self.pool.release(connection) {
            return false;
        }
        if let Some(resolver) = self.provider.idle_timeout_resolver() {
            resolver.set_timeout(connection, IdleTimeout::Forever);
        }
        true
    }

    /// Close `connection` and drop everything kept for it.
    pub fn discard_connection(&self, connection: &Connection) {
        self.tags.forget(connection);
        self.provider.forget_connection(connection);
        self.pool.discard(connection);
        connection.close();
    }

    /// Tear down. Closes the pool only if this manager created it.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.owns_pool {
            self.pool.close();
        }
        self.endpoints.clear();
        tracing::debug!(owns_pool = self.owns_pool, "connection manager destroyed");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("owns_pool", &self.owns_pool)
            .field("endpoints", &self.endpoints)
            .field("tags", &self.tags.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
