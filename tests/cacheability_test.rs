//! Return-to-pool and teardown tests

use futures::future::BoxFuture;
use netpool::base::neterror::NetError;
use netpool::manager::provider::{ConnectionProvider, IdleTimeout, IdleTimeoutResolver};
use netpool::manager::{ConnectionManager, ConnectionManagerConfig, IdleTimeoutTracker};
use netpool::socket::client::Connection;
use netpool::socket::completion::{deliver, CompletionHandler};
use netpool::socket::endpoint::EndpointKey;
use netpool::socket::pool::ConnectionPool;
use netpool::urlrequest::{Request, RequestFuture};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Pool that hands out detached connections and accepts releases on demand.
struct ScriptedPool {
    accept_release: AtomicBool,
    releases: AtomicUsize,
    discards: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedPool {
    fn new(accept_release: bool) -> Self {
        Self {
            accept_release: AtomicBool::new(accept_release),
            releases: AtomicUsize::new(0),
            discards: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

impl ConnectionPool for ScriptedPool {
    fn take(&self, key: &Arc<EndpointKey>) -> BoxFuture<'static, Result<Connection, NetError>> {
        let conn = Connection::detached(key.remote().clone(), key.local());
        Box::pin(async move { Ok(conn) })
    }

    fn take_with(&self, key: &Arc<EndpointKey>, handler: Arc<dyn CompletionHandler>) {
        deliver(handler.as_ref(), Ok(Connection::detached(key.remote().clone(), key.local())));
    }

    fn release(&self, _connection: &Connection) -> bool {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.accept_release.load(Ordering::SeqCst)
    }

    fn discard(&self, _connection: &Connection) {
        self.discards.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Provider that records every idle-timeout decision.
#[derive(Default)]
struct RecordingProvider {
    timeouts: Mutex<Vec<IdleTimeout>>,
}

impl ConnectionProvider for RecordingProvider {
    fn touch_connection(&self, _connection: &Connection, _request: &Request) {}

    fn idle_timeout_resolver(&self) -> Option<&dyn IdleTimeoutResolver> {
        Some(self)
    }
}

impl IdleTimeoutResolver for RecordingProvider {
    fn set_timeout(&self, _connection: &Connection, timeout: IdleTimeout) {
        self.timeouts.lock().unwrap().push(timeout);
    }
}

async fn tracked(manager: &ConnectionManager) -> Connection {
    let future = RequestFuture::new();
    manager
        .do_tracked_connection(&Request::get("http://example.com/").unwrap(), &future, None)
        .await
        .unwrap();
    future.connection().unwrap()
}

#[tokio::test]
async fn test_return_untagged_accepted() {
    let pool = Arc::new(ScriptedPool::new(true));
    let provider = Arc::new(RecordingProvider::default());
    let manager = ConnectionManager::with_pool(pool.clone(), provider.clone(), ConnectionManagerConfig::default());

    let conn = tracked(&manager).await;
    assert!(manager.return_connection(&conn));
    assert_eq!(pool.releases.load(Ordering::SeqCst), 1);
    assert_eq!(*provider.timeouts.lock().unwrap(), vec![IdleTimeout::Forever]);
}

#[tokio::test]
async fn test_return_untagged_rejected_by_pool() {
    let pool = Arc::new(ScriptedPool::new(false));
    let provider = Arc::new(RecordingProvider::default());
    let manager = ConnectionManager::with_pool(pool.clone(), provider.clone(), ConnectionManagerConfig::default());

    let conn = tracked(&manager).await;
    assert!(!manager.return_connection(&conn));
    assert_eq!(pool.releases.load(Ordering::SeqCst), 1);
    assert!(provider.timeouts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_return_tagged_never_reaches_pool() {
    let pool = Arc::new(ScriptedPool::new(true));
    let provider = Arc::new(RecordingProvider::default());
    let manager = ConnectionManager::with_pool(pool.clone(), provider.clone(), ConnectionManagerConfig::default());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    let conn = manager.obtain_connection(&Request::get(&url).unwrap(), &RequestFuture::new()).await.unwrap();

    assert!(!manager.is_connection_cacheable(&conn));
    assert!(!manager.return_connection(&conn));
    assert!(!manager.return_connection(&conn));
    assert_eq!(pool.releases.load(Ordering::SeqCst), 0);
    assert!(provider.timeouts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_return_without_resolver() {
    struct Silent;
    impl ConnectionProvider for Silent {
        fn touch_connection(&self, _: &Connection, _: &Request) {}
        fn idle_timeout_resolver(&self) -> Option<&dyn IdleTimeoutResolver> {
            None
        }
    }

    let pool = Arc::new(ScriptedPool::new(true));
    let manager = ConnectionManager::with_pool(pool, Arc::new(Silent), ConnectionManagerConfig::default());
    let conn = tracked(&manager).await;
    assert!(manager.return_connection(&conn));
}

#[tokio::test]
async fn test_discard_clears_tag_and_notifies_pool() {
    let pool = Arc::new(ScriptedPool::new(true));
    let manager = ConnectionManager::with_pool(
        pool.clone(),
        Arc::new(IdleTimeoutTracker::new()),
        ConnectionManagerConfig::default(),
    );
    let conn = tracked(&manager).await;

    manager.discard_connection(&conn);
    assert!(!conn.is_connected());
    assert_eq!(pool.discards.load(Ordering::SeqCst), 1);
    assert!(manager.is_connection_cacheable(&conn));
}

#[tokio::test]
async fn test_return_to_owned_pool_resets_idle_timeout() {
    let tracker = Arc::new(IdleTimeoutTracker::new().with_request_idle_timeout(std::time::Duration::from_secs(5)));
    let manager = ConnectionManager::with_transport(
        Arc::new(netpool::socket::transport::TcpTransport::new()),
        tracker.clone(),
        ConnectionManagerConfig::default(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    let future = RequestFuture::new();
    manager.do_tracked_connection(&Request::get(&url).unwrap(), &future, None).await.unwrap();
    let conn = future.connection().unwrap();
    let (_server, _) = listener.accept().await.unwrap();

    assert_eq!(tracker.timeout_for(&conn), Some(IdleTimeout::After(std::time::Duration::from_secs(5))));
    assert!(manager.return_connection(&conn));
    assert_eq!(tracker.timeout_for(&conn), Some(IdleTimeout::Forever));
    // A second return is a double free.
    assert!(!manager.return_connection(&conn));
}

#[tokio::test]
async fn test_destroy_leaves_external_pool_open() {
    let pool = Arc::new(ScriptedPool::new(true));
    let manager = ConnectionManager::with_pool(
        pool.clone(),
        Arc::new(IdleTimeoutTracker::new()),
        ConnectionManagerConfig::default(),
    );
    let _ = tracked(&manager).await;

    manager.destroy();
    assert!(!manager.owns_pool());
    assert!(!pool.closed.load(Ordering::SeqCst));
    assert!(manager.endpoints().is_empty());
}

#[tokio::test]
async fn test_destroy_closes_owned_pool() {
    let manager = ConnectionManager::new(Arc::new(IdleTimeoutTracker::new()), ConnectionManagerConfig::default());
    assert!(manager.owns_pool());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    let request = Request::get(&url).unwrap();

    manager.destroy();
    manager.destroy();

    let events = Arc::new(Recorder::default());
    manager.do_tracked_connection(&request, &RequestFuture::new(), Some(events.clone())).await.unwrap();
    assert_eq!(*events.failures.lock().unwrap(), vec![NetError::ConnectionAborted]);
}

#[derive(Default)]
struct Recorder {
    failures: Mutex<Vec<NetError>>,
}

impl CompletionHandler for Recorder {
    fn completed(&self, _connection: Connection) {}

    fn failed(&self, error: NetError) {
        self.failures.lock().unwrap().push(error);
    }

    fn cancelled(&self) {}
}
