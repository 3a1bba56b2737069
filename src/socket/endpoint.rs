//! Endpoint identity and the per-manager endpoint key cache.
//!
//! An [`EndpointKey`] names a pooling target: the string key the pool groups
//! by, where to connect, which local address to bind, and the connector used
//! to open new connections for it. Keys are built once per distinct endpoint
//! and shared as `Arc`s.

use crate::base::neterror::NetError;
use crate::socket::connector::{Connector, ConnectorFactory};
use crate::urlrequest::Request;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

/// An unresolved host and port. Name resolution happens at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPortPair {
    host: String,
    port: u16,
}

impl HostPortPair {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host without IPv6 brackets, for SNI and IP literal checks.
    pub fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for HostPortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Default port for a scheme: 80 for `http`/`ws`, 443 for `https`/`wss`.
pub fn default_port(scheme: &str) -> Result<u16, NetError> {
    match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => Ok(80),
        "https" | "wss" => Ok(443),
        other => Err(NetError::UnknownUrlScheme(other.to_string())),
    }
}

/// Where a request's connection goes: the proxy when one is set, the target
/// otherwise.
///
/// An explicit port always wins. Otherwise the port is the default of the
/// request URL's scheme, for a proxy too.
pub fn remote_address(request: &Request) -> Result<HostPortPair, NetError> {
    let target = request.url();
    match request.proxy() {
        Some(proxy) => {
            let host = proxy.host().ok_or(NetError::InvalidUrl)?;
            let port = match proxy.port() {
                Some(port) => port,
                None => default_port(target.scheme())?,
            };
            Ok(HostPortPair::new(host, port))
        }
        None => {
            let host = target.host_str().ok_or(NetError::InvalidUrl)?;
            Ok(HostPortPair::new(host, explicit_or_default_port(target)?))
        }
    }
}

fn explicit_or_default_port(url: &Url) -> Result<u16, NetError> {
    url.port().map_or_else(|| default_port(url.scheme()), Ok)
}

/// The local bind address for a request, with an ephemeral port.
pub fn local_address(request: &Request) -> Option<SocketAddr> {
    request.local_address().map(|ip| SocketAddr::new(ip, 0))
}

/// The string a request pools under: derived from the proxy URL when a proxy
/// is set, from the request URL otherwise.
pub fn pool_key(request: &Request) -> String {
    let url = request.proxy().map_or(request.url(), |p| &p.url);
    request.key_strategy().key(url)
}

/// Immutable descriptor of one pooling target.
pub struct EndpointKey {
    key: String,
    remote: HostPortPair,
    local: Option<SocketAddr>,
    connector: Arc<dyn Connector>,
}

impl EndpointKey {
    pub fn new(
        key: impl Into<String>,
        remote: HostPortPair,
        local: Option<SocketAddr>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self { key: key.into(), remote, local, connector }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn remote(&self) -> &HostPortPair {
        &self.remote
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Connector template the pool opens new connections with.
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }
}

impl fmt::Debug for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointKey")
            .field("key", &self.key)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

/// Caches one [`EndpointKey`] per pool key.
///
/// Hits take a shard read lock only. A miss takes the shard's entry lock,
/// re-checks, and constructs under it, so concurrent first lookups of a key
/// build exactly one descriptor.
#[derive(Default)]
pub struct EndpointKeyCache {
    entries: DashMap<String, Arc<EndpointKey>>,
    constructed: AtomicUsize,
}

impl EndpointKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        request: &Request,
        factory: &ConnectorFactory,
    ) -> Result<Arc<EndpointKey>, NetError> {
        let key = pool_key(request);
        if let Some(found) = self.entries.get(&key) {
            return Ok(Arc::clone(found.value()));
        }

        match self.entries.entry(key) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let remote = remote_address(request)?;
                let endpoint = Arc::new(EndpointKey::new(
                    entry.key().clone(),
                    remote,
                    local_address(request),
                    factory.build(request),
                ));
                self.constructed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %endpoint.key, remote = %endpoint.remote, "endpoint key created");
                entry.insert(Arc::clone(&endpoint));
                Ok(endpoint)
            }
        }
    }

    /// Number of descriptors ever constructed (equals `len()` unless cleared).
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl fmt::Debug for EndpointKeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointKeyCache")
            .field("len", &self.entries.len())
            .field("constructed", &self.constructed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::connector::ProtocolChain;
    use crate::socket::proxy::ProxySettings;
    use crate::socket::tls::TlsConfig;
    use crate::socket::transport::TcpTransport;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Barrier;
    use std::thread;

    fn factory() -> ConnectorFactory {
        ConnectorFactory::new(
            Arc::new(TcpTransport::new()),
            ProtocolChain::secure(TlsConfig::default()),
            ProtocolChain::plain(),
        )
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(default_port("http"), Ok(80));
        assert_eq!(default_port("ws"), Ok(80));
        assert_eq!(default_port("https"), Ok(443));
        assert_eq!(default_port("WSS"), Ok(443));
        assert!(matches!(default_port("ftp"), Err(NetError::UnknownUrlScheme(s)) if s == "ftp"));
    }

    #[test]
    fn test_remote_address_direct() {
        let request = Request::get("http://example.com/index.html").unwrap();
        assert_eq!(remote_address(&request).unwrap(), HostPortPair::new("example.com", 80));

        let request = Request::get("https://example.com:8443/").unwrap();
        assert_eq!(remote_address(&request).unwrap(), HostPortPair::new("example.com", 8443));

        let request = Request::get("gopher://example.com/").unwrap();
        assert_eq!(
            remote_address(&request).unwrap_err(),
            NetError::UnknownUrlScheme(String::new())
        );
    }

    #[test]
    fn test_remote_address_through_proxy() {
        let proxy = ProxySettings::new("http://proxy.local:3128").unwrap();
        let request = Request::get("https://example.com/").unwrap().with_proxy(proxy);
        assert_eq!(remote_address(&request).unwrap(), HostPortPair::new("proxy.local", 3128));

        // No explicit port: the request scheme decides, not the proxy scheme.
        let proxy = ProxySettings::new("socks5://proxy.local").unwrap();
        let request = Request::get("https://example.com/").unwrap().with_proxy(proxy);
        assert_eq!(remote_address(&request).unwrap(), HostPortPair::new("proxy.local", 443));

        let proxy = ProxySettings::new("https://proxy.local").unwrap();
        let request = Request::get("http://example.com/").unwrap().with_proxy(proxy);
        assert_eq!(remote_address(&request).unwrap(), HostPortPair::new("proxy.local", 80));

        // Written default port is still explicit.
        let proxy = ProxySettings::new("http://proxy.local:80").unwrap();
        let request = Request::get("https://example.com/").unwrap().with_proxy(proxy);
        assert_eq!(remote_address(&request).unwrap(), HostPortPair::new("proxy.local", 80));

        let proxy = ProxySettings::new("http://proxy.local").unwrap();
        let request = Request::get("ftp://example.com/").unwrap().with_proxy(proxy);
        assert!(matches!(remote_address(&request), Err(NetError::UnknownUrlScheme(_))));
    }

    #[test]
    fn test_pool_key_prefers_proxy() {
        let proxy = ProxySettings::new("http://proxy.local:3128").unwrap();
        let direct = Request::get("https://example.com/").unwrap();
        let proxied = direct.clone().with_proxy(proxy);
        assert_eq!(pool_key(&direct), "https://example.com:443");
        assert_eq!(pool_key(&proxied), "http://proxy.local:3128");
    }

    #[test]
    fn test_same_key_same_instance() {
        let cache = EndpointKeyCache::new();
        let factory = factory();
        let a = cache.get(&Request::get("http://example.com/a").unwrap(), &factory).unwrap();
        let b = cache.get(&Request::get("http://example.com/b").unwrap(), &factory).unwrap();
        let c = cache.get(&Request::get("https://example.com/").unwrap(), &factory).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.constructed(), 2);
        assert_eq!(a.remote().port(), 80);
        assert_eq!(c.remote().port(), 443);
    }

    #[test]
    fn test_local_address_has_ephemeral_port() {
        let cache = EndpointKeyCache::new();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        let request = Request::get("http://example.com/").unwrap().with_local_address(ip);
        let key = cache.get(&request, &factory()).unwrap();
        assert_eq!(key.local(), Some(SocketAddr::new(ip, 0)));
    }

    #[test]
    fn test_unknown_scheme_is_not_cached() {
        let cache = EndpointKeyCache::new();
        let request = Request::get("ftp://example.com/file").unwrap();
        assert!(matches!(
            cache.get(&request, &factory()),
            Err(NetError::UnknownUrlScheme(_))
        ));
        assert!(cache.is_empty());
        assert_eq!(cache.constructed(), 0);
    }

    #[test]
    fn test_concurrent_first_access_constructs_once() {
        const THREADS: usize = 16;
        let cache = Arc::new(EndpointKeyCache::new());
        let factory = Arc::new(factory());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let factory = Arc::clone(&factory);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let request = Request::get(&format!("http://example.com/{}", i)).unwrap();
                    barrier.wait();
                    cache.get(&request, &factory).unwrap()
                })
            })
            .collect();

        let keys: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(keys.iter().all(|k| Arc::ptr_eq(k, &keys[0])));
        assert_eq!(cache.constructed(), 1);
    }
}
