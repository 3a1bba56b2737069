//! Request descriptor consumed by the connection manager.

use crate::base::neterror::NetError;
use crate::socket::proxy::ProxySettings;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use url::Url;

/// Maps a URL onto the string that identifies its connection pool.
///
/// Two requests whose URLs map to the same key share pooled connections.
pub trait PoolKeyStrategy: Send + Sync {
    fn key(&self, url: &Url) -> String;
}

/// Keys by `scheme://host:port`, filling in the scheme's default port.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyStrategy;

impl PoolKeyStrategy for DefaultKeyStrategy {
    fn key(&self, url: &Url) -> String {
        let host = url.host_str().unwrap_or_default();
        match url.port_or_known_default() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        }
    }
}

/// An outbound request as seen by connection acquisition.
#[derive(Clone)]
pub struct Request {
    url: Url,
    local_address: Option<IpAddr>,
    proxy: Option<ProxySettings>,
    key_strategy: Arc<dyn PoolKeyStrategy>,
}

impl Request {
    pub fn new(url: Url) -> Self {
        Self { url, local_address: None, proxy: None, key_strategy: Arc::new(DefaultKeyStrategy) }
    }

    /// Parse `url` and build a request for it.
    pub fn get(url: &str) -> Result<Self, NetError> {
        Url::parse(url).map(Self::new).map_err(|_| NetError::InvalidUrl)
    }

    /// Bind outgoing connections to this local IP.
    pub fn with_local_address(mut self, addr: IpAddr) -> Self {
        self.local_address = Some(addr);
        self
    }

    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_key_strategy<S: PoolKeyStrategy + 'static>(mut self, strategy: S) -> Self {
        self.key_strategy = Arc::new(strategy);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address
    }

    pub fn proxy(&self) -> Option<&ProxySettings> {
        self.proxy.as_ref()
    }

    pub fn key_strategy(&self) -> &dyn PoolKeyStrategy {
        self.key_strategy.as_ref()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url.as_str())
            .field("local_address", &self.local_address)
            .field("proxy", &self.proxy.as_ref().map(|p| p.url.as_str()))
            .finish_non_exhaustive()
    }
}
