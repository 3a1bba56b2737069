//! Connectors: one connect attempt's worth of configuration.
//!
//! [`ConnectorFactory`] binds the shared [`Transport`] to the secure and
//! non-secure [`ProtocolChain`] templates and to a request's target URL and
//! proxy. It keeps no state between calls.

use crate::socket::client::Connection;
use crate::socket::completion::{deliver, CompletionHandler};
use crate::socket::endpoint::HostPortPair;
use crate::socket::proxy::ProxySettings;
use crate::socket::tls::TlsConfig;
use crate::socket::transport::{ConnectTarget, Transport};
use crate::urlrequest::Request;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use url::Url;

/// Performs a transport-level connect and reports through `handler`.
///
/// Returns immediately; the handler sees exactly one outcome later.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        remote: &HostPortPair,
        local: Option<SocketAddr>,
        handler: Arc<dyn CompletionHandler>,
    );
}

/// Protocol stack template layered over the TCP socket.
#[derive(Debug, Clone)]
pub struct ProtocolChain {
    pub tls: Option<TlsConfig>,
    pub nodelay: bool,
}

impl ProtocolChain {
    pub fn plain() -> Self {
        Self { tls: None, nodelay: true }
    }

    pub fn secure(tls: TlsConfig) -> Self {
        Self { tls: Some(tls), nodelay: true }
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}

/// Builds a fresh connector per connect attempt.
#[derive(Clone)]
pub struct ConnectorFactory {
    transport: Arc<dyn Transport>,
    secure: ProtocolChain,
    non_secure: ProtocolChain,
}

impl ConnectorFactory {
    pub fn new(transport: Arc<dyn Transport>, secure: ProtocolChain, non_secure: ProtocolChain) -> Self {
        Self { transport, secure, non_secure }
    }

    /// `https`/`wss` targets get the secure chain.
    pub fn chain_for(&self, url: &Url) -> &ProtocolChain {
        match url.scheme() {
            "https" | "wss" => &self.secure,
            _ => &self.non_secure,
        }
    }

    pub fn build(&self, request: &Request) -> Arc<dyn Connector> {
        Arc::new(ProxyAwareConnector {
            transport: Arc::clone(&self.transport),
            chain: self.chain_for(request.url()).clone(),
            url: request.url().clone(),
            proxy: request.proxy().cloned(),
        })
    }
}

impl fmt::Debug for ConnectorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorFactory")
            .field("secure", &self.secure)
            .field("non_secure", &self.non_secure)
            .finish_non_exhaustive()
    }
}

/// Connector bound to one target URL and optional proxy.
pub struct ProxyAwareConnector {
    transport: Arc<dyn Transport>,
    chain: ProtocolChain,
    url: Url,
    proxy: Option<ProxySettings>,
}

impl Connector for ProxyAwareConnector {
    fn connect(
        &self,
        remote: &HostPortPair,
        local: Option<SocketAddr>,
        handler: Arc<dyn CompletionHandler>,
    ) {
        let target = ConnectTarget {
            remote: remote.clone(),
            local,
            url: self.url.clone(),
            proxy: self.proxy.clone(),
            chain: self.chain.clone(),
        };
        tracing::trace!(remote = %remote, url = %self.url, "connecting");

        let opening = self.transport.open(target);
        tokio::spawn(async move {
            let result: Result<Connection, _> = opening.await;
            deliver(handler.as_ref(), result);
        });
    }
}
