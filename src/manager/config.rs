//! Connection manager configuration.

use crate::socket::connector::ProtocolChain;
use crate::socket::pool::PoolLimits;
use crate::socket::tls::TlsConfig;
use std::time::Duration;

/// Configuration options for [`ConnectionManager`](super::ConnectionManager).
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Maximum connections per endpoint key.
    pub max_connections_per_host: usize,

    /// Maximum connections across all endpoints.
    pub max_total_connections: usize,

    /// Connect timeout. `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,

    /// How long a returned connection may stay idle in the pool.
    pub idle_connection_in_pool_timeout: Option<Duration>,

    /// How often an owned pool sweeps expired or dead idle connections.
    /// `None` leaves eviction to the next take.
    pub keep_alive_check_interval: Option<Duration>,

    /// Hand tracked acquisitions to the pool and return without waiting.
    pub async_connect: bool,

    /// Protocol chain for `https`/`wss` targets.
    pub secure_chain: ProtocolChain,

    /// Protocol chain for everything else.
    pub non_secure_chain: ProtocolChain,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 6,
            max_total_connections: 256,
            connect_timeout: Some(Duration::from_secs(60)),
            idle_connection_in_pool_timeout: Some(Duration::from_secs(60)),
            keep_alive_check_interval: Some(Duration::from_secs(2)),
            async_connect: false,
            secure_chain: ProtocolChain::secure(TlsConfig::default()),
            non_secure_chain: ProtocolChain::plain(),
        }
    }
}

impl ConnectionManagerConfig {
    pub fn with_max_connections_per_host(mut self, max: usize) -> Self {
        self.max_connections_per_host = max;
        self
    }

    pub fn with_max_total_connections(mut self, max: usize) -> Self {
        self.max_total_connections = max;
        self
    }

    /// A zero duration disables the timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn without_connect_timeout(mut self) -> Self {
        self.connect_timeout = None;
        self
    }

    /// A zero duration disables the timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_connection_in_pool_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// A zero duration disables the periodic sweep.
    pub fn with_keep_alive_check_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_check_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn with_async_connect(mut self, enabled: bool) -> Self {
        self.async_connect = enabled;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.secure_chain = ProtocolChain::secure(tls);
        self
    }

    /// The positive connect timeout, if any.
    pub fn effective_connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout.filter(|t| !t.is_zero())
    }

    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            max_per_host: self.max_connections_per_host,
            max_total: self.max_total_connections,
            connect_timeout: self.effective_connect_timeout(),
            idle_timeout: self.idle_connection_in_pool_timeout.filter(|t| !t.is_zero()),
        }
    }
}
