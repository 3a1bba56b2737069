use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Network error codes, numbered after Chromium's `net_error_list.h`.
///
/// Equality compares error codes, so `ConnectionFailedTo { .. }` equals
/// `ConnectionFailed`. The context-carrying variants hold the `io::Error`
/// behind an `Arc` to keep the type `Clone`.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Generic
    #[error("Operation aborted")]
    Aborted,

    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Connection to {host}:{port} failed: {source}")]
    ConnectionFailedTo {
        host: String,
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Name {domain} not resolved: {source}")]
    NameNotResolvedFor {
        domain: String,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Address invalid")]
    AddressInvalid,
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("Tunnel connection failed")]
    TunnelConnectionFailed,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Proxy connection failed")]
    ProxyConnectionFailed,
    #[error("Preconnect max socket limit")]
    PreconnectMaxSocketLimit,

    // URL Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Unknown URL scheme: {0}")]
    UnknownUrlScheme(String),

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    /// Build a `ConnectionFailedTo` from an IO error.
    pub fn connection_failed_to(host: &str, port: u16, source: io::Error) -> Self {
        NetError::ConnectionFailedTo { host: host.to_string(), port, source: Arc::new(source) }
    }

    /// Build a `NameNotResolvedFor` from an IO error.
    pub fn dns_failed(domain: &str, source: io::Error) -> Self {
        NetError::NameNotResolvedFor { domain: domain.to_string(), source: Arc::new(source) }
    }

    /// True when the pool refused to grant a connection because a limit is reached.
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, NetError::PreconnectMaxSocketLimit)
    }

    /// True for the cancellation outcome.
    pub fn is_aborted(&self) -> bool {
        matches!(self, NetError::Aborted)
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Aborted => -3,
            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed | NetError::ConnectionFailedTo { .. } => -104,
            NetError::NameNotResolved | NetError::NameNotResolvedFor { .. } => -105,
            NetError::SslProtocolError => -107,
            NetError::AddressInvalid => -108,
            NetError::TunnelConnectionFailed => -111,
            NetError::ConnectionTimedOut => -118,
            NetError::ProxyConnectionFailed => -130,
            NetError::PreconnectMaxSocketLimit => -133,
            NetError::InvalidUrl => -300,
            NetError::UnknownUrlScheme(_) => -302,
            NetError::Unknown(code) => *code,
        }
    }
}

impl PartialEq for NetError {
    fn eq(&self, other: &Self) -> bool {
        self.as_i32() == other.as_i32()
    }
}

impl Eq for NetError {}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -3 => NetError::Aborted,
            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -107 => NetError::SslProtocolError,
            -108 => NetError::AddressInvalid,
            -111 => NetError::TunnelConnectionFailed,
            -118 => NetError::ConnectionTimedOut,
            -130 => NetError::ProxyConnectionFailed,
            -133 => NetError::PreconnectMaxSocketLimit,
            -300 => NetError::InvalidUrl,
            -302 => NetError::UnknownUrlScheme(String::new()),
            _ => NetError::Unknown(code),
        }
    }
}
