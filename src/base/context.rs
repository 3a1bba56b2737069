//! Error context helpers.
//!
//! Extension traits that turn IO and timer errors into `NetError` values
//! carrying the endpoint they happened on.

use crate::base::neterror::NetError;
use std::io;
use tokio::time::error::Elapsed;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Add connection context to an IO error.
    ///
    /// # Example
    /// ```ignore
    /// use netpool::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await
    ///     .connection_context("example.com", 443)?;
    /// // Error: "Connection to example.com:443 failed: connection refused"
    /// ```
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError>;

    /// Add DNS resolution context to an IO error.
    fn dns_context(self, domain: &str) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError> {
        self.map_err(|e| {
            if e.kind() == io::ErrorKind::ConnectionRefused {
                tracing::debug!(host = %host, port, "connection refused");
            }
            NetError::connection_failed_to(host, port, e)
        })
    }

    fn dns_context(self, domain: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::dns_failed(domain, e))
    }
}

/// Maps an elapsed `tokio::time::timeout` onto `ConnectionTimedOut`.
pub trait TimeoutResultExt<T> {
    fn or_timed_out(self) -> Result<T, NetError>;
}

impl<T> TimeoutResultExt<T> for Result<Result<T, NetError>, Elapsed> {
    fn or_timed_out(self) -> Result<T, NetError> {
        self.unwrap_or(Err(NetError::ConnectionTimedOut))
    }
}
