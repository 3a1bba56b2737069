//! Sockets, connectors and pooling.
//!
//! - [`endpoint`]: endpoint identity, port defaulting and the endpoint key cache
//! - [`connector`]: per-attempt connectors over a shared [`transport`]
//! - [`completion`]: completion handlers, the request bridge and connect promises
//! - [`pool`]: the pool interface and the default per-endpoint pool
//! - [`proxy`]: resolved proxy settings
//! - [`tls`]: TLS configuration with BoringSSL

pub mod client;
pub mod completion;
pub mod connector;
pub mod endpoint;
pub mod pool;
pub mod proxy;
pub mod tls;
pub mod transport;
