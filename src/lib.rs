//! # netpool
//!
//! Connection acquisition for an asynchronous HTTP client.
//!
//! Given a request (and an optional, already resolved proxy), `netpool`
//! obtains a usable connection, either reused from a pool or freshly
//! established, and reports the outcome through one completion protocol that
//! callers can await or hand off to a callback.
//!
//! ## Features
//!
//! - **Endpoint keys**: one cached descriptor per pool key, built once even
//!   under concurrent first access
//! - **Tracked and direct acquisition**: pooled connects reported to a
//!   completion handler, or one-shot connects the caller owns
//! - **Connection pooling**: 6 connections per host, 256 total (Chromium-compatible defaults)
//! - **Cacheability**: directly obtained connections never re-enter the pool
//! - **Transport**: tokio TCP, HTTP CONNECT tunnelling and BoringSSL TLS
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use netpool::manager::{ConnectionManager, ConnectionManagerConfig, IdleTimeoutTracker};
//! use netpool::urlrequest::{Request, RequestFuture};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = ConnectionManager::new(
//!         Arc::new(IdleTimeoutTracker::new()),
//!         ConnectionManagerConfig::default(),
//!     );
//!     let request = Request::get("http://example.com/").unwrap();
//!     let future = RequestFuture::new();
//!
//!     manager.do_tracked_connection(&request, &future, None).await.unwrap();
//!     let conn = future.connected().await.unwrap();
//!     println!("Connected to {}", conn.peer());
//!     manager.return_connection(&conn);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error codes and error context helpers
//! - [`manager`] - Connection manager, configuration, provider hooks
//! - [`socket`] - Endpoint keys, connectors, transport, pool, completion handlers
//! - [`urlrequest`] - Request descriptor and request future

pub mod base;
pub mod manager;
pub mod socket;
pub mod urlrequest;

pub use base::neterror::NetError;
pub use manager::{ConnectionManager, ConnectionManagerConfig};
pub use urlrequest::{Request, RequestFuture};
