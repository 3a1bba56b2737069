//! Request-side types handed to the connection manager.
//!
//! - [`Request`]: target URL, local bind address, resolved proxy, pool key strategy
//! - [`RequestFuture`]: shared completion object for one request

pub mod future;
pub mod request;

pub use future::{RequestFuture, RequestState};
pub use request::{DefaultKeyStrategy, PoolKeyStrategy, Request};
