//! Base types and error handling.
//!
//! - [`NetError`](neterror::NetError): Network error codes matching `net_error_list.h`
//! - [`context`]: `io::Error` and timeout conversion helpers

pub mod context;
pub mod neterror;
