//! Awaitable request semantics over the three-outcome wire protocol.
//!
//! A [`RequestCorrelator`] issues tokens from a monotonic counter, tracks
//! pending requests, and resolves each one from the completion or progress
//! deliveries carrying its token. Several requests to the same message name
//! may be in flight at once; they are distinguished purely by token, never by
//! call order.

pub mod error;
pub mod request;

pub use error::{RequestError, Result};
pub use request::{DEFAULT_REQUEST_TIMEOUT, RequestCorrelator, RequestOptions};
