//! Privileged composition root for the extension messaging core.
//!
//! [`PrivilegedCore`] owns the worker registry (and through it the tab
//! store) and a [`Router`] of request handlers. Feature modules register
//! their operations against the router and answer each received request
//! through a [`Responder`] with zero or more progress deliveries and exactly
//! one terminal outcome.

pub mod config;
pub mod core;
pub mod router;

pub use config::CoreConfig;
pub use core::{CoreError, PrivilegedCore};
pub use router::{Responder, Router};
