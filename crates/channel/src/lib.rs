//! Ordered bidirectional channel primitive for extension messaging.
//!
//! One [`ChannelEndpoint`] pair connects exactly one isolated surface context
//! to the privileged core. Messages are typed [`WireMessage`] values decoded
//! once at this boundary; handlers subscribe by route name and run in
//! registration order for every matching inbound message.

#![warn(missing_docs)]

pub mod endpoint;
pub mod message;

pub use endpoint::{ChannelEndpoint, HandlerId};
pub use message::{COMPLETE_SUFFIX, PROGRESS_SUFFIX, ROUTED_EVENT, Status, TabId, Token, WireMessage};
