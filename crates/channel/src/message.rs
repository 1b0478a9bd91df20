//! Tagged wire message model, decoded once at the channel boundary.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dispatch-name suffix under which terminal completions route.
pub const COMPLETE_SUFFIX: &str = ".complete";
/// Dispatch-name suffix under which progress deliveries route.
pub const PROGRESS_SUFFIX: &str = ".progress";
/// Dispatch name reserved for cross-surface routing envelopes.
pub const ROUTED_EVENT: &str = "@route";

/// Correlation token linking one request to its completion and progress
/// deliveries. Unique among pending requests of the issuing context.
pub type Token = u64;

/// Identity of one browsing tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabId(pub u32);

impl fmt::Display for TabId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Terminal status of a correlated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
	/// The handler produced a result.
	Success,
	/// The handler failed; the payload carries the error description.
	Error,
}

/// One message carried over a channel.
///
/// Payload arguments are JSON values. Each variant has a dispatch route
/// ([`WireMessage::route_name`]); completions and progress deliveries route
/// under the suffixed name of the request they answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
	/// A correlated request addressed to the receiving side.
	Request {
		/// Operation name, e.g. `vault.config.read`.
		name: String,
		/// Correlation token issued by the sender.
		token: Token,
		/// Operation arguments.
		args: Vec<Value>,
	},
	/// The single terminal outcome of a request.
	Completion {
		/// Name of the request this completes.
		name: String,
		/// Token of the request this completes.
		token: Token,
		/// Terminal status.
		status: Status,
		/// Result payload on success, error description on error.
		payload: Vec<Value>,
	},
	/// A non-terminal progress delivery for a pending request.
	Progress {
		/// Name of the pending request.
		name: String,
		/// Token of the pending request.
		token: Token,
		/// Progress payload.
		payload: Vec<Value>,
	},
	/// Plain event traffic with no correlation.
	Event {
		/// Event name.
		name: String,
		/// Event arguments.
		args: Vec<Value>,
	},
	/// Envelope asking the privileged side to deliver `inner` to a named
	/// sibling surface on the same tab.
	Routed {
		/// Name of the target worker handle.
		target: String,
		/// Originating tab.
		tab: TabId,
		/// The wrapped message.
		inner: Box<WireMessage>,
	},
}

impl WireMessage {
	/// The name handlers subscribe under to receive this message.
	#[must_use]
	pub fn route_name(&self) -> Cow<'_, str> {
		match self {
			Self::Request { name, .. } | Self::Event { name, .. } => Cow::Borrowed(name),
			Self::Completion { name, .. } => Cow::Owned(format!("{name}{COMPLETE_SUFFIX}")),
			Self::Progress { name, .. } => Cow::Owned(format!("{name}{PROGRESS_SUFFIX}")),
			Self::Routed { .. } => Cow::Borrowed(ROUTED_EVENT),
		}
	}
}
