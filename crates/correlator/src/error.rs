use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Result alias for correlated requests.
pub type Result<T, E = RequestError> = std::result::Result<T, E>;

/// Failure of one correlated request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
	/// The channel was torn down before or while the request was pending.
	#[error("channel closed")]
	ChannelClosed,
	/// No terminal outcome arrived within the deadline.
	#[error("request timed out after {0:?}")]
	Timeout(Duration),
	/// The remote handler completed the request with an error status.
	#[error("{message}")]
	Remote {
		/// Human-readable error description extracted from the payload.
		message: String,
	},
}

/// Extracts an error description from an error-completion payload.
///
/// Handlers conventionally send either an object with a `message` field or a
/// bare string; anything else is stringified as-is.
pub(crate) fn remote_message(payload: &[Value]) -> String {
	match payload.first() {
		Some(Value::String(message)) => message.clone(),
		Some(Value::Object(fields)) => match fields.get("message").and_then(Value::as_str) {
			Some(message) => message.to_string(),
			None => Value::Object(fields.clone()).to_string(),
		},
		Some(other) => other.to_string(),
		None => "request failed".to_string(),
	}
}
