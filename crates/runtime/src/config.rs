use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Returns the default request timeout in seconds.
fn default_request_timeout() -> u64 {
	30
}

/// Configuration for the privileged core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
	/// Terminal deadline for correlated requests, in seconds.
	#[serde(default = "default_request_timeout")]
	pub request_timeout_secs: u64,
}

impl Default for CoreConfig {
	fn default() -> Self {
		Self {
			request_timeout_secs: default_request_timeout(),
		}
	}
}

impl CoreConfig {
	/// The request timeout as a duration.
	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}
}
