//! Named worker handles bound to one tab.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use vaultlink_channel::{ChannelEndpoint, TabId, WireMessage};
use vaultlink_correlator::{RequestCorrelator, RequestOptions, Result as RequestResult};

type DetachFn = Box<dyn FnOnce() + Send>;

/// Options supplied when attaching a worker handle.
#[derive(Default)]
pub struct AttachOptions {
	on_detach: Vec<DetachFn>,
	request_timeout: Option<Duration>,
}

impl AttachOptions {
	/// Creates empty options.
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a callback run, in registration order, when the handle
	/// detaches.
	#[must_use]
	pub fn on_detach(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
		self.on_detach.push(Box::new(callback));
		self
	}

	/// Default timeout for privileged-side requests issued through this
	/// handle.
	#[must_use]
	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.request_timeout = Some(timeout);
		self
	}
}

struct HandleState {
	detached: bool,
	on_detach: Vec<DetachFn>,
}

/// One named privileged-side endpoint bound to exactly one tab.
///
/// A handle does not own its tab; it carries the tab identity for lookup and
/// lifecycle wiring only. Its lifecycle is `attached → detached`, terminal:
/// once detached, the handle's channel is down and the registry no longer
/// returns it.
pub struct WorkerHandle {
	tab: TabId,
	name: String,
	channel: Arc<ChannelEndpoint>,
	correlator: RequestCorrelator,
	attached_at: Instant,
	detach_token: CancellationToken,
	state: Mutex<HandleState>,
}

impl WorkerHandle {
	pub(crate) fn new(tab: TabId, name: &str, channel: Arc<ChannelEndpoint>, options: AttachOptions) -> Self {
		let correlator = match options.request_timeout {
			Some(timeout) => RequestCorrelator::with_default_timeout(Arc::clone(&channel), timeout),
			None => RequestCorrelator::new(Arc::clone(&channel)),
		};
		Self {
			tab,
			name: name.to_string(),
			channel,
			correlator,
			attached_at: Instant::now(),
			detach_token: CancellationToken::new(),
			state: Mutex::new(HandleState {
				detached: false,
				on_detach: options.on_detach,
			}),
		}
	}

	/// The hosting tab.
	pub fn tab(&self) -> TabId {
		self.tab
	}

	/// The surface name, e.g. `"App"` or `"ShareAutocomplete"`.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// The privileged end of the channel to this surface.
	pub fn channel(&self) -> &Arc<ChannelEndpoint> {
		&self.channel
	}

	/// When the handle attached.
	pub fn attached_at(&self) -> Instant {
		self.attached_at
	}

	/// Whether the detach sequence already ran.
	pub fn is_detached(&self) -> bool {
		self.state.lock().detached
	}

	/// Resolves when the handle detaches.
	pub async fn detached(&self) {
		self.detach_token.cancelled().await;
	}

	/// Sends one plain event to the surface.
	pub fn message(&self, event: &str, args: Vec<Value>) {
		self.channel.send(WireMessage::Event {
			name: event.to_string(),
			args,
		});
	}

	/// Issues a correlated request to the surface.
	pub fn request(&self, name: &str, args: Vec<Value>) -> impl Future<Output = RequestResult<Vec<Value>>> + Send + 'static {
		self.correlator.request(name, args)
	}

	/// Issues a correlated request to the surface with per-request options.
	pub fn request_with(
		&self,
		name: &str,
		args: Vec<Value>,
		options: RequestOptions,
	) -> impl Future<Output = RequestResult<Vec<Value>>> + Send + 'static {
		self.correlator.request_with(name, args, options)
	}

	/// Runs the detach sequence exactly once.
	///
	/// Order matters: detach callbacks first, in registration order, then the
	/// cancellation token, then channel teardown, which rejects every request
	/// still pending on the channel. Returns false when the handle was
	/// already detached.
	pub(crate) fn run_detach(&self) -> bool {
		let callbacks = {
			let mut state = self.state.lock();
			if state.detached {
				return false;
			}
			state.detached = true;
			std::mem::take(&mut state.on_detach)
		};
		for callback in callbacks {
			callback();
		}
		self.detach_token.cancel();
		self.channel.disconnect();
		true
	}
}
