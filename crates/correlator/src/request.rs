//! Token issue and pending-request tracking.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use vaultlink_channel::{COMPLETE_SUFFIX, ChannelEndpoint, PROGRESS_SUFFIX, Status, Token, WireMessage};

use crate::error::{RequestError, Result, remote_message};

/// Default terminal deadline for a correlated request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Completions slower than this are logged.
const SLOW_REQUEST_WARN: Duration = Duration::from_secs(5);

type ProgressFn = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Per-request options for [`RequestCorrelator::request_with`].
#[derive(Default)]
pub struct RequestOptions {
	timeout: Option<Duration>,
	on_progress: Option<ProgressFn>,
}

impl RequestOptions {
	/// Creates empty options: default timeout, no progress callback.
	pub fn new() -> Self {
		Self::default()
	}

	/// Overrides the correlator's default timeout for this request.
	#[must_use]
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	/// Invoked with the payload of every progress delivery that arrives
	/// before the terminal outcome.
	#[must_use]
	pub fn on_progress(mut self, callback: impl Fn(&[Value]) + Send + Sync + 'static) -> Self {
		self.on_progress = Some(Arc::new(callback));
		self
	}
}

/// One in-flight correlated request.
///
/// Lives in the pending table from send until its terminal outcome; progress
/// deliveries leave it in place.
struct PendingRequest {
	name: String,
	complete: oneshot::Sender<Result<Vec<Value>>>,
	on_progress: Option<ProgressFn>,
	created_at: Instant,
}

struct CorrelatorInner {
	channel: Arc<ChannelEndpoint>,
	next_token: AtomicU64,
	pending: Mutex<HashMap<Token, PendingRequest>>,
	listened: Mutex<HashSet<String>>,
	default_timeout: Duration,
}

impl CorrelatorInner {
	/// Rejects every pending request. Runs when the channel disconnects.
	fn reject_all(&self) {
		let drained: Vec<PendingRequest> = {
			let mut pending = self.pending.lock();
			pending.drain().map(|(_, entry)| entry).collect()
		};
		for entry in drained {
			tracing::debug!(name = %entry.name, "correlator.reject_pending");
			let _ = entry.complete.send(Err(RequestError::ChannelClosed));
		}
	}

	fn complete(&self, token: Token, status: Status, payload: &[Value]) {
		let entry = self.pending.lock().remove(&token);
		let Some(entry) = entry else {
			tracing::warn!(channel = %self.channel.id(), token, "correlator.unknown_token");
			return;
		};
		let elapsed = entry.created_at.elapsed();
		if elapsed > SLOW_REQUEST_WARN {
			tracing::warn!(name = %entry.name, elapsed_ms = elapsed.as_millis() as u64, "correlator.slow_request");
		}
		let result = match status {
			Status::Success => Ok(payload.to_vec()),
			Status::Error => Err(RequestError::Remote {
				message: remote_message(payload),
			}),
		};
		let _ = entry.complete.send(result);
	}

	fn progress(&self, token: Token, payload: &[Value]) {
		let callback = {
			let pending = self.pending.lock();
			match pending.get(&token) {
				Some(entry) => entry.on_progress.clone(),
				None => {
					tracing::warn!(channel = %self.channel.id(), token, "correlator.unknown_token");
					return;
				}
			}
		};
		if let Some(callback) = callback {
			callback(payload);
		}
	}
}

/// Issues unique tokens and turns the SUCCESS/ERROR/PROGRESS wire protocol
/// into awaitable requests.
///
/// Tokens come from a monotonic per-correlator counter, so collisions among
/// pending requests cannot occur. One persistent channel listener per
/// distinct message name serves every concurrent request to that name;
/// deliveries are routed by token lookup. A delivery for an unknown token is
/// logged and discarded, never raised.
#[derive(Clone)]
pub struct RequestCorrelator {
	inner: Arc<CorrelatorInner>,
}

impl RequestCorrelator {
	/// Creates a correlator with the default request timeout.
	pub fn new(channel: Arc<ChannelEndpoint>) -> Self {
		Self::with_default_timeout(channel, DEFAULT_REQUEST_TIMEOUT)
	}

	/// Creates a correlator with a custom default timeout.
	///
	/// A disconnect hook is installed immediately: pending requests reject
	/// with [`RequestError::ChannelClosed`] the moment the channel tears
	/// down instead of hanging forever.
	pub fn with_default_timeout(channel: Arc<ChannelEndpoint>, timeout: Duration) -> Self {
		let inner = Arc::new(CorrelatorInner {
			channel: Arc::clone(&channel),
			next_token: AtomicU64::new(1),
			pending: Mutex::new(HashMap::new()),
			listened: Mutex::new(HashSet::new()),
			default_timeout: timeout,
		});
		let hook = Arc::downgrade(&inner);
		channel.on_disconnect(move || {
			if let Some(inner) = hook.upgrade() {
				inner.reject_all();
			}
		});
		Self { inner }
	}

	/// Sends one correlated request and resolves with its terminal outcome.
	pub fn request(&self, name: &str, args: Vec<Value>) -> impl Future<Output = Result<Vec<Value>>> + Send + 'static {
		self.request_with(name, args, RequestOptions::new())
	}

	/// Sends one correlated request with per-request options.
	///
	/// The request is registered and sent before this returns; the returned
	/// future only awaits the outcome. A request issued on a disconnected
	/// channel rejects immediately rather than hanging.
	pub fn request_with(
		&self,
		name: &str,
		args: Vec<Value>,
		options: RequestOptions,
	) -> impl Future<Output = Result<Vec<Value>>> + Send + 'static {
		let inner = Arc::clone(&self.inner);
		let timeout = options.timeout.unwrap_or(inner.default_timeout);
		let setup = if inner.channel.is_connected() {
			self.ensure_listeners(name);
			let token = inner.next_token.fetch_add(1, Ordering::Relaxed);
			let (complete, receiver) = oneshot::channel();
			{
				let mut pending = inner.pending.lock();
				let replaced = pending.insert(
					token,
					PendingRequest {
						name: name.to_string(),
						complete,
						on_progress: options.on_progress,
						created_at: Instant::now(),
					},
				);
				debug_assert!(replaced.is_none(), "token collision in pending table");
				if replaced.is_some() {
					tracing::error!(token, "correlator.token_collision");
				}
			}
			inner.channel.send(WireMessage::Request {
				name: name.to_string(),
				token,
				args,
			});
			Ok((token, receiver))
		} else {
			Err(RequestError::ChannelClosed)
		};
		let name = name.to_string();
		async move {
			let (token, receiver) = setup?;
			match tokio::time::timeout(timeout, receiver).await {
				Ok(Ok(result)) => result,
				Ok(Err(_)) => Err(RequestError::ChannelClosed),
				Err(_) => {
					inner.pending.lock().remove(&token);
					tracing::warn!(name = %name, token, timeout_ms = timeout.as_millis() as u64, "correlator.timeout");
					Err(RequestError::Timeout(timeout))
				}
			}
		}
	}

	/// Number of requests currently awaiting their terminal outcome.
	pub fn pending_count(&self) -> usize {
		self.inner.pending.lock().len()
	}

	/// Installs the completion and progress listeners for one message name,
	/// exactly once per name for the correlator's lifetime.
	fn ensure_listeners(&self, name: &str) {
		{
			let mut listened = self.inner.listened.lock();
			if !listened.insert(name.to_string()) {
				return;
			}
		}
		let complete_route = format!("{name}{COMPLETE_SUFFIX}");
		let inner = Arc::downgrade(&self.inner);
		self.inner.channel.on(&complete_route, move |msg| {
			let WireMessage::Completion { token, status, payload, .. } = msg else {
				return;
			};
			if let Some(inner) = inner.upgrade() {
				inner.complete(*token, *status, payload);
			}
		});
		let progress_route = format!("{name}{PROGRESS_SUFFIX}");
		let inner = Arc::downgrade(&self.inner);
		self.inner.channel.on(&progress_route, move |msg| {
			let WireMessage::Progress { token, payload, .. } = msg else {
				return;
			};
			if let Some(inner) = inner.upgrade() {
				inner.progress(*token, payload);
			}
		});
	}
}
