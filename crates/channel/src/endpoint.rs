//! Channel endpoint pair and handler dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::WireMessage;

/// Identifier for one registered handler, used to deregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

type HandlerFn = Arc<dyn Fn(&WireMessage) + Send + Sync>;
type DisconnectFn = Box<dyn FnOnce() + Send>;

struct HandlerEntry {
	id: HandlerId,
	once: bool,
	callback: HandlerFn,
}

/// State shared by both endpoints of one pair.
///
/// The `closed` token is the single connected/disconnected flag; disconnect
/// hooks of both endpoints live in one list so they fire in registration
/// order regardless of which side registered them.
struct Shared {
	closed: CancellationToken,
	hooks: Mutex<Vec<DisconnectFn>>,
}

impl Shared {
	fn disconnect(&self) {
		let hooks = {
			let mut hooks = self.hooks.lock();
			if self.closed.is_cancelled() {
				return;
			}
			self.closed.cancel();
			std::mem::take(&mut *hooks)
		};
		for hook in hooks {
			hook();
		}
	}
}

/// One endpoint of an ordered bidirectional channel connecting an isolated
/// surface context to the privileged core.
///
/// Sends never fail visibly; a send on a disconnected endpoint is a silent
/// no-op observable through [`ChannelEndpoint::is_connected`]. Exactly one
/// delivery attempt is made per send, ordering is preserved per channel, and
/// no ordering holds across two different channels.
pub struct ChannelEndpoint {
	id: String,
	shared: Arc<Shared>,
	tx: mpsc::UnboundedSender<WireMessage>,
	rx: Mutex<Option<mpsc::UnboundedReceiver<WireMessage>>>,
	handlers: Mutex<HashMap<String, Vec<HandlerEntry>>>,
	next_handler: AtomicU64,
}

impl ChannelEndpoint {
	/// Creates a connected endpoint pair.
	///
	/// The identifiers are derived from the surfaces' declared names and only
	/// appear in logs.
	pub fn pair(left: impl Into<String>, right: impl Into<String>) -> (Arc<Self>, Arc<Self>) {
		let shared = Arc::new(Shared {
			closed: CancellationToken::new(),
			hooks: Mutex::new(Vec::new()),
		});
		let (left_tx, right_rx) = mpsc::unbounded_channel();
		let (right_tx, left_rx) = mpsc::unbounded_channel();
		let left = Arc::new(Self {
			id: left.into(),
			shared: Arc::clone(&shared),
			tx: left_tx,
			rx: Mutex::new(Some(left_rx)),
			handlers: Mutex::new(HashMap::new()),
			next_handler: AtomicU64::new(0),
		});
		let right = Arc::new(Self {
			id: right.into(),
			shared,
			tx: right_tx,
			rx: Mutex::new(Some(right_rx)),
			handlers: Mutex::new(HashMap::new()),
			next_handler: AtomicU64::new(0),
		});
		(left, right)
	}

	/// Returns this endpoint's identifier.
	pub fn id(&self) -> &str {
		&self.id
	}

	/// Returns false once either endpoint disconnected.
	pub fn is_connected(&self) -> bool {
		!self.shared.closed.is_cancelled()
	}

	/// Enqueues one message for the peer endpoint.
	///
	/// Never fails. On a disconnected channel the message is dropped and the
	/// drop logged; callers refuse new work by checking
	/// [`ChannelEndpoint::is_connected`] first.
	pub fn send(&self, msg: WireMessage) {
		if self.shared.closed.is_cancelled() {
			tracing::debug!(channel = %self.id, route = %msg.route_name(), "channel.send_disconnected");
			return;
		}
		if self.tx.send(msg).is_err() {
			tracing::debug!(channel = %self.id, "channel.peer_gone");
		}
	}

	/// Registers a persistent handler for one route name.
	///
	/// All handlers registered under a name run, in registration order, for
	/// every matching inbound message.
	pub fn on(&self, name: &str, callback: impl Fn(&WireMessage) + Send + Sync + 'static) -> HandlerId {
		self.register(name, false, Arc::new(callback))
	}

	/// Registers a handler that deregisters itself after its first invocation.
	pub fn once(&self, name: &str, callback: impl Fn(&WireMessage) + Send + Sync + 'static) -> HandlerId {
		self.register(name, true, Arc::new(callback))
	}

	fn register(&self, name: &str, once: bool, callback: HandlerFn) -> HandlerId {
		let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
		self.handlers
			.lock()
			.entry(name.to_string())
			.or_default()
			.push(HandlerEntry { id, once, callback });
		id
	}

	/// Deregisters one handler. Returns false when it was not registered.
	pub fn remove_handler(&self, name: &str, id: HandlerId) -> bool {
		let mut handlers = self.handlers.lock();
		let Some(entries) = handlers.get_mut(name) else {
			return false;
		};
		let before = entries.len();
		entries.retain(|entry| entry.id != id);
		entries.len() != before
	}

	/// Number of handlers currently registered for one route name.
	pub fn handler_count(&self, name: &str) -> usize {
		self.handlers.lock().get(name).map_or(0, Vec::len)
	}

	/// Registers a hook fired exactly once when the channel disconnects.
	///
	/// Hooks of both endpoints run in registration order. Registering on an
	/// already-disconnected channel runs the hook immediately.
	pub fn on_disconnect(&self, hook: impl FnOnce() + Send + 'static) {
		let mut hook: Option<DisconnectFn> = Some(Box::new(hook));
		{
			let mut hooks = self.shared.hooks.lock();
			if !self.shared.closed.is_cancelled()
				&& let Some(hook) = hook.take()
			{
				hooks.push(hook);
			}
		}
		if let Some(hook) = hook {
			hook();
		}
	}

	/// Tears the channel down.
	///
	/// Idempotent. The first call marks both endpoints disconnected and fires
	/// every registered disconnect hook.
	pub fn disconnect(&self) {
		self.shared.disconnect();
	}

	/// Resolves once the channel disconnects.
	pub async fn closed(&self) {
		self.shared.closed.cancelled().await;
	}

	/// Drains inbound messages to handlers in arrival order until the channel
	/// disconnects or the peer endpoint is dropped.
	///
	/// At most one pump may run per endpoint; a second call logs and returns.
	pub async fn pump(&self) {
		let taken = self.rx.lock().take();
		let Some(mut rx) = taken else {
			tracing::warn!(channel = %self.id, "channel.pump_already_taken");
			return;
		};
		loop {
			tokio::select! {
				() = self.shared.closed.cancelled() => break,
				msg = rx.recv() => match msg {
					Some(msg) => self.dispatch(msg),
					None => break,
				},
			}
		}
		self.disconnect();
	}

	/// Synchronously dispatches every already-queued inbound message.
	///
	/// Returns the number of messages dispatched. Unavailable once
	/// [`ChannelEndpoint::pump`] has taken the receiver.
	pub fn try_dispatch_all(&self) -> usize {
		let mut dispatched = 0;
		loop {
			let msg = {
				let mut rx = self.rx.lock();
				let Some(rx) = rx.as_mut() else {
					return dispatched;
				};
				match rx.try_recv() {
					Ok(msg) => msg,
					Err(_) => break,
				}
			};
			self.dispatch(msg);
			dispatched += 1;
		}
		dispatched
	}

	/// Runs handlers for one inbound message, in registration order.
	///
	/// The handler table is snapshotted before invocation: handlers added
	/// while dispatching do not observe the message that added them, and
	/// once-handlers are deregistered before their callback runs.
	fn dispatch(&self, msg: WireMessage) {
		let route = msg.route_name().into_owned();
		let callbacks: Vec<HandlerFn> = {
			let mut handlers = self.handlers.lock();
			match handlers.get_mut(&route) {
				Some(entries) => {
					let snapshot = entries.iter().map(|entry| Arc::clone(&entry.callback)).collect();
					entries.retain(|entry| !entry.once);
					snapshot
				}
				None => {
					tracing::trace!(channel = %self.id, route = %route, "channel.unrouted");
					return;
				}
			}
		};
		for callback in callbacks {
			callback(&msg);
		}
	}
}
