//! Request dispatch for privileged feature modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use vaultlink_channel::{ChannelEndpoint, Status, Token, WireMessage};

type RequestHandler = Arc<dyn Fn(Responder, Vec<Value>) + Send + Sync>;

/// Reply port bound to one received request.
///
/// A handler must produce exactly one terminal outcome, preceded by zero or
/// more progress deliveries. A second terminal send, or progress after the
/// terminal outcome, is a logged no-op.
#[derive(Clone)]
pub struct Responder {
	channel: Weak<ChannelEndpoint>,
	name: String,
	token: Token,
	terminal_sent: Arc<AtomicBool>,
}

impl Responder {
	fn new(channel: Weak<ChannelEndpoint>, name: String, token: Token) -> Self {
		Self {
			channel,
			name,
			token,
			terminal_sent: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Sends one non-terminal progress delivery.
	pub fn progress(&self, payload: Vec<Value>) {
		if self.terminal_sent.load(Ordering::Relaxed) {
			tracing::warn!(name = %self.name, token = self.token, "responder.progress_after_terminal");
			return;
		}
		if let Some(channel) = self.channel.upgrade() {
			channel.send(WireMessage::Progress {
				name: self.name.clone(),
				token: self.token,
				payload,
			});
		}
	}

	/// Completes the request successfully.
	pub fn success(self, payload: Vec<Value>) {
		self.terminal(Status::Success, payload);
	}

	/// Completes the request with an error payload.
	pub fn error(self, payload: Vec<Value>) {
		self.terminal(Status::Error, payload);
	}

	fn terminal(self, status: Status, payload: Vec<Value>) {
		if self.terminal_sent.swap(true, Ordering::Relaxed) {
			tracing::warn!(name = %self.name, token = self.token, "responder.duplicate_terminal");
			return;
		}
		if let Some(channel) = self.channel.upgrade() {
			channel.send(WireMessage::Completion {
				name: self.name.clone(),
				token: self.token,
				status,
				payload,
			});
		}
	}
}

/// Table of request handlers keyed by message name.
///
/// Feature modules register their operations once at composition time; the
/// core binds the table to each surface channel at attach. Handlers
/// registered after a bind do not apply to already-attached surfaces.
#[derive(Clone, Default)]
pub struct Router {
	handlers: Arc<Mutex<HashMap<String, RequestHandler>>>,
}

impl Router {
	/// Creates an empty router.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers the handler for one message name, replacing any previous
	/// one.
	pub fn register(&self, name: &str, handler: impl Fn(Responder, Vec<Value>) + Send + Sync + 'static) {
		if self.handlers.lock().insert(name.to_string(), Arc::new(handler)).is_some() {
			tracing::debug!(name, "router.handler_replaced");
		}
	}

	/// Installs every registered handler on one surface channel.
	pub fn bind(&self, channel: &Arc<ChannelEndpoint>) {
		let handlers: Vec<(String, RequestHandler)> = {
			let table = self.handlers.lock();
			table.iter().map(|(name, handler)| (name.clone(), Arc::clone(handler))).collect()
		};
		for (route, handler) in handlers {
			let reply_channel = Arc::downgrade(channel);
			channel.on(&route, move |msg| {
				let WireMessage::Request { name, token, args } = msg else {
					return;
				};
				let responder = Responder::new(reply_channel.clone(), name.clone(), *token);
				handler(responder, args.clone());
			});
		}
	}
}
