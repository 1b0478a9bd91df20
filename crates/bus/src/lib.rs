//! In-context publish/subscribe on top of one channel.
//!
//! The bus deduplicates channel subscriptions: the first subscriber for an
//! event name installs exactly one channel-level listener that fans out to a
//! local callback list, so an inbound message is delivered once per local
//! subscriber rather than once per channel handler. A local
//! [`EventBus::emit`] runs same-context subscribers synchronously and still
//! forwards the event to the remote side. There is no replay: a subscriber
//! added after an emit never observes it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use vaultlink_channel::{ChannelEndpoint, WireMessage};

type BusCallback = Arc<dyn Fn(&[Value]) + Send + Sync>;

#[derive(Default)]
struct Topic {
	callbacks: Vec<BusCallback>,
}

struct BusInner {
	channel: Arc<ChannelEndpoint>,
	topics: Mutex<HashMap<String, Topic>>,
}

/// Publish/subscribe layer owned by one isolated context.
#[derive(Clone)]
pub struct EventBus {
	inner: Arc<BusInner>,
}

impl EventBus {
	/// Creates a bus over one channel endpoint.
	pub fn new(channel: Arc<ChannelEndpoint>) -> Self {
		Self {
			inner: Arc::new(BusInner {
				channel,
				topics: Mutex::new(HashMap::new()),
			}),
		}
	}

	/// Subscribes to one event name.
	///
	/// The first subscriber installs the single channel listener for the
	/// name; later subscribers are appended to the fan-out list without a
	/// second channel handler.
	pub fn on(&self, name: &str, callback: impl Fn(&[Value]) + Send + Sync + 'static) {
		let mut topics = self.inner.topics.lock();
		let topic = topics.entry(name.to_string()).or_insert_with(|| {
			self.install_channel_listener(name);
			Topic::default()
		});
		topic.callbacks.push(Arc::new(callback));
	}

	/// Publishes one event.
	///
	/// Local subscribers run synchronously, in subscription order, before the
	/// event is forwarded to the remote side. The forward is unconditional so
	/// the privileged process observes every emit.
	pub fn emit(&self, name: &str, args: Vec<Value>) {
		let callbacks: Vec<BusCallback> = {
			let topics = self.inner.topics.lock();
			topics.get(name).map(|topic| topic.callbacks.clone()).unwrap_or_default()
		};
		for callback in &callbacks {
			callback(&args);
		}
		tracing::trace!(event = name, local = callbacks.len(), "bus.emit");
		self.inner.channel.send(WireMessage::Event {
			name: name.to_string(),
			args,
		});
	}

	/// Drops every local subscriber for one event name.
	///
	/// The channel listener stays installed and fans out to the now-empty
	/// list; re-subscribing reuses it.
	pub fn off(&self, name: &str) {
		if let Some(topic) = self.inner.topics.lock().get_mut(name) {
			topic.callbacks.clear();
		}
	}

	/// Number of local subscribers for one event name.
	pub fn local_subscriber_count(&self, name: &str) -> usize {
		self.inner.topics.lock().get(name).map_or(0, |topic| topic.callbacks.len())
	}

	fn install_channel_listener(&self, name: &str) {
		let inner = Arc::downgrade(&self.inner);
		let topic_name = name.to_string();
		self.inner.channel.on(name, move |msg| {
			let WireMessage::Event { args, .. } = msg else {
				return;
			};
			let Some(inner) = inner.upgrade() else {
				return;
			};
			let callbacks: Vec<BusCallback> = {
				let topics = inner.topics.lock();
				topics.get(&topic_name).map(|topic| topic.callbacks.clone()).unwrap_or_default()
			};
			for callback in callbacks {
				callback(args);
			}
		});
	}
}
