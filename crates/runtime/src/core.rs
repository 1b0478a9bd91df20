//! Privileged process composition root.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use vaultlink_channel::{ChannelEndpoint, ROUTED_EVENT, TabId, WireMessage};
use vaultlink_correlator::RequestError;
use vaultlink_registry::{AttachOptions, RegistryError, TabEvent, TabStore, WorkerRegistry};

use crate::config::CoreConfig;
use crate::router::Router;

/// Failure of a privileged-side messaging operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
	/// The addressed worker is not attached.
	#[error(transparent)]
	Registry(#[from] RegistryError),
	/// The request to the addressed worker failed.
	#[error(transparent)]
	Request(#[from] RequestError),
}

/// The privileged process composition root.
///
/// Owns the worker registry (and through it the tab store) plus the request
/// router. Feature modules receive these by reference; nothing here is an
/// ambient singleton, so tests compose isolated cores freely.
pub struct PrivilegedCore {
	registry: Arc<WorkerRegistry>,
	router: Router,
	config: CoreConfig,
}

impl PrivilegedCore {
	/// Creates a core with a fresh registry and store.
	pub fn new(config: CoreConfig) -> Self {
		Self {
			registry: Arc::new(WorkerRegistry::new()),
			router: Router::new(),
			config,
		}
	}

	/// The worker registry.
	pub fn registry(&self) -> &Arc<WorkerRegistry> {
		&self.registry
	}

	/// The request router. Register feature handlers here before attaching
	/// surfaces.
	pub fn router(&self) -> &Router {
		&self.router
	}

	/// The tab store shared by this core's worker handles.
	pub fn store(&self) -> Arc<TabStore> {
		self.registry.store()
	}

	/// The core configuration.
	pub fn config(&self) -> &CoreConfig {
		&self.config
	}

	/// Attaches one surface to the core and returns its end of the channel.
	///
	/// Creates the channel pair, binds the router and the cross-surface
	/// route to the privileged end, registers the worker handle, and spawns
	/// the privileged pump. The pump ends when the handle detaches.
	pub fn attach_surface(&self, tab: TabId, name: &str) -> Arc<ChannelEndpoint> {
		let (surface_end, core_end) = ChannelEndpoint::pair(format!("{name}@{tab}"), format!("core:{name}@{tab}"));
		self.router.bind(&core_end);
		self.bind_routing(&core_end, tab);
		let options = AttachOptions::new().request_timeout(self.config.request_timeout());
		self.registry.attach(name, Arc::clone(&core_end), tab, options);
		let pump = Arc::clone(&core_end);
		tokio::spawn(async move { pump.pump().await });
		surface_end
	}

	/// Delivers routing envelopes arriving on one surface channel to the
	/// named sibling surface.
	fn bind_routing(&self, core_end: &Arc<ChannelEndpoint>, origin: TabId) {
		let registry = Arc::downgrade(&self.registry);
		core_end.on(ROUTED_EVENT, move |msg| {
			let WireMessage::Routed { target, tab, inner } = msg else {
				return;
			};
			let Some(registry) = registry.upgrade() else {
				return;
			};
			// The lookup trusts the tab the envelope arrived from, not the
			// tab it claims.
			if *tab != origin {
				tracing::warn!(claimed = tab.0, origin = origin.0, "route.tab_mismatch");
			}
			match registry.get(target, origin) {
				Some(handle) => handle.channel().send((**inner).clone()),
				None => tracing::warn!(tab = origin.0, target, "route.no_such_worker"),
			}
		});
	}

	/// Sends one plain event to a named worker.
	pub fn message_on(&self, tab: TabId, worker: &str, event: &str, args: Vec<Value>) -> Result<(), RegistryError> {
		let handle = self.registry.get(worker, tab).ok_or_else(|| RegistryError::NoSuchWorker {
			tab,
			name: worker.to_string(),
		})?;
		handle.message(event, args);
		Ok(())
	}

	/// Issues a correlated request to a named worker and awaits its outcome.
	pub async fn request_on(&self, tab: TabId, worker: &str, name: &str, args: Vec<Value>) -> Result<Vec<Value>, CoreError> {
		let handle = self.registry.get(worker, tab).ok_or_else(|| RegistryError::NoSuchWorker {
			tab,
			name: worker.to_string(),
		})?;
		Ok(handle.request(name, args).await?)
	}

	/// Sends one plain event to every worker attached to a tab.
	///
	/// Returns the number of workers addressed.
	pub fn broadcast(&self, tab: TabId, event: &str, args: Vec<Value>) -> usize {
		let names = self.registry.get_all_names(tab);
		for name in &names {
			if let Some(handle) = self.registry.get(name, tab) {
				handle.message(event, args.clone());
			}
		}
		names.len()
	}

	/// Detaches one worker. Idempotent; returns false when it was not
	/// attached.
	pub fn detach_surface(&self, tab: TabId, name: &str) -> bool {
		self.registry.detach(name, tab)
	}

	/// Applies tab lifecycle events in arrival order until the sender side
	/// is dropped.
	pub async fn drive_tab_events(&self, events: mpsc::UnboundedReceiver<TabEvent>) {
		self.registry.drive(events).await;
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use parking_lot::Mutex;
	use serde_json::json;
	use vaultlink_bus::EventBus;
	use vaultlink_channel::Status;
	use vaultlink_correlator::{RequestCorrelator, RequestOptions};
	use vaultlink_registry::TabStore;

	use super::*;

	const TICK: Duration = Duration::from_secs(1);

	/// Spawns the surface-side pump, mirroring what a real surface does
	/// right after connecting.
	fn pump(endpoint: &Arc<ChannelEndpoint>) {
		let pumping = Arc::clone(endpoint);
		tokio::spawn(async move { pumping.pump().await });
	}

	#[tokio::test]
	async fn request_fulfils_with_the_handler_result() {
		let core = PrivilegedCore::new(CoreConfig::default());
		core.router().register("vault.config.read", |responder, args| {
			assert_eq!(args, vec![json!("baseUrl")]);
			responder.success(vec![json!("https://example.org")]);
		});

		let surface = core.attach_surface(TabId(1), "App");
		pump(&surface);
		let correlator = RequestCorrelator::new(Arc::clone(&surface));

		let result = tokio::time::timeout(TICK, correlator.request("vault.config.read", vec![json!("baseUrl")]))
			.await
			.expect("request should complete")
			.unwrap();
		assert_eq!(result, vec![json!("https://example.org")]);
	}

	#[tokio::test]
	async fn progress_deliveries_precede_the_outcome() {
		let core = PrivilegedCore::new(CoreConfig::default());
		core.router().register("vault.import.run", |responder, _args| {
			responder.progress(vec![json!("25%")]);
			responder.progress(vec![json!("75%")]);
			responder.success(vec![json!({"imported": 12})]);
		});

		let surface = core.attach_surface(TabId(1), "Import");
		pump(&surface);
		let correlator = RequestCorrelator::new(Arc::clone(&surface));

		let progress = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&progress);
		let options = RequestOptions::new().on_progress(move |payload| {
			sink.lock().push(payload.to_vec());
		});
		let result = tokio::time::timeout(TICK, correlator.request_with("vault.import.run", vec![], options))
			.await
			.expect("request should complete")
			.unwrap();

		assert_eq!(*progress.lock(), vec![vec![json!("25%")], vec![json!("75%")]]);
		assert_eq!(result, vec![json!({"imported": 12})]);
	}

	#[tokio::test]
	async fn error_completion_surfaces_the_handler_message() {
		let core = PrivilegedCore::new(CoreConfig::default());
		core.router().register("vault.keyring.import", |responder, _args| {
			responder.error(vec![json!({"message": "bad key"})]);
		});

		let surface = core.attach_surface(TabId(1), "Setup");
		pump(&surface);
		let correlator = RequestCorrelator::new(Arc::clone(&surface));

		let outcome = tokio::time::timeout(TICK, correlator.request("vault.keyring.import", vec![]))
			.await
			.expect("request should complete");
		assert_eq!(
			outcome,
			Err(RequestError::Remote {
				message: "bad key".into()
			})
		);
	}

	#[tokio::test]
	async fn duplicate_terminal_outcomes_are_dropped() {
		let core = PrivilegedCore::new(CoreConfig::default());
		core.router().register("vault.config.read", |responder, _args| {
			let duplicate = responder.clone();
			let late = responder.clone();
			responder.success(vec![json!("first")]);
			duplicate.success(vec![json!("second")]);
			late.progress(vec![json!("stale")]);
		});

		let surface = core.attach_surface(TabId(1), "App");
		pump(&surface);
		let correlator = RequestCorrelator::new(Arc::clone(&surface));

		let result = tokio::time::timeout(TICK, correlator.request("vault.config.read", vec![]))
			.await
			.expect("request should complete")
			.unwrap();
		assert_eq!(result, vec![json!("first")]);
	}

	#[tokio::test]
	async fn routed_envelope_reaches_the_named_sibling_surface() {
		let core = PrivilegedCore::new(CoreConfig::default());
		let tab = TabId(4);

		let share = core.attach_surface(tab, "Share");
		let autocomplete = core.attach_surface(tab, "ShareAutocomplete");
		pump(&autocomplete);

		let bus = EventBus::new(Arc::clone(&autocomplete));
		let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
		bus.on("vault.share.autocomplete.reset", move |args| {
			let _ = seen_tx.send(args.to_vec());
		});

		share.send(WireMessage::Routed {
			target: "ShareAutocomplete".into(),
			tab,
			inner: Box::new(WireMessage::Event {
				name: "vault.share.autocomplete.reset".into(),
				args: vec![json!(["ada"])],
			}),
		});

		let args = tokio::time::timeout(TICK, seen_rx.recv())
			.await
			.expect("reset should arrive")
			.unwrap();
		assert_eq!(args, vec![json!(["ada"])]);
	}

	#[tokio::test]
	async fn routed_envelope_to_a_missing_worker_is_dropped() {
		let core = PrivilegedCore::new(CoreConfig::default());
		core.router().register("vault.config.read", |responder, _args| {
			responder.success(vec![json!("alive")]);
		});
		let tab = TabId(4);
		let share = core.attach_surface(tab, "Share");
		pump(&share);

		share.send(WireMessage::Routed {
			target: "Ghost".into(),
			tab,
			inner: Box::new(WireMessage::Event {
				name: "vault.share.autocomplete.reset".into(),
				args: vec![],
			}),
		});

		// The drop must not disturb the channel: a request still completes.
		let correlator = RequestCorrelator::new(Arc::clone(&share));
		let result = tokio::time::timeout(TICK, correlator.request("vault.config.read", vec![]))
			.await
			.expect("request should complete")
			.unwrap();
		assert_eq!(result, vec![json!("alive")]);
	}

	#[tokio::test]
	async fn broadcast_reaches_every_surface_of_the_tab_once() {
		let core = PrivilegedCore::new(CoreConfig::default());
		let tab = TabId(2);
		let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

		// The surfaces and their buses must outlive the broadcast.
		let mut surfaces = Vec::new();
		for name in ["App", "Share"] {
			let surface = core.attach_surface(tab, name);
			pump(&surface);
			let bus = EventBus::new(Arc::clone(&surface));
			let seen_tx = seen_tx.clone();
			bus.on("vault.session.expired", move |_| {
				let _ = seen_tx.send(name);
			});
			surfaces.push((surface, bus));
		}
		let other_tab = core.attach_surface(TabId(3), "App");
		pump(&other_tab);

		assert_eq!(core.broadcast(tab, "vault.session.expired", vec![]), 2);

		let mut recipients = Vec::new();
		for _ in 0..2 {
			recipients.push(
				tokio::time::timeout(TICK, seen_rx.recv())
					.await
					.expect("broadcast should arrive")
					.unwrap(),
			);
		}
		recipients.sort_unstable();
		assert_eq!(recipients, vec!["App", "Share"]);
	}

	#[tokio::test]
	async fn addressed_sends_to_missing_workers_fail_cleanly() {
		let core = PrivilegedCore::new(CoreConfig::default());
		let tab = TabId(1);

		let missing = CoreError::Registry(RegistryError::NoSuchWorker {
			tab,
			name: "App".into(),
		});
		assert_eq!(
			core.message_on(tab, "App", "vault.session.expired", vec![]),
			Err(RegistryError::NoSuchWorker {
				tab,
				name: "App".into()
			})
		);
		assert_eq!(core.request_on(tab, "App", "vault.app.ping", vec![]).await, Err(missing));
		assert_eq!(core.broadcast(tab, "vault.session.expired", vec![]), 0);
	}

	#[tokio::test]
	async fn request_on_reaches_the_surface_and_resolves() {
		let core = PrivilegedCore::new(CoreConfig::default());
		let tab = TabId(1);
		let surface = core.attach_surface(tab, "App");

		// The surface answers privileged-side requests itself.
		let reply = Arc::clone(&surface);
		surface.on("vault.app.ping", move |msg| {
			if let WireMessage::Request { name, token, .. } = msg {
				reply.send(WireMessage::Completion {
					name: name.clone(),
					token: *token,
					status: Status::Success,
					payload: vec![json!("pong")],
				});
			}
		});
		pump(&surface);

		let result = tokio::time::timeout(TICK, core.request_on(tab, "App", "vault.app.ping", vec![]))
			.await
			.expect("request should complete")
			.unwrap();
		assert_eq!(result, vec![json!("pong")]);
	}

	#[tokio::test]
	async fn closing_the_tab_rejects_requests_pending_mid_flight() {
		let core = PrivilegedCore::new(CoreConfig::default());
		// A handler that never answers: the request stays pending until the
		// tab goes away.
		core.router().register("vault.export.run", |_responder, _args| {});

		let tab = TabId(7);
		let surface = core.attach_surface(tab, "Export");
		pump(&surface);
		let correlator = RequestCorrelator::new(Arc::clone(&surface));
		core.store().set(tab, "export.format", json!("kdbx"));

		let outcome = correlator.request("vault.export.run", vec![]);

		let (events_tx, events_rx) = mpsc::unbounded_channel();
		events_tx.send(TabEvent::Closed(tab)).unwrap();
		drop(events_tx);
		tokio::time::timeout(TICK, core.drive_tab_events(events_rx))
			.await
			.expect("tab events should drain");

		assert_eq!(
			tokio::time::timeout(TICK, outcome).await.expect("rejection should arrive"),
			Err(RequestError::ChannelClosed)
		);
		assert!(core.registry().get_all_names(tab).is_empty());
		assert_eq!(core.store().get(tab, "export.format"), None);
	}

	#[tokio::test]
	async fn detach_surface_is_idempotent_at_the_core_level() {
		let core = PrivilegedCore::new(CoreConfig::default());
		let tab = TabId(1);
		let _surface = core.attach_surface(tab, "App");

		assert!(core.detach_surface(tab, "App"));
		assert!(!core.detach_surface(tab, "App"));
	}

	#[tokio::test]
	async fn cores_compose_with_an_injected_store() {
		let store = Arc::new(TabStore::new());
		let registry = Arc::new(WorkerRegistry::with_store(Arc::clone(&store)));
		store.set(TabId(1), "k", json!(1));
		registry.detach_tab(TabId(1));
		assert_eq!(store.get(TabId(1), "k"), None);
	}
}
