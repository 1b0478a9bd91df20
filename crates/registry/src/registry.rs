//! Registry of worker handles keyed by tab and name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use vaultlink_channel::{ChannelEndpoint, TabId};

use crate::handle::{AttachOptions, WorkerHandle};
use crate::store::TabStore;

/// Failure of an addressed send to a named worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
	/// No handle is attached under the requested `(tab, name)` pair.
	#[error("no worker named {name:?} attached to tab {tab}")]
	NoSuchWorker {
		/// The addressed tab.
		tab: TabId,
		/// The addressed worker name.
		name: String,
	},
}

/// Lifecycle notification from a hosting browser tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabEvent {
	/// The tab closed.
	Closed(TabId),
	/// The tab navigated; its script contexts are gone.
	Navigated(TabId),
}

/// Status snapshot for one attached handle.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
	/// The hosting tab.
	pub tab: TabId,
	/// The surface name.
	pub name: String,
	/// When the handle attached.
	pub attached_at: Instant,
}

/// Privileged-side table of live worker handles, `tab → name → handle`.
///
/// At most one live handle exists per `(tab, name)` at any time: attaching
/// over an existing pair detaches the previous handle first. All mutation
/// happens in arrival order on the privileged event loop; the registry is
/// shared by reference from one composition root, never as an ambient
/// singleton.
pub struct WorkerRegistry {
	tabs: Mutex<HashMap<TabId, HashMap<String, Arc<WorkerHandle>>>>,
	store: Arc<TabStore>,
}

impl Default for WorkerRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl WorkerRegistry {
	/// Creates a registry owning a fresh tab store.
	pub fn new() -> Self {
		Self::with_store(Arc::new(TabStore::new()))
	}

	/// Creates a registry purging the given store on tab teardown.
	pub fn with_store(store: Arc<TabStore>) -> Self {
		Self {
			tabs: Mutex::new(HashMap::new()),
			store,
		}
	}

	/// The tab store purged by this registry.
	pub fn store(&self) -> Arc<TabStore> {
		Arc::clone(&self.store)
	}

	/// Attaches a handle for `(tab, name)`, replacing any existing one.
	///
	/// A reconnect replaces the previous connection rather than coexisting
	/// with it: the old handle is fully detached (its callbacks run, its
	/// channel torn down) before the new one is stored. The replacement does
	/// not purge the tab store; the tab is still alive.
	pub fn attach(&self, name: &str, channel: Arc<ChannelEndpoint>, tab: TabId, options: AttachOptions) -> Arc<WorkerHandle> {
		let previous = self.tabs.lock().get_mut(&tab).and_then(|handles| handles.remove(name));
		if let Some(previous) = previous {
			tracing::debug!(tab = tab.0, name, "registry.replace");
			previous.run_detach();
		}
		let handle = Arc::new(WorkerHandle::new(tab, name, channel, options));
		self.tabs.lock().entry(tab).or_default().insert(name.to_string(), Arc::clone(&handle));
		tracing::debug!(tab = tab.0, name, "registry.attach");
		handle
	}

	/// Detaches the handle for `(tab, name)`.
	///
	/// Idempotent: detaching a missing handle logs a warning and returns
	/// false. When the detached handle was the last one of its tab, the
	/// tab's store entries are purged.
	pub fn detach(&self, name: &str, tab: TabId) -> bool {
		let removed = {
			let mut tabs = self.tabs.lock();
			match tabs.get_mut(&tab) {
				Some(handles) => {
					let handle = handles.remove(name);
					let last = handle.is_some() && handles.is_empty();
					if last {
						tabs.remove(&tab);
					}
					handle.map(|handle| (handle, last))
				}
				None => None,
			}
		};
		let Some((handle, last)) = removed else {
			tracing::warn!(tab = tab.0, name, "registry.detach_missing");
			return false;
		};
		handle.run_detach();
		if last {
			let purged = self.store.purge_tab(tab);
			tracing::debug!(tab = tab.0, purged, "registry.store_purged");
		}
		tracing::debug!(tab = tab.0, name, "registry.detach");
		true
	}

	/// Looks up the live handle for `(tab, name)`.
	///
	/// Returns `None` rather than failing when the tab has no handles at all
	/// or the name is absent. Never returns a handle whose detach already
	/// ran.
	pub fn get(&self, name: &str, tab: TabId) -> Option<Arc<WorkerHandle>> {
		self.tabs.lock().get(&tab).and_then(|handles| handles.get(name)).cloned()
	}

	/// Names of every handle attached to one tab, sorted.
	pub fn get_all_names(&self, tab: TabId) -> Vec<String> {
		let mut names: Vec<String> = self
			.tabs
			.lock()
			.get(&tab)
			.map(|handles| handles.keys().cloned().collect())
			.unwrap_or_default();
		names.sort();
		names
	}

	/// Total number of attached handles across all tabs.
	pub fn active_count(&self) -> usize {
		self.tabs.lock().values().map(HashMap::len).sum()
	}

	/// Snapshots of every attached handle, sorted by tab then name.
	pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
		let mut snapshots: Vec<WorkerSnapshot> = {
			let tabs = self.tabs.lock();
			tabs.values()
				.flat_map(|handles| handles.values())
				.map(|handle| WorkerSnapshot {
					tab: handle.tab(),
					name: handle.name().to_string(),
					attached_at: handle.attached_at(),
				})
				.collect()
		};
		snapshots.sort_by(|a, b| (a.tab, &a.name).cmp(&(b.tab, &b.name)));
		snapshots
	}

	/// Detaches every handle of one tab and purges its store entries.
	///
	/// Returns the number of handles detached. Handles detach in name order.
	pub fn detach_tab(&self, tab: TabId) -> usize {
		let mut handles: Vec<(String, Arc<WorkerHandle>)> = {
			let mut tabs = self.tabs.lock();
			tabs.remove(&tab).map(|handles| handles.into_iter().collect()).unwrap_or_default()
		};
		handles.sort_by(|a, b| a.0.cmp(&b.0));
		for (_, handle) in &handles {
			handle.run_detach();
		}
		let purged = self.store.purge_tab(tab);
		tracing::debug!(tab = tab.0, detached = handles.len(), purged, "registry.detach_tab");
		handles.len()
	}

	/// Applies tab lifecycle events in arrival order until the sender side
	/// is dropped.
	pub async fn drive(&self, mut events: mpsc::UnboundedReceiver<TabEvent>) {
		while let Some(event) = events.recv().await {
			match event {
				TabEvent::Closed(tab) => {
					tracing::debug!(tab = tab.0, "registry.tab_closed");
					self.detach_tab(tab);
				}
				TabEvent::Navigated(tab) => {
					tracing::debug!(tab = tab.0, "registry.tab_navigated");
					self.detach_tab(tab);
				}
			}
		}
	}
}
