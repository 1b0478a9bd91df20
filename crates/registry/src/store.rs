use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use vaultlink_channel::TabId;

/// Transient per-tab state shared by the worker handles of one tab.
///
/// Lets independent surfaces on the same tab hand data to each other (an
/// invited-user list visible to a dialog and its autocomplete, the resource
/// id being shared) without exposing it to the hosted page. Entries never
/// outlive their tab: the registry purges them when the tab's last handle
/// detaches. There is no eviction policy; size is the caller's concern.
#[derive(Default)]
pub struct TabStore {
	inner: Mutex<HashMap<TabId, HashMap<String, Value>>>,
}

impl TabStore {
	/// Creates an empty store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates or overwrites one entry.
	pub fn set(&self, tab: TabId, key: impl Into<String>, value: Value) {
		self.inner.lock().entry(tab).or_default().insert(key.into(), value);
	}

	/// Reads one entry.
	pub fn get(&self, tab: TabId, key: &str) -> Option<Value> {
		self.inner.lock().get(&tab).and_then(|entries| entries.get(key)).cloned()
	}

	/// Removes one entry, returning its value.
	pub fn remove(&self, tab: TabId, key: &str) -> Option<Value> {
		let mut inner = self.inner.lock();
		let entries = inner.get_mut(&tab)?;
		let value = entries.remove(key);
		if entries.is_empty() {
			inner.remove(&tab);
		}
		value
	}

	/// Drops every entry of one tab. Returns the number purged.
	pub fn purge_tab(&self, tab: TabId) -> usize {
		self.inner.lock().remove(&tab).map_or(0, |entries| entries.len())
	}

	/// Number of entries currently held for one tab.
	pub fn entry_count(&self, tab: TabId) -> usize {
		self.inner.lock().get(&tab).map_or(0, HashMap::len)
	}
}
