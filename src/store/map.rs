//! Named concurrent map with atomic per-key processors.

use crate::store::events::{MapEvent, MapListener};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// View of a single entry handed to a processor by [`NamedMap::invoke`].
///
/// Changes are written back when the processor returns.
#[derive(Debug)]
pub struct InvocableEntry<'a, V> {
    key: &'a str,
    value: Option<V>,
}

impl<V: Clone + Default> InvocableEntry<'_, V> {
    /// The entry key.
    pub fn key(&self) -> &str {
        self.key
    }

    /// Whether the entry currently has a value.
    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    /// The current value.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Mutable access to the current value.
    pub fn value_mut(&mut self) -> Option<&mut V> {
        self.value.as_mut()
    }

    /// The current value, or the default when absent.
    pub fn value_or_default(&self) -> V {
        self.value.clone().unwrap_or_default()
    }

    /// Replace the value.
    pub fn set_value(&mut self, value: V) {
        self.value = Some(value);
    }

    /// Remove the entry.
    pub fn remove(&mut self) {
        self.value = None;
    }
}

/// A named map whose entries are only mutated through atomic processors.
///
/// [`invoke`](Self::invoke) runs under the key's shard write lock, so updates
/// to the same key are serialized no matter which thread issues them.
/// Listeners are told about every committed change once that lock has been
/// released.
pub struct NamedMap<V> {
    name: String,
    entries: DashMap<String, V>,
    key_listeners: RwLock<HashMap<String, Vec<Arc<dyn MapListener<V>>>>>,
    listeners: RwLock<Vec<Arc<dyn MapListener<V>>>>,
}

impl<V> NamedMap<V>
where
    V: Clone + Default + PartialEq + Send + Sync + 'static,
{
    /// Create an empty map.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            key_listeners: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// The map name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Atomically apply `processor` to the entry for `key`.
    ///
    /// The processor must not touch this map again; it runs while the key's
    /// shard is locked. A value left unchanged is not written back and
    /// produces no event.
    pub fn invoke<R>(&self, key: &str, processor: impl FnOnce(&mut InvocableEntry<'_, V>) -> R) -> R {
        let (result, event) = {
            let slot = self.entries.entry(key.to_string());
            let original = match &slot {
                Entry::Occupied(occupied) => Some(occupied.get().clone()),
                Entry::Vacant(_) => None,
            };

            let mut entry = InvocableEntry {
                key,
                value: original.clone(),
            };
            let result = processor(&mut entry);

            let event = if entry.value != original {
                match (slot, entry.value.clone()) {
                    (Entry::Occupied(mut occupied), Some(value)) => {
                        occupied.insert(value);
                    }
                    (Entry::Occupied(occupied), None) => {
                        occupied.remove();
                    }
                    (Entry::Vacant(vacant), Some(value)) => {
                        vacant.insert(value);
                    }
                    (Entry::Vacant(_), None) => {}
                }
                Some(MapEvent::new(&self.name, key, original, entry.value))
            } else {
                None
            };
            (result, event)
        };

        if let Some(event) = event {
            trace!(map = %self.name, key, kind = ?event.kind, "Entry changed");
            self.dispatch(&event);
        }
        result
    }

    /// Current value for `key`.
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|value| value.clone())
    }

    /// Whether `key` has a value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Store `value` under `key`, notifying listeners.
    pub fn put(&self, key: &str, value: V) {
        self.invoke(key, |entry| entry.set_value(value));
    }

    /// Remove `key`, notifying listeners.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.invoke(key, |entry| {
            let old = entry.value().cloned();
            entry.remove();
            old
        })
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Point-in-time copy of all entries, sorted by key.
    pub fn entries(&self) -> Vec<(String, V)> {
        let mut entries: Vec<(String, V)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, notifying listeners.
    pub fn clear(&self) {
        for key in self.keys() {
            self.remove(&key);
        }
    }

    /// Listen for changes to a single key.
    pub fn add_key_listener(&self, key: &str, listener: Arc<dyn MapListener<V>>) {
        self.key_listeners
            .write()
            .entry(key.to_string())
            .or_default()
            .push(listener);
    }

    /// Listen for changes to any key.
    pub fn add_listener(&self, listener: Arc<dyn MapListener<V>>) {
        self.listeners.write().push(listener);
    }

    fn dispatch(&self, event: &MapEvent<V>) {
        let mut targets: Vec<Arc<dyn MapListener<V>>> = self
            .key_listeners
            .read()
            .get(&event.key)
            .cloned()
            .unwrap_or_default();
        targets.extend(self.listeners.read().iter().cloned());

        for listener in targets {
            listener.on_event(event);
        }
    }
}

impl<V> std::fmt::Debug for NamedMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMap")
            .field("name", &self.name)
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::events::MapEventKind;
    use parking_lot::Mutex;
    use std::thread;

    fn recording(map: &NamedMap<u32>, key: Option<&str>) -> Arc<Mutex<Vec<MapEvent<u32>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn MapListener<u32>> =
            Arc::new(move |event: &MapEvent<u32>| sink.lock().push(event.clone()));
        match key {
            Some(key) => map.add_key_listener(key, listener),
            None => map.add_listener(listener),
        }
        seen
    }

    #[test]
    fn test_invoke_stores_value_and_returns_result() {
        let map = NamedMap::<u32>::new("counters");

        let result = map.invoke("a", |entry| {
            assert!(!entry.is_present());
            entry.set_value(entry.value_or_default() + 5);
            "done"
        });

        assert_eq!(result, "done");
        assert_eq!(map.get("a"), Some(5));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_unchanged_value_emits_no_event() {
        let map = NamedMap::<u32>::new("counters");
        let seen = recording(&map, None);

        map.put("a", 1);
        map.invoke("a", |entry| entry.set_value(1));
        map.invoke("missing", |entry| entry.value().copied());

        assert_eq!(seen.lock().len(), 1);
        assert!(!map.contains_key("missing"));
    }

    #[test]
    fn test_key_listener_sees_only_its_key() {
        let map = NamedMap::<u32>::new("counters");
        let seen_a = recording(&map, Some("a"));

        map.put("a", 1);
        map.put("b", 1);
        map.put("a", 2);
        map.remove("a");

        let kinds: Vec<_> = seen_a.lock().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MapEventKind::Inserted,
                MapEventKind::Updated,
                MapEventKind::Deleted
            ]
        );
        let last = seen_a.lock().last().cloned().unwrap();
        assert_eq!(last.old_value, Some(2));
        assert_eq!(last.new_value, None);
        assert_eq!(last.map, "counters");
    }

    #[test]
    fn test_concurrent_invocations_are_serialized() {
        let map = Arc::new(NamedMap::<u32>::new("counters"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = map.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        map.invoke("n", |entry| entry.set_value(entry.value_or_default() + 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.get("n"), Some(4000));
    }

    #[test]
    fn test_entries_are_sorted_and_clear_removes_all() {
        let map = NamedMap::<u32>::new("counters");
        map.put("b", 2);
        map.put("a", 1);

        assert_eq!(map.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(map.entries(), vec![("a".to_string(), 1), ("b".to_string(), 2)]);

        map.clear();
        assert!(map.is_empty());
    }
}
