//! Bounded in-memory hot layer with least-recently-used eviction

use linked_hash_map::LinkedHashMap;
use std::sync::Arc;

/// Front of the map is the least recently used entry
pub(crate) struct MemoryLayer {
    capacity: usize,
    entries: LinkedHashMap<String, Arc<Vec<u8>>>,
}

impl MemoryLayer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: LinkedHashMap::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.entries.get_refresh(key).map(|value| value.clone())
    }

    pub fn insert(&mut self, key: &str, value: Arc<Vec<u8>>) {
        if self.capacity == 0 {
            return;
        }
        // Re-inserting an existing key moves it to the back
        self.entries.insert(key.to_string(), value);
        while self.entries.len() > self.capacity {
            if self.entries.pop_front().is_none() {
                break;
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }
        keys.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
