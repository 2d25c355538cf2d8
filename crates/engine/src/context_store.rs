//! Write-once mapping from a completed work item to the context blob it
//! produced. Children read their parent's entry for affinity and for retry
//! resumption; the map is never mutated after first write for a given id.

use std::collections::HashMap;
use std::sync::Mutex;

use swarmforge_core::{Payload, WorkItemId};

#[derive(Default)]
pub struct ContextStore {
    blobs: Mutex<HashMap<WorkItemId, Payload>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `blob` for `item_id` if nothing has been stored yet. A second
    /// write for the same id is a no-op — the store is write-once.
    pub fn put(&self, item_id: WorkItemId, blob: Payload) {
        let mut blobs = self.blobs.lock().expect("context store mutex poisoned");
        blobs.entry(item_id).or_insert(blob);
    }

    /// By-value copy of a stored context blob, if any.
    pub fn get(&self, item_id: WorkItemId) -> Option<Payload> {
        self.blobs
            .lock()
            .expect("context store mutex poisoned")
            .get(&item_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_write_for_same_id_is_ignored() {
        let store = ContextStore::new();
        store.put(WorkItemId(1), Payload::new(b"first".to_vec()));
        store.put(WorkItemId(1), Payload::new(b"second".to_vec()));
        assert_eq!(store.get(WorkItemId(1)).unwrap().as_bytes(), b"first");
    }

    #[test]
    fn missing_id_returns_none() {
        let store = ContextStore::new();
        assert!(store.get(WorkItemId(99)).is_none());
    }
}
