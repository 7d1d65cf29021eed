use std::collections::HashMap;

/// Conversation id used when the caller supplies none.
pub(crate) const DEFAULT_CONVERSATION_ID: &str = "_default";

/// Soft cache mapping a caller conversation id to the server-side thread id.
/// At capacity the whole map is evicted rather than tracking recency: threads
/// are cheap to recreate, and a miss costs one `thread/start`.
pub(crate) struct ThreadRegistry {
    capacity: usize,
    map: HashMap<String, String>,
}

impl ThreadRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<String> {
        self.map.get(conversation_id).cloned()
    }

    pub fn insert(&mut self, conversation_id: String, thread_id: String) {
        if self.map.len() >= self.capacity && !self.map.contains_key(&conversation_id) {
            tracing::debug!(
                evicted = self.map.len(),
                "thread registry at capacity; evicting all entries"
            );
            self.map.clear();
        }
        self.map.insert(conversation_id, thread_id);
    }

    /// Forget every mapping. Called when the subprocess dies: its thread ids
    /// are meaningless to the next child.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_round_trip() {
        let mut registry = ThreadRegistry::new(100);
        assert_eq!(registry.get("conv-1"), None);
        registry.insert("conv-1".to_string(), "thr_1".to_string());
        assert_eq!(registry.get("conv-1").as_deref(), Some("thr_1"));
    }

    #[test]
    fn capacity_triggers_wholesale_eviction() {
        let mut registry = ThreadRegistry::new(100);
        for i in 0..100 {
            registry.insert(format!("conv-{i}"), format!("thr_{i}"));
            assert!(registry.len() <= 100);
        }
        assert_eq!(registry.len(), 100);

        registry.insert("conv-100".to_string(), "thr_100".to_string());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("conv-100").as_deref(), Some("thr_100"));
        assert_eq!(registry.get("conv-0"), None);
    }

    #[test]
    fn reinserting_existing_key_does_not_evict() {
        let mut registry = ThreadRegistry::new(2);
        registry.insert("a".to_string(), "thr_a".to_string());
        registry.insert("b".to_string(), "thr_b".to_string());
        registry.insert("a".to_string(), "thr_a2".to_string());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("a").as_deref(), Some("thr_a2"));
        assert_eq!(registry.get("b").as_deref(), Some("thr_b"));
    }

    #[test]
    fn clear_forgets_everything() {
        let mut registry = ThreadRegistry::new(100);
        registry.insert("a".to_string(), "thr_a".to_string());
        registry.clear();
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.get("a"), None);
    }
}
