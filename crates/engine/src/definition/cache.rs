//! LRU cache of parsed process definitions

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use uuid::Uuid;

use super::model::ProcessModel;

/// Parsed models keyed by definition id
///
/// A limit of zero or below means unbounded.
pub struct DefinitionCache {
    entries: Mutex<LruCache<Uuid, Arc<ProcessModel>>>,
    limit: i32,
}

impl DefinitionCache {
    pub fn new(limit: i32) -> Self {
        let entries = match usize::try_from(limit).ok().and_then(NonZeroUsize::new) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(entries),
            limit,
        }
    }

    pub fn get(&self, definition_id: &Uuid) -> Option<Arc<ProcessModel>> {
        self.entries.lock().get(definition_id).cloned()
    }

    pub fn insert(&self, definition_id: Uuid, model: Arc<ProcessModel>) {
        self.entries.lock().put(definition_id, model);
    }

    pub fn remove(&self, definition_id: &Uuid) {
        self.entries.lock().pop(definition_id);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured limit
    pub fn limit(&self) -> i32 {
        self.limit
    }
}

impl std::fmt::Debug for DefinitionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefinitionCache")
            .field("limit", &self.limit)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{parse_definition, ParseOptions, SourceFormat};

    fn model(key: &str) -> Arc<ProcessModel> {
        let source = format!(
            r#"{{"key":"{key}","elements":[{{"id":"s","type":"start_event"}},{{"id":"e","type":"end_event"}}],"flows":[{{"id":"f","source":"s","target":"e"}}]}}"#
        );
        Arc::new(parse_definition(&source, SourceFormat::Json, &ParseOptions::default()).unwrap())
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = DefinitionCache::new(2);
        let (a, b, c) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        cache.insert(a, model("a"));
        cache.insert(b, model("b"));
        assert!(cache.get(&a).is_some());
        cache.insert(c, model("c"));

        assert!(cache.get(&b).is_none());
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&c).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_non_positive_limit_is_unbounded() {
        let cache = DefinitionCache::new(-1);
        for i in 0..300 {
            cache.insert(Uuid::now_v7(), model(&format!("p{i}")));
        }
        assert_eq!(cache.len(), 300);
        assert_eq!(cache.limit(), -1);
    }
}
