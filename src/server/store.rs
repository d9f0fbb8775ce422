//! In-memory JSON resource store backing the demo API.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::{Map, Value};
use uuid::Uuid;

type Collection = BTreeMap<String, Value>;

/// Collections of JSON objects keyed by collection name and id.
#[derive(Debug, Default)]
pub struct ResourceStore {
    collections: RwLock<BTreeMap<String, Collection>>,
}

/// Object stored under `id`, with the id field set.
fn with_id(mut object: Map<String, Value>, id: &str) -> Value {
    object.insert("id".to_string(), Value::String(id.to_string()));
    Value::Object(object)
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self, collection: &str) -> Vec<Value> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        collections.get(collection)?.get(id).cloned()
    }

    /// Insert a new object. Uses the object's `id` (or `name`) when present,
    /// otherwise a fresh UUID.
    pub fn create(&self, collection: &str, object: Map<String, Value>) -> Value {
        let id = ["id", "name"]
            .iter()
            .find_map(|key| match object.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let stored = with_id(object, &id);
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, stored.clone());
        stored
    }

    /// Replace or insert the object at `id`. Returns the stored object and
    /// whether it previously existed.
    pub fn put(&self, collection: &str, id: &str, object: Map<String, Value>) -> (Value, bool) {
        let stored = with_id(object, id);
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        let existed = collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), stored.clone())
            .is_some();
        (stored, existed)
    }

    /// Shallow-merge `patch` into an existing object.
    pub fn patch(&self, collection: &str, id: &str, patch: Map<String, Value>) -> Option<Value> {
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        let current = collections.get_mut(collection)?.get_mut(id)?;
        if let Value::Object(fields) = current {
            for (key, value) in patch {
                if key != "id" {
                    fields.insert(key, value);
                }
            }
        }
        Some(current.clone())
    }

    pub fn delete(&self, collection: &str, id: &str) -> Option<Value> {
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        collections.get_mut(collection)?.remove(id)
    }
}
