//! Run-scoped key/value store shared between tasks.
//!
//! A task records data (for example channel identifiers) under a namespace
//! and key; later tasks in the same run read it back, either directly or via
//! `${store.<namespace>.<key>.<path>}` placeholders in their configuration.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

#[derive(Debug, Default)]
pub struct RunStore {
    entries: Mutex<HashMap<(String, String), Value>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, namespace: &str, key: &str, value: Value) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert((namespace.to_string(), key.to_string()), value);
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    /// Resolve a dotted path `namespace.key[.field...]`. Numeric segments
    /// index into arrays.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let namespace = segments.next()?;
        let key = segments.next()?;
        let mut current = self.get(namespace, key)?;
        for segment in segments {
            current = match current {
                Value::Object(mut map) => map.remove(segment)?,
                Value::Array(mut items) => {
                    let index: usize = segment.parse().ok()?;
                    if index >= items.len() {
                        return None;
                    }
                    items.swap_remove(index)
                }
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
