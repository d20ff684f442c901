//! Caller key lookup.

use gateway_core::ApiKey;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Read-mostly map of caller keys
#[derive(Debug, Default)]
pub struct KeyManager {
    keys: RwLock<HashMap<String, ApiKey>>,
}

impl KeyManager {
    /// Create an empty manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one key
    pub fn insert(&self, key: ApiKey) {
        self.keys.write().insert(key.key.clone(), key);
    }

    /// Merge keys, replacing entries with the same token
    pub fn extend(&self, keys: impl IntoIterator<Item = ApiKey>) {
        let mut map = self.keys.write();
        for key in keys {
            map.insert(key.key.clone(), key);
        }
    }

    /// Look up a key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<ApiKey> {
        self.keys.read().get(key).cloned()
    }

    /// Number of keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Whether no key is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let manager = KeyManager::new();
        assert!(manager.is_empty());
        manager.insert(ApiKey::new("sk-1", ["a"]));
        manager.extend([ApiKey::new("sk-2", ["b"]), ApiKey::new("sk-1", ["c"])]);
        assert_eq!(manager.len(), 2);
        assert!(manager.get("sk-1").unwrap().allows("c"));
        assert!(manager.get("sk-3").is_none());
    }
}
