//! External index contract consumed by `EmailStore`.
//!
//! The core never assumes a particular backing store for the three
//! ordered string->string maps (envelope-hash, content-hash,
//! message-id) it dedups against — they are opaque collaborators.
//! `BTreeMapIndex` below is an in-memory reference implementation good
//! enough for tests and the demo CLI; production callers supply their
//! own (an LSM tree, a SQL table, whatever already exists).

use std::collections::BTreeMap;
use std::sync::RwLock;

/// Ordered `get`/`put` contract. Durability, if any, must be at least as
/// strong as the block file's between flushes — the core does not
/// enforce this, it only documents the expectation.
pub trait ExternalIndex: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str);
}

/// In-memory reference implementation backed by a `BTreeMap`, guarded by
/// an `RwLock` so it can be shared across the same concurrency model as
/// `BlockIndex`. Not a production index — serde_json (de)serialization
/// is provided for tests/demo persistence only.
#[derive(Default)]
pub struct BTreeMapIndex {
    inner: RwLock<BTreeMap<String, String>>,
}

impl BTreeMapIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let snapshot = self.inner.read().expect("index poisoned").clone();
        serde_json::to_vec(&snapshot)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let map: BTreeMap<String, String> = serde_json::from_slice(bytes)?;
        Ok(Self {
            inner: RwLock::new(map),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExternalIndex for BTreeMapIndex {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.read().expect("index poisoned").get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) {
        self.inner
            .write()
            .expect("index poisoned")
            .insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let idx = BTreeMapIndex::new();
        assert_eq!(idx.get("missing"), None);
        idx.put("envelope-abc", "10:0");
        assert_eq!(idx.get("envelope-abc"), Some("10:0".to_string()));
    }

    #[test]
    fn serialize_round_trips() {
        let idx = BTreeMapIndex::new();
        idx.put("a", "1:0");
        idx.put("b", "1:1");
        let bytes = idx.to_bytes().unwrap();
        let restored = BTreeMapIndex::from_bytes(&bytes).unwrap();
        assert_eq!(restored.get("a"), Some("1:0".to_string()));
        assert_eq!(restored.len(), 2);
    }
}
