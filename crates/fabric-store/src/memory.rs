//! In-process store backend with the same CAS contract as the agent.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{Store, StoreEntry, StoreError, StoreResult};

/// An in-memory [`Store`].
///
/// Byte-equality compare-and-swap over a mutex-guarded map. Used by tests and
/// when the daemon runs without a store agent; state does not survive the
/// process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), (Vec<u8>, u64)>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, space: &str, key: &str) -> StoreResult<Option<StoreEntry>> {
        let entries = self.entries.lock().expect("store mutex poisoned");
        Ok(entries
            .get(&(space.to_string(), key.to_string()))
            .map(|(value, version)| StoreEntry {
                key: key.to_string(),
                value: value.clone(),
                version: *version,
            }))
    }

    async fn put(
        &self,
        space: &str,
        key: &str,
        value: &[u8],
        expected: Option<&[u8]>,
    ) -> StoreResult<()> {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        let map_key = (space.to_string(), key.to_string());

        match (entries.get(&map_key), expected) {
            (Some((current, _)), Some(expected)) if current.as_slice() != expected => {
                return Err(StoreError::Outdated);
            }
            (Some(_), None) => return Err(StoreError::Outdated),
            _ => {}
        }

        let version = entries.get(&map_key).map(|(_, v)| v + 1).unwrap_or(1);
        entries.insert(map_key, (value.to_vec(), version));
        Ok(())
    }

    async fn delete(&self, space: &str, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        entries.remove(&(space.to_string(), key.to_string()));
        Ok(())
    }

    async fn get_all(&self, space: &str) -> StoreResult<Vec<StoreEntry>> {
        let entries = self.entries.lock().expect("store mutex poisoned");
        let mut result: Vec<StoreEntry> = entries
            .iter()
            .filter(|((s, _), _)| s == space)
            .map(|((_, key), (value, version))| StoreEntry {
                key: key.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect();
        result.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryStore::new();
        assert!(store.get("network", "default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let store = MemoryStore::new();
        store.put("network", "default", b"v1", None).await.unwrap();

        let entry = store.get("network", "default").await.unwrap().unwrap();
        assert_eq!(entry.value, b"v1");
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn test_create_only_conflict() {
        let store = MemoryStore::new();
        store.put("network", "default", b"v1", None).await.unwrap();

        let err = store
            .put("network", "default", b"v2", None)
            .await
            .unwrap_err();
        assert!(err.is_outdated());
    }

    #[tokio::test]
    async fn test_cas_update() {
        let store = MemoryStore::new();
        store.put("vlan", "vlan", b"aaaa", None).await.unwrap();

        store
            .put("vlan", "vlan", b"bbbb", Some(b"aaaa"))
            .await
            .unwrap();

        let entry = store.get("vlan", "vlan").await.unwrap().unwrap();
        assert_eq!(entry.value, b"bbbb");
        assert_eq!(entry.version, 2);
    }

    #[tokio::test]
    async fn test_cas_conflict() {
        let store = MemoryStore::new();
        store.put("vlan", "vlan", b"aaaa", None).await.unwrap();

        let err = store
            .put("vlan", "vlan", b"cccc", Some(b"stale"))
            .await
            .unwrap_err();
        assert!(err.is_outdated());

        // Losing write must not change the stored value
        let entry = store.get("vlan", "vlan").await.unwrap().unwrap();
        assert_eq!(entry.value, b"aaaa");
    }

    #[tokio::test]
    async fn test_cas_create_with_expected() {
        // An absent key accepts any expected value, matching the agent's
        // cas=0 create path.
        let store = MemoryStore::new();
        store
            .put("ipam", "10.0.0.0/24", b"\x00\x00", Some(b"\x00\x00"))
            .await
            .unwrap();
        assert!(store.get("ipam", "10.0.0.0/24").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let store = MemoryStore::new();
        store.put("network", "n1", b"v", None).await.unwrap();
        store.delete("network", "n1").await.unwrap();
        store.delete("network", "n1").await.unwrap();
        assert!(store.get("network", "n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_all_scoped_to_space() {
        let store = MemoryStore::new();
        store.put("network", "a", b"1", None).await.unwrap();
        store.put("network", "b", b"2", None).await.unwrap();
        store.put("ipam", "c", b"3", None).await.unwrap();

        let entries = store.get_all("network").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "a");
        assert_eq!(entries[1].key, "b");
    }
}
