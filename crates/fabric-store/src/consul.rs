//! Consul HTTP KV backend.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use crate::{Store, StoreEntry, StoreError, StoreResult};

/// Configuration for the Consul backend.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Base URL of the local agent (e.g., `http://127.0.0.1:8500`).
    pub base_url: String,
}

impl ConsulConfig {
    /// Creates a config pointing at the given agent URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Config for the default local agent address.
    pub fn local() -> Self {
        Self::new("http://127.0.0.1:8500")
    }

    fn kv_url(&self, space: &str, key: &str) -> String {
        format!("{}/v1/kv/{}/{}", self.base_url, space, key)
    }
}

/// One entry of a Consul KV read response. Values come back base64-encoded.
#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
    #[serde(rename = "Value")]
    value: Option<String>,
}

impl KvPair {
    fn into_entry(self, space: &str) -> StoreResult<StoreEntry> {
        let encoded = self.value.unwrap_or_default();
        let value = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| StoreError::Decode(format!("{}: {}", self.key, e)))?;
        // Consul returns the full path; strip the namespace prefix.
        let key = self
            .key
            .strip_prefix(&format!("{}/", space))
            .unwrap_or(&self.key)
            .to_string();
        Ok(StoreEntry {
            key,
            value,
            version: self.modify_index,
        })
    }
}

/// [`Store`] backed by a local Consul agent's HTTP KV API.
///
/// Compare-and-swap writes ride on Consul's `?cas=<ModifyIndex>` parameter;
/// per-key linearizability is provided by the agent's server quorum.
pub struct ConsulStore {
    config: ConsulConfig,
    client: reqwest::Client,
}

impl ConsulStore {
    /// Creates a store client for the given agent.
    pub fn new(config: ConsulConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn read(&self, url: &str) -> StoreResult<Option<Vec<KvPair>>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StoreError::Connection(format!("{}: {}", url, e)))?;

        debug!(url = %url, status = %resp.status(), "store read");
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(StoreError::request("get", resp.status().to_string()));
        }

        let pairs: Vec<KvPair> = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(Some(pairs))
    }
}

#[async_trait]
impl Store for ConsulStore {
    async fn get(&self, space: &str, key: &str) -> StoreResult<Option<StoreEntry>> {
        let url = self.config.kv_url(space, key);
        let Some(pairs) = self.read(&url).await? else {
            return Ok(None);
        };
        let pair = pairs
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode("empty KV response".to_string()))?;
        pair.into_entry(space).map(Some)
    }

    async fn put(
        &self,
        space: &str,
        key: &str,
        value: &[u8],
        expected: Option<&[u8]>,
    ) -> StoreResult<()> {
        // Read-compare-write: the ModifyIndex observed here guards the CAS,
        // and the value comparison rejects writers holding a stale snapshot
        // even before the round trip.
        let current = self.get(space, key).await?;
        let cas_index = match (&current, expected) {
            (Some(entry), Some(expected)) => {
                if entry.value.as_slice() != expected {
                    return Err(StoreError::Outdated);
                }
                entry.version
            }
            (Some(_), None) => return Err(StoreError::Outdated),
            // Absent key: cas=0 makes the write a pure create.
            (None, _) => 0,
        };

        let url = format!("{}?cas={}", self.config.kv_url(space, key), cas_index);
        debug!(url = %url, "store put");
        let resp = self
            .client
            .put(&url)
            .body(value.to_vec())
            .send()
            .await
            .map_err(|e| StoreError::Connection(format!("{}: {}", url, e)))?;

        if !resp.status().is_success() {
            return Err(StoreError::request("put", resp.status().to_string()));
        }

        // Consul answers the CAS verdict as a bare boolean body.
        let body = resp
            .text()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        if body.trim() == "true" {
            Ok(())
        } else {
            Err(StoreError::Outdated)
        }
    }

    async fn delete(&self, space: &str, key: &str) -> StoreResult<()> {
        let url = self.config.kv_url(space, key);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| StoreError::Connection(format!("{}: {}", url, e)))?;

        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(StoreError::request("delete", resp.status().to_string()))
        }
    }

    async fn get_all(&self, space: &str) -> StoreResult<Vec<StoreEntry>> {
        let url = format!("{}/v1/kv/{}?recurse", self.config.base_url, space);
        let Some(pairs) = self.read(&url).await? else {
            return Ok(Vec::new());
        };
        pairs.into_iter().map(|p| p.into_entry(space)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kv_url() {
        let config = ConsulConfig::local();
        assert_eq!(
            config.kv_url("network", "default"),
            "http://127.0.0.1:8500/v1/kv/network/default"
        );
    }

    #[test]
    fn test_kv_pair_decode() {
        let json = r#"[{"CreateIndex":5,"ModifyIndex":9,"LockIndex":0,"Key":"network/default","Flags":0,"Value":"eyJpZCI6ImRlZmF1bHQifQ=="}]"#;
        let pairs: Vec<KvPair> = serde_json::from_str(json).unwrap();
        let entry = pairs.into_iter().next().unwrap().into_entry("network").unwrap();

        assert_eq!(entry.key, "default");
        assert_eq!(entry.version, 9);
        assert_eq!(entry.value, br#"{"id":"default"}"#);
    }

    #[test]
    fn test_kv_pair_null_value() {
        let json = r#"[{"ModifyIndex":3,"Key":"vlan/vlan","Value":null}]"#;
        let pairs: Vec<KvPair> = serde_json::from_str(json).unwrap();
        let entry = pairs.into_iter().next().unwrap().into_entry("vlan").unwrap();
        assert!(entry.value.is_empty());
    }
}
