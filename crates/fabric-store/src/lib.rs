//! Key/value store client for cluster-wide state.
//!
//! All persistent fabric state (network records, allocation bitmaps) lives in
//! an external distributed KV store reached through the [`Store`] trait. The
//! store is treated as an opaque service: the only consistency primitive the
//! fabric relies on is a linearizable per-key compare-and-swap, surfaced here
//! as [`Store::put`] with an expected previous value.
//!
//! Two implementations are provided:
//!
//! - [`ConsulStore`]: the production backend, speaking the Consul HTTP KV
//!   API (`?cas=` writes against the entry's ModifyIndex)
//! - [`MemoryStore`]: an in-process map with the same CAS contract, used by
//!   tests and for single-host operation without an agent

mod consul;
mod memory;

pub use consul::{ConsulConfig, ConsulStore};
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from KV store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store connection error: {0}")]
    Connection(String),

    /// A request reached the store but failed.
    #[error("store request failed: {operation}: {message}")]
    Request {
        /// The operation that failed (e.g., "get", "put").
        operation: String,
        /// Error message.
        message: String,
    },

    /// A compare-and-swap write lost against a concurrent update.
    ///
    /// Callers performing optimistic updates re-read and retry on this.
    #[error("value changed since read (CAS conflict)")]
    Outdated,

    /// The stored value could not be decoded.
    #[error("invalid stored data: {0}")]
    Decode(String),
}

impl StoreError {
    /// Creates a request error.
    pub fn request(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error is a CAS conflict.
    pub fn is_outdated(&self) -> bool {
        matches!(self, StoreError::Outdated)
    }
}

/// A stored value together with its version.
///
/// The version is whatever the backend uses to detect concurrent updates
/// (Consul's ModifyIndex, a counter for the in-memory store). It is opaque to
/// callers; CAS is expressed in terms of expected *values*, mirroring the
/// read-compare-write discipline of the store agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    /// The key within its namespace.
    pub key: String,
    /// The raw stored bytes.
    pub value: Vec<u8>,
    /// Backend version of this entry.
    pub version: u64,
}

/// Client interface to the distributed KV store.
///
/// Keys are grouped into flat namespaces (`space`): the fabric uses
/// `network` for network records, `vlan` for the global VLAN bitmap, and
/// `ipam` for per-subnet IP bitmaps.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads a key. Returns `None` when the key does not exist.
    async fn get(&self, space: &str, key: &str) -> StoreResult<Option<StoreEntry>>;

    /// Writes a key, guarded by the expected previous value.
    ///
    /// With `expected = None` the write succeeds only if the key does not
    /// exist yet (first-writer-wins creation). With `expected = Some(bytes)`
    /// the write succeeds only if the current value still equals `bytes`.
    /// A mismatch in either mode yields [`StoreError::Outdated`].
    async fn put(
        &self,
        space: &str,
        key: &str,
        value: &[u8],
        expected: Option<&[u8]>,
    ) -> StoreResult<()>;

    /// Deletes a key. Deleting an absent key is not an error.
    async fn delete(&self, space: &str, key: &str) -> StoreResult<()>;

    /// Lists every entry in a namespace.
    async fn get_all(&self, space: &str) -> StoreResult<Vec<StoreEntry>>;
}
