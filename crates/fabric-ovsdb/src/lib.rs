//! OVSDB management-protocol client.
//!
//! This crate keeps a durable JSON-RPC session to the virtual switch daemon
//! and exposes the handful of transactional operations the fabric needs:
//! bridge creation, internal (container/gateway) ports, VXLAN tunnel ports,
//! and port deletion.
//!
//! The client registers a `monitor` on the configuration tables and applies
//! every change notification to a local [`TableMirror`] from a single
//! background task, so readers always observe whole updates. Server-assigned
//! row identifiers are resolved from names through an index maintained as
//! updates arrive. A lost session fails all in-flight requests, makes new
//! operations return [`OvsError::NotConnected`] immediately, and is retried
//! in the background with a fixed delay for as long as the process lives.

mod client;
mod mirror;
mod ops;
mod rpc;

pub use client::{Endpoint, OvsdbClient, OvsdbConfig, CONTEXT_KEY, CONTEXT_VALUE};
pub use mirror::{RemovedRow, Row, RowUpdate, TableMirror, TableUpdates};

use thiserror::Error;

/// Result type alias for switch operations.
pub type OvsResult<T> = Result<T, OvsError>;

/// Errors from the switch protocol client.
#[derive(Debug, Error)]
pub enum OvsError {
    /// No live session to the switch daemon. Fatal to the calling
    /// operation; reconnection continues in the background.
    #[error("switch session is not connected")]
    NotConnected,

    /// The switch reported an error for one operation of a transaction.
    #[error("switch transaction failed at operation {index}: {error}: {details}")]
    Transaction {
        /// Index of the failing operation within the transaction.
        index: usize,
        /// Server-supplied error tag.
        error: String,
        /// Server-supplied detail text.
        details: String,
    },

    /// The peer sent something that is not valid protocol.
    #[error("switch protocol error: {0}")]
    Protocol(String),

    /// Transport-level failure.
    #[error("switch i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl OvsError {
    /// Creates a transaction error.
    pub fn transaction(index: usize, error: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Transaction {
            index,
            error: error.into(),
            details: details.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
