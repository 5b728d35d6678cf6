//! Error types for daemon operations.

use std::io;

use fabric_ipam::AllocatorError;
use fabric_ovsdb::OvsError;
use fabric_store::StoreError;
use fabric_types::Ipv4Subnet;
use thiserror::Error;

/// Result type alias for daemon operations.
pub type FabricResult<T> = Result<T, FabricError>;

/// Errors that can occur while managing networks and attachments.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Failed to spawn a shell command.
    #[error("failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// No network record with this id.
    #[error("network '{0}' not found")]
    NetworkNotFound(String),

    /// A network was re-created with a different subnet. Networks are
    /// immutable once created.
    #[error("network '{id}' already exists with subnet {stored}, requested {requested}")]
    SubnetMismatch {
        /// Network id.
        id: String,
        /// Subnet in the stored record.
        stored: Ipv4Subnet,
        /// Subnet the caller supplied.
        requested: Ipv4Subnet,
    },

    /// No tracked connection for this container.
    #[error("no connection for container '{0}'")]
    ConnectionNotFound(String),

    /// An attachment step failed. Completed steps have been rolled back.
    #[error("attachment step '{step}' failed: {source}")]
    Attachment {
        /// Name of the failing step.
        step: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<FabricError>,
    },

    /// A namespace-level operation failed.
    #[error("namespace operation '{operation}' failed: {message}")]
    Namespace {
        /// The operation that failed (e.g., "setns", "bind").
        operation: String,
        /// Error message.
        message: String,
    },

    /// A freshly created interface never became visible to the kernel.
    #[error("interface '{0}' did not appear within the wait budget")]
    InterfaceNotVisible(String),

    /// Every candidate subnet for the default network overlaps an existing
    /// route.
    #[error("no unused subnet available for the default network")]
    NoAvailableSubnet,

    /// A record read back from the store did not decode.
    #[error("invalid record for '{id}': {message}")]
    InvalidRecord {
        /// Record key.
        id: String,
        /// Decode error.
        message: String,
    },

    /// Switch protocol failure.
    #[error(transparent)]
    Switch(#[from] OvsError),

    /// Resource allocation failure.
    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    /// KV store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failed to parse a network primitive.
    #[error(transparent)]
    Parse(#[from] fabric_types::ParseError),
}

impl FabricError {
    /// Creates a namespace error.
    pub fn namespace(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Namespace {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Wraps an error as a failed attachment step.
    pub fn attachment(step: &'static str, source: FabricError) -> Self {
        Self::Attachment {
            step,
            source: Box::new(source),
        }
    }
}
