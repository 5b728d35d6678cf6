//! Common types for the fabric control plane.
//!
//! This crate provides type-safe representations of the network primitives
//! shared by the allocator, switch client, and daemon:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses, including the
//!   deterministic derivation used for container interfaces
//! - [`Ipv4Subnet`]: IPv4 network prefixes with host-offset arithmetic

mod mac;
mod subnet;

pub use mac::MacAddress;
pub use subnet::Ipv4Subnet;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IPv4 subnet: {0}")]
    InvalidSubnet(String),
}
