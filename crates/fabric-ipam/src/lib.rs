//! Cluster-wide resource allocation for the fabric.
//!
//! IP addresses (one pool per subnet) and VLAN tags (one global pool of 4096)
//! are tracked as bitmaps stored in the KV store, one byte blob per pool. No
//! locks are held across hosts: every allocation is a read-modify-write with
//! a compare-and-swap, retried on conflict. Bit `i` set means offset `i + 1`
//! is in use; offset 0 is never handed out.

mod allocator;
mod bitmap;

pub use allocator::{ResourceAllocator, VLAN_POOL_SIZE};
pub use bitmap::Bitmap;

use fabric_store::StoreError;
use fabric_types::Ipv4Subnet;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Result type alias for allocator operations.
pub type AllocatorResult<T> = Result<T, AllocatorError>;

/// Errors from resource allocation.
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// Every offset in the pool is taken.
    #[error("no free {resource} left in pool '{pool}'")]
    PoolExhausted {
        /// What was being allocated ("address" or "vlan").
        resource: &'static str,
        /// The pool key.
        pool: String,
    },

    /// The CAS retry budget ran out under sustained contention.
    #[error("gave up on pool '{pool}' after {attempts} conflicting updates")]
    Contention {
        /// The pool key.
        pool: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// An address was released against a subnet that does not contain it.
    #[error("{ip} is outside subnet {subnet}")]
    AddressOutOfRange {
        /// The address being released.
        ip: Ipv4Addr,
        /// The pool subnet.
        subnet: Ipv4Subnet,
    },

    /// The subnet has no allocatable host addresses.
    #[error("subnet {0} is too small to allocate from")]
    SubnetTooSmall(Ipv4Subnet),

    /// A VLAN tag outside the pool range.
    #[error("vlan tag {0} is outside the pool (1-4096)")]
    InvalidVlan(u16),

    /// The KV store failed for a reason other than a CAS conflict.
    #[error(transparent)]
    Store(#[from] StoreError),
}
