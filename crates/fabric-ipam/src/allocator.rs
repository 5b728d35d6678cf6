//! Optimistic-concurrency resource allocator.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use fabric_store::{Store, StoreError};
use fabric_types::Ipv4Subnet;

use crate::{AllocatorError, AllocatorResult, Bitmap};

/// Size of the cluster-wide VLAN pool.
pub const VLAN_POOL_SIZE: u64 = 4096;

/// KV namespace holding per-subnet IP bitmaps (key = subnet in CIDR form).
const IPAM_SPACE: &str = "ipam";

/// KV namespace and key of the single global VLAN bitmap.
const VLAN_SPACE: &str = "vlan";
const VLAN_KEY: &str = "vlan";

/// CAS retry budget per operation. Conflicts beyond this surface as
/// [`AllocatorError::Contention`] instead of spinning unbounded.
const MAX_CAS_ATTEMPTS: u32 = 16;

const BACKOFF_BASE: Duration = Duration::from_millis(10);
const BACKOFF_CAP: Duration = Duration::from_millis(640);

/// Hands out collision-free IP addresses and VLAN tags across the cluster.
///
/// The KV store is the single source of truth; this struct keeps no state
/// between operations. Any number of hosts may race on the same pool; the
/// losers observe a CAS conflict, re-read, and retry with backoff.
pub struct ResourceAllocator {
    store: Arc<dyn Store>,
}

impl ResourceAllocator {
    /// Creates an allocator over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Allocates the lowest free address in `subnet`.
    ///
    /// Offsets start at 1 (the address right above the network address) and
    /// stop short of the broadcast address. First-fit means released
    /// addresses are reused before the pool advances.
    #[instrument(skip(self))]
    pub async fn request_ip(&self, subnet: Ipv4Subnet) -> AllocatorResult<Ipv4Addr> {
        let max_offset = usable_offsets(subnet)?;
        let key = subnet.to_string();
        let offset = self
            .allocate(IPAM_SPACE, &key, subnet.host_count(), max_offset, "address")
            .await?;

        // Cannot miss: offset <= max_offset < host_count.
        let ip = subnet
            .addr_at(offset as u32)
            .expect("offset bounded by pool size");
        debug!(%subnet, %ip, "allocated address");
        Ok(ip)
    }

    /// Returns `ip` to its subnet's pool.
    ///
    /// Releasing an address that is not currently allocated clears an
    /// already-clear bit and is a no-op.
    #[instrument(skip(self))]
    pub async fn release_ip(&self, ip: Ipv4Addr, subnet: Ipv4Subnet) -> AllocatorResult<()> {
        let offset = subnet
            .offset_of(ip)
            .ok_or(AllocatorError::AddressOutOfRange { ip, subnet })?;
        if offset == 0 {
            // The network address is never allocated.
            return Ok(());
        }
        let key = subnet.to_string();
        self.release(IPAM_SPACE, &key, subnet.host_count(), u64::from(offset))
            .await
    }

    /// Allocates a VLAN tag from the global pool (values 1..=4096).
    #[instrument(skip(self))]
    pub async fn request_vlan(&self) -> AllocatorResult<u16> {
        let tag = self
            .allocate(VLAN_SPACE, VLAN_KEY, VLAN_POOL_SIZE, VLAN_POOL_SIZE, "vlan")
            .await?;
        debug!(tag, "allocated vlan");
        Ok(tag as u16)
    }

    /// Returns a VLAN tag to the global pool.
    #[instrument(skip(self))]
    pub async fn release_vlan(&self, tag: u16) -> AllocatorResult<()> {
        if tag == 0 || u64::from(tag) > VLAN_POOL_SIZE {
            return Err(AllocatorError::InvalidVlan(tag));
        }
        self.release(VLAN_SPACE, VLAN_KEY, VLAN_POOL_SIZE, u64::from(tag))
            .await
    }

    /// Read-modify-CAS loop setting the first free bit.
    ///
    /// Returns the 1-based offset. Every conflict restarts from a fresh read;
    /// nothing is carried over between attempts.
    async fn allocate(
        &self,
        space: &str,
        key: &str,
        pool_bits: u64,
        max_offset: u64,
        resource: &'static str,
    ) -> AllocatorResult<u64> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get(space, key).await?;
            let (mut bitmap, expected) = match &current {
                Some(entry) => (
                    Bitmap::from_bytes(&entry.value, pool_bits),
                    Some(entry.value.as_slice()),
                ),
                None => (Bitmap::new(pool_bits), None),
            };

            let bit = match bitmap.first_free() {
                Some(bit) if bit + 1 <= max_offset => bit,
                _ => {
                    return Err(AllocatorError::PoolExhausted {
                        resource,
                        pool: key.to_string(),
                    })
                }
            };
            bitmap.set(bit);

            match self
                .store
                .put(space, key, bitmap.as_bytes(), expected)
                .await
            {
                Ok(()) => return Ok(bit + 1),
                Err(StoreError::Outdated) => {
                    debug!(pool = key, attempt, "allocation lost CAS race, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(pool = key, "allocation retry budget exhausted");
        Err(AllocatorError::Contention {
            pool: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Mirror of [`Self::allocate`]: clears the bit for a 1-based offset.
    async fn release(
        &self,
        space: &str,
        key: &str,
        pool_bits: u64,
        offset: u64,
    ) -> AllocatorResult<()> {
        if offset == 0 || offset > pool_bits {
            return Ok(());
        }

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let Some(entry) = self.store.get(space, key).await? else {
                // Pool never written: nothing to release.
                return Ok(());
            };

            let mut bitmap = Bitmap::from_bytes(&entry.value, pool_bits);
            bitmap.clear(offset - 1);

            match self
                .store
                .put(space, key, bitmap.as_bytes(), Some(&entry.value))
                .await
            {
                Ok(()) => return Ok(()),
                Err(StoreError::Outdated) => {
                    debug!(pool = key, attempt, "release lost CAS race, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(pool = key, "release retry budget exhausted");
        Err(AllocatorError::Contention {
            pool: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}

/// Highest allocatable 1-based offset in `subnet`: everything between the
/// network address and the broadcast address.
fn usable_offsets(subnet: Ipv4Subnet) -> AllocatorResult<u64> {
    let hosts = subnet.host_count();
    if hosts < 4 {
        return Err(AllocatorError::SubnetTooSmall(subnet));
    }
    Ok(hosts - 2)
}

/// Exponential backoff with jitter for CAS retries.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(16))
        .min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_BASE.as_millis() as u64);
    exp + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn allocator() -> ResourceAllocator {
        ResourceAllocator::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_ip_first_fit_reuse() {
        let alloc = allocator();
        let subnet: Ipv4Subnet = "192.170.0.0/24".parse().unwrap();

        for i in 1..25u8 {
            let ip = alloc.request_ip(subnet).await.unwrap();
            assert_eq!(ip, Ipv4Addr::new(192, 170, 0, i));
        }

        alloc
            .release_ip(Ipv4Addr::new(192, 170, 0, 1), subnet)
            .await
            .unwrap();
        alloc
            .release_ip(Ipv4Addr::new(192, 170, 0, 11), subnet)
            .await
            .unwrap();

        // Released offsets come back before the pool advances
        assert_eq!(
            alloc.request_ip(subnet).await.unwrap(),
            Ipv4Addr::new(192, 170, 0, 1)
        );
        assert_eq!(
            alloc.request_ip(subnet).await.unwrap(),
            Ipv4Addr::new(192, 170, 0, 11)
        );
        assert_eq!(
            alloc.request_ip(subnet).await.unwrap(),
            Ipv4Addr::new(192, 170, 0, 25)
        );
    }

    #[tokio::test]
    async fn test_ip_partial_mask_crosses_byte_boundary() {
        let alloc = allocator();
        let subnet: Ipv4Subnet = "192.170.32.0/20".parse().unwrap();

        for i in 1..300u32 {
            let ip = alloc.request_ip(subnet).await.unwrap();
            let expected = Ipv4Addr::new(192, 170, 32 + (i / 256) as u8, (i % 256) as u8);
            assert_eq!(ip, expected, "allocation {}", i);
        }
    }

    #[tokio::test]
    async fn test_ip_partial_mask_release() {
        let alloc = allocator();
        let subnet: Ipv4Subnet = "192.170.32.0/20".parse().unwrap();

        for _ in 1..25 {
            alloc.request_ip(subnet).await.unwrap();
        }

        alloc
            .release_ip(Ipv4Addr::new(192, 170, 32, 3), subnet)
            .await
            .unwrap();
        alloc
            .release_ip(Ipv4Addr::new(192, 170, 32, 14), subnet)
            .await
            .unwrap();

        assert_eq!(
            alloc.request_ip(subnet).await.unwrap(),
            Ipv4Addr::new(192, 170, 32, 3)
        );
        assert_eq!(
            alloc.request_ip(subnet).await.unwrap(),
            Ipv4Addr::new(192, 170, 32, 14)
        );
    }

    #[tokio::test]
    async fn test_ip_pool_exhaustion_skips_broadcast() {
        let alloc = allocator();
        let subnet: Ipv4Subnet = "10.0.0.0/29".parse().unwrap();

        // 8 addresses, minus network and broadcast
        for i in 1..=6u8 {
            let ip = alloc.request_ip(subnet).await.unwrap();
            assert_eq!(ip, Ipv4Addr::new(10, 0, 0, i));
        }

        let err = alloc.request_ip(subnet).await.unwrap_err();
        assert!(matches!(err, AllocatorError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn test_release_unallocated_is_noop() {
        let alloc = allocator();
        let subnet: Ipv4Subnet = "192.170.0.0/24".parse().unwrap();

        alloc
            .release_ip(Ipv4Addr::new(192, 170, 0, 200), subnet)
            .await
            .unwrap();

        assert_eq!(
            alloc.request_ip(subnet).await.unwrap(),
            Ipv4Addr::new(192, 170, 0, 1)
        );
    }

    #[tokio::test]
    async fn test_release_outside_subnet_rejected() {
        let alloc = allocator();
        let subnet: Ipv4Subnet = "192.170.0.0/24".parse().unwrap();

        let err = alloc
            .release_ip(Ipv4Addr::new(10, 0, 0, 1), subnet)
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::AddressOutOfRange { .. }));
    }

    #[tokio::test]
    async fn test_subnet_too_small() {
        let alloc = allocator();
        let subnet: Ipv4Subnet = "10.0.0.0/31".parse().unwrap();
        let err = alloc.request_ip(subnet).await.unwrap_err();
        assert!(matches!(err, AllocatorError::SubnetTooSmall(_)));
    }

    #[tokio::test]
    async fn test_vlan_pool_full_cycle() {
        let alloc = allocator();
        let mut seen = vec![false; VLAN_POOL_SIZE as usize + 1];

        for _ in 0..VLAN_POOL_SIZE {
            let tag = alloc.request_vlan().await.unwrap();
            assert!(tag >= 1 && u64::from(tag) <= VLAN_POOL_SIZE);
            assert!(!seen[tag as usize], "tag {} handed out twice", tag);
            seen[tag as usize] = true;
        }

        // 4097th allocation fails exactly once
        let err = alloc.request_vlan().await.unwrap_err();
        assert!(matches!(err, AllocatorError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn test_vlan_release_and_reuse() {
        let alloc = allocator();
        let first = alloc.request_vlan().await.unwrap();
        let second = alloc.request_vlan().await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        alloc.release_vlan(first).await.unwrap();
        assert_eq!(alloc.request_vlan().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_vlan_release_invalid_tag() {
        let alloc = allocator();
        assert!(matches!(
            alloc.release_vlan(0).await.unwrap_err(),
            AllocatorError::InvalidVlan(0)
        ));
        assert!(matches!(
            alloc.release_vlan(4097).await.unwrap_err(),
            AllocatorError::InvalidVlan(4097)
        ));
    }

    #[tokio::test]
    async fn test_pool_blob_sizes() {
        let store = Arc::new(MemoryStore::new());
        let alloc = ResourceAllocator::new(store.clone());

        alloc.request_vlan().await.unwrap();
        let vlan_blob = store.get(VLAN_SPACE, VLAN_KEY).await.unwrap().unwrap();
        assert_eq!(vlan_blob.value.len(), 512);

        let subnet: Ipv4Subnet = "192.170.0.0/24".parse().unwrap();
        alloc.request_ip(subnet).await.unwrap();
        let ip_blob = store
            .get(IPAM_SPACE, "192.170.0.0/24")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ip_blob.value.len(), 32);

        // One bit set in each pool
        assert_eq!(Bitmap::from_bytes(&vlan_blob.value, VLAN_POOL_SIZE).ones(), 1);
        assert_eq!(Bitmap::from_bytes(&ip_blob.value, 256).ones(), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert!(backoff_delay(0) >= BACKOFF_BASE);
        assert!(backoff_delay(1) >= Duration::from_millis(20));
        assert!(backoff_delay(31) <= BACKOFF_CAP + BACKOFF_BASE);
    }
}
