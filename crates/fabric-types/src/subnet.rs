//! IPv4 subnet type with host-offset arithmetic.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 network prefix in CIDR notation (e.g., 10.1.42.0/24).
///
/// Parsing canonicalises the address to the network address, so
/// `"10.1.42.7/24"` and `"10.1.42.0/24"` denote the same subnet. Host
/// offsets are plain `u32` arithmetic on the network address, which keeps
/// increments correct across byte boundaries for masks that are not
/// byte-aligned.
///
/// # Examples
///
/// ```
/// use fabric_types::Ipv4Subnet;
///
/// let subnet: Ipv4Subnet = "192.170.32.0/20".parse().unwrap();
/// assert_eq!(subnet.addr_at(257), Some("192.170.33.1".parse().unwrap()));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Subnet {
    /// Creates a new subnet, masking `address` down to its network address.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length exceeds 32.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, ParseError> {
        if prefix_len > 32 {
            return Err(ParseError::InvalidSubnet(format!(
                "{}/{}",
                address, prefix_len
            )));
        }
        let mask = Self::mask_bits(prefix_len);
        Ok(Ipv4Subnet {
            network: Ipv4Addr::from(u32::from(address) & mask),
            prefix_len,
        })
    }

    fn mask_bits(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        }
    }

    /// Returns the network address.
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns the total number of addresses covered by the prefix.
    pub fn host_count(&self) -> u64 {
        1u64 << (32 - self.prefix_len)
    }

    /// Returns true if `ip` falls inside this subnet.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_bits(self.prefix_len) == u32::from(self.network)
    }

    /// Returns the address at `offset` from the network address, or `None`
    /// when the offset walks past the end of the prefix.
    pub fn addr_at(&self, offset: u32) -> Option<Ipv4Addr> {
        if u64::from(offset) >= self.host_count() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network) + offset))
    }

    /// Returns the offset of `ip` from the network address, or `None` when
    /// `ip` is outside the subnet.
    pub fn offset_of(&self, ip: Ipv4Addr) -> Option<u32> {
        if !self.contains(ip) {
            return None;
        }
        Some(u32::from(ip) - u32::from(self.network))
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .split_once('/')
            .ok_or_else(|| ParseError::InvalidSubnet(s.to_string()))?;

        let address: Ipv4Addr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidSubnet(s.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidSubnet(s.to_string()))?;

        Ipv4Subnet::new(address, prefix_len)
    }
}

impl TryFrom<String> for Ipv4Subnet {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Subnet> for String {
    fn from(subnet: Ipv4Subnet) -> String {
        subnet.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_canonicalises() {
        let subnet: Ipv4Subnet = "10.1.42.1/16".parse().unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 1, 0, 0));
        assert_eq!(subnet.prefix_len(), 16);
        assert_eq!(subnet.to_string(), "10.1.0.0/16");
    }

    #[test]
    fn test_host_count() {
        let subnet: Ipv4Subnet = "192.170.0.0/24".parse().unwrap();
        assert_eq!(subnet.host_count(), 256);

        let subnet: Ipv4Subnet = "192.170.32.0/20".parse().unwrap();
        assert_eq!(subnet.host_count(), 4096);
    }

    #[test]
    fn test_addr_at_crosses_byte_boundary() {
        let subnet: Ipv4Subnet = "192.170.32.0/20".parse().unwrap();
        assert_eq!(subnet.addr_at(255), Some(Ipv4Addr::new(192, 170, 32, 255)));
        assert_eq!(subnet.addr_at(256), Some(Ipv4Addr::new(192, 170, 33, 0)));
        assert_eq!(subnet.addr_at(257), Some(Ipv4Addr::new(192, 170, 33, 1)));
    }

    #[test]
    fn test_addr_at_out_of_range() {
        let subnet: Ipv4Subnet = "192.170.0.0/24".parse().unwrap();
        assert_eq!(subnet.addr_at(255), Some(Ipv4Addr::new(192, 170, 0, 255)));
        assert_eq!(subnet.addr_at(256), None);
    }

    #[test]
    fn test_offset_of() {
        let subnet: Ipv4Subnet = "192.170.32.0/20".parse().unwrap();
        assert_eq!(subnet.offset_of(Ipv4Addr::new(192, 170, 33, 1)), Some(257));
        assert_eq!(subnet.offset_of(Ipv4Addr::new(192, 171, 0, 1)), None);
    }

    #[test]
    fn test_contains() {
        let subnet: Ipv4Subnet = "172.16.42.0/24".parse().unwrap();
        assert!(subnet.contains(Ipv4Addr::new(172, 16, 42, 200)));
        assert!(!subnet.contains(Ipv4Addr::new(172, 16, 43, 1)));
    }

    #[test]
    fn test_invalid() {
        assert!("10.0.0.0".parse::<Ipv4Subnet>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Subnet>().is_err());
        assert!("bogus/24".parse::<Ipv4Subnet>().is_err());
    }
}
