//! Host network probes and small helpers.

use std::net::Ipv4Addr;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use tracing::debug;

use fabric_types::Ipv4Subnet;

use crate::commands;
use crate::error::{FabricError, FabricResult};
use crate::shell;

/// How long to wait for a newly created switch port to show up as a kernel
/// interface, and how often to look.
pub const IFACE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const IFACE_POLL_INTERVAL: Duration = Duration::from_millis(100);

static INET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"inet (\d+\.\d+\.\d+\.\d+)/(\d+)").expect("Invalid regex pattern"));

static ROUTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+\.\d+\.\d+\.\d+/\d+)").expect("Invalid regex pattern"));

/// Returns the first IPv4 address configured on `dev`, or `None` when the
/// interface does not exist or has no IPv4 address.
pub async fn get_iface_addr(dev: &str) -> FabricResult<Option<(Ipv4Addr, Ipv4Subnet)>> {
    let result = shell::exec(&commands::build_addr_show_cmd(dev)).await?;
    if !result.success() {
        return Ok(None);
    }

    for caps in INET_RE.captures_iter(&result.stdout) {
        let addr: Ipv4Addr = match caps[1].parse() {
            Ok(addr) => addr,
            Err(_) => continue,
        };
        let prefix_len: u8 = match caps[2].parse() {
            Ok(len) => len,
            Err(_) => continue,
        };
        let subnet = Ipv4Subnet::new(addr, prefix_len)?;
        return Ok(Some((addr, subnet)));
    }
    Ok(None)
}

/// Returns true when two subnets share any addresses.
pub fn networks_overlap(a: Ipv4Subnet, b: Ipv4Subnet) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

/// Returns true when `subnet` overlaps any installed IPv4 route.
pub async fn route_overlaps(subnet: Ipv4Subnet) -> FabricResult<bool> {
    let output = shell::exec_or_throw(&commands::build_route_show_cmd()).await?;
    for line in output.lines() {
        let Some(caps) = ROUTE_RE.captures(line) else {
            continue;
        };
        if let Ok(route) = caps[1].parse::<Ipv4Subnet>() {
            if networks_overlap(subnet, route) {
                debug!(%subnet, %route, "subnet overlaps installed route");
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Polls until `dev` is visible to the kernel, failing after
/// [`IFACE_WAIT_TIMEOUT`].
///
/// Switch-created interfaces appear asynchronously; polling replaces any
/// fixed grace delay so a slow kernel delays us only as long as it must.
pub async fn wait_for_interface(dev: &str) -> FabricResult<()> {
    let deadline = tokio::time::Instant::now() + IFACE_WAIT_TIMEOUT;
    loop {
        let result = shell::exec(&commands::build_link_show_cmd(dev)).await?;
        if result.success() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(FabricError::InterfaceNotVisible(dev.to_string()));
        }
        tokio::time::sleep(IFACE_POLL_INTERVAL).await;
    }
}

/// Returns a new port name: the prefix followed by `len` random hex chars.
pub fn generate_port_name(prefix: &str, len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..len)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect();
    format!("{}{}", prefix, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_networks_overlap() {
        let a: Ipv4Subnet = "10.1.0.0/16".parse().unwrap();
        let b: Ipv4Subnet = "10.1.42.0/24".parse().unwrap();
        let c: Ipv4Subnet = "10.2.0.0/16".parse().unwrap();

        assert!(networks_overlap(a, b));
        assert!(networks_overlap(b, a));
        assert!(!networks_overlap(a, c));
        assert!(!networks_overlap(b, c));
    }

    #[test]
    fn test_inet_regex() {
        let line = "2: fabric0    inet 10.1.42.1/16 brd 10.1.255.255 scope global fabric0";
        let caps = INET_RE.captures(line).unwrap();
        assert_eq!(&caps[1], "10.1.42.1");
        assert_eq!(&caps[2], "16");
    }

    #[test]
    fn test_route_regex() {
        assert!(ROUTE_RE.captures("10.1.0.0/16 dev fabric0 scope link").is_some());
        assert!(ROUTE_RE.captures("default via 192.168.1.1 dev eth0").is_none());
    }

    #[test]
    fn test_generate_port_name() {
        let name = generate_port_name("ovs", 7);
        assert_eq!(name.len(), 10);
        assert!(name.starts_with("ovs"));
        assert!(name[3..].chars().all(|c| c.is_ascii_hexdigit()));

        // Vanishingly unlikely to collide
        assert_ne!(generate_port_name("ovs", 7), generate_port_name("ovs", 7));
    }
}
