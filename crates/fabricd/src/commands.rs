//! Shell command builders for link and firewall operations.

use std::net::Ipv4Addr;

use fabric_types::{Ipv4Subnet, MacAddress};

use crate::shell::{self, IPTABLES_CMD, IP_CMD};

/// Build set-MTU command
pub fn build_set_mtu_cmd(dev: &str, mtu: u32) -> String {
    format!(
        "{} link set dev {} mtu {}",
        IP_CMD,
        shell::shellquote(dev),
        mtu
    )
}

/// Build link-up command
pub fn build_link_up_cmd(dev: &str) -> String {
    format!("{} link set dev {} up", IP_CMD, shell::shellquote(dev))
}

/// Build link-down command
pub fn build_link_down_cmd(dev: &str) -> String {
    format!("{} link set dev {} down", IP_CMD, shell::shellquote(dev))
}

/// Build link-show command (used to probe interface visibility)
pub fn build_link_show_cmd(dev: &str) -> String {
    format!("{} link show dev {}", IP_CMD, shell::shellquote(dev))
}

/// Build one-line IPv4 address listing for an interface
pub fn build_addr_show_cmd(dev: &str) -> String {
    format!("{} -4 -o addr show dev {}", IP_CMD, shell::shellquote(dev))
}

/// Build IPv4 route listing command
pub fn build_route_show_cmd() -> String {
    format!("{} -4 route show", IP_CMD)
}

/// Build add-address command
pub fn build_add_addr_cmd(dev: &str, addr: Ipv4Addr, prefix_len: u8) -> String {
    format!(
        "{} address add {}/{} dev {}",
        IP_CMD,
        addr,
        prefix_len,
        shell::shellquote(dev)
    )
}

/// Build set-MAC command
pub fn build_set_mac_cmd(dev: &str, mac: MacAddress) -> String {
    format!(
        "{} link set dev {} address {}",
        IP_CMD,
        shell::shellquote(dev),
        mac
    )
}

/// Build rename command
pub fn build_rename_cmd(old: &str, new: &str) -> String {
    format!(
        "{} link set dev {} name {}",
        IP_CMD,
        shell::shellquote(old),
        shell::shellquote(new)
    )
}

/// Build command moving a link into a process's network namespace
pub fn build_move_to_netns_cmd(dev: &str, pid: u32) -> String {
    format!(
        "{} link set dev {} netns {}",
        IP_CMD,
        shell::shellquote(dev),
        pid
    )
}

/// Build default-route command
pub fn build_default_route_cmd(gateway: Ipv4Addr) -> String {
    format!("{} route replace default via {}", IP_CMD, gateway)
}

/// Masquerade traffic leaving the fabric towards other interfaces
pub fn build_nat_masquerade_cmd(bridge: &str, subnet: Ipv4Subnet) -> String {
    format!(
        "{} -t nat -A POSTROUTING -s {} ! -o {} -j MASQUERADE",
        IPTABLES_CMD,
        subnet,
        shell::shellquote(bridge)
    )
}

/// Allow outbound connections from the bridge
pub fn build_forward_out_cmd(bridge: &str) -> String {
    let bridge = shell::shellquote(bridge);
    format!(
        "{} -A FORWARD -i {} ! -o {} -j ACCEPT",
        IPTABLES_CMD, bridge, bridge
    )
}

/// Allow inbound traffic for established sessions
pub fn build_forward_in_cmd(bridge: &str) -> String {
    format!(
        "{} -A FORWARD -o {} -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT",
        IPTABLES_CMD,
        shell::shellquote(bridge)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_set_mtu_cmd() {
        let cmd = build_set_mtu_cmd("ovs1a2b3c4", 1440);
        assert!(cmd.contains("link set dev"));
        assert!(cmd.contains("ovs1a2b3c4"));
        assert!(cmd.contains("mtu 1440"));
    }

    #[test]
    fn test_build_link_up_down() {
        assert!(build_link_up_cmd("fabric0").ends_with("up"));
        assert!(build_link_down_cmd("fabric0").ends_with("down"));
    }

    #[test]
    fn test_build_add_addr_cmd() {
        let cmd = build_add_addr_cmd("ovs1a2b3c4", Ipv4Addr::new(10, 1, 42, 2), 16);
        assert!(cmd.contains("address add 10.1.42.2/16"));
    }

    #[test]
    fn test_build_set_mac_cmd() {
        let mac = MacAddress::from_ipv4(Ipv4Addr::new(10, 1, 42, 2));
        let cmd = build_set_mac_cmd("ovs1a2b3c4", mac);
        assert!(cmd.contains("address 02:42:0a:01:2a:02"));
    }

    #[test]
    fn test_build_rename_cmd() {
        let cmd = build_rename_cmd("ovs1a2b3c4", "eth7");
        assert!(cmd.contains("\"ovs1a2b3c4\" name \"eth7\""));
    }

    #[test]
    fn test_build_move_to_netns_cmd() {
        let cmd = build_move_to_netns_cmd("ovs1a2b3c4", 4242);
        assert!(cmd.contains("netns 4242"));
    }

    #[test]
    fn test_build_default_route_cmd() {
        let cmd = build_default_route_cmd(Ipv4Addr::new(10, 1, 42, 1));
        assert!(cmd.contains("route replace default via 10.1.42.1"));
    }

    #[test]
    fn test_build_iptables_rules() {
        let subnet: Ipv4Subnet = "10.1.0.0/16".parse().unwrap();
        let nat = build_nat_masquerade_cmd("fabric0", subnet);
        assert!(nat.contains("-t nat -A POSTROUTING -s 10.1.0.0/16"));
        assert!(nat.contains("MASQUERADE"));

        assert!(build_forward_out_cmd("fabric0").contains("-A FORWARD -i"));
        assert!(build_forward_in_cmd("fabric0").contains("RELATED,ESTABLISHED"));
    }

    #[test]
    fn test_quoting_hostile_name() {
        let cmd = build_link_up_cmd("evil$(reboot)");
        assert!(cmd.contains("\"evil\\$(reboot)\""));
    }
}
