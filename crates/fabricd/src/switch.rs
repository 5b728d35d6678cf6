//! Seam between the daemon and the switch protocol client.

use async_trait::async_trait;
use fabric_ovsdb::{OvsResult, OvsdbClient};

/// The switch operations the daemon depends on.
///
/// Implemented by [`OvsdbClient`] in production; tests substitute a
/// recording mock.
#[async_trait]
pub trait Switch: Send + Sync {
    /// Creates the bridge if it does not already exist.
    async fn ensure_bridge(&self, name: &str) -> OvsResult<()>;

    /// Adds an internal port, optionally VLAN-tagged (tag 0 = untagged).
    async fn add_internal_port(&self, bridge: &str, port: &str, tag: u16) -> OvsResult<()>;

    /// Adds a VXLAN tunnel port towards a peer host.
    async fn add_vxlan_port(&self, bridge: &str, port: &str, remote_ip: &str) -> OvsResult<()>;

    /// Deletes a port by name; unknown names are a no-op.
    async fn delete_port(&self, bridge: &str, port: &str) -> OvsResult<()>;

    /// Stores attachment context on a port's interface row.
    async fn set_port_context(&self, port: &str, container_id: &str, data: &str) -> OvsResult<()>;

    /// Returns true if the local mirror shows a port with this name.
    fn has_port(&self, name: &str) -> bool;

    /// Reads back all stored attachment contexts.
    fn connection_contexts(&self) -> Vec<(String, String)>;
}

#[async_trait]
impl Switch for OvsdbClient {
    async fn ensure_bridge(&self, name: &str) -> OvsResult<()> {
        self.create_bridge(name).await
    }

    async fn add_internal_port(&self, bridge: &str, port: &str, tag: u16) -> OvsResult<()> {
        OvsdbClient::add_internal_port(self, bridge, port, tag).await
    }

    async fn add_vxlan_port(&self, bridge: &str, port: &str, remote_ip: &str) -> OvsResult<()> {
        OvsdbClient::add_vxlan_port(self, bridge, port, remote_ip).await
    }

    async fn delete_port(&self, bridge: &str, port: &str) -> OvsResult<()> {
        OvsdbClient::delete_port(self, bridge, port).await
    }

    async fn set_port_context(&self, port: &str, container_id: &str, data: &str) -> OvsResult<()> {
        OvsdbClient::set_port_context(self, port, container_id, data).await
    }

    fn has_port(&self, name: &str) -> bool {
        OvsdbClient::has_port(self, name)
    }

    fn connection_contexts(&self) -> Vec<(String, String)> {
        OvsdbClient::connection_contexts(self)
    }
}
