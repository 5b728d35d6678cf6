//! Logical network registry.
//!
//! A network is `{id, subnet, gateway, vlan}`, persisted as JSON in the KV
//! store under the `network` namespace. Records are created lazily on first
//! use, never cached (every read is a store round trip), and immutable once
//! created. Creation is first-writer-wins across the cluster: the loser of
//! the race releases everything it claimed locally and adopts the winner's
//! record.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use fabric_ipam::ResourceAllocator;
use fabric_store::{Store, StoreError};
use fabric_types::Ipv4Subnet;

use crate::commands;
use crate::error::{FabricError, FabricResult};
use crate::shell;
use crate::switch::Switch;
use crate::utils;

/// KV namespace holding network records.
pub const NETWORK_SPACE: &str = "network";

/// Id of the reserved default network.
pub const DEFAULT_NETWORK: &str = "default";

/// Candidate subnets tried for the default network, in order. The list
/// avoids ranges commonly claimed by cloud environments; a candidate is
/// skipped when it overlaps a route already installed on the host.
const DEFAULT_SUBNET_CANDIDATES: &[&str] = &[
    "10.1.42.1/16",
    "10.42.42.1/16",
    "172.16.42.1/24",
    "172.16.43.1/24",
    "172.16.44.1/24",
    "10.0.42.1/24",
    "10.0.43.1/24",
    "172.17.42.1/16",
    "10.0.42.1/16",
    "192.168.42.1/24",
    "192.168.43.1/24",
    "192.168.44.1/24",
];

/// A logical network record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Caller-chosen identifier.
    pub id: String,
    /// Address pool for this network.
    pub subnet: Ipv4Subnet,
    /// Gateway address, configured on the per-network switch port.
    pub gateway: Ipv4Addr,
    /// VLAN tag isolating this network on the shared bridge.
    pub vlan: u16,
}

/// Manages network records and their per-host gateway ports.
pub struct NetworkRegistry {
    store: Arc<dyn Store>,
    allocator: Arc<ResourceAllocator>,
    switch: Arc<dyn Switch>,
    bridge: String,
    mtu: u32,

    #[cfg(test)]
    mock_mode: bool,

    #[cfg(test)]
    captured_commands: Vec<String>,
}

impl NetworkRegistry {
    /// Creates a registry bound to this host's bridge.
    pub fn new(
        store: Arc<dyn Store>,
        allocator: Arc<ResourceAllocator>,
        switch: Arc<dyn Switch>,
        bridge: impl Into<String>,
        mtu: u32,
    ) -> Self {
        Self {
            store,
            allocator,
            switch,
            bridge: bridge.into(),
            mtu,
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: Vec::new(),
        }
    }

    /// Enables mock mode: commands are captured instead of executed and
    /// host probes report nothing.
    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.mock_mode = true;
        self
    }

    #[cfg(test)]
    pub fn captured_commands(&self) -> &[String] {
        &self.captured_commands
    }

    async fn exec(&mut self, cmd: &str) -> FabricResult<()> {
        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.push(cmd.to_string());
            return Ok(());
        }

        shell::exec_or_throw(cmd).await?;
        Ok(())
    }

    async fn iface_addr(&self, dev: &str) -> FabricResult<Option<(Ipv4Addr, Ipv4Subnet)>> {
        #[cfg(test)]
        if self.mock_mode {
            let _ = dev;
            return Ok(None);
        }

        utils::get_iface_addr(dev).await
    }

    async fn wait_iface(&self, dev: &str) -> FabricResult<()> {
        #[cfg(test)]
        if self.mock_mode {
            let _ = dev;
            return Ok(());
        }

        utils::wait_for_interface(dev).await
    }

    async fn subnet_in_use(&self, subnet: Ipv4Subnet) -> FabricResult<bool> {
        #[cfg(test)]
        if self.mock_mode {
            let _ = subnet;
            return Ok(false);
        }

        utils::route_overlaps(subnet).await
    }

    /// Reads a network record.
    pub async fn get_network(&self, id: &str) -> FabricResult<Option<Network>> {
        let Some(entry) = self.store.get(NETWORK_SPACE, id).await? else {
            return Ok(None);
        };
        let network =
            serde_json::from_slice(&entry.value).map_err(|e| FabricError::InvalidRecord {
                id: id.to_string(),
                message: e.to_string(),
            })?;
        Ok(Some(network))
    }

    /// Lists every network record in the cluster.
    pub async fn list_networks(&self) -> FabricResult<Vec<Network>> {
        let entries = self.store.get_all(NETWORK_SPACE).await?;
        entries
            .iter()
            .map(|entry| {
                serde_json::from_slice(&entry.value).map_err(|e| FabricError::InvalidRecord {
                    id: entry.key.clone(),
                    message: e.to_string(),
                })
            })
            .collect()
    }

    /// Creates a network, or returns the existing record for `id`.
    ///
    /// Re-creation with a different subnet is an error: records are
    /// immutable. On a create race the loser releases its VLAN, gateway
    /// address, and gateway port, then adopts the stored record.
    #[instrument(skip(self))]
    pub async fn create_network(&mut self, id: &str, subnet: Ipv4Subnet) -> FabricResult<Network> {
        if let Some(existing) = self.get_network(id).await? {
            if existing.subnet != subnet {
                return Err(FabricError::SubnetMismatch {
                    id: id.to_string(),
                    stored: existing.subnet,
                    requested: subnet,
                });
            }
            debug!(id, "network already exists");
            return Ok(existing);
        }

        let vlan = self.allocator.request_vlan().await?;

        let (network, provisioned) = match self.claim_network(id, subnet, vlan).await {
            Ok(claim) => claim,
            Err(e) => {
                if let Err(release_err) = self.allocator.release_vlan(vlan).await {
                    warn!(id, vlan, error = %release_err, "failed to release vlan");
                }
                return Err(e);
            }
        };

        let data = serde_json::to_vec(&network).expect("network record serialization cannot fail");
        match self.store.put(NETWORK_SPACE, id, &data, None).await {
            Ok(()) => {
                self.setup_iptables(&network).await?;
                info!(id, vlan, subnet = %network.subnet, gateway = %network.gateway, "network created");
                Ok(network)
            }
            Err(StoreError::Outdated) => {
                debug!(id, "lost network create race, adopting winner");
                self.release_claim(&network, provisioned).await;
                self.get_network(id)
                    .await?
                    .ok_or_else(|| FabricError::NetworkNotFound(id.to_string()))
            }
            Err(e) => {
                self.release_claim(&network, provisioned).await;
                Err(e.into())
            }
        }
    }

    /// Builds the local half of a network: either adopts a pre-existing
    /// host interface named `id`, or allocates a gateway address and brings
    /// up a tagged gateway port. Returns the record and whether a port was
    /// provisioned.
    async fn claim_network(
        &mut self,
        id: &str,
        subnet: Ipv4Subnet,
        vlan: u16,
    ) -> FabricResult<(Network, bool)> {
        if let Some((addr, iface_subnet)) = self.iface_addr(id).await? {
            debug!(id, %addr, "adopting existing interface for network");
            let network = Network {
                id: id.to_string(),
                subnet: iface_subnet,
                gateway: addr,
                vlan,
            };
            return Ok((network, false));
        }

        let gateway = self.allocator.request_ip(subnet).await?;
        let network = Network {
            id: id.to_string(),
            subnet,
            gateway,
            vlan,
        };

        if let Err(e) = self.provision_gateway(&network).await {
            if let Err(release_err) = self.allocator.release_ip(gateway, subnet).await {
                warn!(id, %gateway, error = %release_err, "failed to release gateway address");
            }
            return Err(e);
        }
        Ok((network, true))
    }

    /// Creates and configures the per-network gateway port on this host.
    async fn provision_gateway(&mut self, network: &Network) -> FabricResult<()> {
        self.switch
            .add_internal_port(&self.bridge, &network.id, network.vlan)
            .await?;
        self.wait_iface(&network.id).await?;

        let mtu = self.mtu;
        self.exec(&commands::build_set_mtu_cmd(&network.id, mtu))
            .await?;
        self.exec(&commands::build_add_addr_cmd(
            &network.id,
            network.gateway,
            network.subnet.prefix_len(),
        ))
        .await?;
        self.exec(&commands::build_link_up_cmd(&network.id)).await?;
        Ok(())
    }

    /// Best-effort undo of everything claimed for a record that will not be
    /// stored.
    async fn release_claim(&mut self, network: &Network, provisioned: bool) {
        if let Err(e) = self.allocator.release_vlan(network.vlan).await {
            warn!(id = %network.id, vlan = network.vlan, error = %e, "failed to release vlan");
        }
        if provisioned {
            if let Err(e) = self
                .allocator
                .release_ip(network.gateway, network.subnet)
                .await
            {
                warn!(id = %network.id, gateway = %network.gateway, error = %e, "failed to release gateway address");
            }
            if let Err(e) = self.switch.delete_port(&self.bridge, &network.id).await {
                warn!(id = %network.id, error = %e, "failed to delete gateway port");
            }
        }
    }

    /// Masquerade and forwarding rules for a network's subnet.
    async fn setup_iptables(&mut self, network: &Network) -> FabricResult<()> {
        let bridge = self.bridge.clone();
        self.exec(&commands::build_nat_masquerade_cmd(&bridge, network.subnet))
            .await?;
        self.exec(&commands::build_forward_out_cmd(&bridge)).await?;
        self.exec(&commands::build_forward_in_cmd(&bridge)).await?;
        Ok(())
    }

    /// Deletes a network: record, VLAN, and the local gateway port.
    #[instrument(skip(self))]
    pub async fn delete_network(&mut self, id: &str) -> FabricResult<()> {
        let network = self
            .get_network(id)
            .await?
            .ok_or_else(|| FabricError::NetworkNotFound(id.to_string()))?;

        self.store.delete(NETWORK_SPACE, id).await?;
        self.allocator.release_vlan(network.vlan).await?;
        self.switch.delete_port(&self.bridge, id).await?;
        info!(id, "network deleted");
        Ok(())
    }

    /// Gets or creates the reserved default network, picking the first
    /// candidate subnet that does not collide with an installed route.
    pub async fn create_default_network(&mut self) -> FabricResult<Network> {
        if let Some(network) = self.get_network(DEFAULT_NETWORK).await? {
            return Ok(network);
        }

        for candidate in DEFAULT_SUBNET_CANDIDATES {
            let subnet: Ipv4Subnet = candidate
                .parse()
                .expect("default subnet candidates are well-formed");
            if self.subnet_in_use(subnet).await? {
                continue;
            }
            return self.create_network(DEFAULT_NETWORK, subnet).await;
        }
        Err(FabricError::NoAvailableSubnet)
    }
}
