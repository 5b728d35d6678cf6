//! Container attachment.
//!
//! An attachment turns an allocated switch port into a live interface inside
//! a container's network namespace: create a tagged port, wait for the
//! kernel to expose it, allocate an address and derive its MAC, move the
//! interface into the container, and configure it in place. Every completed
//! step pushes an undo action; a later failure runs the accumulated undo
//! list, so a failed attachment leaves neither the port nor the address
//! behind.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use fabric_ipam::ResourceAllocator;
use fabric_types::{Ipv4Subnet, MacAddress};

use crate::commands;
use crate::error::{FabricError, FabricResult};
use crate::netns;
use crate::network::{Network, NetworkRegistry};
use crate::shell;
use crate::switch::Switch;
use crate::utils;

/// Prefix of generated container port names.
pub const CONNECTION_PORT_PREFIX: &str = "ovs";
const PORT_NAME_SUFFIX_LEN: usize = 7;

/// A container's attachment to a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Container identifier as supplied by the orchestration layer.
    pub container_id: String,
    /// Pid whose network namespace holds the interface.
    pub container_pid: u32,
    /// Id of the attached network.
    pub network: String,
    /// Switch port backing the interface.
    pub port_name: String,
    /// Address assigned from the network's pool.
    pub ip: Ipv4Addr,
    /// The network's subnet (needed to release the address later).
    pub subnet: Ipv4Subnet,
    /// MAC derived from the address.
    pub mac: MacAddress,
    /// Default-route target inside the container.
    pub gateway: Ipv4Addr,
}

/// Undo actions accumulated while an attachment progresses.
enum Undo {
    DeletePort(String),
    ReleaseIp(Ipv4Addr, Ipv4Subnet),
}

/// Drives the attachment state machine.
pub struct AttachmentOrchestrator {
    switch: Arc<dyn Switch>,
    allocator: Arc<ResourceAllocator>,
    bridge: String,
    mtu: u32,

    #[cfg(test)]
    mock_mode: bool,

    #[cfg(test)]
    captured_commands: Vec<String>,

    #[cfg(test)]
    fail_step: Option<&'static str>,
}

impl AttachmentOrchestrator {
    /// Creates an orchestrator for this host's bridge.
    pub fn new(
        switch: Arc<dyn Switch>,
        allocator: Arc<ResourceAllocator>,
        bridge: impl Into<String>,
        mtu: u32,
    ) -> Self {
        Self {
            switch,
            allocator,
            bridge: bridge.into(),
            mtu,
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: Vec::new(),
            #[cfg(test)]
            fail_step: None,
        }
    }

    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.mock_mode = true;
        self
    }

    /// Forces the named step to fail (for rollback tests).
    #[cfg(test)]
    pub fn fail_at(&mut self, step: &'static str) {
        self.fail_step = Some(step);
    }

    #[cfg(test)]
    pub fn captured_commands(&self) -> &[String] {
        &self.captured_commands
    }

    fn check_injected(&self, step: &'static str) -> FabricResult<()> {
        #[cfg(test)]
        if self.fail_step == Some(step) {
            return Err(FabricError::attachment(
                step,
                FabricError::namespace(step, "injected failure".to_string()),
            ));
        }
        let _ = step;
        Ok(())
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

    async fn wait_iface(&self, dev: &str) -> FabricResult<()> {
        #[cfg(test)]
        if self.mock_mode {
            let _ = dev;
            return Ok(());
        }

        utils::wait_for_interface(dev).await
    }

    fn bind_netns(&self, pid: u32) -> FabricResult<PathBuf> {
        #[cfg(test)]
        if self.mock_mode {
            return Ok(PathBuf::from(netns::NETNS_RUN_DIR).join(pid.to_string()));
        }

        netns::bind_process_netns(pid)
    }

    async fn run_in_namespace(
        &mut self,
        handle: PathBuf,
        cmds: Vec<(&'static str, String)>,
    ) -> FabricResult<()> {
        #[cfg(test)]
        if self.mock_mode {
            let _ = handle;
            for (_, cmd) in cmds {
                self.captured_commands.push(cmd);
            }
            return Ok(());
        }

        tokio::task::spawn_blocking(move || netns::run_commands(&handle, &cmds))
            .await
            .map_err(|e| FabricError::namespace("join", e.to_string()))?
    }

    /// Attaches a container to a network; the default network is created
    /// lazily when no name is given.
    ///
    /// Returns the live connection, or an error naming the failing step
    /// with all completed steps undone.
    #[instrument(skip(self, registry))]
    pub async fn add_connection(
        &mut self,
        registry: &mut NetworkRegistry,
        container_id: &str,
        pid: u32,
        network_name: Option<&str>,
    ) -> FabricResult<Connection> {
        let network = match network_name {
            Some(name) => registry
                .get_network(name)
                .await?
                .ok_or_else(|| FabricError::NetworkNotFound(name.to_string()))?,
            None => registry.create_default_network().await?,
        };

        let mut undo = Vec::new();
        match self.attach(&network, container_id, pid, &mut undo).await {
            Ok(connection) => {
                info!(
                    container = container_id,
                    port = %connection.port_name,
                    ip = %connection.ip,
                    network = %network.id,
                    "container attached"
                );
                Ok(connection)
            }
            Err(e) => {
                self.rollback(undo).await;
                Err(e)
            }
        }
    }

    async fn attach(
        &mut self,
        network: &Network,
        container_id: &str,
        pid: u32,
        undo: &mut Vec<Undo>,
    ) -> FabricResult<Connection> {
        // A fresh random port name; the name is how callers refer to the
        // port from here on.
        self.check_injected("create-port")?;
        let port_name = utils::generate_port_name(CONNECTION_PORT_PREFIX, PORT_NAME_SUFFIX_LEN);
        self.switch
            .add_internal_port(&self.bridge, &port_name, network.vlan)
            .await
            .map_err(|e| FabricError::attachment("create-port", e.into()))?;
        undo.push(Undo::DeletePort(port_name.clone()));

        self.check_injected("interface-visible")?;
        self.wait_iface(&port_name)
            .await
            .map_err(|e| FabricError::attachment("interface-visible", e))?;

        self.check_injected("host-configure")?;
        let mtu = self.mtu;
        self.exec(&commands::build_set_mtu_cmd(&port_name, mtu))
            .await
            .map_err(|e| FabricError::attachment("host-configure", e))?;
        self.exec(&commands::build_link_up_cmd(&port_name))
            .await
            .map_err(|e| FabricError::attachment("host-configure", e))?;

        self.check_injected("allocate-address")?;
        let ip = self
            .allocator
            .request_ip(network.subnet)
            .await
            .map_err(|e| FabricError::attachment("allocate-address", e.into()))?;
        undo.push(Undo::ReleaseIp(ip, network.subnet));
        let mac = MacAddress::from_ipv4(ip);

        self.check_injected("bind-namespace")?;
        let handle = self
            .bind_netns(pid)
            .map_err(|e| FabricError::attachment("bind-namespace", e))?;

        self.check_injected("move-port")?;
        self.exec(&commands::build_move_to_netns_cmd(&port_name, pid))
            .await
            .map_err(|e| FabricError::attachment("move-port", e))?;

        self.check_injected("configure-container")?;
        let device = container_device(network.vlan);
        let cmds = container_commands(&port_name, &device, ip, network);
        self.run_in_namespace(handle, cmds).await?;

        Ok(Connection {
            container_id: container_id.to_string(),
            container_pid: pid,
            network: network.id.clone(),
            port_name,
            ip,
            subnet: network.subnet,
            mac,
            gateway: network.gateway,
        })
    }

    /// Runs accumulated undo actions, newest first. Failures are logged,
    /// not surfaced: the original error matters more.
    async fn rollback(&mut self, undo: Vec<Undo>) {
        for action in undo.into_iter().rev() {
            match action {
                Undo::DeletePort(port) => {
                    if let Err(e) = self.switch.delete_port(&self.bridge, &port).await {
                        warn!(%port, error = %e, "rollback: failed to delete port");
                    }
                }
                Undo::ReleaseIp(ip, subnet) => {
                    if let Err(e) = self.allocator.release_ip(ip, subnet).await {
                        warn!(%ip, error = %e, "rollback: failed to release address");
                    }
                }
            }
        }
    }

    /// Detaches a container: delete the switch port, return the address.
    ///
    /// The container's namespace is left alone; it may already be gone
    /// along with the container itself.
    #[instrument(skip(self))]
    pub async fn delete_connection(&mut self, connection: &Connection) -> FabricResult<()> {
        self.switch
            .delete_port(&self.bridge, &connection.port_name)
            .await?;
        self.allocator
            .release_ip(connection.ip, connection.subnet)
            .await?;
        info!(
            container = %connection.container_id,
            port = %connection.port_name,
            "container detached"
        );
        Ok(())
    }
}

/// Stable in-container device name, one per network.
fn container_device(vlan: u16) -> String {
    format!("eth{}", vlan)
}

/// The configuration sequence run inside the container's namespace.
fn container_commands(
    port: &str,
    device: &str,
    ip: Ipv4Addr,
    network: &Network,
) -> Vec<(&'static str, String)> {
    vec![
        ("link-down", commands::build_link_down_cmd(port)),
        ("rename", commands::build_rename_cmd(port, device)),
        (
            "assign-address",
            commands::build_add_addr_cmd(device, ip, network.subnet.prefix_len()),
        ),
        (
            "assign-mac",
            commands::build_set_mac_cmd(device, MacAddress::from_ipv4(ip)),
        ),
        ("link-up", commands::build_link_up_cmd(device)),
        (
            "default-route",
            commands::build_default_route_cmd(network.gateway),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::mock::MockSwitch;
    use fabric_ipam::Bitmap;
    use fabric_store::{MemoryStore, Store};
    use pretty_assertions::assert_eq;

    struct Harness {
        store: Arc<MemoryStore>,
        switch: Arc<MockSwitch>,
        registry: NetworkRegistry,
        orchestrator: AttachmentOrchestrator,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let switch = Arc::new(MockSwitch::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let allocator = Arc::new(ResourceAllocator::new(dyn_store.clone()));
        let registry = NetworkRegistry::new(
            dyn_store,
            allocator.clone(),
            switch.clone(),
            "fabric0",
            1440,
        )
        .with_mock_mode();
        let orchestrator =
            AttachmentOrchestrator::new(switch.clone(), allocator, "fabric0", 1440)
                .with_mock_mode();
        Harness {
            store,
            switch,
            registry,
            orchestrator,
        }
    }

    async fn pool_bits_set(store: &MemoryStore, subnet: &str) -> u64 {
        match store.get("ipam", subnet).await.unwrap() {
            Some(entry) => Bitmap::from_bytes(&entry.value, 65536).ones(),
            None => 0,
        }
    }

    #[tokio::test]
    async fn test_add_connection_to_default_network() {
        let mut h = harness();

        let conn = h
            .orchestrator
            .add_connection(&mut h.registry, "c-1", 4242, None)
            .await
            .unwrap();

        assert_eq!(conn.network, "default");
        assert_eq!(conn.container_pid, 4242);
        // Gateway took .1, the container gets .2
        assert_eq!(conn.ip, Ipv4Addr::new(10, 1, 0, 2));
        assert_eq!(conn.gateway, Ipv4Addr::new(10, 1, 0, 1));
        assert_eq!(conn.mac.to_string(), "02:42:0a:01:00:02");
        assert!(conn.port_name.starts_with(CONNECTION_PORT_PREFIX));
        assert_eq!(conn.port_name.len(), 10);

        // The port exists and is tagged with the default network's vlan
        assert!(h.switch.has_port(&conn.port_name));
        assert!(h.switch.ops().iter().any(|op| op.contains("tag=1")));

        // Host side, move, and in-namespace configuration all captured
        let cmds = h.orchestrator.captured_commands();
        assert!(cmds.iter().any(|c| c.contains("mtu 1440")));
        assert!(cmds.iter().any(|c| c.contains("netns 4242")));
        assert!(cmds.iter().any(|c| c.contains("name \"eth1\"")));
        assert!(cmds.iter().any(|c| c.contains("address add 10.1.0.2/16")));
        assert!(cmds
            .iter()
            .any(|c| c.contains("route replace default via 10.1.0.1")));
    }

    #[tokio::test]
    async fn test_add_connection_unknown_network() {
        let mut h = harness();
        let err = h
            .orchestrator
            .add_connection(&mut h.registry, "c-1", 4242, Some("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::NetworkNotFound(_)));
    }

    #[tokio::test]
    async fn test_failure_rolls_back_port_and_address() {
        let mut h = harness();
        h.orchestrator.fail_at("configure-container");

        let err = h
            .orchestrator
            .add_connection(&mut h.registry, "c-1", 4242, None)
            .await
            .unwrap_err();
        match err {
            FabricError::Attachment { step, .. } => assert_eq!(step, "configure-container"),
            other => panic!("expected attachment error, got {:?}", other),
        }

        // Only the gateway address remains allocated; the container port
        // is gone again
        assert_eq!(pool_bits_set(&h.store, "10.1.0.0/16").await, 1);
        let container_ports: Vec<String> = h
            .switch
            .port_names()
            .into_iter()
            .filter(|p| p.starts_with(CONNECTION_PORT_PREFIX))
            .collect();
        assert!(container_ports.is_empty());
    }

    #[tokio::test]
    async fn test_failure_before_allocation_leaves_pool_untouched() {
        let mut h = harness();
        h.orchestrator.fail_at("allocate-address");

        let err = h
            .orchestrator
            .add_connection(&mut h.registry, "c-1", 4242, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FabricError::Attachment {
                step: "allocate-address",
                ..
            }
        ));

        assert_eq!(pool_bits_set(&h.store, "10.1.0.0/16").await, 1);
        assert!(h
            .switch
            .port_names()
            .iter()
            .all(|p| !p.starts_with(CONNECTION_PORT_PREFIX)));
    }

    #[tokio::test]
    async fn test_delete_connection_releases_address() {
        let mut h = harness();
        let conn = h
            .orchestrator
            .add_connection(&mut h.registry, "c-1", 4242, None)
            .await
            .unwrap();
        assert_eq!(pool_bits_set(&h.store, "10.1.0.0/16").await, 2);

        h.orchestrator.delete_connection(&conn).await.unwrap();

        assert_eq!(pool_bits_set(&h.store, "10.1.0.0/16").await, 1);
        assert!(!h.switch.has_port(&conn.port_name));

        // The freed address is the next one handed out
        let again = h
            .orchestrator
            .add_connection(&mut h.registry, "c-2", 4243, None)
            .await
            .unwrap();
        assert_eq!(again.ip, conn.ip);
    }

    #[test]
    fn test_container_commands_sequence() {
        let network = Network {
            id: "default".to_string(),
            subnet: "10.1.0.0/16".parse().unwrap(),
            gateway: Ipv4Addr::new(10, 1, 0, 1),
            vlan: 7,
        };
        let cmds = container_commands("ovs1a2b3c4", "eth7", Ipv4Addr::new(10, 1, 0, 5), &network);

        let steps: Vec<&str> = cmds.iter().map(|(step, _)| *step).collect();
        assert_eq!(
            steps,
            vec![
                "link-down",
                "rename",
                "assign-address",
                "assign-mac",
                "link-up",
                "default-route"
            ]
        );
        // Down the old name, then configure the stable device name
        assert!(cmds[0].1.contains("ovs1a2b3c4"));
        assert!(cmds[2].1.contains("eth7"));
        assert!(cmds[3].1.contains("02:42:0a:01:00:05"));
    }

    #[test]
    fn test_container_device_name() {
        assert_eq!(container_device(1), "eth1");
        assert_eq!(container_device(4096), "eth4096");
    }
}
