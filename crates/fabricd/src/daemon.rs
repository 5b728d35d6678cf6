//! Daemon wiring: bootstrap, cluster membership, and the serial request
//! loop.
//!
//! Registry and attachment operations mutate host state, so the daemon
//! processes them one at a time from a channel; the management surface and
//! the peer-discovery mechanism only hold channel senders.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use fabric_ipam::ResourceAllocator;
use fabric_store::Store;
use fabric_types::Ipv4Subnet;

use crate::connection::{AttachmentOrchestrator, Connection};
use crate::error::{FabricError, FabricResult};
use crate::network::{Network, NetworkRegistry};
use crate::switch::Switch;

/// Default MTU for fabric interfaces, leaving room for the VXLAN header.
pub const DEFAULT_MTU: u32 = 1440;

/// Default bridge name.
pub const DEFAULT_BRIDGE: &str = "fabric0";

/// Cluster membership changes, delivered by the discovery mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A host joined: build a tunnel towards it.
    MemberJoined(Ipv4Addr),
    /// A host left: tear its tunnel down.
    MemberLeft(Ipv4Addr),
}

/// Requests served by the daemon loop, with reply channels.
#[derive(Debug)]
pub enum DaemonRequest {
    CreateNetwork {
        id: String,
        subnet: Ipv4Subnet,
        reply: oneshot::Sender<FabricResult<Network>>,
    },
    DeleteNetwork {
        id: String,
        reply: oneshot::Sender<FabricResult<()>>,
    },
    ListNetworks {
        reply: oneshot::Sender<FabricResult<Vec<Network>>>,
    },
    AddConnection {
        container_id: String,
        pid: u32,
        network: Option<String>,
        reply: oneshot::Sender<FabricResult<Connection>>,
    },
    DeleteConnection {
        container_id: String,
        reply: oneshot::Sender<FabricResult<()>>,
    },
}

/// The per-host fabric daemon.
pub struct Daemon {
    bridge: String,
    switch: Arc<dyn Switch>,
    registry: NetworkRegistry,
    orchestrator: AttachmentOrchestrator,
    connections: HashMap<String, Connection>,
}

impl Daemon {
    /// Assembles a daemon over its collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        switch: Arc<dyn Switch>,
        bridge: impl Into<String>,
        mtu: u32,
    ) -> Self {
        let bridge = bridge.into();
        let allocator = Arc::new(ResourceAllocator::new(store.clone()));
        let registry = NetworkRegistry::new(
            store,
            allocator.clone(),
            switch.clone(),
            bridge.clone(),
            mtu,
        );
        let orchestrator =
            AttachmentOrchestrator::new(switch.clone(), allocator, bridge.clone(), mtu);
        Self {
            bridge,
            switch,
            registry,
            orchestrator,
            connections: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn new_mock(store: Arc<dyn Store>, switch: Arc<dyn Switch>) -> Self {
        let bridge = DEFAULT_BRIDGE.to_string();
        let allocator = Arc::new(ResourceAllocator::new(store.clone()));
        let registry = NetworkRegistry::new(
            store,
            allocator.clone(),
            switch.clone(),
            bridge.clone(),
            DEFAULT_MTU,
        )
        .with_mock_mode();
        let orchestrator =
            AttachmentOrchestrator::new(switch.clone(), allocator, bridge.clone(), DEFAULT_MTU)
                .with_mock_mode();
        Self {
            bridge,
            switch,
            registry,
            orchestrator,
            connections: HashMap::new(),
        }
    }

    /// Brings the host into the fabric: ensure the bridge, restore any
    /// connections recorded on the switch, and ensure the default network.
    pub async fn bootstrap(&mut self) -> FabricResult<()> {
        self.switch.ensure_bridge(&self.bridge).await?;
        self.populate_connections();
        self.registry.create_default_network().await?;
        info!(bridge = %self.bridge, "fabric bootstrapped");
        Ok(())
    }

    /// Restores the connection table from contexts stored on the switch's
    /// interface rows. Records that fail to decode are skipped.
    pub fn populate_connections(&mut self) {
        for (container_id, data) in self.switch.connection_contexts() {
            match serde_json::from_str::<Connection>(&data) {
                Ok(connection) => {
                    self.connections.insert(container_id, connection);
                }
                Err(e) => {
                    warn!(container = %container_id, error = %e, "skipping undecodable connection context");
                }
            }
        }
        if !self.connections.is_empty() {
            info!(count = self.connections.len(), "restored connections");
        }
    }

    /// Reacts to a membership change by adding or removing the peer's
    /// tunnel.
    pub async fn handle_cluster_event(&mut self, event: ClusterEvent) -> FabricResult<()> {
        match event {
            ClusterEvent::MemberJoined(ip) => self.add_peer(ip).await,
            ClusterEvent::MemberLeft(ip) => self.delete_peer(ip).await,
        }
    }

    /// Creates the VXLAN tunnel port towards a peer host.
    pub async fn add_peer(&mut self, peer_ip: Ipv4Addr) -> FabricResult<()> {
        let port = peer_port_name(peer_ip);
        self.switch
            .add_vxlan_port(&self.bridge, &port, &peer_ip.to_string())
            .await?;
        info!(peer = %peer_ip, "peer tunnel added");
        Ok(())
    }

    /// Removes the VXLAN tunnel port of a departed peer.
    pub async fn delete_peer(&mut self, peer_ip: Ipv4Addr) -> FabricResult<()> {
        self.switch
            .delete_port(&self.bridge, &peer_port_name(peer_ip))
            .await?;
        info!(peer = %peer_ip, "peer tunnel removed");
        Ok(())
    }

    /// Attaches a container and records the connection, stamping it onto
    /// the switch so it survives a daemon restart.
    pub async fn add_connection(
        &mut self,
        container_id: &str,
        pid: u32,
        network: Option<&str>,
    ) -> FabricResult<Connection> {
        let connection = self
            .orchestrator
            .add_connection(&mut self.registry, container_id, pid, network)
            .await?;

        let data =
            serde_json::to_string(&connection).expect("connection serialization cannot fail");
        if let Err(e) = self
            .switch
            .set_port_context(&connection.port_name, container_id, &data)
            .await
        {
            warn!(container = container_id, error = %e, "failed to store connection context");
        }

        self.connections
            .insert(container_id.to_string(), connection.clone());
        Ok(connection)
    }

    /// Tears down a container's connection.
    pub async fn delete_connection(&mut self, container_id: &str) -> FabricResult<()> {
        let connection = self
            .connections
            .remove(container_id)
            .ok_or_else(|| FabricError::ConnectionNotFound(container_id.to_string()))?;
        self.orchestrator.delete_connection(&connection).await
    }

    /// The tracked connections, by container id.
    pub fn connections(&self) -> &HashMap<String, Connection> {
        &self.connections
    }

    /// Serves requests and membership events until either channel closes.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<DaemonRequest>,
        mut events: mpsc::Receiver<ClusterEvent>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.serve(request).await,
                    None => break,
                },
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_cluster_event(event).await {
                            error!(error = %e, "cluster event failed");
                        }
                    }
                    None => break,
                },
            }
        }
        info!("daemon loop stopped");
    }

    async fn serve(&mut self, request: DaemonRequest) {
        match request {
            DaemonRequest::CreateNetwork { id, subnet, reply } => {
                let _ = reply.send(self.registry.create_network(&id, subnet).await);
            }
            DaemonRequest::DeleteNetwork { id, reply } => {
                let _ = reply.send(self.registry.delete_network(&id).await);
            }
            DaemonRequest::ListNetworks { reply } => {
                let _ = reply.send(self.registry.list_networks().await);
            }
            DaemonRequest::AddConnection {
                container_id,
                pid,
                network,
                reply,
            } => {
                let result = self
                    .add_connection(&container_id, pid, network.as_deref())
                    .await;
                let _ = reply.send(result);
            }
            DaemonRequest::DeleteConnection {
                container_id,
                reply,
            } => {
                let _ = reply.send(self.delete_connection(&container_id).await);
            }
        }
    }
}

/// Tunnel port name for a peer, derived from its address.
fn peer_port_name(peer_ip: Ipv4Addr) -> String {
    format!("vxlan-{}", peer_ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::mock::MockSwitch;
    use fabric_store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn daemon() -> (Daemon, Arc<MockSwitch>) {
        let store = Arc::new(MemoryStore::new());
        let switch = Arc::new(MockSwitch::new());
        (Daemon::new_mock(store, switch.clone()), switch)
    }

    #[tokio::test]
    async fn test_bootstrap_creates_bridge_and_default_network() {
        let (mut daemon, switch) = daemon();
        daemon.bootstrap().await.unwrap();

        assert!(switch.has_port(DEFAULT_BRIDGE));
        let network = daemon
            .registry
            .get_network(crate::network::DEFAULT_NETWORK)
            .await
            .unwrap();
        assert!(network.is_some());
    }

    #[tokio::test]
    async fn test_peer_lifecycle() {
        let (mut daemon, switch) = daemon();
        let peer = Ipv4Addr::new(192, 168, 1, 7);

        daemon
            .handle_cluster_event(ClusterEvent::MemberJoined(peer))
            .await
            .unwrap();
        assert!(switch.has_port("vxlan-192.168.1.7"));
        assert!(switch
            .ops()
            .iter()
            .any(|op| op.contains("remote=192.168.1.7")));

        daemon
            .handle_cluster_event(ClusterEvent::MemberLeft(peer))
            .await
            .unwrap();
        assert!(!switch.has_port("vxlan-192.168.1.7"));
    }

    #[tokio::test]
    async fn test_connection_lifecycle_through_daemon() {
        let (mut daemon, switch) = daemon();
        daemon.bootstrap().await.unwrap();

        let conn = daemon.add_connection("c-1", 4242, None).await.unwrap();
        assert_eq!(daemon.connections().len(), 1);
        assert!(switch.has_port(&conn.port_name));
        // Context stamped for restart recovery
        assert_eq!(switch.connection_contexts().len(), 1);

        daemon.delete_connection("c-1").await.unwrap();
        assert!(daemon.connections().is_empty());
        assert!(!switch.has_port(&conn.port_name));

        let err = daemon.delete_connection("c-1").await.unwrap_err();
        assert!(matches!(err, FabricError::ConnectionNotFound(_)));
    }

    #[tokio::test]
    async fn test_populate_connections_from_switch() {
        let (mut daemon, switch) = daemon();

        let connection = Connection {
            container_id: "c-9".to_string(),
            container_pid: 999,
            network: "default".to_string(),
            port_name: "ovs9999999".to_string(),
            ip: Ipv4Addr::new(10, 1, 0, 9),
            subnet: "10.1.0.0/16".parse().unwrap(),
            mac: fabric_types::MacAddress::from_ipv4(Ipv4Addr::new(10, 1, 0, 9)),
            gateway: Ipv4Addr::new(10, 1, 0, 1),
        };
        switch.push_context("c-9", &serde_json::to_string(&connection).unwrap());
        switch.push_context("bad", "not json");

        daemon.populate_connections();

        assert_eq!(daemon.connections().len(), 1);
        assert_eq!(daemon.connections()["c-9"], connection);
    }

    #[tokio::test]
    async fn test_request_loop_serves_and_stops() {
        let (daemon, _switch) = daemon();
        let (request_tx, request_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);

        let handle = tokio::spawn(daemon.run(request_rx, event_rx));

        let (reply_tx, reply_rx) = oneshot::channel();
        request_tx
            .send(DaemonRequest::CreateNetwork {
                id: "web".to_string(),
                subnet: "10.1.0.0/16".parse().unwrap(),
                reply: reply_tx,
            })
            .await
            .unwrap();
        let network = reply_rx.await.unwrap().unwrap();
        assert_eq!(network.id, "web");

        drop(request_tx);
        drop(event_tx);
        handle.await.unwrap();
    }
}
