//! fabricd - per-host fabric daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fabric_ovsdb::{Endpoint, OvsdbClient, OvsdbConfig};
use fabric_store::{ConsulConfig, ConsulStore, Store};
use fabricd::daemon::{DEFAULT_BRIDGE, DEFAULT_MTU};
use fabricd::{ClusterEvent, Daemon, DaemonRequest, Switch};

#[derive(Debug, Parser)]
#[command(name = "fabricd", about = "Container-networking fabric daemon")]
struct Args {
    /// Name of the fabric bridge on this host
    #[arg(long, default_value = DEFAULT_BRIDGE)]
    bridge: String,

    /// OVSDB management address (TCP)
    #[arg(long, default_value = "127.0.0.1:6640")]
    ovsdb: String,

    /// OVSDB unix socket path; overrides --ovsdb when set
    #[arg(long)]
    ovsdb_socket: Option<PathBuf>,

    /// Consul agent URL for the cluster KV store
    #[arg(long, default_value = "http://127.0.0.1:8500")]
    consul: String,

    /// MTU for fabric interfaces
    #[arg(long, default_value_t = DEFAULT_MTU)]
    mtu: u32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    info!(bridge = %args.bridge, "--- starting fabricd ---");

    let store: Arc<dyn Store> = Arc::new(ConsulStore::new(ConsulConfig::new(&args.consul)));

    let endpoint = match &args.ovsdb_socket {
        Some(path) => Endpoint::Unix(path.clone()),
        None => Endpoint::Tcp(args.ovsdb.clone()),
    };
    let ovs_config = OvsdbConfig::new(endpoint).with_guard_bridge(&args.bridge);
    let switch: Arc<dyn Switch> = Arc::new(OvsdbClient::connect(ovs_config).await);

    let mut daemon = Daemon::new(store, switch, &args.bridge, args.mtu);
    daemon.bootstrap().await?;

    // The management API and peer discovery hold these senders; they are
    // external collaborators wired up here.
    let (_request_tx, request_rx) = mpsc::channel::<DaemonRequest>(64);
    let (_event_tx, event_rx) = mpsc::channel::<ClusterEvent>(64);

    daemon.run(request_rx, event_rx).await;
    Ok(())
}
