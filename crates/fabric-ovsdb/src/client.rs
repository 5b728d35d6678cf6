//! Session management and transactional operations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::mirror::{TableMirror, TableUpdates};
use crate::ops;
use crate::rpc::{self, FrameDecoder, Incoming};
use crate::{OvsError, OvsResult};

const DB_NAME: &str = "Open_vSwitch";

/// Interface `other_config` keys carrying attachment context.
pub const CONTEXT_KEY: &str = "container_id";
pub const CONTEXT_VALUE: &str = "container_data";

/// Where to reach the switch daemon's management socket.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// TCP address, e.g. `127.0.0.1:6640`.
    Tcp(String),
    /// Unix domain socket, e.g. `/var/run/openvswitch/db.sock`.
    Unix(PathBuf),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct OvsdbConfig {
    /// Management socket location.
    pub endpoint: Endpoint,
    /// Delay between (re)connection attempts.
    pub reconnect_delay: Duration,
    /// Bridge to re-create if it is observed being deleted out-of-band.
    pub guard_bridge: Option<String>,
}

impl OvsdbConfig {
    /// Creates a config for the given endpoint with the default retry delay.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            reconnect_delay: Duration::from_secs(2),
            guard_bridge: None,
        }
    }

    /// Names the bridge the client should heal after external deletion.
    pub fn with_guard_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.guard_bridge = Some(bridge.into());
        self
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One live connection: the write half plus the in-flight request table.
struct Session {
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<HashMap<u64, oneshot::Sender<(Value, Value)>>>,
    next_id: AtomicU64,
}

impl Session {
    fn new(writer: BoxedWriter) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Sends a request and waits for the matching reply.
    async fn request(&self, method: &str, params: Value) -> OvsResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .insert(id, tx);

        let frame = rpc::request_frame(id, method, &params);
        let written = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            self.pending
                .lock()
                .expect("pending mutex poisoned")
                .remove(&id);
            return Err(e.into());
        }

        match rx.await {
            Ok((result, error)) => {
                if !error.is_null() {
                    return Err(OvsError::protocol(error.to_string()));
                }
                Ok(result)
            }
            // The reader dropped our sender: session torn down mid-flight.
            Err(_) => Err(OvsError::NotConnected),
        }
    }

    /// Routes a reply to its waiting request.
    fn complete(&self, id: u64, result: Value, error: Value) {
        if let Some(tx) = self
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .remove(&id)
        {
            let _ = tx.send((result, error));
        }
    }

    /// Answers a server-initiated request (echo keep-alive).
    async fn reply(&self, id: &Value, result: &Value) -> OvsResult<()> {
        let frame = rpc::reply_frame(id, result);
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Fails every in-flight request. Dropping the senders wakes the
    /// awaiting callers with `NotConnected`.
    fn fail_all(&self) {
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .clear();
    }
}

/// Events delivered to the mirror task, the mirror's only writer.
enum MirrorEvent {
    /// Fresh dump after (re)connecting: replaces all mirrored state, then
    /// acks so the connector can proceed.
    Snapshot(TableUpdates, oneshot::Sender<()>),
    /// Incremental change notification.
    Update(TableUpdates),
}

struct ClientInner {
    config: OvsdbConfig,
    session: Mutex<Option<Arc<Session>>>,
    mirror: RwLock<TableMirror>,
    update_tx: mpsc::UnboundedSender<MirrorEvent>,
}

impl ClientInner {
    fn current_session(&self) -> OvsResult<Arc<Session>> {
        self.session
            .lock()
            .expect("session mutex poisoned")
            .clone()
            .ok_or(OvsError::NotConnected)
    }

    fn drop_session(&self) {
        if let Some(session) = self
            .session
            .lock()
            .expect("session mutex poisoned")
            .take()
        {
            session.fail_all();
        }
    }

    /// Runs a transaction and checks every per-operation reply.
    ///
    /// The switch applies or rejects the batch as a whole; a reported row
    /// error is surfaced, not rolled back client-side.
    async fn transact(&self, operations: Vec<Value>) -> OvsResult<Vec<Value>> {
        let session = self.current_session()?;
        let count = operations.len();

        let mut params = vec![json!(DB_NAME)];
        params.extend(operations);
        let result = session.request("transact", Value::Array(params)).await?;

        let rows = result
            .as_array()
            .cloned()
            .ok_or_else(|| OvsError::protocol("transact reply is not an array"))?;
        if rows.len() < count {
            return Err(OvsError::protocol(format!(
                "transact returned {} replies for {} operations",
                rows.len(),
                count
            )));
        }
        for (index, row) in rows.iter().enumerate() {
            if let Some(err) = row.get("error").and_then(Value::as_str) {
                if !err.is_empty() {
                    let details = row
                        .get("details")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    return Err(OvsError::transaction(index, err, details));
                }
            }
        }
        Ok(rows)
    }

    async fn create_bridge(&self, name: &str) -> OvsResult<()> {
        // A bridge always carries a same-named port; its presence in the
        // mirror means the bridge exists.
        if self.has_port(name) {
            debug!(bridge = name, "bridge already present");
            return Ok(());
        }
        let root = self
            .root_uuid()
            .ok_or(OvsError::NotConnected)?;
        self.transact(ops::create_bridge(name, &root)).await?;
        info!(bridge = name, "bridge created");
        Ok(())
    }

    async fn add_internal_port(&self, bridge: &str, port: &str, tag: u16) -> OvsResult<()> {
        self.transact(ops::add_internal_port(bridge, port, tag))
            .await?;
        info!(bridge, port, tag, "internal port added");
        Ok(())
    }

    async fn add_vxlan_port(&self, bridge: &str, port: &str, remote_ip: &str) -> OvsResult<()> {
        self.transact(ops::add_vxlan_port(bridge, port, remote_ip))
            .await?;
        info!(bridge, port, remote_ip, "vxlan port added");
        Ok(())
    }

    async fn delete_port(&self, bridge: &str, port: &str) -> OvsResult<()> {
        // The port may already be gone (container cleanup racing with us);
        // an unknown name is a no-op, not an error.
        let Some(uuid) = self.port_uuid(port) else {
            warn!(port, "no mirrored port to delete");
            return Ok(());
        };
        self.transact(ops::delete_port(bridge, &uuid)).await?;
        info!(bridge, port, "port deleted");
        Ok(())
    }

    async fn set_port_context(&self, port: &str, container_id: &str, data: &str) -> OvsResult<()> {
        self.transact(ops::set_port_context(port, CONTEXT_KEY, container_id))
            .await?;
        self.transact(ops::set_port_context(port, CONTEXT_VALUE, data))
            .await?;
        Ok(())
    }

    fn has_port(&self, name: &str) -> bool {
        self.mirror
            .read()
            .expect("mirror lock poisoned")
            .uuid_of("Port", name)
            .is_some()
    }

    fn port_uuid(&self, name: &str) -> Option<String> {
        self.mirror
            .read()
            .expect("mirror lock poisoned")
            .uuid_of("Port", name)
            .map(str::to_string)
    }

    fn root_uuid(&self) -> Option<String> {
        self.mirror
            .read()
            .expect("mirror lock poisoned")
            .root_uuid()
            .map(str::to_string)
    }
}

/// Client handle to the switch daemon.
///
/// Cheap to clone; all clones share one session and one mirror.
#[derive(Clone)]
pub struct OvsdbClient {
    inner: Arc<ClientInner>,
}

impl OvsdbClient {
    /// Connects to the switch, registers for change notifications, and
    /// applies the initial table dump before returning.
    ///
    /// The switch is load-bearing for every fabric operation, so absence is
    /// never surfaced here: connection attempts repeat with a fixed delay
    /// until one succeeds, and a later disconnect triggers the same loop in
    /// the background.
    pub async fn connect(config: OvsdbConfig) -> Self {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            config,
            session: Mutex::new(None),
            mirror: RwLock::new(TableMirror::new()),
            update_tx,
        });
        tokio::spawn(mirror_task(Arc::downgrade(&inner), update_rx));

        let disconnect_rx = loop {
            match establish(&inner).await {
                Ok(rx) => break rx,
                Err(e) => {
                    error!(error = %e, "cannot reach switch, retrying");
                    tokio::time::sleep(inner.config.reconnect_delay).await;
                }
            }
        };
        tokio::spawn(supervise(inner.clone(), disconnect_rx));

        OvsdbClient { inner }
    }

    /// Returns true while a session to the switch is live.
    pub fn is_connected(&self) -> bool {
        self.inner
            .session
            .lock()
            .expect("session mutex poisoned")
            .is_some()
    }

    /// Creates the bridge if the mirror does not already show it.
    pub async fn create_bridge(&self, name: &str) -> OvsResult<()> {
        self.inner.create_bridge(name).await
    }

    /// Adds an internal port (container or gateway interface) to a bridge.
    /// A non-zero `tag` isolates the port onto that VLAN.
    pub async fn add_internal_port(&self, bridge: &str, port: &str, tag: u16) -> OvsResult<()> {
        self.inner.add_internal_port(bridge, port, tag).await
    }

    /// Adds a VXLAN tunnel port towards a peer host.
    pub async fn add_vxlan_port(&self, bridge: &str, port: &str, remote_ip: &str) -> OvsResult<()> {
        self.inner.add_vxlan_port(bridge, port, remote_ip).await
    }

    /// Deletes a port by name. Unknown names are a no-op.
    pub async fn delete_port(&self, bridge: &str, port: &str) -> OvsResult<()> {
        self.inner.delete_port(bridge, port).await
    }

    /// Stores attachment context on a port's interface row.
    pub async fn set_port_context(
        &self,
        port: &str,
        container_id: &str,
        data: &str,
    ) -> OvsResult<()> {
        self.inner.set_port_context(port, container_id, data).await
    }

    /// Returns true if the mirror shows a port with this name.
    pub fn has_port(&self, name: &str) -> bool {
        self.inner.has_port(name)
    }

    /// Resolves a port name to its server-assigned identifier.
    pub fn port_uuid(&self, name: &str) -> Option<String> {
        self.inner.port_uuid(name)
    }

    /// Reads back every attachment context stored on interface rows.
    pub fn connection_contexts(&self) -> Vec<(String, String)> {
        let mirror = self.inner.mirror.read().expect("mirror lock poisoned");
        let mut contexts = Vec::new();
        for (_uuid, row) in mirror.rows("Interface") {
            let id = ovs_map_get(row.get("other_config"), CONTEXT_KEY);
            let data = ovs_map_get(row.get("other_config"), CONTEXT_VALUE);
            if let (Some(id), Some(data)) = (id, data) {
                contexts.push((id, data));
            }
        }
        contexts
    }

    #[cfg(test)]
    fn offline(config: OvsdbConfig) -> Self {
        let (update_tx, _update_rx) = mpsc::unbounded_channel();
        OvsdbClient {
            inner: Arc::new(ClientInner {
                config,
                session: Mutex::new(None),
                mirror: RwLock::new(TableMirror::new()),
                update_tx,
            }),
        }
    }
}

/// Reads a value out of an OVSDB map column (`["map", [[k, v], ...]]`).
fn ovs_map_get(column: Option<&Value>, key: &str) -> Option<String> {
    let pairs = column?.as_array()?;
    if pairs.first()?.as_str()? != "map" {
        return None;
    }
    for pair in pairs.get(1)?.as_array()? {
        let kv = pair.as_array()?;
        if kv.first()?.as_str()? == key {
            return kv.get(1)?.as_str().map(str::to_string);
        }
    }
    None
}

/// Opens the transport and returns its two halves.
async fn open_stream(endpoint: &Endpoint) -> std::io::Result<(BoxedReader, BoxedWriter)> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            let (r, w) = stream.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            let (r, w) = stream.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
    }
}

/// Builds one session: connect, spawn the reader, register the monitor, and
/// apply the initial dump. Returns a receiver that fires when the reader
/// exits (i.e. the session died).
async fn establish(inner: &Arc<ClientInner>) -> OvsResult<oneshot::Receiver<()>> {
    let (reader, writer) = open_stream(&inner.config.endpoint).await?;

    let session = Arc::new(Session::new(writer));
    *inner.session.lock().expect("session mutex poisoned") = Some(session.clone());

    let (disconnect_tx, disconnect_rx) = oneshot::channel();
    tokio::spawn(reader_task(
        reader,
        session.clone(),
        inner.update_tx.clone(),
        disconnect_tx,
    ));

    let monitored = json!({
        "Open_vSwitch": {},
        "Bridge": {},
        "Port": {},
        "Interface": {},
    });
    let initial = match session
        .request("monitor", json!([DB_NAME, null, monitored]))
        .await
    {
        Ok(initial) => initial,
        Err(e) => {
            inner.drop_session();
            return Err(e);
        }
    };

    let updates = match TableUpdates::from_value(&initial) {
        Ok(updates) => updates,
        Err(e) => {
            inner.drop_session();
            return Err(e);
        }
    };
    let (ack_tx, ack_rx) = oneshot::channel();
    let _ = inner
        .update_tx
        .send(MirrorEvent::Snapshot(updates, ack_tx));
    if ack_rx.await.is_err() {
        inner.drop_session();
        return Err(OvsError::NotConnected);
    }

    info!("connected to switch");
    Ok(disconnect_rx)
}

/// Waits out the current session and reconnects forever.
async fn supervise(inner: Arc<ClientInner>, mut disconnect_rx: oneshot::Receiver<()>) {
    loop {
        // Err means the reader dropped its end; either way the session died.
        let _ = (&mut disconnect_rx).await;
        warn!("switch session lost, reconnecting");
        inner.drop_session();

        loop {
            tokio::time::sleep(inner.config.reconnect_delay).await;
            match establish(&inner).await {
                Ok(rx) => {
                    disconnect_rx = rx;
                    break;
                }
                Err(e) => warn!(error = %e, "switch reconnect failed"),
            }
        }
    }
}

/// Reads frames until the stream dies, routing replies to waiting requests,
/// answering echoes, and forwarding updates to the mirror task.
async fn reader_task(
    mut reader: BoxedReader,
    session: Arc<Session>,
    update_tx: mpsc::UnboundedSender<MirrorEvent>,
    _disconnect_tx: oneshot::Sender<()>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 16 * 1024];

    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "switch read failed");
                break;
            }
        };
        decoder.extend(&buf[..n]);

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(e) = dispatch(frame, &session, &update_tx).await {
                        warn!(error = %e, "dropping switch session");
                        break 'read;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "dropping switch session");
                    break 'read;
                }
            }
        }
    }
    // _disconnect_tx drops here, waking the supervisor.
}

async fn dispatch(
    frame: Value,
    session: &Session,
    update_tx: &mpsc::UnboundedSender<MirrorEvent>,
) -> OvsResult<()> {
    match rpc::classify(frame)? {
        Incoming::Reply { id, result, error } => {
            session.complete(id, result, error);
            Ok(())
        }
        Incoming::Request { id, method, params } if method == "echo" => {
            session.reply(&id, &params).await
        }
        Incoming::Request { id, method, .. } => {
            debug!(%method, ?id, "ignoring unsupported server request");
            Ok(())
        }
        Incoming::Notification { method, params } if method == "update" => {
            let updates_value = params
                .get(1)
                .ok_or_else(|| OvsError::protocol("update without table-updates"))?;
            let updates = TableUpdates::from_value(updates_value)?;
            let _ = update_tx.send(MirrorEvent::Update(updates));
            Ok(())
        }
        Incoming::Notification { method, .. } => {
            debug!(%method, "ignoring notification");
            Ok(())
        }
    }
}

/// The mirror's single writer. Applies snapshots and updates in arrival
/// order and re-creates the guarded bridge if it vanishes underneath us.
async fn mirror_task(inner: Weak<ClientInner>, mut rx: mpsc::UnboundedReceiver<MirrorEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };

        match event {
            MirrorEvent::Snapshot(updates, ack) => {
                {
                    let mut mirror = inner.mirror.write().expect("mirror lock poisoned");
                    mirror.clear();
                    mirror.apply(&updates);
                }
                let _ = ack.send(());
            }
            MirrorEvent::Update(updates) => {
                let removed = inner
                    .mirror
                    .write()
                    .expect("mirror lock poisoned")
                    .apply(&updates);

                let Some(guard) = inner.config.guard_bridge.clone() else {
                    continue;
                };
                for gone in removed {
                    if gone.table == "Bridge"
                        && gone.row.get("name").and_then(Value::as_str) == Some(guard.as_str())
                    {
                        warn!(bridge = %guard, "bridge deleted out-of-band, recreating");
                        let inner = inner.clone();
                        let name = guard.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.create_bridge(&name).await {
                                error!(bridge = %name, error = %e, "bridge re-creation failed");
                            }
                        });
                    }
                }
            }
        }
    }
}
