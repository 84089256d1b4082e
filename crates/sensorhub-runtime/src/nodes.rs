//! Serial node link manager.
//!
//! A [`NodeClient`] owns one open serial link to a sensor node and serializes
//! every command on it: the link sits behind an async mutex, and the blocking
//! write-then-read exchange runs on Tokio's blocking pool while the mutex is
//! held. Transport-level failures are retried with exponential backoff; when
//! the attempts run out the link is closed and the client reports itself
//! offline.
//!
//! [`NodeLinkManager`] keeps the registry of connected clients keyed by
//! [`NodeKey`], discovers nodes on matching serial ports through the
//! `hello`/`hello_ack` handshake and keeps node calibration in sync with the
//! store. Unhealthy clients are evicted lazily, on the next access.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use sensorhub_core::config::{NodeConfig, SerialConfig};
use sensorhub_core::{
    Error, LinkStatus, NodeKey, NodeMode, NodeUpsert, Reading, Result, SetupId, now_ms,
};
use sensorhub_hardware::{PortInfo, SerialBackend, SerialLink, SerialSettings};
use sensorhub_protocol::{AllReport, NodeHello, NodeLineCodec, NodeMessage, SimOverrides};
use serde_json::Value;
use tokio::task::JoinError;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

use crate::scheduler::{PollIntervals, run_periodic};
use crate::store::Store;

const READ_CHUNK: usize = 512;

fn blocking_failed(e: JoinError) -> Error {
    Error::ResourceExhaustion(format!("serial worker thread failed: {e}"))
}

/// An open link plus its receive buffer.
#[derive(Debug)]
struct LinkState<L> {
    link: L,
    buf: BytesMut,
    codec: NodeLineCodec,
}

impl<L: SerialLink> LinkState<L> {
    fn new(link: L) -> Self {
        Self {
            link,
            buf: BytesMut::with_capacity(READ_CHUNK),
            codec: NodeLineCodec::new(),
        }
    }

    fn write(&mut self, message: NodeMessage) -> Result<()> {
        let mut out = BytesMut::new();
        self.codec.encode(message, &mut out)?;
        self.link.write_all(&out)?;
        Ok(())
    }

    /// Read until one message decodes or `deadline` passes.
    ///
    /// Malformed lines surface as errors; blank lines are skipped by the codec.
    fn read_message(&mut self, deadline: Instant, timeout: Duration) -> Result<NodeMessage> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(message) = self.codec.decode(&mut self.buf)? {
                return Ok(message);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(timeout.as_millis() as u64));
            }
            let n = self.link.read_chunk(&mut chunk)?;
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// One request/response exchange.
    ///
    /// Stale input is discarded before writing. Unsolicited `hello` lines
    /// are skipped unless a `hello` is what the request expects.
    fn exchange(&mut self, request: NodeMessage, timeout: Duration) -> Result<Option<NodeMessage>> {
        let expected = request.expected_reply();
        self.buf.clear();
        self.write(request)?;

        let Some(expected) = expected else {
            return Ok(None);
        };

        let deadline = Instant::now() + timeout;
        loop {
            let reply = self.read_message(deadline, timeout)?;
            if matches!(reply, NodeMessage::Hello(_)) && expected != "hello" {
                debug!(port = %self.link.port(), "Skipping unsolicited hello");
                continue;
            }
            return Ok(Some(reply));
        }
    }
}

/// Open `port` and run the `hello`/`hello_ack` handshake.
///
/// Blocking; lines that are not a valid `hello` are skipped until the
/// handshake deadline passes.
fn handshake<B: SerialBackend>(
    backend: &B,
    port: &str,
    serial: &SerialConfig,
) -> Result<(LinkState<B::Link>, NodeHello)> {
    let link = backend.open(port, &SerialSettings::from(serial))?;
    let mut state = LinkState::new(link);
    std::thread::sleep(serial.open_delay());

    let timeout = serial.handshake_timeout();
    let deadline = Instant::now() + timeout;
    let mut last_error = None;

    let outcome = loop {
        match state.read_message(deadline, timeout) {
            Ok(NodeMessage::Hello(hello)) => break Ok(hello),
            Ok(other) => {
                debug!(port, kind = other.kind(), "Ignoring message during handshake");
            }
            Err(Error::Timeout(ms)) => {
                break Err(match last_error.take() {
                    Some(e) => Error::protocol(format!("hello parse failed: {e}")),
                    None => Error::Timeout(ms),
                });
            }
            Err(e @ (Error::Protocol(_) | Error::FrameTooLarge { .. })) => {
                debug!(port, error = %e, "Skipping malformed handshake line");
                last_error = Some(e);
            }
            Err(e) => break Err(e),
        }
    };

    match outcome {
        Ok(hello) => {
            state.write(NodeMessage::HelloAck(hello.clone()))?;
            Ok((state, hello))
        }
        Err(e) => {
            state.link.close();
            Err(e)
        }
    }
}

/// Retry policy and timing for commands on one node.
#[derive(Debug, Clone)]
struct CommandPolicy {
    nodes: NodeConfig,
    timeout: Duration,
}

/// Command-capable handle to one connected node.
pub struct NodeClient<L> {
    key: NodeKey,
    port: String,
    identity: Mutex<NodeHello>,
    link: tokio::sync::Mutex<Option<LinkState<L>>>,
    open: AtomicBool,
    policy: CommandPolicy,
}

impl<L> std::fmt::Debug for NodeClient<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient")
            .field("key", &self.key)
            .field("port", &self.port)
            .field("open", &self.open.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<L: SerialLink> NodeClient<L> {
    fn new(
        key: NodeKey,
        state: LinkState<L>,
        hello: NodeHello,
        serial: &SerialConfig,
        nodes: &NodeConfig,
    ) -> Self {
        Self {
            key,
            port: state.link.port().to_string(),
            identity: Mutex::new(hello),
            link: tokio::sync::Mutex::new(Some(state)),
            open: AtomicBool::new(true),
            policy: CommandPolicy {
                nodes: nodes.clone(),
                timeout: serial.timeout(),
            },
        }
    }

    fn identity_guard(&self) -> MutexGuard<'_, NodeHello> {
        self.identity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Identity announced in the last `hello`, with the calibration hash
    /// updated after each successful sync.
    pub fn identity(&self) -> NodeHello {
        self.identity_guard().clone()
    }

    pub fn calib_hash(&self) -> Option<String> {
        self.identity_guard().calib_hash.clone()
    }

    fn set_calib_hash(&self, hash: String) {
        self.identity_guard().calib_hash = Some(hash);
    }

    /// Whether the link is usable. A link busy with a command counts as open.
    pub fn is_open(&self) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        match self.link.try_lock() {
            Ok(guard) => guard.as_ref().is_some_and(|state| state.link.is_open()),
            Err(_) => true,
        }
    }

    /// Send one command, waiting for its reply if it expects one.
    ///
    /// Retryable failures are retried with `base * 2^attempt` backoff. When
    /// the attempts are exhausted the link is closed and the last error is
    /// returned.
    pub async fn send(&self, message: NodeMessage) -> Result<Option<NodeMessage>> {
        let mut guard = self.link.lock().await;
        let attempts = self.policy.nodes.retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let Some(mut state) = guard.take() else {
                return Err(Error::NodeOffline(self.key.to_string()));
            };
            let request = message.clone();
            let timeout = self.policy.timeout;

            let (state, result) = match tokio::task::spawn_blocking(move || {
                let result = state.exchange(request, timeout);
                (state, result)
            })
            .await
            {
                Ok(done) => done,
                Err(e) => {
                    self.open.store(false, Ordering::SeqCst);
                    return Err(blocking_failed(e));
                }
            };
            let still_open = state.link.is_open();
            *guard = Some(state);

            match result {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() && still_open => {
                    warn!(
                        node_key = %self.key,
                        command = message.kind(),
                        attempt = attempt + 1,
                        error = %e,
                        "nodes.command_retry"
                    );
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.policy.nodes.backoff(attempt)).await;
                    }
                }
                Err(e) if e.is_retryable() => {
                    last_error = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(mut state) = guard.take() {
            state.link.close();
        }
        self.open.store(false, Ordering::SeqCst);
        let error = last_error.unwrap_or_else(|| Error::NodeOffline(self.key.to_string()));
        warn!(node_key = %self.key, command = message.kind(), error = %error, "nodes.command_failed");
        Err(error)
    }

    async fn request(&self, message: NodeMessage) -> Result<NodeMessage> {
        let expected = message.expected_reply().unwrap_or("reply");
        match self.send(message).await? {
            Some(NodeMessage::Error { msg } | NodeMessage::Unknown { msg }) => {
                Err(Error::protocol(format!("node rejected command: {msg}")))
            }
            Some(reply) => Ok(reply),
            None => Err(Error::unexpected(expected, "nothing")),
        }
    }

    /// Ask for a full sensor report.
    pub async fn request_all(&self) -> Result<AllReport> {
        match self.request(NodeMessage::GetAll).await? {
            NodeMessage::All(report) => Ok(report),
            other => Err(Error::unexpected("all", other.kind())),
        }
    }

    /// Ask the node to re-announce itself.
    pub async fn probe(&self) -> Result<NodeHello> {
        match self.request(NodeMessage::Hello(NodeHello::probe())).await? {
            NodeMessage::Hello(hello) => Ok(hello),
            other => Err(Error::unexpected("hello", other.kind())),
        }
    }

    /// Push a calibration payload and wait for the acknowledgement.
    pub async fn set_calibration(&self, version: u32, payload: Value) -> Result<()> {
        match self.request(NodeMessage::SetCalib { version, payload }).await? {
            NodeMessage::SetCalibAck => Ok(()),
            other => Err(Error::unexpected("set_calib_ack", other.kind())),
        }
    }

    pub async fn set_mode(&self, mode: NodeMode) -> Result<()> {
        self.send(NodeMessage::SetMode { mode }).await.map(|_| ())
    }

    /// Override simulated values on a node in debug mode.
    ///
    /// # Errors
    /// `InvalidCommand` when no value is given.
    pub async fn set_sim(&self, overrides: SimOverrides) -> Result<()> {
        if overrides.ph.is_none() && overrides.ec.is_none() && overrides.temp.is_none() {
            return Err(Error::InvalidCommand(
                "set_sim needs at least one of ph, ec, temp".into(),
            ));
        }
        self.send(NodeMessage::SetSim(overrides)).await.map(|_| ())
    }

    /// Close the link, waiting for any in-flight command to finish.
    pub async fn close(&self) {
        let mut guard = self.link.lock().await;
        if let Some(mut state) = guard.take() {
            state.link.close();
            debug!(node_key = %self.key, "Node link closed");
        }
        self.open.store(false, Ordering::SeqCst);
    }
}

type ClientMap<L> = HashMap<NodeKey, Arc<NodeClient<L>>>;

/// Registry and discovery of serial sensor nodes.
pub struct NodeLinkManager<B: SerialBackend> {
    backend: Arc<B>,
    store: Arc<dyn Store>,
    serial: SerialConfig,
    nodes: NodeConfig,
    clients: Mutex<ClientMap<B::Link>>,
}

impl<B: SerialBackend> std::fmt::Debug for NodeLinkManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLinkManager")
            .field("connected", &self.connected_count())
            .finish_non_exhaustive()
    }
}

impl<B: SerialBackend> NodeLinkManager<B> {
    pub fn new(
        backend: Arc<B>,
        store: Arc<dyn Store>,
        serial: SerialConfig,
        nodes: NodeConfig,
    ) -> Self {
        Self {
            backend,
            store,
            serial,
            nodes,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn clients(&self) -> MutexGuard<'_, ClientMap<B::Link>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serial ports that look like sensor nodes.
    pub fn list_serial_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = self.backend.list_ports()?;
        Ok(ports
            .into_iter()
            .filter(|port| {
                port.matches_signature(
                    self.serial.usb_vid,
                    &self.serial.usb_pids,
                    &self.serial.match_keywords,
                )
            })
            .collect())
    }

    fn port_enumerated(&self, port: &str) -> bool {
        match self.backend.list_ports() {
            Ok(ports) => ports.iter().any(|p| p.port_name == port),
            Err(e) => {
                debug!(error = %e, "Port enumeration failed during health check");
                true
            }
        }
    }

    /// Healthy client for `key`, evicting it if its link closed or its port
    /// vanished.
    pub async fn get_node_client(&self, key: &NodeKey) -> Option<Arc<NodeClient<B::Link>>> {
        let client = self.clients().get(key).cloned()?;
        if client.is_open() && self.port_enumerated(client.port()) {
            return Some(client);
        }

        {
            let mut clients = self.clients();
            if clients
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, &client))
            {
                clients.remove(key);
            }
        }
        info!(node_key = %key, port = %client.port(), "nodes.client_evicted");
        client.close().await;
        None
    }

    pub fn connected_count(&self) -> usize {
        self.clients().len()
    }

    pub fn connected_keys(&self) -> Vec<NodeKey> {
        let mut keys: Vec<NodeKey> = self.clients().keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn connect(&self, port: &str) -> Result<Arc<NodeClient<B::Link>>> {
        let backend = Arc::clone(&self.backend);
        let serial = self.serial.clone();
        let port_name = port.to_string();
        let (state, hello) =
            tokio::task::spawn_blocking(move || handshake(&*backend, &port_name, &serial))
                .await
                .map_err(blocking_failed)??;

        let key = NodeKey::from_port(port);
        let client = Arc::new(NodeClient::new(
            key.clone(),
            state,
            hello,
            &self.serial,
            &self.nodes,
        ));
        let previous = self.clients().insert(key, Arc::clone(&client));
        if let Some(previous) = previous {
            previous.close().await;
        }
        Ok(client)
    }

    fn record_node(&self, client: &NodeClient<B::Link>, last_error: Option<String>) -> Result<()> {
        let identity = client.identity();
        self.store.upsert_node(NodeUpsert {
            node_key: client.key().clone(),
            name: None,
            fw: identity.fw,
            cap: identity.cap,
            calib_hash: identity.calib_hash,
            mode: None,
            status: LinkStatus::Online,
            last_error,
        })
    }

    /// Bring a freshly connected node up to date with the store.
    async fn adopt(&self, client: &NodeClient<B::Link>) -> Result<()> {
        self.record_node(client, None)?;

        if let Err(e) = self.sync_calibration(client).await {
            warn!(node_key = %client.key(), error = %e, "nodes.calib_failed");
            self.record_node(client, Some(format!("calib sync failed: {e}")))?;
        }

        match client.request_all().await {
            Ok(report) => self.reconcile_mode(client.key(), &report),
            Err(e) => debug!(node_key = %client.key(), error = %e, "nodes.mode_failed"),
        }
        Ok(())
    }

    /// Send the stored calibration if the node's hash differs.
    ///
    /// Returns whether a `set_calib` was sent.
    pub async fn sync_calibration(&self, client: &NodeClient<B::Link>) -> Result<bool> {
        let Some(calibration) = self.store.get_calibration(client.key())? else {
            return Ok(false);
        };
        if client.calib_hash().as_deref() == Some(calibration.calib_hash.as_str()) {
            debug!(node_key = %client.key(), "Calibration already in sync");
            return Ok(false);
        }

        client
            .set_calibration(calibration.version, calibration.payload.clone())
            .await?;
        client.set_calib_hash(calibration.calib_hash.clone());
        self.record_node(client, None)?;
        info!(
            node_key = %client.key(),
            version = calibration.version,
            calib_hash = %calibration.calib_hash,
            "nodes.calib_synced"
        );
        Ok(true)
    }

    /// One discovery pass. Returns the node keys seen online.
    pub async fn scan_nodes_once(&self) -> Result<HashSet<NodeKey>> {
        let ports = self.list_serial_ports()?;
        if ports.is_empty() {
            debug!("nodes.scan_empty");
        }

        let mut seen = HashSet::new();
        for port in &ports {
            let key = NodeKey::from_port(&port.port_name);
            if self.get_node_client(&key).await.is_some() {
                seen.insert(key);
                continue;
            }

            match self.connect(&port.port_name).await {
                Ok(client) => {
                    let identity = client.identity();
                    info!(
                        node_key = %key,
                        port = %port.port_name,
                        fw = identity.fw.as_deref().unwrap_or("?"),
                        "nodes.scan_success"
                    );
                    match self.adopt(&client).await {
                        Ok(()) => {
                            seen.insert(key);
                        }
                        Err(e) => {
                            // Forget the link so the next pass handshakes it again.
                            warn!(node_key = %key, port = %port.port_name, error = %e, "nodes.scan_failed");
                            self.remove_node_client(&key).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(port = %port.port_name, error = %e, "nodes.scan_failed");
                }
            }
        }

        self.store.mark_nodes_offline_except(&seen)?;
        Ok(seen)
    }

    /// Discovery loop on the node scan cadence.
    pub async fn node_discovery_loop(self: Arc<Self>, intervals: Arc<PollIntervals>) {
        let min_sleep = intervals.min_sleep();
        run_periodic(
            "node_discovery",
            || intervals.node_scan(),
            min_sleep,
            || {
                let manager = Arc::clone(&self);
                async move { manager.scan_nodes_once().await.map(|_| ()) }
            },
        )
        .await;
    }

    fn reconcile_mode(&self, key: &NodeKey, report: &AllReport) {
        if let Some(mode) = report.mode()
            && let Err(e) = self.store.set_node_mode(key, mode)
        {
            debug!(node_key = %key, error = %e, "Mode reconcile failed");
        }
    }

    async fn client_or_offline(&self, key: &NodeKey) -> Result<Arc<NodeClient<B::Link>>> {
        self.get_node_client(key)
            .await
            .ok_or_else(|| Error::NodeOffline(key.to_string()))
    }

    /// `get_all` on a node, reconciling the reported mode into the store.
    pub async fn request_all(&self, key: &NodeKey) -> Result<AllReport> {
        let client = self.client_or_offline(key).await?;
        let report = client.request_all().await?;
        self.reconcile_mode(key, &report);
        Ok(report)
    }

    /// Current reading for the node bound to a setup.
    pub async fn fetch_setup_reading(&self, setup_id: &SetupId) -> Result<(NodeKey, Reading)> {
        let setup = self
            .store
            .get_setup(setup_id)?
            .ok_or_else(|| Error::not_found("setup", setup_id.as_str()))?;
        let node_key = setup
            .node_id
            .ok_or_else(|| Error::NoNodeAssigned(setup_id.to_string()))?;

        let report = self.request_all(&node_key).await?;
        let mode = report.mode();
        let reading = Reading {
            ts: now_ms(),
            ph: report.ph,
            ec: report.ec,
            temp: report.temp,
            status: report.status,
            mode,
        };
        Ok((node_key, reading))
    }

    pub async fn set_node_mode(&self, key: &NodeKey, mode: NodeMode) -> Result<()> {
        let client = self.client_or_offline(key).await?;
        client.set_mode(mode).await?;
        self.store.set_node_mode(key, mode)?;
        info!(node_key = %key, mode = %mode, "nodes.mode_set");
        Ok(())
    }

    pub async fn set_node_sim(&self, key: &NodeKey, overrides: SimOverrides) -> Result<()> {
        let client = self.client_or_offline(key).await?;
        client.set_sim(overrides).await
    }

    pub async fn probe_node(&self, key: &NodeKey) -> Result<NodeHello> {
        let client = self.client_or_offline(key).await?;
        client.probe().await
    }

    /// Close and forget a node connection.
    pub async fn remove_node_client(&self, key: &NodeKey) -> bool {
        let removed = self.clients().remove(key);
        match removed {
            Some(client) => {
                client.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every connection.
    pub async fn reset(&self) {
        let clients: Vec<_> = self.clients().drain().map(|(_, client)| client).collect();
        for client in clients {
            client.close().await;
        }
    }
}
