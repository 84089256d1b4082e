//! Node link manager against scripted mock serial ports.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sensorhub_core::config::{NodeConfig, SerialConfig};
use sensorhub_core::{
    Calibration, CameraId, CameraRecord, Error, LinkStatus, NodeKey, NodeMode, NodeRecord,
    NodeUpsert, Reading, Result, SetupId, SetupRecord,
};
use sensorhub_hardware::PortInfo;
use sensorhub_hardware::mock::{MockSerialBackend, MockSerialHandle};
use sensorhub_protocol::SimOverrides;
use sensorhub_runtime::NodeLinkManager;
use sensorhub_runtime::store::{MemoryStore, Store};

const PORT: &str = "/dev/ttyACM0";
const HELLO: &str = r#"{"t":"hello","fw":"1.2.0","calibHash":"old"}"#;
const ALL_REPLY: &str =
    r#"{"t":"all","ph":6.2,"ec":1.35,"temp":21.5,"status":["ok"],"mode":"debug"}"#;

struct Fixture {
    backend: MockSerialBackend,
    store: Arc<MemoryStore>,
    manager: NodeLinkManager<MockSerialBackend>,
}

fn create_manager(
    backend: &MockSerialBackend,
    store: Arc<dyn Store>,
) -> NodeLinkManager<MockSerialBackend> {
    let serial = SerialConfig {
        timeout_ms: 50,
        open_delay_ms: 0,
        handshake_timeout_ms: 300,
        ..SerialConfig::default()
    };
    let nodes = NodeConfig {
        retry_attempts: 3,
        retry_backoff_base_ms: 1,
        ..NodeConfig::default()
    };
    NodeLinkManager::new(Arc::new(backend.clone()), store, serial, nodes)
}

fn create_fixture() -> Fixture {
    let backend = MockSerialBackend::new();
    let store = Arc::new(MemoryStore::new());
    let manager = create_manager(&backend, Arc::clone(&store) as Arc<dyn Store>);
    Fixture {
        backend,
        store,
        manager,
    }
}

/// Node answering like real firmware, staying silent for the next
/// `drop_replies` lines it receives.
fn plug_port(backend: &MockSerialBackend, info: PortInfo, drop_replies: Arc<AtomicUsize>) -> MockSerialHandle {
    let node = backend.add_port(info);
    node.set_hello(Some(HELLO.to_string()));
    node.set_responder(move |line| {
        if drop_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Vec::new();
        }
        let message: serde_json::Value = serde_json::from_str(line).unwrap_or_default();
        match message["t"].as_str() {
            Some("get_all") => vec![ALL_REPLY.to_string()],
            Some("set_calib") => vec![r#"{"t":"set_calib_ack"}"#.to_string()],
            Some("hello") => vec![HELLO.to_string()],
            _ => Vec::new(),
        }
    });
    node
}

fn plug_node(backend: &MockSerialBackend, port: &str, drop_replies: Arc<AtomicUsize>) -> MockSerialHandle {
    plug_port(backend, PortInfo::new(port).with_usb_ids(0x2E8A, 0x0005), drop_replies)
}

fn count_written(node: &MockSerialHandle, kind: &str) -> usize {
    let needle = format!(r#""t":"{kind}""#);
    node.written_lines()
        .iter()
        .filter(|line| line.contains(&needle))
        .count()
}

fn setup(id: &str, node: Option<&str>) -> SetupRecord {
    SetupRecord {
        setup_id: SetupId::new(id),
        name: None,
        node_id: node.map(NodeKey::from_port),
        camera_id: None,
        value_interval_minutes: None,
        photo_interval_minutes: None,
    }
}

/// Memory store whose next `failures` node upserts for one key fail.
struct FlakyNodeStore {
    inner: MemoryStore,
    failing: NodeKey,
    failures: AtomicUsize,
}

impl Store for FlakyNodeStore {
    fn get_setup(&self, setup_id: &SetupId) -> Result<Option<SetupRecord>> {
        self.inner.get_setup(setup_id)
    }

    fn list_setups(&self) -> Result<Vec<SetupRecord>> {
        self.inner.list_setups()
    }

    fn get_node(&self, node_key: &NodeKey) -> Result<Option<NodeRecord>> {
        self.inner.get_node(node_key)
    }

    fn upsert_node(&self, node: NodeUpsert) -> Result<()> {
        if node.node_key == self.failing
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Error::Store("db locked".to_string()));
        }
        self.inner.upsert_node(node)
    }

    fn set_node_mode(&self, node_key: &NodeKey, mode: NodeMode) -> Result<()> {
        self.inner.set_node_mode(node_key, mode)
    }

    fn mark_nodes_offline_except(&self, online: &HashSet<NodeKey>) -> Result<()> {
        self.inner.mark_nodes_offline_except(online)
    }

    fn get_calibration(&self, node_key: &NodeKey) -> Result<Option<Calibration>> {
        self.inner.get_calibration(node_key)
    }

    fn get_camera(&self, camera_id: &CameraId) -> Result<Option<CameraRecord>> {
        self.inner.get_camera(camera_id)
    }

    fn list_cameras(&self) -> Result<Vec<CameraRecord>> {
        self.inner.list_cameras()
    }

    fn upsert_camera(&self, camera: CameraRecord) -> Result<()> {
        self.inner.upsert_camera(camera)
    }

    fn mark_cameras_offline_except(&self, online: &HashSet<CameraId>) -> Result<()> {
        self.inner.mark_cameras_offline_except(online)
    }

    fn insert_reading(&self, setup_id: &SetupId, node_key: &NodeKey, reading: &Reading) -> Result<()> {
        self.inner.insert_reading(setup_id, node_key, reading)
    }
}

#[tokio::test]
async fn test_scan_handshakes_and_records_node() {
    let fx = create_fixture();
    let node = plug_node(&fx.backend, PORT, Arc::default());
    let key = NodeKey::from_port(PORT);

    let seen = fx.manager.scan_nodes_once().await.unwrap();
    assert!(seen.contains(&key));
    assert_eq!(fx.manager.connected_keys(), vec![key.clone()]);

    let written = node.written_lines();
    assert!(written[0].contains(r#""t":"hello_ack""#));
    assert!(written[0].contains(r#""fw":"1.2.0""#));
    assert_eq!(count_written(&node, "get_all"), 1);

    let record = fx.store.node(&key).unwrap();
    assert_eq!(record.status, LinkStatus::Online);
    assert_eq!(record.fw.as_deref(), Some("1.2.0"));
    assert_eq!(record.mode, Some(NodeMode::Debug));
    assert_eq!(record.last_error, None);

    let report = fx.manager.request_all(&key).await.unwrap();
    assert_eq!(report.ph, 6.2);
    assert_eq!(report.status, vec!["ok".to_string()]);
}

#[tokio::test]
async fn test_only_matching_ports_are_probed() {
    let fx = create_fixture();
    plug_node(&fx.backend, PORT, Arc::default());
    let modem = fx
        .backend
        .add_port(PortInfo::new("/dev/ttyUSB0").with_usb_ids(0x1A86, 0x7523));
    plug_port(
        &fx.backend,
        PortInfo::new("/dev/ttyACM1").with_description("Raspberry Pi RP2040 board"),
        Arc::default(),
    );

    let ports: Vec<String> = fx
        .manager
        .list_serial_ports()
        .unwrap()
        .into_iter()
        .map(|port| port.port_name)
        .collect();
    assert_eq!(ports, vec!["/dev/ttyACM0".to_string(), "/dev/ttyACM1".to_string()]);

    fx.manager.scan_nodes_once().await.unwrap();
    assert_eq!(modem.open_count(), 0);
    assert_eq!(fx.manager.connected_count(), 2);
}

#[tokio::test]
async fn test_silent_port_times_out_and_is_released() {
    let fx = create_fixture();
    let node = fx
        .backend
        .add_port(PortInfo::new(PORT).with_usb_ids(0x2E8A, 0x000A));

    let seen = fx.manager.scan_nodes_once().await.unwrap();
    assert!(seen.is_empty());
    assert_eq!(node.open_count(), 1);
    assert!(!node.is_held_open());
    assert_eq!(fx.manager.connected_count(), 0);
}

#[tokio::test]
async fn test_command_retry_recovers() {
    let fx = create_fixture();
    let drop_replies = Arc::new(AtomicUsize::new(0));
    let node = plug_node(&fx.backend, PORT, Arc::clone(&drop_replies));
    let key = NodeKey::from_port(PORT);
    fx.manager.scan_nodes_once().await.unwrap();

    node.clear_written();
    drop_replies.store(2, Ordering::SeqCst);
    let report = fx.manager.request_all(&key).await.unwrap();

    assert_eq!(report.temp, 21.5);
    assert_eq!(count_written(&node, "get_all"), 3);
    assert!(fx.manager.get_node_client(&key).await.is_some());
}

#[tokio::test]
async fn test_command_retry_exhaustion_closes_link() {
    let fx = create_fixture();
    let drop_replies = Arc::new(AtomicUsize::new(0));
    let node = plug_node(&fx.backend, PORT, Arc::clone(&drop_replies));
    let key = NodeKey::from_port(PORT);
    fx.manager.scan_nodes_once().await.unwrap();

    node.clear_written();
    drop_replies.store(usize::MAX, Ordering::SeqCst);
    let error = fx.manager.request_all(&key).await.unwrap_err();

    assert!(matches!(error, Error::Timeout(_)));
    assert_eq!(count_written(&node, "get_all"), 3);
    assert!(!node.is_held_open());
    assert!(fx.manager.get_node_client(&key).await.is_none());
    assert!(matches!(
        fx.manager.request_all(&key).await,
        Err(Error::NodeOffline(_))
    ));
}

#[tokio::test]
async fn test_command_retry_recovers_from_io_errors() {
    let fx = create_fixture();
    let node = plug_node(&fx.backend, PORT, Arc::default());
    let key = NodeKey::from_port(PORT);
    fx.manager.scan_nodes_once().await.unwrap();

    node.clear_written();
    node.fail_next_writes(2);
    let report = fx.manager.request_all(&key).await.unwrap();

    assert_eq!(report.ph, 6.2);
    assert_eq!(count_written(&node, "get_all"), 1);
    assert!(node.is_held_open());
    assert!(fx.manager.get_node_client(&key).await.is_some());
}

#[tokio::test]
async fn test_io_error_exhaustion_closes_link() {
    let fx = create_fixture();
    let node = plug_node(&fx.backend, PORT, Arc::default());
    let key = NodeKey::from_port(PORT);
    fx.manager.scan_nodes_once().await.unwrap();

    node.clear_written();
    node.fail_next_writes(3);
    let error = fx.manager.request_all(&key).await.unwrap_err();

    assert!(matches!(error, Error::Transport { .. }));
    assert!(node.written_lines().is_empty());
    assert!(!node.is_held_open());
    assert!(fx.manager.get_node_client(&key).await.is_none());
}

#[tokio::test]
async fn test_store_failure_skips_only_that_node() {
    let backend = MockSerialBackend::new();
    let failing = NodeKey::from_port(PORT);
    let store = Arc::new(FlakyNodeStore {
        inner: MemoryStore::new(),
        failing: failing.clone(),
        failures: AtomicUsize::new(1),
    });
    let manager = create_manager(&backend, Arc::clone(&store) as Arc<dyn Store>);
    let flaky = plug_node(&backend, PORT, Arc::default());
    plug_node(&backend, "/dev/ttyACM1", Arc::default());
    let healthy = NodeKey::from_port("/dev/ttyACM1");

    let seen = manager.scan_nodes_once().await.unwrap();
    assert_eq!(seen, HashSet::from([healthy.clone()]));
    assert_eq!(manager.connected_keys(), vec![healthy.clone()]);
    assert!(!flaky.is_held_open());
    assert!(store.inner.node(&failing).is_none());
    assert_eq!(store.inner.node(&healthy).unwrap().status, LinkStatus::Online);

    let seen = manager.scan_nodes_once().await.unwrap();
    assert_eq!(seen, HashSet::from([failing.clone(), healthy]));
    assert_eq!(flaky.open_count(), 2);
    assert_eq!(store.inner.node(&failing).unwrap().status, LinkStatus::Online);
}

#[tokio::test]
async fn test_calibration_pushed_when_hash_differs() {
    let fx = create_fixture();
    let key = NodeKey::from_port(PORT);
    fx.store.insert_calibration(Calibration {
        node_key: key.clone(),
        version: 3,
        calib_hash: "new".into(),
        payload: serde_json::json!({"ph": {"slope": 1.02}}),
    });
    let node = plug_node(&fx.backend, PORT, Arc::default());

    fx.manager.scan_nodes_once().await.unwrap();

    let pushed: Vec<String> = node
        .written_lines()
        .into_iter()
        .filter(|line| line.contains(r#""t":"set_calib""#))
        .collect();
    assert_eq!(pushed.len(), 1);
    assert!(pushed[0].contains(r#""version":3"#));

    let record = fx.store.node(&key).unwrap();
    assert_eq!(record.calib_hash.as_deref(), Some("new"));
    assert_eq!(record.last_error, None);

    let client = fx.manager.get_node_client(&key).await.unwrap();
    assert_eq!(client.calib_hash().as_deref(), Some("new"));
    assert!(!fx.manager.sync_calibration(&client).await.unwrap());
}

#[tokio::test]
async fn test_calibration_failure_keeps_node_connected() {
    let fx = create_fixture();
    let key = NodeKey::from_port(PORT);
    fx.store.insert_calibration(Calibration {
        node_key: key.clone(),
        version: 1,
        calib_hash: "new".into(),
        payload: serde_json::json!({}),
    });
    let node = fx
        .backend
        .add_port(PortInfo::new(PORT).with_usb_ids(0x2E8A, 0x0005));
    node.set_hello(Some(HELLO.to_string()));
    node.set_responder(|line| {
        if line.contains(r#""t":"set_calib""#) {
            vec![r#"{"t":"error","msg":"bad payload"}"#.to_string()]
        } else if line.contains(r#""t":"get_all""#) {
            vec![ALL_REPLY.to_string()]
        } else {
            Vec::new()
        }
    });

    let seen = fx.manager.scan_nodes_once().await.unwrap();
    assert!(seen.contains(&key));

    let record = fx.store.node(&key).unwrap();
    assert_eq!(record.status, LinkStatus::Online);
    assert!(
        record
            .last_error
            .as_deref()
            .is_some_and(|e| e.starts_with("calib sync failed:") && e.contains("bad payload"))
    );
    assert_eq!(record.calib_hash.as_deref(), Some("old"));
    assert!(fx.manager.get_node_client(&key).await.is_some());
}

#[tokio::test]
async fn test_unplugged_node_is_evicted_and_marked_offline() {
    let fx = create_fixture();
    let node = plug_node(&fx.backend, PORT, Arc::default());
    let key = NodeKey::from_port(PORT);
    fx.manager.scan_nodes_once().await.unwrap();

    fx.backend.remove_port(PORT);
    assert!(fx.manager.get_node_client(&key).await.is_none());
    assert_eq!(fx.manager.connected_count(), 0);
    assert!(!node.is_held_open());

    let seen = fx.manager.scan_nodes_once().await.unwrap();
    assert!(seen.is_empty());
    assert_eq!(fx.store.node(&key).unwrap().status, LinkStatus::Offline);
}

#[tokio::test]
async fn test_replugged_node_reconnects() {
    let fx = create_fixture();
    plug_node(&fx.backend, PORT, Arc::default());
    fx.manager.scan_nodes_once().await.unwrap();

    fx.backend.remove_port(PORT);
    let node = plug_node(&fx.backend, PORT, Arc::default());
    let seen = fx.manager.scan_nodes_once().await.unwrap();

    assert!(seen.contains(&NodeKey::from_port(PORT)));
    assert_eq!(node.open_count(), 1);
    assert_eq!(fx.manager.connected_count(), 1);
}

#[tokio::test]
async fn test_fetch_setup_reading() {
    let fx = create_fixture();
    plug_node(&fx.backend, PORT, Arc::default());
    fx.store.insert_setup(setup("S1", Some(PORT)));
    fx.store.insert_setup(setup("S2", None));
    fx.store.insert_setup(setup("S3", Some("/dev/ttyACM9")));

    assert!(matches!(
        fx.manager.fetch_setup_reading(&SetupId::new("missing")).await,
        Err(Error::NotFound { kind: "setup", .. })
    ));
    assert!(matches!(
        fx.manager.fetch_setup_reading(&SetupId::new("S2")).await,
        Err(Error::NoNodeAssigned(_))
    ));
    assert!(matches!(
        fx.manager.fetch_setup_reading(&SetupId::new("S1")).await,
        Err(Error::NodeOffline(_))
    ));

    fx.manager.scan_nodes_once().await.unwrap();
    let (key, reading) = fx
        .manager
        .fetch_setup_reading(&SetupId::new("S1"))
        .await
        .unwrap();
    assert_eq!(key, NodeKey::from_port(PORT));
    assert_eq!(reading.ph, 6.2);
    assert_eq!(reading.ec, 1.35);
    assert_eq!(reading.mode, Some(NodeMode::Debug));
    assert!(matches!(
        fx.manager.fetch_setup_reading(&SetupId::new("S3")).await,
        Err(Error::NodeOffline(_))
    ));
}

#[tokio::test]
async fn test_mode_and_sim_commands() {
    let fx = create_fixture();
    let node = plug_node(&fx.backend, PORT, Arc::default());
    let key = NodeKey::from_port(PORT);
    fx.manager.scan_nodes_once().await.unwrap();

    fx.manager.set_node_mode(&key, NodeMode::Real).await.unwrap();
    assert!(
        node.written_lines()
            .contains(&r#"{"t":"set_mode","mode":"real"}"#.to_string())
    );
    assert_eq!(fx.store.node(&key).unwrap().mode, Some(NodeMode::Real));

    assert!(matches!(
        fx.manager.set_node_sim(&key, SimOverrides::default()).await,
        Err(Error::InvalidCommand(_))
    ));
    fx.manager
        .set_node_sim(
            &key,
            SimOverrides {
                ph: Some(7.0),
                ..SimOverrides::default()
            },
        )
        .await
        .unwrap();
    assert!(
        node.written_lines()
            .contains(&r#"{"t":"set_sim","ph":7.0}"#.to_string())
    );

    let hello = fx.manager.probe_node(&key).await.unwrap();
    assert_eq!(hello.fw.as_deref(), Some("1.2.0"));
}

#[tokio::test]
async fn test_remove_and_reset_close_links() {
    let fx = create_fixture();
    let first = plug_node(&fx.backend, PORT, Arc::default());
    let second = plug_node(&fx.backend, "/dev/ttyACM1", Arc::default());
    fx.manager.scan_nodes_once().await.unwrap();
    assert_eq!(fx.manager.connected_count(), 2);

    assert!(fx.manager.remove_node_client(&NodeKey::from_port(PORT)).await);
    assert!(!fx.manager.remove_node_client(&NodeKey::from_port(PORT)).await);
    assert!(!first.is_held_open());

    fx.manager.reset().await;
    assert_eq!(fx.manager.connected_count(), 0);
    assert!(!second.is_held_open());
}
