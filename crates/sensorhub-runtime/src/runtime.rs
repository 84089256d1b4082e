//! The hub runtime: owns every manager and the background loops.

use std::sync::Arc;

use sensorhub_core::{HubConfig, Result, SetupId};
use sensorhub_hardware::{SerialBackend, WorkerLauncher};
use serde::Serialize;
use tracing::info;

use crate::camera::{CameraHealth, CameraWorkerManager};
use crate::camera_devices::CameraDiscovery;
use crate::live::{BroadcastSink, LiveManager, LiveMessage, ReadingsCapture};
use crate::nodes::NodeLinkManager;
use crate::scheduler::{LoopRegistry, LoopStatus, PollIntervals};
use crate::stills::StillCapture;
use crate::store::{StillRecord, StillWriter, Store};

/// Point-in-time view of the hub.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubHealth {
    pub camera: CameraHealth,
    pub loops: Vec<LoopStatus>,
    pub nodes_connected: usize,
    pub live_setups: Vec<SetupId>,
}

/// Owner of the node links, camera workers, live fan-out and capture loops.
///
/// Everything here is shared through `Arc`, so handles returned by the
/// accessors stay valid across [`HubRuntime::reset`].
pub struct HubRuntime<B: SerialBackend, L: WorkerLauncher> {
    config: HubConfig,
    intervals: Arc<PollIntervals>,
    store: Arc<dyn Store>,
    nodes: Arc<NodeLinkManager<B>>,
    cameras: Arc<CameraWorkerManager<L>>,
    discovery: Arc<CameraDiscovery<L>>,
    live: Arc<LiveManager<NodeLinkManager<B>>>,
    readings: Arc<ReadingsCapture<NodeLinkManager<B>>>,
    stills: Arc<StillCapture<L>>,
    loops: LoopRegistry,
}

impl<B: SerialBackend, L: WorkerLauncher> std::fmt::Debug for HubRuntime<B, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubRuntime")
            .field("config", &self.config)
            .field("loops", &self.loops)
            .finish_non_exhaustive()
    }
}

impl<B: SerialBackend, L: WorkerLauncher> HubRuntime<B, L> {
    /// Build the runtime. Fails only on an invalid configuration.
    pub fn new(
        config: HubConfig,
        backend: B,
        launcher: L,
        store: Arc<dyn Store>,
        writer: Arc<dyn StillWriter>,
    ) -> Result<Self> {
        config.validate()?;

        let intervals = Arc::new(PollIntervals::from_config(&config));
        let launcher = Arc::new(launcher);

        let nodes = Arc::new(NodeLinkManager::new(
            Arc::new(backend),
            Arc::clone(&store),
            config.serial.clone(),
            config.nodes.clone(),
        ));
        let cameras = Arc::new(CameraWorkerManager::new(
            Arc::clone(&launcher),
            config.camera.clone(),
        ));
        let discovery = Arc::new(CameraDiscovery::new(
            launcher,
            Arc::clone(&store),
            &config.camera,
        ));
        let live = Arc::new(LiveManager::new(Arc::clone(&nodes), Arc::clone(&intervals)));
        let readings = Arc::new(ReadingsCapture::new(
            Arc::clone(&nodes),
            Arc::clone(&store),
            config.live.default_value_interval_minutes,
        ));
        let stills = Arc::new(StillCapture::new(
            Arc::clone(&cameras),
            Arc::clone(&store),
            writer,
            config.live.default_photo_interval_minutes,
        ));

        Ok(Self {
            config,
            intervals,
            store,
            nodes,
            cameras,
            discovery,
            live,
            readings,
            stills,
            loops: LoopRegistry::new(),
        })
    }

    /// Start the four background loops. Must be called inside a Tokio runtime.
    pub fn start_loops(&self) {
        self.loops.start(
            "node_discovery",
            Arc::clone(&self.nodes).node_discovery_loop(Arc::clone(&self.intervals)),
        );
        self.loops.start(
            "readings_capture",
            Arc::clone(&self.readings).readings_capture_loop(Arc::clone(&self.intervals)),
        );
        self.loops.start(
            "camera_discovery",
            Arc::clone(&self.discovery)
                .camera_discovery_loop(Arc::clone(&self.live), Arc::clone(&self.intervals)),
        );
        self.loops.start(
            "photo_capture",
            Arc::clone(&self.stills).photo_capture_loop(Arc::clone(&self.intervals)),
        );
        info!(loops = self.loops.status().len(), "hub.loops_started");
    }

    /// Stop every loop, drop all device state, tell live clients, restart.
    pub async fn reset(&self, reason: &str) {
        self.loops.stop_all();
        self.nodes.reset().await;
        self.cameras.reset().await;
        self.discovery.reset().await;
        self.readings.reset().await;
        self.stills.reset().await;

        let notified = self
            .live
            .broadcast_all(&LiveMessage::Reset {
                reason: reason.to_string(),
            })
            .await;
        info!(reason, notified, "hub.reset");

        self.start_loops();
    }

    /// Stop everything without restarting.
    pub async fn shutdown(&self) {
        self.loops.stop_all();
        self.live.shutdown().await;
        self.cameras.reset().await;
        self.nodes.reset().await;
        info!("hub.shutdown");
    }

    pub async fn health(&self) -> HubHealth {
        HubHealth {
            camera: self.cameras.health(),
            loops: self.loops.status(),
            nodes_connected: self.nodes.connected_count(),
            live_setups: self.live.active_setups().await,
        }
    }

    pub async fn capture_photo_now(&self, setup_id: &SetupId, reason: &str) -> Result<StillRecord> {
        self.stills.capture_photo_now(setup_id, reason).await
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn intervals(&self) -> &Arc<PollIntervals> {
        &self.intervals
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn nodes(&self) -> &Arc<NodeLinkManager<B>> {
        &self.nodes
    }

    pub fn cameras(&self) -> &Arc<CameraWorkerManager<L>> {
        &self.cameras
    }

    pub fn discovery(&self) -> &Arc<CameraDiscovery<L>> {
        &self.discovery
    }

    pub fn live(&self) -> &Arc<LiveManager<NodeLinkManager<B>>> {
        &self.live
    }

    pub fn readings(&self) -> &Arc<ReadingsCapture<NodeLinkManager<B>>> {
        &self.readings
    }

    pub fn stills(&self) -> &Arc<StillCapture<L>> {
        &self.stills
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStillWriter, MemoryStore};
    use sensorhub_hardware::mock::{MockLauncher, MockSerialBackend};

    fn runtime(config: HubConfig) -> Result<HubRuntime<MockSerialBackend, MockLauncher>> {
        let (launcher, _handle) = MockLauncher::new();
        HubRuntime::new(
            config,
            MockSerialBackend::new(),
            launcher,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStillWriter::new()),
        )
    }

    #[test]
    fn test_new_rejects_invalid_admission() {
        let mut config = HubConfig::default();
        config.camera.max_total = 0;
        assert!(runtime(config).is_err());
    }

    #[tokio::test]
    async fn test_start_reset_shutdown() {
        let hub = runtime(HubConfig::default()).unwrap();
        hub.start_loops();

        let names: Vec<String> = hub.health().await.loops.into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["camera_discovery", "node_discovery", "photo_capture", "readings_capture"]
        );

        let (subscriber, mut rx) = hub.live().connect(16);
        hub.live().subscribe(&SetupId::new("S1"), &subscriber).await;
        hub.reset("admin").await;
        assert_eq!(hub.health().await.loops.len(), 4);

        // The poll task may have pushed an error for the unknown setup first.
        let mut saw_reset = false;
        while let Ok(message) = rx.try_recv() {
            if message == r#"{"t":"reset","reason":"admin"}"# {
                saw_reset = true;
            }
        }
        assert!(saw_reset);

        hub.shutdown().await;
        let health = hub.health().await;
        assert!(health.loops.is_empty());
        assert!(health.live_setups.is_empty());
        assert_eq!(health.nodes_connected, 0);
    }
}
