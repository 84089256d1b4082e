//! Boundary to the external persistent store.
//!
//! The hub only reads setups, calibrations and camera records, and writes
//! node state, camera state, readings and still images. [`Store`] captures
//! exactly that surface; [`MemoryStore`] is a complete in-process
//! implementation used by the CLI and the tests.
//!
//! Store methods are synchronous and must not block for long: the runtime
//! calls them from async tasks.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use sensorhub_core::{
    Calibration, CameraId, CameraRecord, Error, LinkStatus, NodeKey, NodeMode, NodeRecord,
    NodeUpsert, Reading, Result, SetupId, SetupRecord, now_ms,
};
use serde::Serialize;
use tracing::debug;

/// Persistent state consumed and produced by the runtime.
pub trait Store: Send + Sync {
    fn get_setup(&self, setup_id: &SetupId) -> Result<Option<SetupRecord>>;

    fn list_setups(&self) -> Result<Vec<SetupRecord>>;

    fn get_node(&self, node_key: &NodeKey) -> Result<Option<NodeRecord>>;

    /// Insert or update a node record, refreshing `last_seen_ms`.
    fn upsert_node(&self, node: NodeUpsert) -> Result<()>;

    fn set_node_mode(&self, node_key: &NodeKey, mode: NodeMode) -> Result<()>;

    /// Mark every node not in `online` offline.
    fn mark_nodes_offline_except(&self, online: &HashSet<NodeKey>) -> Result<()>;

    fn get_calibration(&self, node_key: &NodeKey) -> Result<Option<Calibration>>;

    fn get_camera(&self, camera_id: &CameraId) -> Result<Option<CameraRecord>>;

    fn list_cameras(&self) -> Result<Vec<CameraRecord>>;

    /// Insert or update a camera record. A user-assigned alias survives.
    fn upsert_camera(&self, camera: CameraRecord) -> Result<()>;

    /// Mark every camera not in `online` offline.
    fn mark_cameras_offline_except(&self, online: &HashSet<CameraId>) -> Result<()>;

    fn insert_reading(&self, setup_id: &SetupId, node_key: &NodeKey, reading: &Reading)
    -> Result<()>;
}

/// A persisted still image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StillRecord {
    pub ts: i64,
    pub path: PathBuf,
    pub camera_id: CameraId,
    pub setup_id: SetupId,
}

/// Destination for captured JPEG stills.
pub trait StillWriter: Send + Sync {
    fn save_still(
        &self,
        setup_id: &SetupId,
        camera_id: &CameraId,
        ts: DateTime<Utc>,
        jpeg: &[u8],
    ) -> Result<StillRecord>;
}

/// A stored reading together with the identities it was recorded for.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReading {
    pub setup_id: SetupId,
    pub node_key: NodeKey,
    pub reading: Reading,
}

#[derive(Debug, Default)]
struct MemoryState {
    setups: HashMap<SetupId, SetupRecord>,
    nodes: HashMap<NodeKey, NodeRecord>,
    calibrations: HashMap<NodeKey, Calibration>,
    cameras: HashMap<CameraId, CameraRecord>,
    readings: Vec<StoredReading>,
}

/// In-process [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_setup(&self, setup: SetupRecord) {
        self.state().setups.insert(setup.setup_id.clone(), setup);
    }

    pub fn remove_setup(&self, setup_id: &SetupId) -> Option<SetupRecord> {
        self.state().setups.remove(setup_id)
    }

    pub fn insert_calibration(&self, calibration: Calibration) {
        self.state()
            .calibrations
            .insert(calibration.node_key.clone(), calibration);
    }

    /// Snapshot of a node record.
    pub fn node(&self, node_key: &NodeKey) -> Option<NodeRecord> {
        self.state().nodes.get(node_key).cloned()
    }

    /// All readings stored so far, in insertion order.
    pub fn readings(&self) -> Vec<StoredReading> {
        self.state().readings.clone()
    }
}

impl Store for MemoryStore {
    fn get_setup(&self, setup_id: &SetupId) -> Result<Option<SetupRecord>> {
        Ok(self.state().setups.get(setup_id).cloned())
    }

    fn list_setups(&self) -> Result<Vec<SetupRecord>> {
        let mut setups: Vec<SetupRecord> = self.state().setups.values().cloned().collect();
        setups.sort_by(|a, b| a.setup_id.cmp(&b.setup_id));
        Ok(setups)
    }

    fn get_node(&self, node_key: &NodeKey) -> Result<Option<NodeRecord>> {
        Ok(self.node(node_key))
    }

    fn upsert_node(&self, node: NodeUpsert) -> Result<()> {
        let mut state = self.state();
        let now = now_ms();
        match state.nodes.get_mut(&node.node_key) {
            Some(record) => {
                if node.name.is_some() {
                    record.name = node.name;
                }
                if node.mode.is_some() {
                    record.mode = node.mode;
                }
                record.fw = node.fw;
                record.cap = node.cap;
                record.calib_hash = node.calib_hash;
                record.status = node.status;
                record.last_error = node.last_error;
                record.last_seen_ms = Some(now);
            }
            None => {
                state.nodes.insert(
                    node.node_key.clone(),
                    NodeRecord {
                        node_key: node.node_key,
                        name: node.name,
                        kind: "sensor".to_string(),
                        fw: node.fw,
                        cap: node.cap,
                        calib_hash: node.calib_hash,
                        mode: node.mode,
                        status: node.status,
                        last_error: node.last_error,
                        last_seen_ms: Some(now),
                    },
                );
            }
        }
        Ok(())
    }

    fn set_node_mode(&self, node_key: &NodeKey, mode: NodeMode) -> Result<()> {
        let mut state = self.state();
        let record = state
            .nodes
            .get_mut(node_key)
            .ok_or_else(|| Error::not_found("node", node_key.as_str()))?;
        record.mode = Some(mode);
        Ok(())
    }

    fn mark_nodes_offline_except(&self, online: &HashSet<NodeKey>) -> Result<()> {
        for (key, record) in self.state().nodes.iter_mut() {
            if !online.contains(key) && record.status != LinkStatus::Offline {
                debug!(node_key = %key, "Node marked offline");
                record.status = LinkStatus::Offline;
            }
        }
        Ok(())
    }

    fn get_calibration(&self, node_key: &NodeKey) -> Result<Option<Calibration>> {
        Ok(self.state().calibrations.get(node_key).cloned())
    }

    fn get_camera(&self, camera_id: &CameraId) -> Result<Option<CameraRecord>> {
        Ok(self.state().cameras.get(camera_id).cloned())
    }

    fn list_cameras(&self) -> Result<Vec<CameraRecord>> {
        let mut cameras: Vec<CameraRecord> = self.state().cameras.values().cloned().collect();
        cameras.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        Ok(cameras)
    }

    fn upsert_camera(&self, mut camera: CameraRecord) -> Result<()> {
        let mut state = self.state();
        if let Some(existing) = state.cameras.get(&camera.camera_id)
            && existing.alias.is_some()
        {
            camera.alias = existing.alias.clone();
        }
        state.cameras.insert(camera.camera_id.clone(), camera);
        Ok(())
    }

    fn mark_cameras_offline_except(&self, online: &HashSet<CameraId>) -> Result<()> {
        for (id, record) in self.state().cameras.iter_mut() {
            if !online.contains(id) {
                record.status = LinkStatus::Offline;
            }
        }
        Ok(())
    }

    fn insert_reading(
        &self,
        setup_id: &SetupId,
        node_key: &NodeKey,
        reading: &Reading,
    ) -> Result<()> {
        self.state().readings.push(StoredReading {
            setup_id: setup_id.clone(),
            node_key: node_key.clone(),
            reading: reading.clone(),
        });
        Ok(())
    }
}

/// Writes stills to `<root>/<setup>/<setup>_<YYYY-MM-DD_HH-MM-SS>.jpg`.
#[derive(Debug, Clone)]
pub struct DirectoryStillWriter {
    root: PathBuf,
}

impl DirectoryStillWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Reject identifiers that would escape the photo root.
fn path_component(id: &str) -> Result<&str> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) || id.contains("..")
    {
        return Err(Error::InvalidCommand(format!(
            "identifier not usable as a path: {id}"
        )));
    }
    Ok(id)
}

impl StillWriter for DirectoryStillWriter {
    fn save_still(
        &self,
        setup_id: &SetupId,
        camera_id: &CameraId,
        ts: DateTime<Utc>,
        jpeg: &[u8],
    ) -> Result<StillRecord> {
        let setup = path_component(setup_id.as_str())?;
        let dir = self.root.join(setup);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{setup}_{}.jpg", ts.format("%Y-%m-%d_%H-%M-%S")));
        std::fs::write(&path, jpeg)?;

        Ok(StillRecord {
            ts: ts.timestamp_millis(),
            path,
            camera_id: camera_id.clone(),
            setup_id: setup_id.clone(),
        })
    }
}

/// A still kept in memory by [`MemoryStillWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedStill {
    pub record: StillRecord,
    pub jpeg: Vec<u8>,
}

/// In-process [`StillWriter`].
#[derive(Debug, Default)]
pub struct MemoryStillWriter {
    stills: Mutex<Vec<SavedStill>>,
}

impl MemoryStillWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stills(&self) -> Vec<SavedStill> {
        self.stills
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl StillWriter for MemoryStillWriter {
    fn save_still(
        &self,
        setup_id: &SetupId,
        camera_id: &CameraId,
        ts: DateTime<Utc>,
        jpeg: &[u8],
    ) -> Result<StillRecord> {
        let record = StillRecord {
            ts: ts.timestamp_millis(),
            path: PathBuf::from(format!(
                "{setup_id}/{setup_id}_{}.jpg",
                ts.format("%Y-%m-%d_%H-%M-%S")
            )),
            camera_id: camera_id.clone(),
            setup_id: setup_id.clone(),
        };
        self.stills
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SavedStill {
                record: record.clone(),
                jpeg: jpeg.to_vec(),
            });
        Ok(record)
    }
}
