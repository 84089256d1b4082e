//! Live fan-out to websocket-style subscribers and the readings capture loop.
//!
//! A subscriber is the sending half of a bounded channel of serialized JSON
//! messages. Subscribing to a setup lazily starts one poll task for it; the
//! task is cancelled when the setup's last subscriber leaves. A subscriber
//! whose channel is full misses that message, one whose channel is closed is
//! dropped from every setup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sensorhub_core::constants::MISSING_SETUP_RETRY_MS;
use sensorhub_core::{
    CameraId, CameraRecord, Error, LinkStatus, NodeKey, Reading, Result, SetupId, now_ms,
};
use sensorhub_hardware::SerialBackend;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::nodes::NodeLinkManager;
use crate::scheduler::{DueTimeTable, PollIntervals, run_periodic};
use crate::store::Store;

const MIN_LIVE_POLL: Duration = Duration::from_secs(1);

/// Something that can produce the current reading of a setup.
pub trait ReadingSource: Send + Sync + 'static {
    fn fetch_setup_reading(
        &self,
        setup_id: &SetupId,
    ) -> impl Future<Output = Result<(NodeKey, Reading)>> + Send;
}

impl<B: SerialBackend> ReadingSource for NodeLinkManager<B> {
    async fn fetch_setup_reading(&self, setup_id: &SetupId) -> Result<(NodeKey, Reading)> {
        NodeLinkManager::fetch_setup_reading(self, setup_id).await
    }
}

/// Fan-out of system-wide messages.
pub trait BroadcastSink: Send + Sync + 'static {
    fn broadcast_all(&self, message: &LiveMessage) -> impl Future<Output = usize> + Send;
}

/// Camera entry of a `cameraDevices` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraPayload {
    pub camera_id: CameraId,
    pub device_id: CameraId,
    pub alias: Option<String>,
    pub pnp_device_id: Option<String>,
    pub container_id: Option<String>,
    pub friendly_name: Option<String>,
    pub status: LinkStatus,
}

impl From<&CameraRecord> for CameraPayload {
    fn from(camera: &CameraRecord) -> Self {
        Self {
            camera_id: camera.camera_id.clone(),
            device_id: camera.camera_id.clone(),
            alias: camera.alias.clone(),
            pnp_device_id: camera.pnp_device_id.clone(),
            container_id: camera.container_id.clone(),
            friendly_name: camera.friendly_name.clone(),
            status: camera.status,
        }
    }
}

/// Messages pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t")]
pub enum LiveMessage {
    #[serde(rename = "reading", rename_all = "camelCase")]
    Reading {
        setup_id: SetupId,
        ts: i64,
        ph: f64,
        ec: f64,
        temp: f64,
        status: Vec<String>,
    },
    #[serde(rename = "error", rename_all = "camelCase")]
    Error { setup_id: SetupId, msg: String },
    #[serde(rename = "cameraDevices")]
    CameraDevices { devices: Vec<CameraPayload> },
    #[serde(rename = "reset")]
    Reset { reason: String },
}

impl LiveMessage {
    pub fn reading(setup_id: &SetupId, reading: &Reading) -> Self {
        let status = if reading.status.is_empty() {
            vec!["ok".to_string()]
        } else {
            reading.status.clone()
        };
        Self::Reading {
            setup_id: setup_id.clone(),
            ts: reading.ts,
            ph: reading.ph,
            ec: reading.ec,
            temp: reading.temp,
            status,
        }
    }
}

/// A connected live client.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Default)]
struct LiveState {
    subscriptions: HashMap<SetupId, HashMap<u64, mpsc::Sender<String>>>,
    tasks: HashMap<SetupId, JoinHandle<()>>,
}

impl LiveState {
    /// Drop one subscriber from a setup, cancelling its poll task if it was
    /// the last one.
    fn remove(&mut self, setup_id: &SetupId, subscriber_id: u64) {
        let Some(subscribers) = self.subscriptions.get_mut(setup_id) else {
            return;
        };
        subscribers.remove(&subscriber_id);
        if subscribers.is_empty() {
            self.subscriptions.remove(setup_id);
            if let Some(task) = self.tasks.remove(setup_id) {
                task.abort();
                debug!(setup_id = %setup_id, "Live poll stopped");
            }
        }
    }
}

/// Live subscriptions and their poll tasks.
pub struct LiveManager<R> {
    source: Arc<R>,
    intervals: Arc<PollIntervals>,
    state: Mutex<LiveState>,
    next_id: AtomicU64,
}

impl<R> std::fmt::Debug for LiveManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveManager").finish_non_exhaustive()
    }
}

impl<R: ReadingSource> LiveManager<R> {
    pub fn new(source: Arc<R>, intervals: Arc<PollIntervals>) -> Self {
        Self {
            source,
            intervals,
            state: Mutex::new(LiveState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a client; messages arrive on the returned receiver.
    pub fn connect(&self, capacity: usize) -> (Subscriber, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscriber = Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        (subscriber, rx)
    }

    /// Watch a setup, starting its poll task if this is the first watcher.
    pub async fn subscribe(self: &Arc<Self>, setup_id: &SetupId, subscriber: &Subscriber) {
        let mut state = self.state.lock().await;
        state
            .subscriptions
            .entry(setup_id.clone())
            .or_default()
            .insert(subscriber.id, subscriber.tx.clone());

        if !state.tasks.contains_key(setup_id) {
            let manager = Arc::clone(self);
            let id = setup_id.clone();
            state
                .tasks
                .insert(setup_id.clone(), tokio::spawn(async move { manager.poll_setup(id).await }));
            debug!(setup_id = %setup_id, "Live poll started");
        }
    }

    pub async fn unsubscribe(&self, setup_id: &SetupId, subscriber: &Subscriber) {
        self.state.lock().await.remove(setup_id, subscriber.id);
    }

    /// Drop a client from every setup it watches.
    pub async fn remove_subscriber(&self, subscriber: &Subscriber) {
        let mut state = self.state.lock().await;
        let setups: Vec<SetupId> = state
            .subscriptions
            .iter()
            .filter(|(_, subscribers)| subscribers.contains_key(&subscriber.id))
            .map(|(setup_id, _)| setup_id.clone())
            .collect();
        for setup_id in setups {
            state.remove(&setup_id, subscriber.id);
        }
    }

    pub async fn subscriber_count(&self, setup_id: &SetupId) -> usize {
        self.state
            .lock()
            .await
            .subscriptions
            .get(setup_id)
            .map_or(0, HashMap::len)
    }

    /// Setups that currently have a running poll task.
    pub async fn active_setups(&self) -> Vec<SetupId> {
        let mut setups: Vec<SetupId> = self.state.lock().await.tasks.keys().cloned().collect();
        setups.sort();
        setups
    }

    /// Send a message to a setup's subscribers. Returns how many got it.
    pub async fn broadcast(&self, setup_id: &SetupId, message: &LiveMessage) -> usize {
        let Some(data) = encode(message) else {
            return 0;
        };
        let mut state = self.state.lock().await;
        let Some(subscribers) = state.subscriptions.get(setup_id) else {
            return 0;
        };

        let (delivered, dead) = send_all(subscribers, &data);
        for id in dead {
            state.remove(setup_id, id);
        }
        delivered
    }

    /// Cancel every poll task and forget all subscribers.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for (_, task) in state.tasks.drain() {
            task.abort();
        }
        state.subscriptions.clear();
    }

    async fn poll_setup(self: Arc<Self>, setup_id: SetupId) {
        loop {
            match self.source.fetch_setup_reading(&setup_id).await {
                Ok((_, reading)) => {
                    self.broadcast(&setup_id, &LiveMessage::reading(&setup_id, &reading))
                        .await;
                }
                Err(Error::NotFound { kind: "setup", .. }) => {
                    let message = LiveMessage::Error {
                        setup_id: setup_id.clone(),
                        msg: "setup missing".to_string(),
                    };
                    self.broadcast(&setup_id, &message).await;
                    tokio::time::sleep(Duration::from_millis(MISSING_SETUP_RETRY_MS)).await;
                    continue;
                }
                Err(e) => {
                    debug!(setup_id = %setup_id, error = %e, "Live reading unavailable");
                }
            }
            tokio::time::sleep(self.intervals.live_poll().max(MIN_LIVE_POLL)).await;
        }
    }
}

fn encode(message: &LiveMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!(error = %e, "Live message serialization failed");
            None
        }
    }
}

/// Try to send `data` to each subscriber; returns the delivered count and
/// the ids whose channel is closed.
fn send_all(subscribers: &HashMap<u64, mpsc::Sender<String>>, data: &str) -> (usize, Vec<u64>) {
    let mut delivered = 0;
    let mut dead = Vec::new();
    for (id, tx) in subscribers {
        match tx.try_send(data.to_string()) {
            Ok(()) => delivered += 1,
            Err(TrySendError::Full(_)) => debug!(subscriber = id, "Subscriber lagging, message dropped"),
            Err(TrySendError::Closed(_)) => dead.push(*id),
        }
    }
    (delivered, dead)
}

impl<R: ReadingSource> BroadcastSink for LiveManager<R> {
    /// Send to every connected subscriber once, whatever it watches.
    async fn broadcast_all(&self, message: &LiveMessage) -> usize {
        let Some(data) = encode(message) else {
            return 0;
        };
        let mut state = self.state.lock().await;

        let mut unique: HashMap<u64, mpsc::Sender<String>> = HashMap::new();
        for subscribers in state.subscriptions.values() {
            for (id, tx) in subscribers {
                unique.entry(*id).or_insert_with(|| tx.clone());
            }
        }

        let (delivered, dead) = send_all(&unique, &data);
        for id in dead {
            let setups: Vec<SetupId> = state.subscriptions.keys().cloned().collect();
            for setup_id in setups {
                state.remove(&setup_id, id);
            }
        }
        delivered
    }
}

/// Background persistence of readings on each setup's own cadence.
pub struct ReadingsCapture<R> {
    source: Arc<R>,
    store: Arc<dyn Store>,
    default_interval_minutes: f64,
    due: Mutex<DueTimeTable<SetupId>>,
}

impl<R> std::fmt::Debug for ReadingsCapture<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadingsCapture")
            .field("default_interval_minutes", &self.default_interval_minutes)
            .finish_non_exhaustive()
    }
}

impl<R: ReadingSource> ReadingsCapture<R> {
    pub fn new(source: Arc<R>, store: Arc<dyn Store>, default_interval_minutes: f64) -> Self {
        Self {
            source,
            store,
            default_interval_minutes,
            due: Mutex::new(DueTimeTable::new()),
        }
    }

    /// One capture tick at `now_ms`. Returns the number of readings stored.
    ///
    /// Setups without a node or with a non-positive interval are skipped.
    pub async fn tick_at(&self, now_ms: i64) -> Result<usize> {
        let setups = self.store.list_setups()?;
        let mut due = self.due.lock().await;
        due.retain(|id| setups.iter().any(|setup| &setup.setup_id == id));

        let mut stored = 0;
        for setup in &setups {
            if setup.node_id.is_none() {
                continue;
            }
            let minutes = setup
                .value_interval_minutes
                .unwrap_or(self.default_interval_minutes);
            if minutes <= 0.0 {
                continue;
            }
            let interval_ms = (minutes * 60_000.0) as i64;
            if !due.check(&setup.setup_id, interval_ms, now_ms) {
                continue;
            }

            match self.source.fetch_setup_reading(&setup.setup_id).await {
                Ok((node_key, reading)) => {
                    match self.store.insert_reading(&setup.setup_id, &node_key, &reading) {
                        Ok(()) => stored += 1,
                        Err(e) => warn!(setup_id = %setup.setup_id, error = %e, "Reading insert failed"),
                    }
                }
                Err(e) => {
                    debug!(setup_id = %setup.setup_id, error = %e, "Reading capture skipped");
                }
            }
            due.advance(&setup.setup_id, interval_ms, now_ms);
        }
        if stored > 0 {
            info!(stored, "readings.captured");
        }
        Ok(stored)
    }

    pub async fn reset(&self) {
        self.due.lock().await.clear();
    }

    pub async fn readings_capture_loop(self: Arc<Self>, intervals: Arc<PollIntervals>) {
        let min_sleep = intervals.min_sleep();
        run_periodic(
            "readings_capture",
            || intervals.capture_tick(),
            min_sleep,
            || {
                let capture = Arc::clone(&self);
                async move { capture.tick_at(now_ms()).await.map(|_| ()) }
            },
        )
        .await;
    }
}
