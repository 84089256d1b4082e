//! Camera capture worker management.
//!
//! One external worker process runs per camera device while at least one
//! subscriber holds it. A pump task decodes the worker's `FRAM` stream and
//! fans every frame out to the subscribers' single-slot mailboxes, where a
//! newer frame replaces an undelivered one. When the stream ends, for any
//! reason, every mailbox receives [`FrameEvent::EndOfStream`].
//!
//! All worker state lives in one registry map behind one mutex, shared with
//! the pump tasks, so subscriber sets and admission counts never race.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use sensorhub_core::config::CameraConfig;
use sensorhub_core::{AdmissionScope, Error, Result};
use sensorhub_hardware::{WorkerLauncher, WorkerProcess};
use sensorhub_protocol::WorkerFrameCodec;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

const STDERR_TAIL_LINES: usize = 20;
const STDERR_DRAIN: Duration = Duration::from_millis(200);

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Frame(Bytes),
    EndOfStream,
}

#[derive(Debug, Default)]
struct SlotState {
    pending: Option<Bytes>,
    ended: bool,
}

/// Single-slot mailbox: holds at most one undelivered frame.
#[derive(Debug, Default)]
struct FrameSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl FrameSlot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, frame: Bytes) {
        {
            let mut state = self.state();
            if state.ended {
                return;
            }
            state.pending = Some(frame);
        }
        self.notify.notify_one();
    }

    fn end(&self) {
        self.state().ended = true;
        self.notify.notify_one();
    }

    fn try_take(&self) -> Option<FrameEvent> {
        let mut state = self.state();
        match state.pending.take() {
            Some(frame) => Some(FrameEvent::Frame(frame)),
            None if state.ended => Some(FrameEvent::EndOfStream),
            None => None,
        }
    }

    async fn recv(&self) -> FrameEvent {
        loop {
            if let Some(event) = self.try_take() {
                return event;
            }
            self.notify.notified().await;
        }
    }
}

/// A subscription to one device's frames.
///
/// Hand it back to [`CameraWorkerManager::unsubscribe`] when done; the
/// worker stops when its last subscription is returned.
#[derive(Debug)]
pub struct FrameSubscription {
    id: u64,
    device_id: String,
    slot: Arc<FrameSlot>,
}

impl FrameSubscription {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Wait for the next frame or the end of the stream.
    pub async fn recv(&self) -> FrameEvent {
        self.slot.recv().await
    }

    /// The pending event, if any, without waiting.
    pub fn try_recv(&self) -> Option<FrameEvent> {
        self.slot.try_take()
    }
}

struct WorkerEntry<P> {
    generation: u64,
    subscribers: HashMap<u64, Arc<FrameSlot>>,
    process: Option<P>,
    pump: Option<JoinHandle<()>>,
    frames_sent: u64,
    last_access: DateTime<Utc>,
    last_error: Option<String>,
    ended: bool,
}

type Workers<P> = Arc<Mutex<HashMap<String, WorkerEntry<P>>>>;

fn lock_workers<P>(
    workers: &Mutex<HashMap<String, WorkerEntry<P>>>,
) -> MutexGuard<'_, HashMap<String, WorkerEntry<P>>> {
    workers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-worker health.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
    pub device_id: String,
    pub pid: Option<u32>,
    pub subscribers: usize,
    pub frames_sent: u64,
    pub last_access: DateTime<Utc>,
    pub last_error: Option<String>,
    pub streaming: bool,
}

/// Snapshot of every running worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraHealth {
    pub workers: Vec<WorkerHealth>,
    pub worker_count: usize,
    pub subscriber_count: usize,
}

impl CameraHealth {
    pub fn worker(&self, device_id: &str) -> Option<&WorkerHealth> {
        self.workers.iter().find(|w| w.device_id == device_id)
    }
}

/// Owner of all camera worker processes.
pub struct CameraWorkerManager<L: WorkerLauncher> {
    launcher: Arc<L>,
    config: CameraConfig,
    workers: Workers<L::Process>,
    next_id: AtomicU64,
}

impl<L: WorkerLauncher> std::fmt::Debug for CameraWorkerManager<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraWorkerManager")
            .field("workers", &lock_workers(&self.workers).len())
            .finish_non_exhaustive()
    }
}

impl<L: WorkerLauncher> CameraWorkerManager<L> {
    pub fn new(launcher: Arc<L>, config: CameraConfig) -> Self {
        Self {
            launcher,
            config,
            workers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribe to `device_id`, starting its worker if none is running.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::AdmissionLimit`] when a new worker would exceed a ceiling
    /// - [`Error::ResourceExhaustion`] when the worker cannot be spawned
    pub fn subscribe(&self, device_id: &str) -> Result<FrameSubscription> {
        let (result, stale) = {
            let mut workers = lock_workers(&self.workers);
            let stale = if workers.get(device_id).is_some_and(|entry| entry.ended) {
                workers.remove(device_id)
            } else {
                None
            };
            (self.subscribe_locked(&mut workers, device_id), stale)
        };

        if let Some(entry) = stale {
            tokio::spawn(stop_entry(
                device_id.to_string(),
                entry,
                self.config.stop_grace(),
            ));
        }
        result
    }

    fn subscribe_locked(
        &self,
        workers: &mut HashMap<String, WorkerEntry<L::Process>>,
        device_id: &str,
    ) -> Result<FrameSubscription> {
        if !workers.contains_key(device_id) {
            if workers.len() >= self.config.max_total {
                warn!(
                    device_id,
                    limit = self.config.max_total,
                    "camera.worker_limit_total"
                );
                return Err(Error::AdmissionLimit {
                    scope: AdmissionScope::Total,
                    limit: self.config.max_total,
                });
            }
            if self.config.max_per_device == 0 {
                warn!(device_id, "camera.worker_limit_device");
                return Err(Error::AdmissionLimit {
                    scope: AdmissionScope::Device,
                    limit: 0,
                });
            }
            // The launch runs on the calling task with the registry lock held,
            // so concurrent subscribers can never spawn a second worker. It
            // costs one fork/exec; nothing here waits on the worker itself.
            let entry = self.start_worker(device_id)?;
            workers.insert(device_id.to_string(), entry);
        }

        let id = self.next_id();
        let slot = Arc::new(FrameSlot::default());
        if let Some(entry) = workers.get_mut(device_id) {
            entry.subscribers.insert(id, Arc::clone(&slot));
            entry.last_access = Utc::now();
        }
        Ok(FrameSubscription {
            id,
            device_id: device_id.to_string(),
            slot,
        })
    }

    fn start_worker(&self, device_id: &str) -> Result<WorkerEntry<L::Process>> {
        let mut process = self.launcher.launch(device_id).map_err(|e| {
            error!(device_id, error = %e, "camera.worker_spawn_failed");
            Error::from(e)
        })?;
        let Some(stdout) = process.take_stdout() else {
            return Err(Error::ResourceExhaustion(format!(
                "worker for {device_id} has no stdout"
            )));
        };
        let stderr = process.take_stderr();

        let generation = self.next_id();
        let pump = tokio::spawn(pump::<L::Process>(
            Arc::clone(&self.workers),
            device_id.to_string(),
            generation,
            stdout,
            stderr,
            self.config.expected_mime.clone(),
        ));
        info!(device_id, pid = process.id(), "camera.worker_start");

        Ok(WorkerEntry {
            generation,
            subscribers: HashMap::new(),
            process: Some(process),
            pump: Some(pump),
            frames_sent: 0,
            last_access: Utc::now(),
            last_error: None,
            ended: false,
        })
    }

    /// Remove a subscription; returns the worker entry if it was the last.
    fn detach(&self, subscription: &FrameSubscription) -> Option<WorkerEntry<L::Process>> {
        let mut workers = lock_workers(&self.workers);
        let entry = workers.get_mut(&subscription.device_id)?;
        entry.subscribers.remove(&subscription.id)?;
        entry.last_access = Utc::now();
        if entry.subscribers.is_empty() {
            workers.remove(&subscription.device_id)
        } else {
            None
        }
    }

    /// Return a subscription, stopping the worker if it was the last one.
    pub async fn unsubscribe(&self, subscription: FrameSubscription) {
        if let Some(entry) = self.detach(&subscription) {
            stop_entry(subscription.device_id, entry, self.config.stop_grace()).await;
        }
    }

    /// Wait up to `timeout` for one frame from `device_id`.
    ///
    /// `Ok(None)` means no frame arrived in time or the stream ended.
    pub async fn get_frame(&self, device_id: &str, timeout: Duration) -> Result<Option<Bytes>> {
        let subscription = self.subscribe(device_id)?;
        let event = tokio::time::timeout(timeout, subscription.recv()).await;
        self.unsubscribe(subscription).await;

        match event {
            Ok(FrameEvent::Frame(frame)) => Ok(Some(frame)),
            Ok(FrameEvent::EndOfStream) => {
                debug!(device_id, "Stream ended before a frame arrived");
                Ok(None)
            }
            Err(_) => {
                debug!(device_id, timeout_ms = timeout.as_millis() as u64, "Frame wait timed out");
                Ok(None)
            }
        }
    }

    /// Frames from `device_id` for as long as the stream is held.
    ///
    /// Dropping the stream returns the subscription.
    pub fn stream_frames(
        self: &Arc<Self>,
        device_id: &str,
    ) -> Result<impl Stream<Item = Bytes> + Send + 'static> {
        let guard = SubscriptionGuard {
            manager: Arc::clone(self),
            subscription: Some(self.subscribe(device_id)?),
        };
        Ok(futures::stream::unfold(guard, |guard| async move {
            let event = match guard.subscription.as_ref() {
                Some(subscription) => subscription.recv().await,
                None => return None,
            };
            match event {
                FrameEvent::Frame(frame) => Some((frame, guard)),
                FrameEvent::EndOfStream => None,
            }
        })
        .fuse())
    }

    /// Stop the worker for `device_id` regardless of its subscribers.
    pub async fn stop_device(&self, device_id: &str) -> bool {
        let entry = lock_workers(&self.workers).remove(device_id);
        match entry {
            Some(entry) => {
                stop_entry(device_id.to_string(), entry, self.config.stop_grace()).await;
                true
            }
            None => false,
        }
    }

    /// Stop every worker.
    pub async fn reset(&self) {
        let entries: Vec<_> = lock_workers(&self.workers).drain().collect();
        let grace = self.config.stop_grace();
        futures::future::join_all(
            entries
                .into_iter()
                .map(|(device_id, entry)| stop_entry(device_id, entry, grace)),
        )
        .await;
    }

    pub fn worker_count(&self) -> usize {
        lock_workers(&self.workers).len()
    }

    /// Read-only snapshot of the worker registry.
    pub fn health(&self) -> CameraHealth {
        let workers = lock_workers(&self.workers);
        let mut health: Vec<WorkerHealth> = workers
            .iter()
            .map(|(device_id, entry)| WorkerHealth {
                device_id: device_id.clone(),
                pid: entry.process.as_ref().and_then(|p| p.id()),
                subscribers: entry.subscribers.len(),
                frames_sent: entry.frames_sent,
                last_access: entry.last_access,
                last_error: entry.last_error.clone(),
                streaming: !entry.ended,
            })
            .collect();
        health.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        CameraHealth {
            worker_count: health.len(),
            subscriber_count: health.iter().map(|w| w.subscribers).sum(),
            workers: health,
        }
    }
}

/// Returns the subscription when a frame stream is dropped.
struct SubscriptionGuard<L: WorkerLauncher> {
    manager: Arc<CameraWorkerManager<L>>,
    subscription: Option<FrameSubscription>,
}

impl<L: WorkerLauncher> Drop for SubscriptionGuard<L> {
    fn drop(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        let Some(entry) = self.manager.detach(&subscription) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(stop_entry(
                    subscription.device_id,
                    entry,
                    self.manager.config.stop_grace(),
                ));
            }
            // Outside a runtime the process is reaped by kill-on-drop.
            Err(_) => drop(entry),
        }
    }
}

/// Cancel the pump, end every mailbox, then terminate and if needed kill.
async fn stop_entry<P: WorkerProcess>(
    device_id: String,
    mut entry: WorkerEntry<P>,
    grace: Duration,
) {
    if let Some(pump) = entry.pump.take() {
        pump.abort();
    }
    for slot in entry.subscribers.values() {
        slot.end();
    }

    let Some(mut process) = entry.process.take() else {
        return;
    };
    let pid = process.id();
    if let Err(e) = process.terminate() {
        debug!(device_id = %device_id, error = %e, "Terminate failed");
    }

    let exit_code = match tokio::time::timeout(grace, process.wait()).await {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            debug!(device_id = %device_id, error = %e, "Wait failed");
            None
        }
        Err(_) => {
            warn!(device_id = %device_id, pid, "Worker ignored terminate, killing");
            if let Err(e) = process.kill().await {
                warn!(device_id = %device_id, error = %e, "Kill failed");
            }
            process.wait().await.ok().flatten()
        }
    };

    info!(
        device_id = %device_id,
        pid,
        exit_code,
        frames_sent = entry.frames_sent,
        "camera.worker_stop"
    );
}

/// Deliver one frame. Returns false once the entry is gone or replaced.
fn broadcast<P>(
    workers: &Mutex<HashMap<String, WorkerEntry<P>>>,
    device_id: &str,
    generation: u64,
    frame: Bytes,
) -> bool {
    let mut workers = lock_workers(workers);
    let Some(entry) = workers.get_mut(device_id) else {
        return false;
    };
    if entry.generation != generation {
        return false;
    }
    for slot in entry.subscribers.values() {
        slot.push(frame.clone());
    }
    entry.frames_sent += 1;
    true
}

async fn collect_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    device_id: String,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(device_id = %device_id, line = %line, "Worker stderr");
        let mut buffer = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if buffer.len() == STDERR_TAIL_LINES {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }
}

async fn pump<P: WorkerProcess>(
    workers: Workers<P>,
    device_id: String,
    generation: u64,
    stdout: P::Stdout,
    stderr: Option<P::Stderr>,
    expected_mime: String,
) {
    let tail = Arc::new(Mutex::new(VecDeque::new()));
    let stderr_task = stderr.map(|stderr| {
        tokio::spawn(collect_stderr(stderr, device_id.clone(), Arc::clone(&tail)))
    });

    let mut frames = FramedRead::new(stdout, WorkerFrameCodec::new());
    let reason = loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                if frame.device_id != device_id {
                    warn!(
                        expected = %device_id,
                        actual = %frame.device_id,
                        sequence = frame.sequence,
                        "camera.device_mismatch"
                    );
                    continue;
                }
                if frame.mime != expected_mime {
                    debug!(device_id = %device_id, mime = %frame.mime, "Unexpected frame mime type");
                }
                if !broadcast(&workers, &device_id, generation, frame.payload) {
                    return;
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => break "worker exited".to_string(),
        }
    };

    if let Some(task) = stderr_task {
        // Give the worker a moment to finish writing its diagnostics.
        let _ = tokio::time::timeout(STDERR_DRAIN, task).await;
    }
    let stderr_tail: Vec<String> = tail
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .iter()
        .cloned()
        .collect();

    {
        let mut workers = lock_workers(&workers);
        if let Some(entry) = workers.get_mut(&device_id)
            && entry.generation == generation
        {
            entry.ended = true;
            entry.last_error = Some(format!("frame unavailable: {reason}"));
            for slot in entry.subscribers.values() {
                slot.end();
            }
        }
    }

    warn!(
        device_id = %device_id,
        reason = %reason,
        stderr = %stderr_tail.join(" | "),
        "camera.worker_stream_end"
    );
}
