//! On-demand and scheduled still capture.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use sensorhub_core::{CameraRecord, Error, Result, SetupId, now_ms};
use sensorhub_hardware::WorkerLauncher;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::camera::CameraWorkerManager;
use crate::scheduler::{DueTimeTable, PollIntervals, run_periodic};
use crate::store::{StillRecord, StillWriter, Store};

/// Grabs single frames from a setup's camera and persists them.
pub struct StillCapture<L: WorkerLauncher> {
    cameras: Arc<CameraWorkerManager<L>>,
    store: Arc<dyn Store>,
    writer: Arc<dyn StillWriter>,
    default_interval_minutes: f64,
    due: Mutex<DueTimeTable<SetupId>>,
}

impl<L: WorkerLauncher> std::fmt::Debug for StillCapture<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StillCapture")
            .field("default_interval_minutes", &self.default_interval_minutes)
            .finish_non_exhaustive()
    }
}

impl<L: WorkerLauncher> StillCapture<L> {
    pub fn new(
        cameras: Arc<CameraWorkerManager<L>>,
        store: Arc<dyn Store>,
        writer: Arc<dyn StillWriter>,
        default_interval_minutes: f64,
    ) -> Self {
        Self {
            cameras,
            store,
            writer,
            default_interval_minutes,
            due: Mutex::new(DueTimeTable::new()),
        }
    }

    fn camera_for_setup(&self, setup_id: &SetupId) -> Result<CameraRecord> {
        let setup = self
            .store
            .get_setup(setup_id)?
            .ok_or_else(|| Error::not_found("setup", setup_id.as_str()))?;
        let camera_id = setup
            .camera_id
            .ok_or_else(|| Error::NoCameraAssigned(setup_id.to_string()))?;
        self.store
            .get_camera(&camera_id)?
            .ok_or_else(|| Error::not_found("camera", camera_id.as_str()))
    }

    async fn grab(&self, camera: &CameraRecord) -> Result<Bytes> {
        let timeout = self.cameras.config().frame_timeout();
        self.cameras
            .get_frame(camera.worker_device_id(), timeout)
            .await?
            .ok_or_else(|| {
                Error::FrameUnavailable(format!("no frame within {}ms", timeout.as_millis()))
            })
    }

    /// One JPEG from the setup's camera, not persisted.
    pub async fn snapshot(&self, setup_id: &SetupId) -> Result<Bytes> {
        let camera = self.camera_for_setup(setup_id)?;
        self.grab(&camera).await
    }

    /// Capture one still for a setup and hand it to the still writer.
    pub async fn capture_photo_now(&self, setup_id: &SetupId, reason: &str) -> Result<StillRecord> {
        let camera = self.camera_for_setup(setup_id)?;
        let frame = self.grab(&camera).await?;

        let writer = Arc::clone(&self.writer);
        let setup = setup_id.clone();
        let camera_id = camera.camera_id.clone();
        let record = tokio::task::spawn_blocking(move || {
            writer.save_still(&setup, &camera_id, Utc::now(), &frame)
        })
        .await
        .map_err(|e| Error::ResourceExhaustion(format!("still writer task failed: {e}")))??;

        info!(
            setup_id = %setup_id,
            camera_id = %camera.camera_id,
            reason,
            path = %record.path.display(),
            "camera.capture"
        );
        Ok(record)
    }

    /// One photo tick at `now_ms`. Returns the number of stills saved.
    pub async fn tick_at(&self, now_ms: i64) -> Result<usize> {
        let setups = self.store.list_setups()?;
        let mut due = self.due.lock().await;
        due.retain(|id| setups.iter().any(|setup| &setup.setup_id == id));

        let mut saved = 0;
        for setup in &setups {
            if setup.camera_id.is_none() {
                continue;
            }
            let minutes = setup
                .photo_interval_minutes
                .unwrap_or(self.default_interval_minutes);
            if minutes <= 0.0 {
                continue;
            }
            let interval_ms = (minutes * 60_000.0) as i64;
            if !due.check(&setup.setup_id, interval_ms, now_ms) {
                continue;
            }

            match self.capture_photo_now(&setup.setup_id, "interval").await {
                Ok(_) => saved += 1,
                Err(e @ Error::FrameUnavailable(_)) => {
                    debug!(setup_id = %setup.setup_id, error = %e, "Scheduled still skipped");
                }
                Err(e) => warn!(setup_id = %setup.setup_id, error = %e, "Scheduled still failed"),
            }
            due.advance(&setup.setup_id, interval_ms, now_ms);
        }
        Ok(saved)
    }

    pub async fn reset(&self) {
        self.due.lock().await.clear();
    }

    pub async fn photo_capture_loop(self: Arc<Self>, intervals: Arc<PollIntervals>) {
        let min_sleep = intervals.min_sleep();
        run_periodic(
            "photo_capture",
            || intervals.photo_tick(),
            min_sleep,
            || {
                let stills = Arc::clone(&self);
                async move { stills.tick_at(now_ms()).await.map(|_| ()) }
            },
        )
        .await;
    }
}
