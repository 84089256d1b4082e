//! Periodic scheduling primitives.
//!
//! [`run_periodic`] drives every background loop in the hub: discovery,
//! capture and broadcast. Each iteration's failure is logged and swallowed so
//! one misbehaving subsystem never stalls another. The sleep between
//! iterations is read fresh from an interval provider, usually backed by
//! [`PollIntervals`], so cadences can be changed while the loops run.
//!
//! [`DueTimeTable`] gives each entity of a loop its own drift-corrected
//! cadence, and [`LoopRegistry`] keeps the named loop tasks so they can be
//! stopped and inspected.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use sensorhub_core::{HubConfig, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Run `work` forever, sleeping `interval()` (floored at `min_sleep`)
/// between iterations.
///
/// Errors and panics inside an iteration are logged as `loop.error` and the
/// loop carries on with the next tick.
pub async fn run_periodic<I, W, Fut>(name: &str, mut interval: I, min_sleep: Duration, mut work: W)
where
    I: FnMut() -> Duration,
    W: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        match AssertUnwindSafe(work()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(loop_name = name, error = %e, "loop.error"),
            Err(_) => error!(loop_name = name, "loop.error: iteration panicked"),
        }
        tokio::time::sleep(interval().max(min_sleep)).await;
    }
}

/// Live-reconfigurable loop cadences, in milliseconds.
#[derive(Debug)]
pub struct PollIntervals {
    node_scan_ms: AtomicU64,
    camera_scan_ms: AtomicU64,
    live_poll_ms: AtomicU64,
    capture_tick_ms: AtomicU64,
    photo_tick_ms: AtomicU64,
    min_sleep_ms: AtomicU64,
}

macro_rules! interval_accessors {
    ($($field:ident => $get:ident, $set:ident;)*) => {
        $(
            pub fn $get(&self) -> Duration {
                Duration::from_millis(self.$field.load(Ordering::Relaxed))
            }

            pub fn $set(&self, interval: Duration) {
                self.$field
                    .store(interval.as_millis() as u64, Ordering::Relaxed);
            }
        )*
    };
}

impl PollIntervals {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            node_scan_ms: AtomicU64::new(config.nodes.scan_interval_ms),
            camera_scan_ms: AtomicU64::new(config.camera.scan_interval_ms),
            live_poll_ms: AtomicU64::new(config.live.poll_interval_ms),
            capture_tick_ms: AtomicU64::new(config.live.capture_tick_ms),
            photo_tick_ms: AtomicU64::new(config.live.photo_tick_ms),
            min_sleep_ms: AtomicU64::new(config.live.min_loop_sleep_ms),
        }
    }

    interval_accessors! {
        node_scan_ms => node_scan, set_node_scan;
        camera_scan_ms => camera_scan, set_camera_scan;
        live_poll_ms => live_poll, set_live_poll;
        capture_tick_ms => capture_tick, set_capture_tick;
        photo_tick_ms => photo_tick, set_photo_tick;
        min_sleep_ms => min_sleep, set_min_sleep;
    }
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self::from_config(&HubConfig::default())
    }
}

/// Per-entity next-due timestamps.
///
/// An entity seen for the first time is scheduled one interval out without
/// acting. After an action the due time advances by one interval; if that is
/// still in the past it is reset to `now + interval` so a slow or failed
/// action never causes a burst of catch-up actions.
#[derive(Debug, Clone)]
pub struct DueTimeTable<K> {
    next_due: HashMap<K, i64>,
}

impl<K: Hash + Eq + Clone> DueTimeTable<K> {
    pub fn new() -> Self {
        Self {
            next_due: HashMap::new(),
        }
    }

    /// Whether `key` is due at `now_ms`.
    ///
    /// The first call for a key schedules it and returns `false`.
    pub fn check(&mut self, key: &K, interval_ms: i64, now_ms: i64) -> bool {
        match self.next_due.get(key) {
            Some(due) => now_ms >= *due,
            None => {
                self.next_due.insert(key.clone(), now_ms + interval_ms);
                false
            }
        }
    }

    /// Advance `key` after its action ran, whatever the outcome.
    pub fn advance(&mut self, key: &K, interval_ms: i64, now_ms: i64) {
        let previous = self.next_due.get(key).copied().unwrap_or(now_ms);
        let mut next = previous + interval_ms;
        if next <= now_ms {
            next = now_ms + interval_ms;
        }
        self.next_due.insert(key.clone(), next);
    }

    pub fn next_due(&self, key: &K) -> Option<i64> {
        self.next_due.get(key).copied()
    }

    /// Forget entities for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.next_due.retain(|key, _| keep(key));
    }

    pub fn len(&self) -> usize {
        self.next_due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next_due.is_empty()
    }

    pub fn clear(&mut self) {
        self.next_due.clear();
    }
}

impl<K: Hash + Eq + Clone> Default for DueTimeTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run state of a registered loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopStatus {
    pub name: String,
    pub running: bool,
}

/// Named background loop tasks.
#[derive(Debug, Default)]
pub struct LoopRegistry {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LoopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `task` under `name`, aborting any loop already registered there.
    pub fn start<F>(&self, name: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        if let Some(previous) = self.tasks().insert(name.to_string(), handle) {
            previous.abort();
        }
        debug!(loop_name = name, "Loop started");
    }

    /// Abort the loop registered under `name`.
    pub fn stop(&self, name: &str) -> bool {
        match self.tasks().remove(name) {
            Some(handle) => {
                handle.abort();
                debug!(loop_name = name, "Loop stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for (name, handle) in self.tasks().drain() {
            handle.abort();
            debug!(loop_name = %name, "Loop stopped");
        }
    }

    pub fn status(&self) -> Vec<LoopStatus> {
        let mut status: Vec<LoopStatus> = self
            .tasks()
            .iter()
            .map(|(name, handle)| LoopStatus {
                name: name.clone(),
                running: !handle.is_finished(),
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }
}

impl Drop for LoopRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}
