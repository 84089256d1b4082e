//! SensorHub device runtime.
//!
//! This crate hosts the concurrent core of the hub:
//!
//! - [`scheduler`]: the periodic loop driver, the per-entity due-time table
//!   and the named loop registry.
//! - [`nodes`]: the serial node link manager (handshake, discovery, retrying
//!   command execution, calibration sync).
//! - [`camera`]: one capture worker process per camera device with
//!   latest-wins frame fan-out and admission control.
//! - [`camera_devices`]: camera enumeration through the worker's list mode.
//! - [`live`]: websocket-style fan-out of live readings and the readings
//!   capture loop.
//! - [`stills`]: on-demand and scheduled still capture.
//! - [`store`]: the narrow boundary to the external persistent store.
//! - [`runtime`]: [`HubRuntime`], which owns all of the above.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sensorhub_core::HubConfig;
//! use sensorhub_hardware::{ProcessLauncher, SystemSerial};
//! use sensorhub_runtime::store::{DirectoryStillWriter, MemoryStore};
//! use sensorhub_runtime::HubRuntime;
//!
//! # async fn example() -> sensorhub_core::Result<()> {
//! let config = HubConfig::default();
//! let launcher = ProcessLauncher::from_config(&config.camera)?;
//! let runtime = HubRuntime::new(
//!     config,
//!     SystemSerial,
//!     launcher,
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(DirectoryStillWriter::new("data/photos")),
//! )?;
//! runtime.start_loops();
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod camera_devices;
pub mod live;
pub mod nodes;
pub mod runtime;
pub mod scheduler;
pub mod stills;
pub mod store;

pub use camera::{CameraHealth, CameraWorkerManager, FrameEvent, FrameSubscription};
pub use live::{BroadcastSink, LiveManager, LiveMessage, ReadingSource, ReadingsCapture, Subscriber};
pub use nodes::{NodeClient, NodeLinkManager};
pub use runtime::{HubHealth, HubRuntime};
pub use scheduler::{DueTimeTable, LoopRegistry, PollIntervals, run_periodic};
pub use stills::StillCapture;
pub use store::{StillRecord, StillWriter, Store};
