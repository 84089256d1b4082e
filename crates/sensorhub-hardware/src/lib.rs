//! Hardware abstraction layer for SensorHub.
//!
//! SensorHub talks to two kinds of devices:
//!
//! - **Sensor nodes** attached over USB-CDC serial ports, reached through
//!   [`SerialBackend`] and [`SerialLink`]. [`SystemSerial`] uses the
//!   operating system's ports via `serialport`.
//! - **Camera capture workers**, external processes started through
//!   [`WorkerLauncher`] that stream frames on standard output.
//!   [`ProcessLauncher`] runs the real worker binary via `tokio::process`.
//!
//! # Design
//!
//! - **Generic, not dynamic**: async methods use Edition 2024 RPITIT with
//!   `Send` bounds, so the runtime is generic over the backend rather than
//!   boxing trait objects.
//! - **Blocking serial**: serial reads are blocking with a bounded timeout;
//!   the runtime moves them onto Tokio's blocking pool.
//! - **Error-aware**: all operations return [`Result<T>`][error::Result]
//!   with [`HardwareError`], which converts into the core error type.
//!
//! # Mock Implementations
//!
//! The [`mock`] module provides [`MockSerialBackend`](mock::MockSerialBackend)
//! and [`MockLauncher`](mock::MockLauncher) for development and testing
//! without attached hardware.
//!
//! ```
//! use sensorhub_hardware::mock::MockSerialBackend;
//! use sensorhub_hardware::{PortInfo, SerialBackend};
//!
//! let backend = MockSerialBackend::new();
//! backend.add_port(PortInfo::new("/dev/ttyACM0").with_usb_ids(0x2E8A, 0x0005));
//! assert_eq!(backend.list_ports().unwrap().len(), 1);
//! ```

pub mod error;
pub mod mock;
pub mod process;
pub mod serial;
pub mod traits;
pub mod types;

// Re-export commonly used types for convenience
pub use error::{HardwareError, Result};
pub use process::{ChildWorker, ProcessLauncher};
pub use serial::{SystemSerial, SystemSerialLink};
pub use traits::{SerialBackend, SerialLink, WorkerLauncher, WorkerProcess};
pub use types::{PortInfo, SerialSettings};
