//! Mock device implementations for testing and development.
//!
//! These stand in for attached sensor nodes and the camera worker binary and
//! can be controlled programmatically from tests.

pub mod serial;
pub mod worker;

// Re-export commonly used types
pub use serial::{MockSerialBackend, MockSerialHandle, MockSerialLink};
pub use worker::{MockLauncher, MockLauncherHandle, MockWorker, MockWorkerHandle};
