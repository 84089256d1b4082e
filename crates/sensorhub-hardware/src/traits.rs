//! Hardware boundary trait definitions.
//!
//! Two families of devices sit behind these traits:
//!
//! - **Serial links** ([`SerialBackend`] / [`SerialLink`]): blocking, timeout
//!   based byte pipes to USB-CDC sensor nodes. They are blocking because the
//!   underlying `serialport` handles are; callers run them on the blocking
//!   pool.
//! - **Worker processes** ([`WorkerLauncher`] / [`WorkerProcess`]): external
//!   capture programs that stream frames on standard output.
//!
//! Async methods return `impl Future + Send` (Edition 2024 RPITIT) so the
//! runtime can drive them from spawned tasks. Like every RPITIT trait, they
//! are not object-safe; the runtime is generic over the implementation.

use std::future::Future;

use tokio::io::AsyncRead;

use crate::error::Result;
use crate::types::{PortInfo, SerialSettings};

/// Source of serial ports.
///
/// # Examples
///
/// ```no_run
/// use sensorhub_hardware::{SerialBackend, SerialLink, SerialSettings, SystemSerial};
/// use std::time::Duration;
///
/// # fn example() -> sensorhub_hardware::Result<()> {
/// let backend = SystemSerial;
/// for port in backend.list_ports()? {
///     let mut link = backend.open(&port.port_name, &SerialSettings::new(115_200, Duration::from_millis(500)))?;
///     link.write_all(b"{\"t\":\"get_all\"}\n")?;
/// }
/// # Ok(())
/// # }
/// ```
pub trait SerialBackend: Send + Sync + 'static {
    type Link: SerialLink;

    /// Enumerate the serial ports currently present.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Open a port exclusively.
    fn open(&self, port: &str, settings: &SerialSettings) -> Result<Self::Link>;
}

/// An open serial port.
pub trait SerialLink: Send + 'static {
    /// Path of the port this link was opened on.
    fn port(&self) -> &str;

    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever is available, waiting at most the configured read timeout.
    ///
    /// Returns `Ok(0)` when nothing arrived before the timeout.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Whether the link is still usable. A failed read or write alone does
    /// not close it.
    fn is_open(&self) -> bool;

    /// Release the port. Further I/O fails.
    fn close(&mut self);
}

/// Starts capture worker processes.
pub trait WorkerLauncher: Send + Sync + 'static {
    type Process: WorkerProcess;

    /// Start a worker streaming frames for `device_id`.
    ///
    /// Called with the worker registry lock held: return as soon as the
    /// process exists, without waiting on its output.
    fn launch(&self, device_id: &str) -> Result<Self::Process>;

    /// Run the worker in list mode and return its raw standard output.
    fn list_devices(&self) -> impl Future<Output = Result<String>> + Send;
}

/// A running capture worker.
pub trait WorkerProcess: Send + 'static {
    type Stdout: AsyncRead + Unpin + Send + 'static;
    type Stderr: AsyncRead + Unpin + Send + 'static;

    /// OS process id, if the process is still known to the OS.
    fn id(&self) -> Option<u32>;

    /// Take ownership of the frame stream. Returns `None` after the first call.
    fn take_stdout(&mut self) -> Option<Self::Stdout>;

    /// Take ownership of the diagnostic stream. Returns `None` after the first call.
    fn take_stderr(&mut self) -> Option<Self::Stderr>;

    /// Ask the process to exit.
    fn terminate(&mut self) -> Result<()>;

    /// Force the process to exit and reap it.
    fn kill(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Wait for the process to exit, returning its exit code when it has one.
    fn wait(&mut self) -> impl Future<Output = Result<Option<i32>>> + Send;
}
