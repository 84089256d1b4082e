//! Mock capture worker launcher.
//!
//! Every launch hands a [`MockWorkerHandle`] to the paired
//! [`MockLauncherHandle`], from which a test writes raw frame bytes into the
//! worker's standard output and observes how the process is stopped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

use crate::error::{HardwareError, Result};
use crate::traits::{WorkerLauncher, WorkerProcess};

const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Default)]
struct LauncherState {
    spawned: AtomicUsize,
    fail_launch: AtomicBool,
    ignore_terminate: AtomicBool,
    device_list: Mutex<String>,
}

/// Launcher producing in-process fake workers.
#[derive(Clone)]
pub struct MockLauncher {
    state: Arc<LauncherState>,
    workers_tx: mpsc::UnboundedSender<MockWorkerHandle>,
}

impl std::fmt::Debug for MockLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLauncher")
            .field("spawned", &self.state.spawned.load(Ordering::SeqCst))
            .finish()
    }
}

impl MockLauncher {
    /// Create a launcher and the handle that receives its workers.
    pub fn new() -> (Self, MockLauncherHandle) {
        let state = Arc::new(LauncherState {
            device_list: Mutex::new("[]".to_string()),
            ..LauncherState::default()
        });
        let (workers_tx, workers_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::clone(&state),
                workers_tx,
            },
            MockLauncherHandle { state, workers_rx },
        )
    }
}

impl WorkerLauncher for MockLauncher {
    type Process = MockWorker;

    fn launch(&self, device_id: &str) -> Result<Self::Process> {
        if self.state.fail_launch.load(Ordering::SeqCst) {
            return Err(HardwareError::spawn_failed("mock launch failure"));
        }
        let index = self.state.spawned.fetch_add(1, Ordering::SeqCst);

        let (stdout_reader, stdout_writer) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_reader, stderr_writer) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let signals = Arc::new(WorkerSignals::default());

        let handle = MockWorkerHandle {
            device_id: device_id.to_string(),
            stdout: Some(stdout_writer),
            stderr: Some(stderr_writer),
            exit_tx: exit_tx.clone(),
            signals: Arc::clone(&signals),
        };
        // The test may have dropped its handle; the worker still runs.
        let _ = self.workers_tx.send(handle);

        Ok(MockWorker {
            pid: 10_000 + index as u32,
            stdout: Some(stdout_reader),
            stderr: Some(stderr_reader),
            exit_tx,
            exit_rx,
            signals,
            ignore_terminate: self.state.ignore_terminate.load(Ordering::SeqCst),
        })
    }

    async fn list_devices(&self) -> Result<String> {
        Ok(self
            .state
            .device_list
            .lock()
            .map(|list| list.clone())
            .unwrap_or_default())
    }
}

/// Test-side control of a [`MockLauncher`].
pub struct MockLauncherHandle {
    state: Arc<LauncherState>,
    workers_rx: mpsc::UnboundedReceiver<MockWorkerHandle>,
}

impl MockLauncherHandle {
    /// Number of workers launched so far.
    pub fn spawn_count(&self) -> usize {
        self.state.spawned.load(Ordering::SeqCst)
    }

    /// Wait for the next launched worker.
    pub async fn next_worker(&mut self) -> Option<MockWorkerHandle> {
        self.workers_rx.recv().await
    }

    /// Take an already launched worker without waiting.
    pub fn try_next_worker(&mut self) -> Option<MockWorkerHandle> {
        self.workers_rx.try_recv().ok()
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.state.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Make workers launched from now on ignore `terminate`, forcing a kill.
    pub fn set_ignore_terminate(&self, ignore: bool) {
        self.state.ignore_terminate.store(ignore, Ordering::SeqCst);
    }

    /// Raw output of the next `--list` invocation.
    pub fn set_device_list(&self, json: impl Into<String>) {
        if let Ok(mut list) = self.state.device_list.lock() {
            *list = json.into();
        }
    }
}

#[derive(Default)]
struct WorkerSignals {
    terminated: AtomicBool,
    killed: AtomicBool,
}

/// Worker side of a mock process.
pub struct MockWorkerHandle {
    device_id: String,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    exit_tx: watch::Sender<Option<i32>>,
    signals: Arc<WorkerSignals>,
}

impl MockWorkerHandle {
    /// Device the worker was launched for.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Write raw bytes to the worker's standard output.
    pub async fn write_stdout(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.write_all(data).await,
            None => Err(std::io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// Write a diagnostic line to the worker's standard error.
    pub async fn write_stderr(&mut self, line: &str) -> std::io::Result<()> {
        match self.stderr.as_mut() {
            Some(stderr) => {
                stderr.write_all(line.as_bytes()).await?;
                stderr.write_all(b"\n").await
            }
            None => Err(std::io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// Close both output pipes, as a crashing worker would.
    pub fn close_output(&mut self) {
        self.stdout = None;
        self.stderr = None;
    }

    /// Exit with the given code.
    pub fn exit(&mut self, code: i32) {
        self.close_output();
        self.exit_tx.send_replace(Some(code));
    }

    pub fn was_terminated(&self) -> bool {
        self.signals.terminated.load(Ordering::SeqCst)
    }

    pub fn was_killed(&self) -> bool {
        self.signals.killed.load(Ordering::SeqCst)
    }

    /// Whether the process has exited for any reason.
    pub fn has_exited(&self) -> bool {
        self.exit_tx.borrow().is_some()
    }
}

/// Host side of a mock process.
pub struct MockWorker {
    pid: u32,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    exit_tx: watch::Sender<Option<i32>>,
    exit_rx: watch::Receiver<Option<i32>>,
    signals: Arc<WorkerSignals>,
    ignore_terminate: bool,
}

impl WorkerProcess for MockWorker {
    type Stdout = DuplexStream;
    type Stderr = DuplexStream;

    fn id(&self) -> Option<u32> {
        self.exit_rx.borrow().is_none().then_some(self.pid)
    }

    fn take_stdout(&mut self) -> Option<Self::Stdout> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<Self::Stderr> {
        self.stderr.take()
    }

    fn terminate(&mut self) -> Result<()> {
        self.signals.terminated.store(true, Ordering::SeqCst);
        if !self.ignore_terminate {
            self.exit_tx.send_if_modified(|code| {
                if code.is_none() {
                    *code = Some(0);
                    true
                } else {
                    false
                }
            });
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.signals.killed.store(true, Ordering::SeqCst);
        self.exit_tx.send_if_modified(|code| {
            if code.is_none() {
                *code = Some(-9);
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let code = self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| HardwareError::disconnected(format!("mock worker {}", self.pid)))?;
        Ok(*code)
    }
}
