//! Mock serial backend for testing without attached nodes.
//!
//! Each port added to a [`MockSerialBackend`] comes with a
//! [`MockSerialHandle`] that plays the node side of the link: it can queue
//! lines for the host to read, answer written lines through a responder,
//! inject transient write failures and simulate unplugging.
//!
//! # Examples
//!
//! ```
//! use sensorhub_hardware::mock::MockSerialBackend;
//! use sensorhub_hardware::{PortInfo, SerialBackend, SerialLink, SerialSettings};
//! use std::time::Duration;
//!
//! let backend = MockSerialBackend::new();
//! let node = backend.add_port(PortInfo::new("/dev/ttyACM0").with_usb_ids(0x2E8A, 0x0005));
//! node.set_responder(|line| {
//!     if line.contains("get_all") {
//!         vec![r#"{"t":"all","ph":7.0,"ec":1.0,"temp":20.0}"#.to_string()]
//!     } else {
//!         Vec::new()
//!     }
//! });
//!
//! let settings = SerialSettings::new(115_200, Duration::from_millis(50));
//! let mut link = backend.open("/dev/ttyACM0", &settings).unwrap();
//! link.write_all(b"{\"t\":\"get_all\"}\n").unwrap();
//!
//! let mut buf = [0u8; 256];
//! let n = link.read_chunk(&mut buf).unwrap();
//! assert!(std::str::from_utf8(&buf[..n]).unwrap().contains("\"all\""));
//! assert_eq!(node.written_lines(), vec![r#"{"t":"get_all"}"#.to_string()]);
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{HardwareError, Result};
use crate::traits::{SerialBackend, SerialLink};
use crate::types::{PortInfo, SerialSettings};

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

#[derive(Default)]
struct PortInner {
    inbound: VecDeque<u8>,
    partial: Vec<u8>,
    written: Vec<String>,
    responder: Option<Responder>,
    hello: Option<String>,
    connected: bool,
    fail_open: bool,
    fail_writes: usize,
    open_links: usize,
}

struct MockPort {
    info: PortInfo,
    inner: Mutex<PortInner>,
    readable: Condvar,
    opens: AtomicUsize,
}

impl MockPort {
    fn lock(&self) -> MutexGuard<'_, PortInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_line(inner: &mut PortInner, line: &str) {
        inner.inbound.extend(line.as_bytes());
        inner.inbound.push_back(b'\n');
    }
}

/// In-memory serial backend.
#[derive(Clone, Default)]
pub struct MockSerialBackend {
    ports: Arc<Mutex<BTreeMap<String, Arc<MockPort>>>>,
}

impl std::fmt::Debug for MockSerialBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSerialBackend").finish_non_exhaustive()
    }
}

impl MockSerialBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn ports(&self) -> MutexGuard<'_, BTreeMap<String, Arc<MockPort>>> {
        self.ports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Plug in a port and get the node-side handle for it.
    ///
    /// Re-adding a port name replaces the previous device.
    pub fn add_port(&self, info: PortInfo) -> MockSerialHandle {
        let port = Arc::new(MockPort {
            info: info.clone(),
            inner: Mutex::new(PortInner {
                connected: true,
                ..PortInner::default()
            }),
            readable: Condvar::new(),
            opens: AtomicUsize::new(0),
        });
        self.ports().insert(info.port_name.clone(), Arc::clone(&port));
        MockSerialHandle { port }
    }

    /// Unplug a port: it disappears from enumeration and open links fail.
    pub fn remove_port(&self, port_name: &str) {
        if let Some(port) = self.ports().remove(port_name) {
            port.lock().connected = false;
            port.readable.notify_all();
        }
    }
}

impl SerialBackend for MockSerialBackend {
    type Link = MockSerialLink;

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(self.ports().values().map(|port| port.info.clone()).collect())
    }

    fn open(&self, port_name: &str, settings: &SerialSettings) -> Result<Self::Link> {
        let port = self
            .ports()
            .get(port_name)
            .cloned()
            .ok_or_else(|| HardwareError::disconnected(port_name))?;

        {
            let mut inner = port.lock();
            if !inner.connected {
                return Err(HardwareError::disconnected(port_name));
            }
            if inner.fail_open {
                return Err(HardwareError::communication(port_name, "access denied"));
            }
            inner.open_links += 1;
            inner.inbound.clear();
            inner.partial.clear();
            if let Some(hello) = inner.hello.clone() {
                MockPort::push_line(&mut inner, &hello);
            }
        }
        port.opens.fetch_add(1, Ordering::SeqCst);
        port.readable.notify_all();

        Ok(MockSerialLink {
            port,
            open: true,
            read_timeout: settings.read_timeout,
        })
    }
}

/// Host side of a mock serial port.
pub struct MockSerialLink {
    port: Arc<MockPort>,
    open: bool,
    read_timeout: Duration,
}

impl std::fmt::Debug for MockSerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSerialLink")
            .field("port", &self.port.info.port_name)
            .field("open", &self.open)
            .finish()
    }
}

impl MockSerialLink {
    fn check(&self, inner: &PortInner) -> Result<()> {
        if !self.open || !inner.connected {
            return Err(HardwareError::disconnected(self.port.info.port_name.clone()));
        }
        Ok(())
    }
}

impl SerialLink for MockSerialLink {
    fn port(&self) -> &str {
        &self.port.info.port_name
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut inner = self.port.lock();
        self.check(&inner)?;
        if inner.fail_writes > 0 {
            inner.fail_writes -= 1;
            return Err(HardwareError::communication(
                self.port.info.port_name.clone(),
                "input/output error",
            ));
        }

        inner.partial.extend_from_slice(data);
        while let Some(pos) = inner.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = inner.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]).trim_end().to_string();
            let replies = match inner.responder.as_mut() {
                Some(responder) => responder(&line),
                None => Vec::new(),
            };
            inner.written.push(line);
            for reply in replies {
                MockPort::push_line(&mut inner, &reply);
            }
        }
        drop(inner);
        self.port.readable.notify_all();
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let inner = self.port.lock();
        self.check(&inner)?;

        let (mut inner, _) = self
            .port
            .readable
            .wait_timeout_while(inner, self.read_timeout, |inner| {
                inner.inbound.is_empty() && inner.connected
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.check(&inner)?;

        let n = buf.len().min(inner.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(inner.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn is_open(&self) -> bool {
        self.open && self.port.lock().connected
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let mut inner = self.port.lock();
            inner.open_links = inner.open_links.saturating_sub(1);
        }
    }
}

impl Drop for MockSerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Node side of a mock serial port.
#[derive(Clone)]
pub struct MockSerialHandle {
    port: Arc<MockPort>,
}

impl std::fmt::Debug for MockSerialHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSerialHandle")
            .field("port", &self.port.info.port_name)
            .finish()
    }
}

impl MockSerialHandle {
    pub fn port_name(&self) -> &str {
        &self.port.info.port_name
    }

    /// Queue a line for the host to read.
    pub fn push_line(&self, line: &str) {
        MockPort::push_line(&mut self.port.lock(), line);
        self.port.readable.notify_all();
    }

    /// Line the node announces each time the port is opened.
    pub fn set_hello(&self, hello: Option<String>) {
        self.port.lock().hello = hello;
    }

    /// Answer every complete line the host writes.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        self.port.lock().responder = Some(Box::new(responder));
    }

    /// Make subsequent opens fail as if the port were busy.
    pub fn set_fail_open(&self, fail: bool) {
        self.port.lock().fail_open = fail;
    }

    /// Fail the next `count` host writes with an I/O error. The port stays
    /// plugged and the link stays open.
    pub fn fail_next_writes(&self, count: usize) {
        self.port.lock().fail_writes = count;
    }

    /// Lines written by the host so far, terminators stripped.
    pub fn written_lines(&self) -> Vec<String> {
        self.port.lock().written.clone()
    }

    pub fn clear_written(&self) {
        self.port.lock().written.clear();
    }

    /// Number of times the port has been opened.
    pub fn open_count(&self) -> usize {
        self.port.opens.load(Ordering::SeqCst)
    }

    /// Whether a host link currently holds the port open.
    pub fn is_held_open(&self) -> bool {
        self.port.lock().open_links > 0
    }
}
