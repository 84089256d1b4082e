//! Serial backend on top of the `serialport` crate.

use std::io::{ErrorKind, Read, Write};

use tracing::{debug, warn};

use crate::error::{HardwareError, Result};
use crate::traits::{SerialBackend, SerialLink};
use crate::types::{PortInfo, SerialSettings};

/// The operating system's serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSerial;

impl SerialBackend for SystemSerial {
    type Link = SystemSerialLink;

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(serialport::available_ports()?
            .into_iter()
            .map(PortInfo::from)
            .collect())
    }

    fn open(&self, port: &str, settings: &SerialSettings) -> Result<Self::Link> {
        let mut builder =
            serialport::new(port, settings.baud_rate).timeout(settings.read_timeout);
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }

        let inner = builder
            .open()
            .map_err(|e| HardwareError::communication(port, e.to_string()))?;

        debug!(port = %port, baud = settings.baud_rate, "Serial port opened");

        Ok(SystemSerialLink {
            port: port.to_string(),
            inner: Some(inner),
        })
    }
}

/// An open OS serial port.
pub struct SystemSerialLink {
    port: String,
    inner: Option<Box<dyn serialport::SerialPort>>,
}

impl std::fmt::Debug for SystemSerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemSerialLink")
            .field("port", &self.port)
            .field("open", &self.inner.is_some())
            .finish()
    }
}

impl SystemSerialLink {
    fn inner(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.inner
            .as_mut()
            .ok_or_else(|| HardwareError::disconnected(self.port.clone()))
    }

    /// Map an I/O failure. The handle stays open; the caller's retry
    /// policy decides when the port is given up.
    fn io_failed(&self, err: std::io::Error) -> HardwareError {
        warn!(port = %self.port, error = %err, "Serial I/O failed");
        HardwareError::communication(self.port.clone(), err.to_string())
    }
}

impl SerialLink for SystemSerialLink {
    fn port(&self) -> &str {
        &self.port
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let inner = self.inner()?;
        let result = inner.write_all(data).and_then(|()| inner.flush());
        result.map_err(|e| self.io_failed(e))
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.inner()?.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(0)
            }
            Err(e) => Err(self.io_failed(e)),
        }
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            debug!(port = %self.port, "Serial port closed");
        }
    }
}
