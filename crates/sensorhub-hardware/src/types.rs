//! Common types shared across hardware implementations.

use sensorhub_core::config::SerialConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An enumerated serial port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// OS path of the port (e.g. `/dev/ttyACM0`, `COM3`).
    pub port_name: String,

    pub vid: Option<u16>,
    pub pid: Option<u16>,

    /// Product string reported by the USB descriptor.
    pub description: Option<String>,

    /// Hardware identifier in the `USB VID:PID=XXXX:XXXX SER=...` form.
    pub hwid: Option<String>,

    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
}

impl PortInfo {
    /// Create a port entry with only a name.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    /// Set the USB vendor and product ids, deriving `hwid` from them.
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self.hwid = Some(format!("USB VID:PID={vid:04X}:{pid:04X}"));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_hwid(mut self, hwid: impl Into<String>) -> Self {
        self.hwid = Some(hwid.into());
        self
    }

    /// Whether this port looks like a sensor node.
    ///
    /// A port matches on USB vendor id plus one of the product ids, or on any
    /// keyword appearing in its description or hwid (case-insensitive).
    pub fn matches_signature(&self, vid: u16, pids: &[u16], keywords: &[String]) -> bool {
        if let (Some(port_vid), Some(port_pid)) = (self.vid, self.pid)
            && port_vid == vid
            && pids.contains(&port_pid)
        {
            return true;
        }

        let haystack = format!(
            "{} {}",
            self.description.as_deref().unwrap_or_default(),
            self.hwid.as_deref().unwrap_or_default()
        )
        .to_lowercase();

        keywords
            .iter()
            .any(|keyword| !keyword.is_empty() && haystack.contains(&keyword.to_lowercase()))
    }
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                let mut hwid = format!("USB VID:PID={:04X}:{:04X}", usb.vid, usb.pid);
                if let Some(serial) = &usb.serial_number {
                    hwid.push_str(&format!(" SER={serial}"));
                }
                Self {
                    port_name: info.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    description: usb.product,
                    hwid: Some(hwid),
                    serial_number: usb.serial_number,
                    manufacturer: usb.manufacturer,
                }
            }
            serialport::SerialPortType::PciPort => Self {
                hwid: Some("PCI".to_string()),
                ..Self::new(info.port_name)
            },
            serialport::SerialPortType::BluetoothPort => Self {
                hwid: Some("BTHENUM".to_string()),
                ..Self::new(info.port_name)
            },
            serialport::SerialPortType::Unknown => Self::new(info.port_name),
        }
    }
}

/// Settings applied when opening a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,

    /// Upper bound on a single read before it reports "nothing yet".
    pub read_timeout: Duration,
}

impl SerialSettings {
    pub fn new(baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            baud_rate,
            read_timeout,
        }
    }
}

impl From<&SerialConfig> for SerialSettings {
    fn from(config: &SerialConfig) -> Self {
        Self::new(config.baud_rate, config.timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn keywords() -> Vec<String> {
        vec!["rp2040".to_string(), "2e8a".to_string()]
    }

    #[rstest]
    #[case(PortInfo::new("/dev/ttyACM0").with_usb_ids(0x2E8A, 0x0005), true)]
    #[case(PortInfo::new("/dev/ttyACM1").with_usb_ids(0x2E8A, 0x000A), true)]
    #[case(PortInfo::new("/dev/ttyUSB0").with_usb_ids(0x0403, 0x6001), false)]
    #[case(PortInfo::new("COM4").with_description("RP2040 CDC"), true)]
    #[case(PortInfo::new("COM5").with_hwid("USB\\VID_2E8A&PID_1234"), true)]
    #[case(PortInfo::new("/dev/ttyS0"), false)]
    fn test_matches_signature(#[case] port: PortInfo, #[case] expected: bool) {
        assert_eq!(
            port.matches_signature(0x2E8A, &[0x0005, 0x000A], &keywords()),
            expected
        );
    }

    #[test]
    fn test_other_pid_with_vendor_keyword_in_hwid() {
        // hwid carries "2E8A" so the keyword fallback still matches.
        let port = PortInfo::new("/dev/ttyACM2").with_usb_ids(0x2E8A, 0x0003);
        assert!(port.matches_signature(0x2E8A, &[0x0005], &keywords()));
        assert!(!port.matches_signature(0x2E8A, &[0x0005], &[]));
    }

    #[test]
    fn test_from_usb_port_info() {
        let info = serialport::SerialPortInfo {
            port_name: "/dev/ttyACM0".to_string(),
            port_type: serialport::SerialPortType::UsbPort(serialport::UsbPortInfo {
                vid: 0x2E8A,
                pid: 0x000A,
                serial_number: Some("E660".to_string()),
                manufacturer: Some("Raspberry Pi".to_string()),
                product: Some("Pico".to_string()),
            }),
        };
        let port = PortInfo::from(info);
        assert_eq!(port.vid, Some(0x2E8A));
        assert_eq!(port.hwid.as_deref(), Some("USB VID:PID=2E8A:000A SER=E660"));
        assert_eq!(port.description.as_deref(), Some("Pico"));
    }
}
