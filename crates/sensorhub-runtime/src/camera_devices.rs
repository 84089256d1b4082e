//! Camera enumeration through the capture worker's list mode.
//!
//! The worker prints a JSON list (or a single object) describing the video
//! devices it can open. Each entry is turned into a [`CameraRecord`] with a
//! camera id that survives re-plugging: the USB locator when one can be
//! extracted, otherwise a short fingerprint of the device identifier.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use sensorhub_core::config::CameraConfig;
use sensorhub_core::{CameraId, CameraRecord, LinkStatus, Result};
use sensorhub_hardware::WorkerLauncher;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::live::{BroadcastSink, CameraPayload, LiveMessage};
use crate::scheduler::{PollIntervals, run_periodic};
use crate::store::Store;

const INTEGRATED_KEYWORDS: [&str; 5] = ["integrated", "integrierte", "built-in", "builtin", "internal"];
const DISCOVERY_MIN_SLEEP: Duration = Duration::from_secs(1);

static USB_INSTANCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)USB\\VID_([0-9A-F]{4})&PID_([0-9A-F]{4})").ok());
static PORT_NUMBER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)Port_#(\d+)").ok());
static LOCATION_USB: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)USB\((\d+)\)").ok());

/// First non-empty value among `keys`, numbers rendered as text.
fn first_value(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match item.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Port locator such as `usb046d0825`, `usb3` or `usb0004` from a PnP
/// instance id or location path.
pub fn extract_usb_port(location: &str) -> Option<String> {
    if let Some(caps) = USB_INSTANCE.as_ref()?.captures(location) {
        return Some(format!(
            "usb{}{}",
            caps[1].to_lowercase(),
            caps[2].to_lowercase()
        ));
    }
    if let Some(caps) = PORT_NUMBER.as_ref()?.captures(location)
        && let Ok(port) = caps[1].parse::<u64>()
    {
        return Some(format!("usb{port}"));
    }
    LOCATION_USB
        .as_ref()?
        .captures_iter(location)
        .last()
        .map(|caps| format!("usb{}", &caps[1]))
}

pub fn is_integrated_camera(friendly_name: Option<&str>) -> bool {
    friendly_name.is_some_and(|name| {
        let name = name.to_lowercase();
        INTEGRATED_KEYWORDS.iter().any(|keyword| name.contains(keyword))
    })
}

/// `internal:<8 hex>` fingerprint of a device identifier.
pub fn internal_camera_id(key: &str) -> CameraId {
    let digest = Sha256::digest(key.as_bytes());
    let hex = hex::encode(digest);
    CameraId::new(format!("internal:{}", &hex[..8]))
}

/// Parse the worker's `--list` output into online camera records.
///
/// Entries without an identifier and duplicates are skipped.
pub fn parse_device_list(output: &str) -> Result<Vec<CameraRecord>> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(Vec::new());
    }
    let items = match serde_json::from_str::<Value>(output)? {
        Value::Array(items) => items,
        item @ Value::Object(_) => vec![item],
        _ => Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut cameras = Vec::new();
    for item in &items {
        let device_id = first_value(item, &["device_id", "deviceId"]);
        let instance_id = first_value(item, &["instance_id", "instanceId"]);
        let Some(key) = device_id.clone().or_else(|| instance_id.clone()) else {
            continue;
        };
        if !seen.insert(key.clone()) {
            continue;
        }

        let friendly_name = first_value(item, &["friendly_name", "friendlyName"]);
        let port = if is_integrated_camera(friendly_name.as_deref()) {
            None
        } else {
            first_value(item, &["port_id", "portId"])
                .as_deref()
                .and_then(extract_usb_port)
                .or_else(|| instance_id.as_deref().and_then(extract_usb_port))
        };

        let (camera_id, port, alias) = match port {
            Some(port) => {
                let alias = format!("Kamera {}", port.to_uppercase());
                (CameraId::new(port.clone()), port, alias)
            }
            None => {
                let camera_id = internal_camera_id(&key);
                let short = camera_id
                    .as_str()
                    .rsplit(':')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                (camera_id, String::new(), format!("Kamera INTERNAL {short}"))
            }
        };

        cameras.push(CameraRecord {
            camera_id,
            port,
            alias: Some(alias),
            friendly_name,
            pnp_device_id: Some(key),
            container_id: None,
            status: LinkStatus::Online,
        });
    }
    Ok(cameras)
}

/// Periodic camera enumeration.
pub struct CameraDiscovery<L> {
    launcher: Arc<L>,
    store: Arc<dyn Store>,
    list_timeout: Duration,
    last_payload: Mutex<Option<String>>,
}

impl<L> std::fmt::Debug for CameraDiscovery<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraDiscovery")
            .field("list_timeout", &self.list_timeout)
            .finish_non_exhaustive()
    }
}

impl<L: WorkerLauncher> CameraDiscovery<L> {
    pub fn new(launcher: Arc<L>, store: Arc<dyn Store>, config: &CameraConfig) -> Self {
        Self {
            launcher,
            store,
            list_timeout: config.list_timeout(),
            last_payload: Mutex::new(None),
        }
    }

    async fn list_devices(&self) -> Vec<CameraRecord> {
        let output = match tokio::time::timeout(self.list_timeout, self.launcher.list_devices()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(error = %e, "cameras.worker_failed");
                return Vec::new();
            }
            Err(_) => {
                warn!(timeout_ms = self.list_timeout.as_millis() as u64, "cameras.worker_timeout");
                return Vec::new();
            }
        };
        match parse_device_list(&output) {
            Ok(cameras) => cameras,
            Err(e) => {
                warn!(error = %e, "cameras.worker_bad_json");
                Vec::new()
            }
        }
    }

    /// Enumerate once, upsert what was found and mark the rest offline.
    pub async fn scan_once(&self) -> Result<Vec<CameraRecord>> {
        let cameras = self.list_devices().await;
        let usb = cameras.iter().filter(|c| !c.port.is_empty()).count();
        if cameras.is_empty() {
            debug!("cameras.scan_empty");
        } else {
            info!(
                total = cameras.len(),
                usb,
                internal = cameras.len() - usb,
                "cameras.scan_result"
            );
        }

        let mut online = HashSet::new();
        for camera in &cameras {
            online.insert(camera.camera_id.clone());
            self.store.upsert_camera(camera.clone())?;
        }
        self.store.mark_cameras_offline_except(&online)?;
        Ok(cameras)
    }

    /// Scan, then broadcast the camera list if it changed since the last
    /// broadcast.
    pub async fn scan_and_publish<S: BroadcastSink>(&self, sink: &S) -> Result<bool> {
        self.scan_once().await?;

        let devices: Vec<CameraPayload> = self
            .store
            .list_cameras()?
            .iter()
            .map(CameraPayload::from)
            .collect();
        let message = LiveMessage::CameraDevices { devices };
        let payload = serde_json::to_string(&message)?;

        let mut last = self.last_payload.lock().await;
        if last.as_deref() == Some(payload.as_str()) {
            return Ok(false);
        }
        sink.broadcast_all(&message).await;
        *last = Some(payload);
        Ok(true)
    }

    /// Forget the last broadcast so the next scan publishes again.
    pub async fn reset(&self) {
        *self.last_payload.lock().await = None;
    }

    pub async fn camera_discovery_loop<S: BroadcastSink>(
        self: Arc<Self>,
        sink: Arc<S>,
        intervals: Arc<PollIntervals>,
    ) {
        run_periodic(
            "camera_discovery",
            || intervals.camera_scan(),
            DISCOVERY_MIN_SLEEP,
            || {
                let discovery = Arc::clone(&self);
                let sink = Arc::clone(&sink);
                async move { discovery.scan_and_publish(&*sink).await.map(|_| ()) }
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r"USB\VID_046D&PID_0825\5&2A1B", Some("usb046d0825"))]
    #[case(r"usb\vid_2e8a&pid_000a&mi_00", Some("usb2e8a000a"))]
    #[case("Port_#0003.Hub_#0001", Some("usb3"))]
    #[case("PCIROOT(0)#PCI(1400)#USBROOT(0)#USB(2)#USB(4)", Some("usb4"))]
    #[case("PCIROOT(0)#PCI(1400)#USB(0004)", Some("usb0004"))]
    #[case("ACPI(_SB_)#ACPI(PCI0)", None)]
    fn test_extract_usb_port(#[case] location: &str, #[case] expected: Option<&str>) {
        assert_eq!(extract_usb_port(location).as_deref(), expected);
    }

    #[rstest]
    #[case(Some("Integrated Webcam"), true)]
    #[case(Some("Integrierte Kamera"), true)]
    #[case(Some("HD Built-in Camera"), true)]
    #[case(Some("Logitech C920"), false)]
    #[case(None, false)]
    fn test_integrated_detection(#[case] name: Option<&str>, #[case] expected: bool) {
        assert_eq!(is_integrated_camera(name), expected);
    }

    #[test]
    fn test_internal_id_is_stable() {
        let a = internal_camera_id("\\\\?\\usb#vid_0000");
        let b = internal_camera_id("\\\\?\\usb#vid_0000");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("internal:"));
        assert_eq!(a.as_str().len(), "internal:".len() + 8);
    }

    #[test]
    fn test_parse_list_mixed() {
        let output = r#"[
            {"deviceId": "dev-usb", "friendlyName": "Logitech C920",
             "instanceId": "USB\\VID_046D&PID_082D\\ABC"},
            {"device_id": "dev-port", "port_id": "Port_#0002.Hub_#0001"},
            {"deviceId": "dev-int", "friendlyName": "Integrated Camera",
             "instanceId": "USB\\VID_5986&PID_2113\\0"},
            {"deviceId": "dev-usb"},
            {"friendlyName": "no identifier"}
        ]"#;
        let cameras = parse_device_list(output).unwrap();
        assert_eq!(cameras.len(), 3);

        assert_eq!(cameras[0].camera_id.as_str(), "usb046d082d");
        assert_eq!(cameras[0].alias.as_deref(), Some("Kamera USB046D082D"));
        assert_eq!(cameras[0].pnp_device_id.as_deref(), Some("dev-usb"));

        assert_eq!(cameras[1].camera_id.as_str(), "usb2");
        assert_eq!(cameras[1].port, "usb2");

        assert!(cameras[2].camera_id.as_str().starts_with("internal:"));
        assert!(cameras[2].port.is_empty());
        assert!(
            cameras[2]
                .alias
                .as_deref()
                .unwrap()
                .starts_with("Kamera INTERNAL ")
        );
    }

    #[test]
    fn test_parse_single_object() {
        let cameras = parse_device_list(r#"{"instanceId": "USB\\VID_1234&PID_ABCD\\1"}"#).unwrap();
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].camera_id.as_str(), "usb1234abcd");
        assert_eq!(cameras[0].pnp_device_id.as_deref(), Some(r"USB\VID_1234&PID_ABCD\1"));
    }

    #[test]
    fn test_parse_empty_and_invalid() {
        assert!(parse_device_list("").unwrap().is_empty());
        assert!(parse_device_list("  \n").unwrap().is_empty());
        assert!(parse_device_list("not json").is_err());
    }
}
