use crate::{Result, error::Error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque capability descriptor reported by a node in its `hello`.
pub type CapabilityMap = serde_json::Map<String, serde_json::Value>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Stable node identity, derived from the serial port path.
    NodeKey
);

string_id!(
    /// Identifier of an externally owned setup.
    SetupId
);

string_id!(
    /// Stable camera identity (USB port locator or internal fingerprint).
    CameraId
);

impl NodeKey {
    /// Derive the node key for a serial port path.
    pub fn from_port(port: &str) -> Self {
        Self(port.to_string())
    }
}

/// Operating mode reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Values come from the attached probes.
    Real,
    /// Values are synthesised by the firmware.
    Debug,
}

impl NodeMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "real" => Ok(Self::Real),
            "debug" => Ok(Self::Debug),
            other => Err(Error::InvalidCommand(format!("invalid mode: {other}"))),
        }
    }
}

/// Online/offline state of a node or camera record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Online,
    Offline,
}

/// A single pH/EC/temperature sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Host timestamp in milliseconds since the Unix epoch.
    pub ts: i64,
    pub ph: f64,
    pub ec: f64,
    pub temp: f64,
    pub status: Vec<String>,
    pub mode: Option<NodeMode>,
}

/// Node record as held by the external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_key: NodeKey,
    pub name: Option<String>,
    pub kind: String,
    pub fw: Option<String>,
    pub cap: Option<CapabilityMap>,
    pub calib_hash: Option<String>,
    pub mode: Option<NodeMode>,
    pub status: LinkStatus,
    pub last_error: Option<String>,
    pub last_seen_ms: Option<i64>,
}

/// Upsert request for a node record.
///
/// `None` in `name` or `mode` keeps whatever the store already holds.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpsert {
    pub node_key: NodeKey,
    pub name: Option<String>,
    pub fw: Option<String>,
    pub cap: Option<CapabilityMap>,
    pub calib_hash: Option<String>,
    pub mode: Option<NodeMode>,
    pub status: LinkStatus,
    pub last_error: Option<String>,
}

/// Calibration record for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub node_key: NodeKey,
    pub version: u32,
    pub calib_hash: String,
    pub payload: serde_json::Value,
}

/// Setup record binding a node and/or a camera with polling intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupRecord {
    pub setup_id: SetupId,
    pub name: Option<String>,
    pub node_id: Option<NodeKey>,
    pub camera_id: Option<CameraId>,
    /// Persistence cadence for readings; `None` uses the configured default,
    /// `<= 0` disables it.
    pub value_interval_minutes: Option<f64>,
    /// Still capture cadence; same conventions as `value_interval_minutes`.
    pub photo_interval_minutes: Option<f64>,
}

/// Camera record as held by the external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub camera_id: CameraId,
    pub port: String,
    pub alias: Option<String>,
    pub friendly_name: Option<String>,
    /// Device identifier passed to the capture worker.
    pub pnp_device_id: Option<String>,
    pub container_id: Option<String>,
    pub status: LinkStatus,
}

impl CameraRecord {
    /// Identifier used to address the capture worker for this camera.
    pub fn worker_device_id(&self) -> &str {
        self.pnp_device_id
            .as_deref()
            .unwrap_or_else(|| self.camera_id.as_str())
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
