//! Node link message model.
//!
//! Every line on the wire is one JSON object whose `"t"` field names the
//! message kind. Requests flow host → node, replies node → host:
//!
//! | request     | reply           |
//! |-------------|-----------------|
//! | `hello_ack` | (none)          |
//! | `get_all`   | `all`           |
//! | `set_calib` | `set_calib_ack` |
//! | `set_mode`  | (none)          |
//! | `set_sim`   | (none)          |
//! | `hello`     | `hello`         |
//!
//! The node announces itself with an unsolicited `hello` after the port is
//! opened, and answers malformed requests with `error` or `unknown`.

use sensorhub_core::{CapabilityMap, Error, NodeMode, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity announced by a node.
///
/// The same shape is echoed back in `hello_ack`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeHello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<CapabilityMap>,
    #[serde(
        rename = "calibHash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub calib_hash: Option<String>,
    /// Protocol revision, only present when the host re-probes a node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<u32>,
}

impl NodeHello {
    /// Build the `hello` probe the host sends to ask a node to re-announce.
    pub fn probe() -> Self {
        Self {
            proto: Some(1),
            ..Self::default()
        }
    }
}

/// Full sensor report, the reply to `get_all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllReport {
    pub ph: f64,
    pub ec: f64,
    pub temp: f64,
    #[serde(default)]
    pub status: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Raw probe values, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    /// Node uptime in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

impl AllReport {
    /// Reported mode if it is one the host understands.
    pub fn mode(&self) -> Option<NodeMode> {
        self.mode.as_deref().and_then(|mode| mode.parse().ok())
    }
}

/// Simulation overrides for a node in debug mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ph: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp: Option<f64>,
}

/// A single node link message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum NodeMessage {
    Hello(NodeHello),
    HelloAck(NodeHello),
    GetAll,
    All(AllReport),
    SetCalib { version: u32, payload: Value },
    SetCalibAck,
    SetMode { mode: NodeMode },
    SetSim(SimOverrides),
    Error { msg: String },
    Unknown { msg: String },
}

impl NodeMessage {
    /// Wire name of this message kind, the value of its `"t"` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::HelloAck(_) => "hello_ack",
            Self::GetAll => "get_all",
            Self::All(_) => "all",
            Self::SetCalib { .. } => "set_calib",
            Self::SetCalibAck => "set_calib_ack",
            Self::SetMode { .. } => "set_mode",
            Self::SetSim(_) => "set_sim",
            Self::Error { .. } => "error",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Whether the node answers this request with a reply line.
    pub fn expects_response(&self) -> bool {
        matches!(self, Self::Hello(_) | Self::GetAll | Self::SetCalib { .. })
    }

    /// Reply kind a request is matched against, if it expects one.
    pub fn expected_reply(&self) -> Option<&'static str> {
        match self {
            Self::Hello(_) => Some("hello"),
            Self::GetAll => Some("all"),
            Self::SetCalib { .. } => Some("set_calib_ack"),
            _ => None,
        }
    }

    /// Serialize to a single JSON line without the terminator.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one line (terminator already stripped).
    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| Error::protocol(format!("malformed node line: {e}")))
    }
}
