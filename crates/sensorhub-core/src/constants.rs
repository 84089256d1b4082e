//! Protocol-level constants for the SensorHub device links.
//!
//! SensorHub speaks two fixed wire protocols:
//!
//! - **Node link**: newline-delimited UTF-8 JSON over a USB-CDC serial port,
//!   one object per line, dispatched on its `"t"` field.
//! - **Worker frames**: a little-endian binary stream written by the camera
//!   capture worker on its standard output.
//!
//! # Worker Frame Layout
//!
//! ```text
//! offset  size  field
//! 0       4     magic = "FRAM"
//! 4       2     version (1)
//! 6       2     header_len (32, excess is skipped)
//! 8       8     sequence
//! 16      8     timestamp (ms)
//! 24      2     device_id_len
//! 26      2     mime_len
//! 28      4     payload_len
//! 32      ...   device id, mime type, payload
//! ```
//!
//! Modifying these values breaks compatibility with deployed firmware and
//! worker binaries.

// ============================================================================
// Node Link Protocol
// ============================================================================

/// Line terminator for node link messages.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Maximum accepted length of a single node link line in bytes.
///
/// The firmware serializes replies into 512-byte documents; anything far
/// beyond that is line noise.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// USB vendor id of the RP2040 sensor node.
pub const NODE_USB_VID: u16 = 0x2E8A;

/// USB product ids the RP2040 enumerates with (CDC and CDC+reset).
pub const NODE_USB_PIDS: [u16; 2] = [0x0005, 0x000A];

/// Keywords matched against port description/hwid when VID/PID are missing.
pub const NODE_PORT_KEYWORDS: [&str; 2] = ["rp2040", "2e8a"];

// ============================================================================
// Worker Frame Protocol
// ============================================================================

/// Magic bytes opening every worker frame.
pub const FRAME_MAGIC: &[u8; 4] = b"FRAM";

/// The only supported worker frame version.
pub const FRAME_VERSION: u16 = 1;

/// Fixed header length of a worker frame in bytes.
pub const FRAME_HEADER_LEN: usize = 32;

/// Mime type the worker is expected to emit.
pub const FRAME_EXPECTED_MIME: &str = "image/jpeg";

/// Upper bound on a single frame body (device id + mime + payload).
///
/// A 4K JPEG stays well below this. A larger declared length means the
/// stream is desynchronised.
pub const MAX_FRAME_BODY: usize = 32 * 1024 * 1024;

/// Command-line flag naming the device a worker should stream.
pub const WORKER_DEVICE_FLAG: &str = "--device";

/// Command-line flag asking the worker to print its device list as JSON.
pub const WORKER_LIST_FLAG: &str = "--list";

// ============================================================================
// Scheduling
// ============================================================================

/// Floor applied to every periodic loop sleep.
pub const DEFAULT_MIN_LOOP_SLEEP_MS: u64 = 200;

/// Sleep applied by a live poll when its setup has disappeared.
pub const MISSING_SETUP_RETRY_MS: u64 = 2000;
