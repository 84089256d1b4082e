//! Wire protocols spoken by SensorHub devices.
//!
//! - [`NodeMessage`] / [`NodeLineCodec`]: newline-delimited JSON exchanged
//!   with serial sensor nodes.
//! - [`WorkerFrame`] / [`WorkerFrameCodec`]: the `FRAM` binary stream a
//!   camera capture worker writes on its standard output.

pub mod codec;
pub mod frame;
pub mod line_codec;
pub mod message;

pub use codec::WorkerFrameCodec;
pub use frame::{FrameHeader, WorkerFrame};
pub use line_codec::NodeLineCodec;
pub use message::{AllReport, NodeHello, NodeMessage, SimOverrides};
