//! Tokio codec for camera worker frames.
//!
//! `WorkerFrameCodec` turns a worker's standard output into a stream of
//! [`WorkerFrame`]s when wrapped in a `FramedRead`:
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use sensorhub_protocol::WorkerFrameCodec;
//! use tokio_util::codec::FramedRead;
//!
//! # async fn example(stdout: tokio::process::ChildStdout) {
//! let mut frames = FramedRead::new(stdout, WorkerFrameCodec::new());
//! while let Some(Ok(frame)) = frames.next().await {
//!     println!("{} bytes from {}", frame.payload.len(), frame.device_id);
//! }
//! # }
//! ```
//!
//! # End of Stream
//!
//! A worker signals that it has stopped producing by writing a frame with an
//! empty payload. The decoder reports that frame as an error, the same as a
//! corrupted header or a clean EOF in the middle of a frame, so a consumer
//! only has to treat any error as "the stream is over".
//!
//! # DoS Protection
//!
//! Declared body lengths above the configured maximum are rejected before any
//! bytes are buffered for them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sensorhub_core::constants::{FRAME_HEADER_LEN, MAX_FRAME_BODY};
use sensorhub_core::{Error, Result};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::{FrameHeader, WorkerFrame};

#[derive(Debug)]
pub struct WorkerFrameCodec {
    max_body_size: usize,
    header: Option<FrameHeader>,
}

impl WorkerFrameCodec {
    pub fn new() -> Self {
        Self {
            max_body_size: MAX_FRAME_BODY,
            header: None,
        }
    }

    /// Create a codec with a custom body size ceiling.
    pub fn with_max_body_size(max_body_size: usize) -> Self {
        Self {
            max_body_size,
            header: None,
        }
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }
}

impl Default for WorkerFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn utf8_field(bytes: Bytes, name: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::protocol(format!("frame {name} is not valid UTF-8")))
}

impl Decoder for WorkerFrameCodec {
    type Item = WorkerFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if src.len() < FRAME_HEADER_LEN {
                    src.reserve(FRAME_HEADER_LEN - src.len());
                    return Ok(None);
                }
                let header = FrameHeader::parse(&src[..FRAME_HEADER_LEN])?;
                if header.body_len() > self.max_body_size {
                    return Err(Error::FrameTooLarge {
                        size: header.body_len(),
                        max_size: self.max_body_size,
                    });
                }
                src.advance(FRAME_HEADER_LEN);
                self.header = Some(header);
                header
            }
        };

        let needed = header.remaining_len();
        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }
        self.header = None;

        src.advance(header.extra_header_len());
        let device_id = utf8_field(
            src.split_to(usize::from(header.device_id_len)).freeze(),
            "device id",
        )?;
        let mime = String::from_utf8_lossy(&src.split_to(usize::from(header.mime_len))).into_owned();
        let payload = src.split_to(header.payload_len as usize).freeze();

        if payload.is_empty() {
            debug!(device_id = %device_id, sequence = header.sequence, "Worker sent end-of-stream frame");
            return Err(Error::protocol("worker signalled end of stream"));
        }

        Ok(Some(WorkerFrame {
            sequence: header.sequence,
            timestamp_ms: header.timestamp_ms,
            device_id,
            mime,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.header.is_none() => Ok(None),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "worker stream ended mid-frame",
            ))),
        }
    }
}

impl Encoder<WorkerFrame> for WorkerFrameCodec {
    type Error = Error;

    fn encode(&mut self, item: WorkerFrame, dst: &mut BytesMut) -> Result<()> {
        let header = item.header()?;
        if header.body_len() > self.max_body_size {
            return Err(Error::FrameTooLarge {
                size: header.body_len(),
                max_size: self.max_body_size,
            });
        }
        dst.reserve(FRAME_HEADER_LEN + header.body_len());
        header.write(dst);
        dst.put_slice(item.device_id.as_bytes());
        dst.put_slice(item.mime.as_bytes());
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: WorkerFrame) -> BytesMut {
        let mut buf = BytesMut::new();
        WorkerFrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    fn jpeg(device: &str) -> WorkerFrame {
        WorkerFrame::new(device, "image/jpeg", Bytes::from_static(b"\xff\xd8\xff\xe0jpeg"))
    }

    #[test]
    fn test_codec_defaults() {
        assert_eq!(WorkerFrameCodec::default().max_body_size(), MAX_FRAME_BODY);
    }

    #[test]
    fn test_decode_complete_frame() {
        let mut buf = encoded(jpeg("cam-a").with_sequence(9).with_timestamp(42));
        let frame = WorkerFrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.device_id, "cam-a");
        assert_eq!(frame.mime, "image/jpeg");
        assert_eq!(frame.sequence, 9);
        assert_eq!(frame.timestamp_ms, 42);
        assert_eq!(&frame.payload[..], b"\xff\xd8\xff\xe0jpeg");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let full = encoded(jpeg("cam-a"));
        let mut codec = WorkerFrameCodec::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for byte in full.iter() {
            buf.put_u8(*byte);
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                decoded = Some(frame);
            }
        }
        assert_eq!(decoded.unwrap().device_id, "cam-a");
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut buf = encoded(jpeg("cam-a"));
        buf.extend_from_slice(&encoded(jpeg("cam-b")));
        let mut codec = WorkerFrameCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().device_id, "cam-a");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().device_id, "cam-b");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_extended_header_is_skipped() {
        let frame = jpeg("cam-a");
        let mut header = frame.header().unwrap();
        header.header_len = 40;
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        buf.put_slice(&[0xAA; 8]);
        buf.put_slice(b"cam-a");
        buf.put_slice(b"image/jpeg");
        buf.put_slice(&frame.payload);

        let decoded = WorkerFrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_empty_payload_ends_stream() {
        let mut buf = encoded(WorkerFrame::new("cam-a", "image/jpeg", Bytes::new()));
        assert!(matches!(
            WorkerFrameCodec::new().decode(&mut buf),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut buf = encoded(jpeg("cam-a"));
        let mut codec = WorkerFrameCodec::with_max_body_size(8);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::FrameTooLarge { max_size: 8, .. })
        ));
    }

    #[test]
    fn test_eof_mid_frame_is_error() {
        let full = encoded(jpeg("cam-a"));
        let mut buf = BytesMut::from(&full[..full.len() - 2]);
        assert!(matches!(
            WorkerFrameCodec::new().decode_eof(&mut buf),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_clean_eof() {
        let mut buf = BytesMut::new();
        assert!(WorkerFrameCodec::new().decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_non_jpeg_mime_still_decodes() {
        let mut buf = encoded(WorkerFrame::new("cam-a", "image/png", Bytes::from_static(b"png")));
        let frame = WorkerFrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.mime, "image/png");
    }

    #[test]
    fn test_invalid_utf8_mime_still_decodes() {
        let mut buf = encoded(jpeg("cam-a"));
        // Mime bytes start right after the 32-byte header and the device id.
        buf[32 + "cam-a".len()] = 0xFF;

        let frame = WorkerFrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.device_id, "cam-a");
        assert!(frame.mime.starts_with('\u{FFFD}'));
        assert_eq!(&frame.payload[..], b"\xff\xd8\xff\xe0jpeg");
    }
}
