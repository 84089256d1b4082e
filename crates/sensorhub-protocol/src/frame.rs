//! Camera worker frame model.
//!
//! See [`sensorhub_core::constants`] for the byte layout. All integers are
//! little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sensorhub_core::constants::{FRAME_HEADER_LEN, FRAME_MAGIC, FRAME_VERSION};
use sensorhub_core::{Error, Result};

/// Fixed-size header preceding every frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u16,
    pub header_len: u16,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub device_id_len: u16,
    pub mime_len: u16,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Parse a header from the first [`FRAME_HEADER_LEN`] bytes of `src`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on a bad magic, an unsupported version or
    /// a declared header length shorter than the fixed header.
    pub fn parse(src: &[u8]) -> Result<Self> {
        if src.len() < FRAME_HEADER_LEN {
            return Err(Error::protocol(format!(
                "short frame header: {} bytes",
                src.len()
            )));
        }
        if &src[..4] != FRAME_MAGIC {
            return Err(Error::protocol("bad frame magic"));
        }

        let mut buf = &src[4..FRAME_HEADER_LEN];
        let version = buf.get_u16_le();
        if version != FRAME_VERSION {
            return Err(Error::protocol(format!(
                "unsupported frame version {version}"
            )));
        }
        let header_len = buf.get_u16_le();
        if usize::from(header_len) < FRAME_HEADER_LEN {
            return Err(Error::protocol(format!(
                "frame header length {header_len} below {FRAME_HEADER_LEN}"
            )));
        }

        Ok(Self {
            version,
            header_len,
            sequence: buf.get_u64_le(),
            timestamp_ms: buf.get_u64_le(),
            device_id_len: buf.get_u16_le(),
            mime_len: buf.get_u16_le(),
            payload_len: buf.get_u32_le(),
        })
    }

    /// Bytes between the fixed header and the body that must be skipped.
    pub fn extra_header_len(&self) -> usize {
        usize::from(self.header_len) - FRAME_HEADER_LEN
    }

    /// Length of device id, mime type and payload together.
    pub fn body_len(&self) -> usize {
        usize::from(self.device_id_len) + usize::from(self.mime_len) + self.payload_len as usize
    }

    /// Total bytes on the wire after the fixed header.
    pub fn remaining_len(&self) -> usize {
        self.extra_header_len() + self.body_len()
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.reserve(FRAME_HEADER_LEN);
        dst.put_slice(FRAME_MAGIC);
        dst.put_u16_le(self.version);
        dst.put_u16_le(self.header_len);
        dst.put_u64_le(self.sequence);
        dst.put_u64_le(self.timestamp_ms);
        dst.put_u16_le(self.device_id_len);
        dst.put_u16_le(self.mime_len);
        dst.put_u32_le(self.payload_len);
    }
}

/// One decoded frame from a capture worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFrame {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub device_id: String,
    pub mime: String,
    pub payload: Bytes,
}

impl WorkerFrame {
    pub fn new(device_id: impl Into<String>, mime: impl Into<String>, payload: Bytes) -> Self {
        Self {
            sequence: 0,
            timestamp_ms: 0,
            device_id: device_id.into(),
            mime: mime.into(),
            payload,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Whether this is the zero-length payload a worker sends before exiting.
    pub fn is_end_marker(&self) -> bool {
        self.payload.is_empty()
    }

    /// Build the header describing this frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`] when a field overflows its length slot.
    pub fn header(&self) -> Result<FrameHeader> {
        let device_id_len = u16::try_from(self.device_id.len()).map_err(|_| Error::FrameTooLarge {
            size: self.device_id.len(),
            max_size: u16::MAX as usize,
        })?;
        let mime_len = u16::try_from(self.mime.len()).map_err(|_| Error::FrameTooLarge {
            size: self.mime.len(),
            max_size: u16::MAX as usize,
        })?;
        let payload_len = u32::try_from(self.payload.len()).map_err(|_| Error::FrameTooLarge {
            size: self.payload.len(),
            max_size: u32::MAX as usize,
        })?;

        Ok(FrameHeader {
            version: FRAME_VERSION,
            header_len: FRAME_HEADER_LEN as u16,
            sequence: self.sequence,
            timestamp_ms: self.timestamp_ms,
            device_id_len,
            mime_len,
            payload_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> FrameHeader {
        FrameHeader {
            version: 1,
            header_len: 32,
            sequence: 7,
            timestamp_ms: 1_700_000_000_000,
            device_id_len: 5,
            mime_len: 10,
            payload_len: 1024,
        }
    }

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        sample_header().write(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_LEN);
        assert_eq!(&buf[..4], b"FRAM");
        assert_eq!(&buf[4..6], &[1, 0]);
        assert_eq!(&buf[28..32], &1024u32.to_le_bytes());
        assert_eq!(FrameHeader::parse(&buf).unwrap(), sample_header());
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = BytesMut::new();
        sample_header().write(&mut buf);
        buf[0] = b'X';
        assert!(matches!(FrameHeader::parse(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut header = sample_header();
        header.version = 2;
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        assert!(matches!(FrameHeader::parse(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_header_len_below_fixed_size() {
        let mut header = sample_header();
        header.header_len = 16;
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        assert!(FrameHeader::parse(&buf).is_err());
    }

    #[test]
    fn test_extended_header() {
        let mut header = sample_header();
        header.header_len = 40;
        assert_eq!(header.extra_header_len(), 8);
        assert_eq!(header.body_len(), 5 + 10 + 1024);
        assert_eq!(header.remaining_len(), 8 + 5 + 10 + 1024);
    }

    #[test]
    fn test_frame_header_from_frame() {
        let frame = WorkerFrame::new("cam-a", "image/jpeg", Bytes::from_static(b"\xff\xd8"))
            .with_sequence(3);
        let header = frame.header().unwrap();
        assert_eq!(header.device_id_len, 5);
        assert_eq!(header.mime_len, 10);
        assert_eq!(header.payload_len, 2);
        assert_eq!(header.sequence, 3);
        assert!(!frame.is_end_marker());
    }
}
