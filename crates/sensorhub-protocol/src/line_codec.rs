//! Newline-delimited JSON codec for the node link.
//!
//! `NodeLineCodec` implements [`Decoder`] and [`Encoder<NodeMessage>`] so it
//! can drive a `Framed` async stream, and it can also be called directly on a
//! `BytesMut` fed from a blocking serial read.
//!
//! A malformed line is consumed from the buffer before the error is
//! returned, so a caller that keeps decoding simply skips it.

use bytes::{Buf, BufMut, BytesMut};
use sensorhub_core::constants::{LINE_TERMINATOR, MAX_LINE_LENGTH};
use sensorhub_core::{Error, Result};
use tokio_util::codec::{Decoder, Encoder};

use crate::NodeMessage;

#[derive(Debug, Clone)]
pub struct NodeLineCodec {
    max_line_length: usize,
}

impl NodeLineCodec {
    pub fn new() -> Self {
        Self {
            max_line_length: MAX_LINE_LENGTH,
        }
    }

    /// Create a codec with a custom line length ceiling.
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self { max_line_length }
    }

    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }
}

impl Default for NodeLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NodeLineCodec {
    type Item = NodeMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == LINE_TERMINATOR) else {
                if src.len() > self.max_line_length {
                    let size = src.len();
                    src.clear();
                    return Err(Error::FrameTooLarge {
                        size,
                        max_size: self.max_line_length,
                    });
                }
                return Ok(None);
            };

            let line = src.split_to(pos + 1);
            let line = &line[..pos];
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if line.len() > self.max_line_length {
                return Err(Error::FrameTooLarge {
                    size: line.len(),
                    max_size: self.max_line_length,
                });
            }

            let text = String::from_utf8_lossy(line);
            if text.trim().is_empty() {
                continue;
            }

            return NodeMessage::from_line(&text).map(Some);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None => {
                // A final unterminated line is dropped; the node always
                // terminates its replies.
                src.advance(src.len());
                Ok(None)
            }
        }
    }
}

impl Encoder<NodeMessage> for NodeLineCodec {
    type Error = Error;

    fn encode(&mut self, item: NodeMessage, dst: &mut BytesMut) -> Result<()> {
        let line = item.to_line()?;
        if line.len() > self.max_line_length {
            return Err(Error::FrameTooLarge {
                size: line.len(),
                max_size: self.max_line_length,
            });
        }
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(LINE_TERMINATOR);
        Ok(())
    }
}
