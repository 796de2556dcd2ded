use bytes::{Bytes, BytesMut};
use memchr::memchr;
use std::io;
use tokio_util::codec::Decoder;

/// A frame produced by [`LineCodec`].
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// A newline-terminated line, terminator (and any `\r`) stripped.
    Complete(Bytes),
    /// Bytes left over at end of stream with no terminator.
    Truncated(usize),
}

/// Splits a byte stream on `\n` without UTF-8 decoding.
#[derive(Debug, Default)]
pub struct LineCodec {
    // Bytes of `src` already scanned without finding a newline.
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = Line;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(offset) = memchr(b'\n', &src[self.next_index..]) else {
            self.next_index = src.len();
            return Ok(None);
        };

        let newline = self.next_index + offset;
        self.next_index = 0;

        let mut line = src.split_to(newline + 1);
        line.truncate(newline);
        if line.last() == Some(&b'\r') {
            line.truncate(newline - 1);
        }
        Ok(Some(Line::Complete(line.freeze())))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        let dropped = buf.len();
        buf.clear();
        self.next_index = 0;
        Ok(Some(Line::Truncated(dropped)))
    }
}
