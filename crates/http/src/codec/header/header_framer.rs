//! Header block framer.
//!
//! Finds the boundary between a header block and the data that follows it in a
//! growing buffer. The framer is reused for request heads and, nested inside the
//! multipart scanner, for part headers.
//!
//! # Limits
//!
//! - Maximum header block size: 4KiB (configurable through [`HeaderFramer::with_max_size`])
//!
//! # Behavior
//!
//! On every call the *whole* buffered input is searched for the first blank
//! line (`\r\n\r\n`, `\n\n` or a mix of both). The text before the terminator is
//! returned as the header block, the terminator is consumed, and any bytes after it
//! stay in the caller's buffer as the body prefix. The framer then stops framing
//! until [`HeaderFramer::reset`] is called.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::ParseError;

/// Maximum size in bytes allowed for one header block
pub const MAX_HEADER_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    /// Searching for the header terminator
    Accumulating,
    /// A header block has been emitted
    Framed,
    /// The size cap was exceeded
    Failed,
}

/// Decoder that cuts a header block off the front of a buffer.
#[derive(Debug, Clone)]
pub struct HeaderFramer {
    state: FramerState,
    max_size: usize,
}

impl HeaderFramer {
    pub fn new() -> Self {
        Self::with_max_size(MAX_HEADER_BYTES)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self { state: FramerState::Accumulating, max_size }
    }

    /// Makes the framer ready for a new header cycle.
    pub fn reset(&mut self) {
        self.state = FramerState::Accumulating;
    }

    pub fn is_framed(&self) -> bool {
        self.state == FramerState::Framed
    }

    pub fn is_failed(&self) -> bool {
        self.state == FramerState::Failed
    }

    fn fail(&mut self, current_size: usize) -> ParseError {
        self.state = FramerState::Failed;
        ParseError::too_large_header(current_size, self.max_size)
    }
}

impl Default for HeaderFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for HeaderFramer {
    type Item = Bytes;
    type Error = ParseError;

    /// # Returns
    ///
    /// - `Ok(Some(block))` once the terminator is found, the body prefix stays in `src`
    /// - `Ok(None)` when more data is needed, or the framer is framed/failed
    /// - `Err(ParseError::TooLargeHeader)` once the block exceeds the size cap
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.state != FramerState::Accumulating {
            return Ok(None);
        }

        match find_terminator(src) {
            Some((start, end)) => {
                if start > self.max_size {
                    return Err(self.fail(start));
                }

                let block = src.split_to(start).freeze();
                src.advance(end - start);
                self.state = FramerState::Framed;
                trace!(header_size = block.len(), body_prefix = src.len(), "framed header block");
                Ok(Some(block))
            }
            None => {
                let len = src.len();
                ensure!(len <= self.max_size, self.fail(len));
                Ok(None)
            }
        }
    }
}

/// Locates the first `\r?\n\r?\n` and returns its `(start, end)` offsets.
fn find_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    let mut from = 0;
    while let Some(offset) = buf[from..].iter().position(|&b| b == b'\n') {
        let lf = from + offset;
        let start = if lf > 0 && buf[lf - 1] == b'\r' { lf - 1 } else { lf };

        match buf.get(lf + 1) {
            Some(b'\n') => return Some((start, lf + 2)),
            Some(b'\r') if buf.get(lf + 2) == Some(&b'\n') => return Some((start, lf + 3)),
            _ => from = lf + 1,
        }
    }
    None
}
