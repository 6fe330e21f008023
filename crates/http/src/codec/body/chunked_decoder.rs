//! Decoder implementation for HTTP chunked transfer encoding.
//!
//! This module decodes bodies framed with chunked transfer coding as specified in
//! [RFC 7230 Section 4.1](https://tools.ietf.org/html/rfc7230#section-4.1).
//!
//! Unlike a plain body decoder, [`ChunkedDecoder`] reports the framing itself:
//! every chunk produces a [`ChunkEvent::Started`] event with its declared size,
//! extension and a 1-based counter, followed by [`ChunkEvent::Data`] events as the
//! bytes arrive. The terminal chunk is followed by the raw trailer block in
//! [`ChunkEvent::Done`].

use crate::ensure;
use crate::protocol::ParseError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;
use ChunkedState::*;

/// Maximum size of one chunk-size line, extension included
pub const MAX_CHUNK_LINE_BYTES: usize = 1024;

/// Maximum size of the trailer block
pub const MAX_TRAILER_BYTES: usize = 4 * 1024;

/// Events produced while decoding a chunked body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    /// A chunk-size line was parsed. The terminal chunk reports a size of 0.
    Started { size: u64, extension: String, index: usize },
    /// Chunk payload bytes, `remaining` is what is still owed for this chunk.
    Data { data: Bytes, remaining: u64, index: usize },
    /// The trailer block was read, the body is complete.
    Done { trailers: Bytes, chunks: usize },
}

impl ChunkEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, ChunkEvent::Done { .. })
    }
}

/// A decoder for handling HTTP chunked transfer encoding.
///
/// The decoder processes incoming bytes according to the chunked format:
/// - Each chunk starts with its size in hexadecimal and an optional `;extension`
/// - Followed by the chunk data and CRLF
/// - A zero-sized chunk is followed by trailer lines and a blank line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    remaining: u64,
    index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Read the chunk-size line
    SizeLine,
    /// Read chunk data
    Body,
    /// Read CRLF after chunk data
    BodyEnd,
    /// Read the trailer block after the terminal chunk
    Trailers,
    /// Final state after the trailer block
    Done,
    /// A framing error was reported, nothing more is decoded
    Failed,
}

impl ChunkedDecoder {
    /// Creates a new ChunkedDecoder, ready to read the size of the first chunk.
    pub fn new() -> Self {
        Self { state: SizeLine, remaining: 0, index: 1 }
    }

    pub fn is_done(&self) -> bool {
        self.state == Done
    }

    fn fail(&mut self, e: ParseError) -> ParseError {
        self.state = Failed;
        e
    }

    /// Parses `hex-digits [;extension]`, the line terminator already stripped.
    fn parse_size_line(line: &[u8]) -> Result<(u64, String), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::invalid_chunk("size line is not utf-8"))?;
        let (size, extension) = match line.split_once(';') {
            Some((size, extension)) => (size, extension.trim()),
            None => (line, ""),
        };

        let size = size.trim_matches(|c| c == ' ' || c == '\t');
        ensure!(
            !size.is_empty() && size.bytes().all(|b| b.is_ascii_hexdigit()),
            ParseError::invalid_chunk(format!("invalid chunk size '{size}'"))
        );
        let size = u64::from_str_radix(size, 16).map_err(|_| ParseError::invalid_chunk("chunk size overflow"))?;

        Ok((size, extension.to_string()))
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkedDecoder {
    type Item = ChunkEvent;
    type Error = ParseError;

    /// Decodes the next chunk event from the input buffer.
    ///
    /// # Returns
    /// - `Ok(Some(event))` when framing or payload was decoded
    /// - `Ok(None)` when more data is needed, or the body is already done
    /// - `Err(ParseError)` if the chunked encoding is invalid or a size cap is exceeded
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                SizeLine => {
                    let Some(lf) = src.iter().position(|&b| b == b'\n') else {
                        ensure!(src.len() <= MAX_CHUNK_LINE_BYTES, self.fail(ParseError::too_large_chunk_line(MAX_CHUNK_LINE_BYTES)));
                        return Ok(None);
                    };
                    ensure!(lf < MAX_CHUNK_LINE_BYTES, self.fail(ParseError::too_large_chunk_line(MAX_CHUNK_LINE_BYTES)));

                    let line = src.split_to(lf + 1);
                    let line = line.strip_suffix(b"\n").unwrap_or(&line);
                    let line = line.strip_suffix(b"\r").unwrap_or(line);

                    let (size, extension) = match Self::parse_size_line(line) {
                        Ok(parsed) => parsed,
                        Err(e) => return Err(self.fail(e)),
                    };

                    trace!(size, index = self.index, "read chunk size line");
                    self.remaining = size;
                    self.state = if size == 0 { Trailers } else { Body };
                    return Ok(Some(ChunkEvent::Started { size, extension, index: self.index }));
                }

                Body => {
                    if src.is_empty() {
                        return Ok(None);
                    }

                    // cap remaining bytes at the max capacity of usize
                    let remaining = usize::try_from(self.remaining).unwrap_or(usize::MAX);
                    let read_size = std::cmp::min(remaining, src.len());
                    let data = src.split_to(read_size).freeze();
                    self.remaining -= read_size as u64;

                    let index = self.index;
                    if self.remaining == 0 {
                        self.state = BodyEnd;
                    }
                    return Ok(Some(ChunkEvent::Data { data, remaining: self.remaining, index }));
                }

                BodyEnd => {
                    if src.starts_with(b"\r\n") {
                        src.advance(2);
                    } else if src.starts_with(b"\n") {
                        src.advance(1);
                    } else if src.is_empty() || &src[..] == b"\r" {
                        return Ok(None);
                    } else {
                        return Err(self.fail(ParseError::invalid_chunk("missing CRLF after chunk data")));
                    }
                    self.index += 1;
                    self.state = SizeLine;
                }

                Trailers => {
                    // an empty trailer section is just the blank line
                    let (start, end) = if src.starts_with(b"\r\n") {
                        (0, 2)
                    } else if src.starts_with(b"\n") {
                        (0, 1)
                    } else if let Some(found) = find_blank_line(src) {
                        found
                    } else {
                        ensure!(src.len() <= MAX_TRAILER_BYTES, self.fail(ParseError::too_large_trailers(MAX_TRAILER_BYTES)));
                        return Ok(None);
                    };
                    ensure!(start <= MAX_TRAILER_BYTES, self.fail(ParseError::too_large_trailers(MAX_TRAILER_BYTES)));

                    let trailers = src.split_to(start).freeze();
                    src.advance(end - start);
                    self.state = Done;
                    trace!(trailer_size = trailers.len(), chunks = self.index, "finished reading chunked data");
                    return Ok(Some(ChunkEvent::Done { trailers, chunks: self.index }));
                }

                Done | Failed => return Ok(None),
            }
        }
    }
}

/// Finds the end of a non-empty trailer block: a line ending followed by a blank line.
fn find_blank_line(buf: &[u8]) -> Option<(usize, usize)> {
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
