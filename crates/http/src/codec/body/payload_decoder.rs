//! Decoder implementation for HTTP request payloads.
//!
//! This module provides a unified decoder for the body framings of a request:
//! - Content-Length based payloads
//! - Chunked transfer encoding, with the trailer block kept aside
//! - Messages with no body

use crate::codec::body::chunked_decoder::{ChunkEvent, ChunkedDecoder};
use crate::codec::body::length_decoder::LengthDecoder;
use crate::protocol::{ParseError, PayloadItem, PayloadSize};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// A unified decoder for handling HTTP message payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDecoder {
    /// The specific decoding strategy to use
    kind: Kind,
    /// Raw trailer block of a finished chunked body
    trailers: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    /// Decode payload with a fixed content length
    Length(LengthDecoder),

    /// Decode payload using chunked transfer encoding
    Chunked(ChunkedDecoder),

    /// Handle messages with no body
    NoBody,
}

impl PayloadDecoder {
    /// Creates a PayloadDecoder for messages with no body.
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody, trailers: None }
    }

    /// Creates a PayloadDecoder for chunked transfer encoding.
    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedDecoder::new()), trailers: None }
    }

    /// Creates a PayloadDecoder for a fixed-length payload.
    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthDecoder::new(size)), trailers: None }
    }

    /// Picks the decoder matching the framing declared by the request head.
    ///
    /// A tunnel has no framing, so it is not decoded at all.
    pub fn for_size(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(n) => Self::fix_length(n),
            PayloadSize::Chunked => Self::chunked(),
            PayloadSize::Empty | PayloadSize::Tunnel => Self::empty(),
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::NoBody)
    }

    pub fn is_fix_length(&self) -> bool {
        matches!(self.kind, Kind::Length(_))
    }

    /// Takes the raw trailer block once a chunked body is complete.
    pub fn take_trailers(&mut self) -> Option<Bytes> {
        self.trailers.take()
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    /// Decodes bytes from the input buffer using the appropriate strategy.
    ///
    /// Chunk framing events are folded away: only payload bytes and the final
    /// [`PayloadItem::Eof`] come out.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Length(length_decoder) => length_decoder.decode(src),
            Kind::Chunked(chunked_decoder) => loop {
                match chunked_decoder.decode(src)? {
                    Some(ChunkEvent::Started { .. }) => continue,
                    Some(ChunkEvent::Data { data, .. }) => return Ok(Some(PayloadItem::Chunk(data))),
                    Some(ChunkEvent::Done { trailers, .. }) => {
                        self.trailers = Some(trailers);
                        return Ok(Some(PayloadItem::Eof));
                    }
                    None => return Ok(None),
                }
            },
            Kind::NoBody => Ok(Some(PayloadItem::Eof)),
        }
    }
}
