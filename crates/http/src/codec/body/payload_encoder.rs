use crate::codec::body::chunked_encoder::ChunkedEncoder;
use crate::codec::body::length_encoder::LengthEncoder;
use crate::protocol::{PayloadItem, PayloadSize, SendError};
use bytes::{Buf, BytesMut};

use tokio_util::codec::Encoder;

/// encode payload for response body
#[derive(Debug, Clone)]
pub struct PayloadEncoder {
    kind: Kind,
}

#[derive(Debug, Clone)]
enum Kind {
    /// content-length payload
    Length(LengthEncoder),

    /// transfer-encoding chunked payload
    Chunked(ChunkedEncoder),

    /// have no body with the response
    NoBody,

    /// raw bytes of an upgraded connection
    Tunnel { eof: bool },
}

impl PayloadEncoder {
    /// create an empty `PayloadEncoder`
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    /// create a chunked `PayloadEncoder`
    pub fn chunked() -> Self {
        Self::with_chunked(ChunkedEncoder::new())
    }

    /// create a chunked `PayloadEncoder` from a configured [`ChunkedEncoder`]
    pub fn with_chunked(encoder: ChunkedEncoder) -> Self {
        Self { kind: Kind::Chunked(encoder) }
    }

    /// create a fixed length `PayloadEncoder`
    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthEncoder::new(size)) }
    }

    /// create an unframed `PayloadEncoder` for an upgraded connection
    pub fn tunnel() -> Self {
        Self { kind: Kind::Tunnel { eof: false } }
    }

    pub fn for_size(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(n) => Self::fix_length(n),
            PayloadSize::Chunked => Self::chunked(),
            PayloadSize::Empty => Self::empty(),
            PayloadSize::Tunnel => Self::tunnel(),
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

    pub fn is_finish(&self) -> bool {
        match &self.kind {
            Kind::Length(encoder) => encoder.is_finish(),
            Kind::Chunked(encoder) => encoder.is_finish(),
            Kind::NoBody => true,
            Kind::Tunnel { eof } => *eof,
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &mut self.kind {
            Kind::Length(encoder) => encoder.encode(item, dst),
            Kind::Chunked(encoder) => encoder.encode(item, dst),
            Kind::NoBody => Ok(()),
            Kind::Tunnel { eof } => {
                match item {
                    PayloadItem::Chunk(mut bytes) => {
                        while bytes.has_remaining() {
                            let chunk = bytes.chunk();
                            let len = chunk.len();
                            dst.extend_from_slice(chunk);
                            bytes.advance(len);
                        }
                    }
                    PayloadItem::Eof => *eof = true,
                }
                Ok(())
            }
        }
    }
}
