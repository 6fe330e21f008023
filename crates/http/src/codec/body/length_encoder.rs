use crate::protocol::{PayloadItem, SendError};
use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::warn;

/// Passes a payload through unchanged, up to the declared `Content-Length`.
///
/// Bytes beyond the declared length are dropped. Ending the payload before the
/// length is reached is an error since the head already promised more bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    remaining: u64,
    eof: bool,
}

impl LengthEncoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length, eof: false }
    }

    pub fn is_finish(&self) -> bool {
        self.eof || self.remaining == 0
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(mut bytes) => {
                if self.remaining == 0 {
                    if bytes.has_remaining() {
                        warn!(extra = bytes.remaining(), "payload exceeds content-length, dropping the rest");
                    }
                    return Ok(());
                }

                while bytes.has_remaining() && self.remaining > 0 {
                    let chunk = bytes.chunk();
                    let len = std::cmp::min(chunk.len() as u64, self.remaining) as usize;
                    dst.extend_from_slice(&chunk[..len]);
                    bytes.advance(len);
                    self.remaining -= len as u64;
                }
                Ok(())
            }
            PayloadItem::Eof => {
                self.eof = true;
                if self.remaining > 0 {
                    return Err(SendError::invalid_body(format!("body ended {} bytes short of content-length", self.remaining)));
                }
                Ok(())
            }
        }
    }
}
