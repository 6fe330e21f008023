//! HTTP response encoder
//!
//! Writes the response head through [`HeaderEncoder`], then frames every payload
//! item with the [`PayloadEncoder`] picked from the head's [`PayloadSize`].

use crate::codec::body::PayloadEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, PayloadSize, ResponseHead, SendError};
use bytes::{Buf, BytesMut};
use std::io;
use std::io::ErrorKind;
use tokio_util::codec::Encoder;
use tracing::{error, warn};

#[derive(Debug, Default)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Forgets the payload framing of the current response, e.g. after the head of
    /// a response to `HEAD` was written.
    pub fn reset(&mut self) {
        self.payload_encoder = None;
    }

    /// Whether the current response body was completely written.
    pub fn is_finish(&self) -> bool {
        self.payload_encoder.as_ref().is_none_or(|encoder| encoder.is_finish())
    }
}

impl<D: Buf> Encoder<Message<(ResponseHead, PayloadSize), D>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(ResponseHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((mut head, payload_size)) => {
                if self.payload_encoder.take().is_some_and(|encoder| !encoder.is_finish()) {
                    warn!("previous response body was not finished, replacing its encoder");
                }

                let payload_encoder = match payload_size {
                    PayloadSize::Chunked => {
                        let mut encoder = head.chunked.take().unwrap_or_default();
                        encoder.append_trailers(&head.trailers);
                        PayloadEncoder::with_chunked(encoder)
                    }
                    size => PayloadEncoder::for_size(size),
                };
                self.payload_encoder = Some(payload_encoder);
                self.header_encoder.encode((head, payload_size), dst)
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    // a fixed length body is finished before its end marker arrives
                    if payload_item.is_eof() {
                        return Ok(());
                    }
                    error!("expect response header but receive payload item");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                };

                let result = payload_encoder.encode(payload_item, dst);
                if payload_encoder.is_finish() {
                    self.payload_encoder.take();
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PayloadItem;
    use bytes::Bytes;
    use http::{HeaderName, HeaderValue, StatusCode, Version};

    #[test]
    fn test_chunked_response_with_trailers() {
        let mut encoder = ResponseEncoder::new();
        let mut head = ResponseHead::new(Version::HTTP_11, StatusCode::OK);
        head.trailers.insert(HeaderName::from_static("x-checksum"), HeaderValue::from_static("abc"));

        let mut dst = BytesMut::new();
        encoder.encode(Message::<_, Bytes>::Header((head, PayloadSize::Chunked)), &mut dst).unwrap();
        encoder.encode(Message::Payload(PayloadItem::Chunk(Bytes::from_static(b"hi"))), &mut dst).unwrap();
        encoder.encode(Message::<_, Bytes>::Payload(PayloadItem::Eof), &mut dst).unwrap();

        assert_eq!(
            &dst[..],
            &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\nX-Checksum: abc\r\n\r\n"[..]
        );
        assert!(encoder.is_finish());
    }

    #[test]
    fn test_payload_without_head() {
        let mut encoder = ResponseEncoder::new();
        let chunk = PayloadItem::Chunk(Bytes::from_static(b"orphan"));
        let result = encoder.encode(Message::<(ResponseHead, PayloadSize), Bytes>::Payload(chunk), &mut BytesMut::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_reset_after_head_only() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();
        let head = ResponseHead::new(Version::HTTP_11, StatusCode::OK);
        encoder.encode(Message::<_, Bytes>::Header((head, PayloadSize::Length(10))), &mut dst).unwrap();
        assert!(!encoder.is_finish());

        encoder.reset();
        assert!(encoder.is_finish());
    }
}
