//! HTTP response head encoder.
//!
//! Serializes the status line and header fields, and makes the framing headers
//! (`Content-Length` / `Transfer-Encoding`) agree with the [`PayloadSize`] the
//! body will be written with. Header names go out title-cased.

use crate::protocol::headers::put_title_case;
use crate::protocol::{PayloadSize, ResponseHead, SendError};

use bytes::{BufMut, BytesMut};

use http::{header, HeaderValue, StatusCode, Version};
use std::io;
use std::io::{ErrorKind, Write};
use tokio_util::codec::Encoder;
use tracing::error;

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Encoder for HTTP response heads implementing the [`Encoder`] trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    /// Encodes the response head into the provided bytes buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP version is neither HTTP/1.0 nor HTTP/1.1
    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, payload_size) = item;

        dst.reserve(INIT_HEADER_SIZE);
        let version = match head.version {
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_10 => "HTTP/1.0",
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(io::Error::from(ErrorKind::Unsupported).into());
            }
        };

        let reason = head.reason.as_deref().or_else(|| head.status.canonical_reason());
        match reason {
            Some(reason) if !reason.is_empty() => {
                write!(FastWrite(dst), "{} {} {}\r\n", version, head.status.as_str(), reason)?;
            }
            _ => write!(FastWrite(dst), "{} {}\r\n", version, head.status.as_str())?,
        }

        // Set appropriate content length or transfer encoding header
        let headers = &mut head.headers;
        match payload_size {
            PayloadSize::Length(n) => {
                headers.remove(header::TRANSFER_ENCODING);
                headers.insert(header::CONTENT_LENGTH, n.into());
            }
            PayloadSize::Chunked => {
                headers.remove(header::CONTENT_LENGTH);
                headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
            PayloadSize::Empty => {
                if allows_body(head.status) {
                    const ZERO_VALUE: HeaderValue = HeaderValue::from_static("0");
                    headers.insert(header::CONTENT_LENGTH, ZERO_VALUE);
                }
            }
            PayloadSize::Tunnel => {}
        }

        // Write all headers
        for (header_name, header_value) in headers.iter() {
            put_title_case(dst, header_name.as_str().as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// 1xx, 204 and 304 responses never carry a body, not even an empty one.
pub(crate) fn allows_body(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

/// Fast writer implementation for writing to BytesMut.
pub(crate) struct FastWrite<'a>(pub(crate) &'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
