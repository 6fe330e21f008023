//! Byte-range responses over a seekable resource.
//!
//! A single range streams the byte span as is. Several ranges become a
//! `multipart/byteranges` body whose total length is known before the first byte
//! is read, so the response can carry a `Content-Length`.

use std::collections::VecDeque;
use std::io::{self, SeekFrom};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use http::{HeaderValue, StatusCode, header};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio_util::codec::Encoder;
use tracing::{debug, trace};

use crate::codec::multipart::{MultipartEncoder, MultipartItem};
use crate::codec::range::{RangeError, RangeSet};
use crate::protocol::{Body, Response};

/// Largest read issued against the resource at once
const READ_SIZE: u64 = 16 * 1024;

/// Content type of the parts when the resource has none.
const DEFAULT_PART_TYPE: &str = "text/plain";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Multipart framing rendered up front
    Literal(Bytes),
    /// Inclusive byte span of the resource
    Span { start: u64, end: u64 },
}

#[derive(Debug, Clone)]
pub struct ByteRangeSplicer {
    set: RangeSet,
    boundary: Option<String>,
    content_length: u64,
    segments: VecDeque<Segment>,
}

impl ByteRangeSplicer {
    /// Normalises `range` against a resource of `size` bytes and lays out the output.
    pub fn new(range: &str, size: u64, content_type: Option<&str>) -> Result<Self, RangeError> {
        let set = RangeSet::parse(range, size)?;

        if set.len() == 1 {
            let (start, end) = set.ranges()[0];
            let segments = VecDeque::from([Segment::Span { start, end }]);
            return Ok(Self { content_length: end + 1 - start, boundary: None, segments, set });
        }

        let mut encoder = MultipartEncoder::new();
        let content_type = content_type.unwrap_or(DEFAULT_PART_TYPE);

        let parts: Vec<(Vec<(String, String)>, (u64, u64))> = set
            .ranges()
            .iter()
            .map(|&range| {
                let headers = vec![
                    ("Content-Type".to_string(), content_type.to_string()),
                    ("Content-Range".to_string(), set.content_range(range)),
                ];
                (headers, range)
            })
            .collect();

        let content_length =
            encoder.body_size(parts.iter().map(|(headers, (start, end))| (&headers[..], end + 1 - start)));

        let mut segments = VecDeque::with_capacity(parts.len() * 2 + 1);
        for (headers, (start, end)) in parts {
            let mut framing = BytesMut::new();
            encoder.encode(MultipartItem::Part(headers), &mut framing).map_err(|_| RangeError::Malformed {
                header: range.to_string(),
            })?;
            segments.push_back(Segment::Literal(framing.freeze()));
            segments.push_back(Segment::Span { start, end });
        }

        let mut closing = BytesMut::new();
        encoder
            .encode(MultipartItem::Eof, &mut closing)
            .map_err(|_| RangeError::Malformed { header: range.to_string() })?;
        segments.push_back(Segment::Literal(closing.freeze()));

        debug!(ranges = set.len(), content_length, "prepared multipart byteranges body");
        Ok(Self { boundary: Some(encoder.boundary().to_string()), content_length, segments, set })
    }

    pub fn ranges(&self) -> &RangeSet {
        &self.set
    }

    pub fn is_multipart(&self) -> bool {
        self.boundary.is_some()
    }

    pub fn boundary(&self) -> Option<&str> {
        self.boundary.as_deref()
    }

    /// Exact number of bytes [`into_stream`](Self::into_stream) will produce.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// `Content-Range` of a single-range response.
    pub fn content_range(&self) -> Option<String> {
        if self.is_multipart() {
            return None;
        }
        self.set.ranges().first().map(|&range| self.set.content_range(range))
    }

    /// `Content-Type` of a multi-range response.
    pub fn content_type(&self) -> Option<String> {
        self.boundary.as_ref().map(|boundary| format!("multipart/byteranges; boundary={boundary}"))
    }

    /// Streams the selected bytes of `resource`, with multipart framing if needed.
    pub fn into_stream<R>(self, resource: R) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
    {
        futures::stream::try_unfold((resource, self.segments, true), |(mut resource, mut segments, mut seek)| async move {
            let Some(segment) = segments.pop_front() else {
                return Ok::<_, io::Error>(None);
            };

            match segment {
                Segment::Literal(bytes) => Ok(Some((bytes, (resource, segments, true)))),
                Segment::Span { start, end } => {
                    if seek {
                        resource.seek(SeekFrom::Start(start)).await?;
                        seek = false;
                    }

                    let remaining = end + 1 - start;
                    let want = std::cmp::min(remaining, READ_SIZE) as usize;
                    let mut buf = BytesMut::zeroed(want);
                    let n = resource.read(&mut buf).await?;
                    if n == 0 {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "resource ended inside a range"));
                    }
                    buf.truncate(n);
                    trace!(start, read = n, "read range bytes");

                    let next = start + n as u64;
                    if next <= end {
                        segments.push_front(Segment::Span { start: next, end });
                    } else {
                        seek = true;
                    }
                    Ok(Some((buf.freeze(), (resource, segments, seek))))
                }
            }
        })
    }

    /// Turns `response` into a 206 carrying the selected bytes of `resource`.
    pub fn apply<R>(self, response: &mut Response, resource: R)
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
    {
        response.set_status(StatusCode::PARTIAL_CONTENT);

        let headers = response.headers_mut();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.content_length));
        if let Some(content_type) = self.content_type().and_then(|v| HeaderValue::from_str(&v).ok()) {
            headers.insert(header::CONTENT_TYPE, content_type);
        }
        if let Some(content_range) = self.content_range().and_then(|v| HeaderValue::from_str(&v).ok()) {
            headers.insert(header::CONTENT_RANGE, content_range);
        }

        response.set_body(Body::stream(self.into_stream(resource)));
    }
}

/// Turns `response` into a 416 for a resource of `size` bytes.
pub fn range_not_satisfiable(response: &mut Response, size: u64, error: &RangeError) {
    debug!(cause = %error, "range not satisfiable");
    response.set_status(StatusCode::RANGE_NOT_SATISFIABLE);
    response.set_body(Body::Empty);

    let headers = response.headers_mut();
    headers.remove(header::CONTENT_LENGTH);
    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
        headers.insert(header::CONTENT_RANGE, value);
    }
}
