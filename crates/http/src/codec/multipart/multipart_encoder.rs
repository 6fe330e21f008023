//! Multipart body encoder.
//!
//! Renders `--boundary` delimited parts with title-cased part headers and the
//! closing `--boundary--`. The rendered size of a body can be computed up front
//! with [`MultipartEncoder::body_size`] when every part's size is known, which is
//! what makes `Content-Length` possible for `multipart/byteranges` responses.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Encoder;
use uuid::Uuid;

use crate::protocol::SendError;
use crate::protocol::headers::title_case;
use crate::utils::find_subslice;

/// Items accepted by the [`MultipartEncoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartItem {
    /// Starts a new part with the given headers
    Part(Vec<(String, String)>),
    /// Content of the current part
    Data(Bytes),
    /// Closes the body
    Eof,
}

#[derive(Debug, Clone)]
pub struct MultipartEncoder {
    boundary: String,
    parts: usize,
    /// Tail of the previous data write, to catch a boundary split across writes
    tail: Vec<u8>,
    eof: bool,
}

impl MultipartEncoder {
    /// Creates an encoder with a generated `------<uuid>` boundary.
    pub fn new() -> Self {
        Self::with_boundary(generate_boundary())
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self { boundary: boundary.into(), parts: 0, tail: Vec::new(), eof: false }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn is_finish(&self) -> bool {
        self.eof
    }

    /// Rendered size of one part: delimiter line, headers, blank line, data and
    /// the line break in front of the next delimiter.
    pub fn part_size(&self, headers: &[(String, String)], size: u64) -> u64 {
        let boundary = self.boundary.len() as u64;
        let headers: u64 = headers.iter().map(|(name, value)| header_line(name, value).len() as u64 + 2).sum();
        boundary + 4 + headers + 2 + size + 2
    }

    /// Total rendered size of a body made of the given `(headers, size)` parts.
    pub fn body_size<'a, I>(&self, parts: I) -> u64
    where
        I: IntoIterator<Item = (&'a [(String, String)], u64)>,
    {
        let closing = self.boundary.len() as u64 + 4;
        parts.into_iter().map(|(headers, size)| self.part_size(headers, size)).sum::<u64>() + closing
    }
}

impl Default for MultipartEncoder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn generate_boundary() -> String {
    format!("------{}", Uuid::new_v4().simple())
}

fn header_line(name: &str, value: &str) -> String {
    format!("{}: {}", title_case(name), value.trim())
}

impl Encoder<MultipartItem> for MultipartEncoder {
    type Error = SendError;

    fn encode(&mut self, item: MultipartItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Ok(());
        }

        match item {
            MultipartItem::Part(headers) => {
                if self.parts > 0 {
                    dst.put_slice(b"\r\n");
                }
                dst.put_slice(b"--");
                dst.put_slice(self.boundary.as_bytes());
                dst.put_slice(b"\r\n");
                for (name, value) in &headers {
                    dst.put_slice(header_line(name, value).as_bytes());
                    dst.put_slice(b"\r\n");
                }
                dst.put_slice(b"\r\n");

                self.parts += 1;
                self.tail.clear();
                Ok(())
            }
            MultipartItem::Data(data) => {
                let marker_len = self.boundary.len() + 2;
                let mut window = std::mem::take(&mut self.tail);
                window.extend_from_slice(&data);

                let mut marker = Vec::with_capacity(marker_len);
                marker.extend_from_slice(b"--");
                marker.extend_from_slice(self.boundary.as_bytes());
                if find_subslice(&window, &marker).is_some() {
                    return Err(SendError::invalid_body("multipart boundary found in part data"));
                }

                let keep = std::cmp::min(window.len(), marker_len - 1);
                self.tail = window.split_off(window.len() - keep);

                dst.put_slice(&data);
                Ok(())
            }
            MultipartItem::Eof => {
                self.eof = true;
                dst.put_slice(b"\r\n--");
                dst.put_slice(self.boundary.as_bytes());
                dst.put_slice(b"--");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::multipart::{MultipartEvent, MultipartScanner};
    use tokio_util::codec::Decoder;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_render_and_size() {
        let mut encoder = MultipartEncoder::with_boundary("XYZ");
        let first = headers(&[("content-type", "text/plain"), ("content-range", "bytes 0-2/10")]);
        let second = headers(&[("content-type", "text/plain")]);

        let mut dst = BytesMut::new();
        encoder.encode(MultipartItem::Part(first.clone()), &mut dst).unwrap();
        encoder.encode(MultipartItem::Data(Bytes::from_static(b"abc")), &mut dst).unwrap();
        encoder.encode(MultipartItem::Part(second.clone()), &mut dst).unwrap();
        encoder.encode(MultipartItem::Data(Bytes::from_static(b"hi")), &mut dst).unwrap();
        encoder.encode(MultipartItem::Eof, &mut dst).unwrap();

        assert_eq!(
            &dst[..],
            &b"--XYZ\r\nContent-Type: text/plain\r\nContent-Range: bytes 0-2/10\r\n\r\nabc\r\n\
               --XYZ\r\nContent-Type: text/plain\r\n\r\nhi\r\n--XYZ--"[..]
        );
        let size = encoder.body_size([(&first[..], 3), (&second[..], 2)]);
        assert_eq!(size, dst.len() as u64);
    }

    #[test]
    fn test_generated_boundary() {
        let encoder = MultipartEncoder::new();
        assert!(encoder.boundary().starts_with("------"));
        assert_eq!(encoder.boundary().len(), 6 + 32);
    }

    #[test]
    fn test_boundary_in_data() {
        let mut encoder = MultipartEncoder::with_boundary("XYZ");
        let mut dst = BytesMut::new();
        encoder.encode(MultipartItem::Part(vec![]), &mut dst).unwrap();
        encoder.encode(MultipartItem::Data(Bytes::from_static(b"data --X")), &mut dst).unwrap();
        assert!(encoder.encode(MultipartItem::Data(Bytes::from_static(b"YZ more")), &mut dst).is_err());
    }

    #[test]
    fn test_scanner_reads_encoder_output() {
        let mut encoder = MultipartEncoder::new();
        let mut dst = BytesMut::from(&b"ignored preamble\r\n"[..]);
        encoder.encode(MultipartItem::Part(headers(&[("x-name", "one")])), &mut dst).unwrap();
        encoder.encode(MultipartItem::Data(Bytes::from_static(b"1\r\n2")), &mut dst).unwrap();
        encoder.encode(MultipartItem::Eof, &mut dst).unwrap();

        let mut scanner = MultipartScanner::new(encoder.boundary());
        let mut events = vec![];
        while let Some(event) = scanner.decode(&mut dst).unwrap() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                MultipartEvent::Preamble(Bytes::from_static(b"ignored preamble")),
                MultipartEvent::Part { headers: headers(&[("X-Name", "one")]), index: 1 },
                MultipartEvent::Data { data: Bytes::from_static(b"1\r\n2"), index: 1 },
                MultipartEvent::Done,
            ]
        );
    }
}
