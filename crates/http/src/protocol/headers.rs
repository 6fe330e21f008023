//! Helpers for raw header blocks that don't go through `httparse`: chunked
//! trailers, multipart part headers and title-cased rendering.

use bytes::{BufMut, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::trace;

/// Title-cases a header name, `content-type` becomes `Content-Type`.
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.trim().chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

/// Writes a header name title-cased straight into the output buffer.
pub(crate) fn put_title_case(dst: &mut BytesMut, name: &[u8]) {
    let mut upper = true;
    for &b in name {
        dst.put_u8(if upper { b.to_ascii_uppercase() } else { b });
        upper = b == b'-';
    }
}

/// Splits a raw header block into `(Name, value)` pairs.
///
/// Names are title-cased and values trimmed. Lines that are not `name: value`
/// are skipped.
pub fn parse_header_lines(block: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(block);
    text.lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return None;
            }
            Some((title_case(name), value.trim().to_string()))
        })
        .collect()
}

/// Parses a raw header block (trailers, part headers) into a [`HeaderMap`].
///
/// Repeated names are kept as distinct values in their original order. Entries
/// that aren't valid header names or values are dropped.
pub fn parse_header_block(block: &[u8]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in parse_header_lines(block) {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => trace!(name = %name, "skip invalid header line"),
        }
    }
    headers
}

/// Reads a header as one value, joining repeated lines with `, `.
pub fn joined_value(headers: &HeaderMap, name: impl http::header::AsHeaderName) -> Option<String> {
    let mut values = headers.get_all(name).iter().peekable();
    values.peek()?;
    let parts: Vec<&str> = values.filter_map(|v| v.to_str().ok()).collect();
    Some(parts.join(", "))
}
