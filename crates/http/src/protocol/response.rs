
use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version, header};
use tokio_util::codec::Decoder;

use crate::codec::ChunkEvent;
use crate::codec::ChunkedDecoder;
use crate::codec::ChunkedEncoder;
use crate::protocol::body::Body;
use crate::protocol::headers::{joined_value, parse_header_block, put_title_case};
use crate::protocol::ParseError;
use crate::utils::contains_token;

const MAX_HEADERS: usize = 64;

/// The part of a [`Response`] that goes through the head encoder.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    /// Overrides the canonical reason phrase
    pub reason: Option<String>,
    pub headers: HeaderMap,
    /// Trailers sent after a chunked body
    pub trailers: HeaderMap,
    /// A preconfigured chunked encoder, used when the body goes out chunked
    pub chunked: Option<ChunkedEncoder>,
}

impl ResponseHead {
    pub fn new(version: Version, status: StatusCode) -> Self {
        Self { version, status, reason: None, headers: HeaderMap::new(), trailers: HeaderMap::new(), chunked: None }
    }
}

/// An outgoing (or parsed) HTTP response.
///
/// Created by handlers, filters or the connection itself for synthesized error
/// responses. The connection renders it exactly once per request.
#[derive(Debug, Clone)]
pub struct Response {
    version: Version,
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    trailers: HeaderMap,
    body: Body,
    chunked: Option<ChunkedEncoder>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            body: Body::Empty,
            chunked: None,
        }
    }

    /// A `text/plain` response.
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response.body = Body::from(text.into());
        response
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// The reason phrase, the canonical one unless overridden.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref().or_else(|| self.status.canonical_reason())
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// A header as a single value, repeated lines joined with `, `.
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<String> {
        joined_value(&self.headers, name)
    }

    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    pub fn trailers_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    /// The chunked encoder the body goes out with, if it goes out chunked.
    ///
    /// Use it to set a minimum chunk size, chunk extensions or an observer that
    /// derives trailers from the streamed bytes.
    pub fn chunked_encoder_mut(&mut self) -> &mut ChunkedEncoder {
        self.chunked.get_or_insert_with(ChunkedEncoder::new)
    }

    /// Whether the response asks for the connection to be closed.
    pub fn is_close(&self) -> bool {
        self.headers.get_all(header::CONNECTION).iter().any(|v| contains_token(v.as_bytes(), "close"))
    }

    /// Whether the response switches protocols, a 101 with `Connection: upgrade`.
    pub fn is_upgrade(&self) -> bool {
        self.status == StatusCode::SWITCHING_PROTOCOLS
            && self.headers.get_all(header::CONNECTION).iter().any(|v| contains_token(v.as_bytes(), "upgrade"))
    }

    /// Splits off the head, leaving the body in place.
    pub fn head(&mut self) -> ResponseHead {
        ResponseHead {
            version: self.version,
            status: self.status,
            reason: self.reason.clone(),
            headers: self.headers.clone(),
            trailers: self.trailers.clone(),
            chunked: self.chunked.take(),
        }
    }

    /// Parses a raw trailer block into the response trailers.
    pub fn parse_trailers(&mut self, block: &[u8]) {
        for (name, value) in parse_header_block(block) {
            if let Some(name) = name {
                self.trailers.append(name, value);
            }
        }
    }

    /// Renders the status line and header block, terminator included.
    pub fn render_head(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(256);
        let version = if self.version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" };
        dst.put_slice(version.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.status.as_str().as_bytes());
        if let Some(reason) = self.reason().filter(|reason| !reason.is_empty()) {
            dst.put_u8(b' ');
            dst.put_slice(reason.as_bytes());
        }
        dst.put_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            put_title_case(&mut dst, name.as_str().as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        dst.freeze()
    }

    /// Renders the whole response, an in-memory body included.
    ///
    /// A streamed body can't be rendered without polling it, only the head is
    /// written for one.
    pub fn render(&self) -> Bytes {
        let head = self.render_head();
        match &self.body {
            Body::Full(bytes) => {
                let mut dst = BytesMut::with_capacity(head.len() + bytes.len());
                dst.put_slice(&head);
                dst.put_slice(bytes);
                dst.freeze()
            }
            _ => head,
        }
    }

    /// Parses a complete response: status line, headers and body.
    ///
    /// A chunked body is decoded and its trailers are parsed into
    /// [`trailers`](Self::trailers).
    pub fn parse(bytes: &[u8]) -> Result<Response, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        let head_len = match parsed.parse(bytes) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Err(ParseError::invalid_header("incomplete response head")),
            Err(httparse::Error::TooManyHeaders) => return Err(ParseError::too_many_headers(MAX_HEADERS)),
            Err(e) => return Err(ParseError::invalid_header(e)),
        };

        let status = parsed
            .code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| ParseError::invalid_header("invalid status code"))?;
        let mut response = Response::new(status);
        response.version = match parsed.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            v => return Err(ParseError::InvalidVersion(v)),
        };
        if let Some(reason) = parsed.reason.filter(|r| Some(*r) != status.canonical_reason() && !r.is_empty()) {
            response.reason = Some(reason.to_string());
        }
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(ParseError::invalid_header)?;
            let value = HeaderValue::from_bytes(h.value).map_err(ParseError::invalid_header)?;
            response.headers.append(name, value);
        }

        let body = &bytes[head_len..];
        let chunked = response
            .headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .any(|v| contains_token(v.as_bytes(), "chunked"));
        if !chunked {
            if !body.is_empty() {
                response.body = Body::Full(Bytes::copy_from_slice(body));
            }
            return Ok(response);
        }

        let mut decoder = ChunkedDecoder::new();
        let mut buffer = BytesMut::from(body);
        let mut data = BytesMut::new();
        while let Some(event) = decoder.decode(&mut buffer)? {
            match event {
                ChunkEvent::Data { data: bytes, .. } => data.put_slice(&bytes),
                ChunkEvent::Done { trailers, .. } => {
                    response.parse_trailers(&trailers);
                    break;
                }
                ChunkEvent::Started { .. } => {}
            }
        }
        if !decoder.is_done() {
            return Err(ParseError::invalid_chunk("chunked body ended early"));
        }
        response.body = Body::Full(data.freeze());
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_render() {
        let response = Response::text(StatusCode::NOT_FOUND, "missing")
            .with_header(header::CONTENT_LENGTH, HeaderValue::from_static("7"));
        let rendered = response.render();
        assert_eq!(
            &rendered[..],
            b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: 7\r\n\r\nmissing"
        );
    }

    #[test]
    fn test_custom_reason() {
        let mut response = Response::new(StatusCode::OK);
        response.set_reason("Fine");
        response.set_version(Version::HTTP_10);
        assert_eq!(&response.render_head()[..], b"HTTP/1.0 200 Fine\r\n\r\n");
    }

    #[test]
    fn test_parse_chunked_with_trailers() {
        let raw = indoc! {"
            HTTP/1.1 200 OK
            Transfer-Encoding: chunked
            X-Multi: a
            X-Multi: b

            3
            abc
            2
            de
            0
            X-Sum: 5

        "};
        let response = Response::parse(raw.as_bytes()).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.header("x-multi").as_deref(), Some("a, b"));
        assert_eq!(response.body().as_bytes().map(|b| &b[..]), Some(&b"abcde"[..]));
        assert_eq!(response.trailers()["x-sum"], "5");
    }

    #[test]
    fn test_parse_plain_body() {
        let response = Response::parse(b"HTTP/1.0 418 Short And Stout\r\nContent-Length: 2\r\n\r\nhi").unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(response.version(), Version::HTTP_10);
        assert_eq!(response.reason(), Some("Short And Stout"));
        assert_eq!(response.body().len(), Some(2));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Response::parse(b"HTTP/1.1 abc\r\n\r\n").is_err());
        assert!(Response::parse(b"HTTP/1.1 200 OK\r\n").is_err());
    }

    #[test]
    fn test_upgrade_and_close() {
        let response = Response::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        assert!(response.is_upgrade());
        assert!(!response.is_close());

        let response = Response::new(StatusCode::OK).with_header(header::CONNECTION, HeaderValue::from_static("close"));
        assert!(response.is_close());
    }
}
