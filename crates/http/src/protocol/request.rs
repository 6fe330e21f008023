use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use http::{Extensions, HeaderMap, HeaderName, HeaderValue, Method, Version, header};
use tracing::debug;

use crate::connection::ConnectionHandle;
use crate::protocol::body::{ReqBody, ReqBodySender, body_channel};
use crate::protocol::form::{Form, FormFile, parse_form};
use crate::protocol::headers::{joined_value, parse_header_block, put_title_case};
use crate::protocol::{ParseError, PayloadSize};
use crate::utils::contains_token;

const MAX_HEADERS: usize = 64;

/// How the connection delivers the request body to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyMode {
    /// Every chunk goes to the handler's `on_data` hook
    #[default]
    Callback,
    /// The body is collected in memory and available at `on_request`
    Buffer,
    /// The body is pushed into a [`ReqBody`] taken by the handler
    Stream,
}

/// An incoming HTTP request.
///
/// Created once the request head is framed. The body arrives later, in the way
/// the handler asked for through [`buffer_body`](Self::buffer_body) or
/// [`stream_body`](Self::stream_body) during its `on_headers` hook.
#[derive(Debug)]
pub struct Request {
    method: Method,
    version: Version,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
    headers: HeaderMap,
    trailers: HeaderMap,
    payload_size: PayloadSize,
    query_pairs: Vec<(String, String)>,
    form: Form,
    route_path: Option<String>,
    extensions: Extensions,
    body_mode: BodyMode,
    body: Option<Bytes>,
    body_sender: Option<ReqBodySender>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    connection: Option<ConnectionHandle>,
}

impl Request {
    /// A request built in code, e.g. for tests or outbound use.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query, fragment) = split_target(target);
        let query_pairs = parse_query(query.as_deref());
        Self {
            method,
            version: Version::HTTP_11,
            path,
            query,
            fragment,
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            payload_size: PayloadSize::Empty,
            query_pairs,
            form: Form::default(),
            route_path: None,
            extensions: Extensions::new(),
            body_mode: BodyMode::Callback,
            body: None,
            body_sender: None,
            local_addr: None,
            remote_addr: None,
            connection: None,
        }
    }

    /// Parses a framed head, the block before the blank line.
    pub fn from_head(block: &[u8]) -> Result<Request, ParseError> {
        let mut raw = BytesMut::with_capacity(block.len() + 4);
        raw.put_slice(block);
        raw.put_slice(b"\r\n\r\n");

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&raw) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Err(ParseError::invalid_header("incomplete request head")),
            Err(httparse::Error::TooManyHeaders) => return Err(ParseError::too_many_headers(MAX_HEADERS)),
            Err(httparse::Error::Version) => return Err(ParseError::InvalidVersion(None)),
            Err(httparse::Error::Token) if parsed.method.is_none() => return Err(ParseError::InvalidMethod),
            Err(e) => return Err(ParseError::invalid_header(e)),
        }

        let method = parsed
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or(ParseError::InvalidMethod)?;
        let target = parsed.path.filter(|p| !p.is_empty()).ok_or(ParseError::InvalidUri)?;

        let mut request = Request::new(method, target);
        request.version = match parsed.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            v => return Err(ParseError::InvalidVersion(v)),
        };
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(ParseError::invalid_header)?;
            let value = HeaderValue::from_bytes(h.value).map_err(ParseError::invalid_header)?;
            request.headers.append(name, value);
        }
        request.payload_size = request.framing()?;
        Ok(request)
    }

    /// Parses a complete request, head and in-memory body.
    pub fn parse(bytes: &[u8]) -> Result<Request, ParseError> {
        let (head, body) = match crate::utils::find_subslice(bytes, b"\r\n\r\n") {
            Some(pos) => (&bytes[..pos], &bytes[pos + 4..]),
            None => match crate::utils::find_subslice(bytes, b"\n\n") {
                Some(pos) => (&bytes[..pos], &bytes[pos + 2..]),
                None => (bytes, &[][..]),
            },
        };
        let mut request = Request::from_head(head)?;
        if !body.is_empty() {
            request.set_buffered_body(Bytes::copy_from_slice(body))?;
        }
        Ok(request)
    }

    /// Works out how the body is framed from the head.
    fn framing(&self) -> Result<PayloadSize, ParseError> {
        if self.is_upgrade() {
            return Ok(PayloadSize::Tunnel);
        }

        let chunked = self.headers.get_all(header::TRANSFER_ENCODING).iter().any(|v| contains_token(v.as_bytes(), "chunked"));
        if chunked {
            return Ok(PayloadSize::Chunked);
        }

        let mut length = None;
        for value in self.headers.get_all(header::CONTENT_LENGTH) {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| ParseError::invalid_content_length(format!("{value:?} is not a number")))?;
            if length.is_some_and(|l| l != parsed) {
                return Err(ParseError::invalid_content_length("conflicting values"));
            }
            length = Some(parsed);
        }

        Ok(match length {
            None | Some(0) => PayloadSize::Empty,
            Some(n) => PayloadSize::Length(n),
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// The normalised path, starting with exactly one `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// The decoded query parameters, in order.
    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query_pairs
    }

    /// First query parameter named `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Fields of a buffered form body.
    pub fn form(&self) -> &[(String, String)] {
        &self.form.fields
    }

    /// File parts of a buffered `multipart/form-data` body.
    pub fn files(&self) -> &[FormFile] {
        &self.form.files
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

    /// Parses a raw trailer block into the request trailers.
    pub fn parse_trailers(&mut self, block: &[u8]) {
        for (name, value) in parse_header_block(block) {
            if let Some(name) = name {
                self.trailers.append(name, value);
            }
        }
    }

    pub fn payload_size(&self) -> PayloadSize {
        self.payload_size
    }

    pub fn has_body(&self) -> bool {
        !self.payload_size.is_empty()
    }

    /// Whether the request asks for a protocol switch.
    pub fn is_upgrade(&self) -> bool {
        self.headers.contains_key(header::UPGRADE)
            && self.headers.get_all(header::CONNECTION).iter().any(|v| contains_token(v.as_bytes(), "upgrade"))
    }

    /// Whether the client wants the connection kept open after this exchange.
    pub fn is_keep_alive(&self) -> bool {
        let mut values = self.headers.get_all(header::CONNECTION).iter().peekable();
        if values.peek().is_none() {
            return self.version == Version::HTTP_11;
        }
        !values.any(|v| contains_token(v.as_bytes(), "close"))
    }

    /// The host the request was sent to, without port.
    ///
    /// Falls back to the local address of the connection when there is no `Host` header.
    pub fn host(&self) -> Option<String> {
        if let Some(host) = self.headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
            let host = if host.starts_with('[') {
                host.find(']').map_or(host, |end| &host[..=end])
            } else {
                host.split(':').next().unwrap_or(host)
            };
            return Some(host.to_string());
        }
        self.local_addr.map(|addr| addr.ip().to_string())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub(crate) fn set_addrs(&mut self, local_addr: Option<SocketAddr>, remote_addr: Option<SocketAddr>) {
        self.local_addr = local_addr;
        self.remote_addr = remote_addr;
    }

    /// The prefix of the route that matched, `None` when no route did.
    pub fn route_path(&self) -> Option<&str> {
        self.route_path.as_deref()
    }

    /// Records the matched route. Only the first call has an effect.
    pub(crate) fn set_route_path(&mut self, route_path: impl Into<String>) {
        if self.route_path.is_none() {
            self.route_path = Some(route_path.into());
        }
    }

    /// The path below the matched route prefix, `/` for an exact match.
    pub fn route_relative_path(&self) -> &str {
        let Some(route) = self.route_path.as_deref() else {
            return &self.path;
        };
        let rest = self.path.get(route.trim_end_matches('/').len()..).unwrap_or("");
        if rest.is_empty() { "/" } else { rest }
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// A handle to the connection the request came in on.
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub(crate) fn set_connection(&mut self, handle: ConnectionHandle) {
        self.connection = Some(handle);
    }

    /// Aborts the connection this request came in on.
    pub fn abort(&self) {
        if let Some(handle) = &self.connection {
            handle.close();
        }
    }

    pub fn body_mode(&self) -> BodyMode {
        self.body_mode
    }

    /// Asks for the body to be collected in memory before `on_request`.
    ///
    /// Upgrade requests never buffer, their body is a tunnel.
    pub fn buffer_body(&mut self) {
        if self.payload_size.is_tunnel() {
            debug!("upgrade request body can't be buffered");
            return;
        }
        self.body_mode = BodyMode::Buffer;
        self.body_sender = None;
    }

    /// Takes the body as a stream, backpressure included.
    pub fn stream_body(&mut self) -> ReqBody {
        let (sender, body) = body_channel(self.payload_size);
        self.body_mode = BodyMode::Stream;
        self.body_sender = Some(sender);
        body
    }

    pub(crate) fn take_body_sender(&mut self) -> Option<ReqBodySender> {
        self.body_sender.take()
    }

    /// The buffered body, once completely read.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Stores a completely read body and parses it if it is a form.
    pub fn set_buffered_body(&mut self, body: Bytes) -> Result<(), ParseError> {
        if let Some(content_type) = self.headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            if let Some(form) = parse_form(content_type, &body)? {
                self.form = form;
            }
        }
        self.body = Some(body);
        Ok(())
    }

    /// The request target as sent on the request line.
    pub fn target(&self) -> String {
        let mut target = self.path.clone();
        if let Some(query) = &self.query {
            target.push('?');
            target.push_str(query);
        }
        if let Some(fragment) = &self.fragment {
            target.push('#');
            target.push_str(fragment);
        }
        target
    }

    /// Renders the request line, headers and a buffered body.
    pub fn render(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(256);
        let version = if self.version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" };
        dst.put_slice(self.method.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.target().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(version.as_bytes());
        dst.put_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            put_title_case(&mut dst, name.as_str().as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        if let Some(body) = &self.body {
            dst.put_slice(body);
        }
        dst.freeze()
    }
}

/// Splits a request target into a normalised path, query and fragment.
///
/// Leading slashes collapse into one, and an absolute-form target loses its
/// scheme and authority.
fn split_target(target: &str) -> (String, Option<String>, Option<String>) {
    let target = match target.find("://") {
        Some(scheme_end) if !target[..scheme_end].contains('/') => {
            let rest = &target[scheme_end + 3..];
            rest.find(['/', '?', '#']).map_or("/", |pos| &rest[pos..])
        }
        _ => target,
    };

    let (rest, fragment) = match target.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment.to_string())),
        None => (target, None),
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (rest, None),
    };

    (format!("/{}", path.trim_start_matches('/')), query, fragment)
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return vec![];
    };
    serde_urlencoded::from_str(query).unwrap_or_else(|e| {
        debug!(cause = %e, "ignore malformed query string");
        vec![]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_from_head() {
        let head = indoc! {"
            GET //static//app.js?v=1&lang=en#top HTTP/1.1
            Host: example.com:8080
            Accept: text/html
            Accept: application/json"};
        let request = Request::from_head(head.as_bytes()).unwrap();

        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.version(), Version::HTTP_11);
        assert_eq!(request.path(), "/static//app.js");
        assert_eq!(request.query(), Some("v=1&lang=en"));
        assert_eq!(request.fragment(), Some("top"));
        assert_eq!(request.query_param("lang"), Some("en"));
        assert_eq!(request.header("accept").as_deref(), Some("text/html, application/json"));
        assert_eq!(request.host().as_deref(), Some("example.com"));
        assert_eq!(request.payload_size(), PayloadSize::Empty);
        assert!(request.is_keep_alive());
    }

    #[test]
    fn test_framing() {
        let request = Request::from_head(b"POST /a HTTP/1.1\r\nContent-Length: 12").unwrap();
        assert_eq!(request.payload_size(), PayloadSize::Length(12));

        let request = Request::from_head(b"POST /a HTTP/1.1\r\nTransfer-Encoding: gzip, chunked").unwrap();
        assert_eq!(request.payload_size(), PayloadSize::Chunked);

        let request = Request::from_head(b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket").unwrap();
        assert_eq!(request.payload_size(), PayloadSize::Tunnel);
        assert!(request.is_upgrade());

        let conflict = Request::from_head(b"POST /a HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2");
        assert!(matches!(conflict, Err(ParseError::InvalidContentLength { .. })));
        assert!(Request::from_head(b"POST /a HTTP/1.1\r\nContent-Length: -1").is_err());
    }

    #[test]
    fn test_bad_heads() {
        assert!(Request::from_head(b"GET /a HTTP/2.0").is_err());
        assert!(Request::from_head(b"GET /a").is_err());
        assert!(Request::from_head(b"G(T /a HTTP/1.1").is_err());
    }

    #[test]
    fn test_keep_alive_rules() {
        let request = Request::from_head(b"GET / HTTP/1.0").unwrap();
        assert!(!request.is_keep_alive());

        let request = Request::from_head(b"GET / HTTP/1.0\r\nConnection: keep-alive").unwrap();
        assert!(request.is_keep_alive());

        let request = Request::from_head(b"GET / HTTP/1.1\r\nConnection: close").unwrap();
        assert!(!request.is_keep_alive());
    }

    #[test]
    fn test_parse_form_body() {
        let raw = "POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 18\r\n\r\nuser=bob&pass=x%21";
        let request = Request::parse(raw.as_bytes()).unwrap();
        assert_eq!(request.form(), &[("user".to_string(), "bob".to_string()), ("pass".to_string(), "x!".to_string())]);
        assert_eq!(request.body().map(Bytes::len), Some(18));
    }

    #[test]
    fn test_render_round_trip() {
        let mut request = Request::new(Method::PUT, "/items/1?force=true");
        request.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        request.set_buffered_body(Bytes::from_static(b"data")).unwrap();

        let rendered = request.render();
        assert_eq!(&rendered[..], b"PUT /items/1?force=true HTTP/1.1\r\nContent-Type: text/plain\r\n\r\ndata");

        let parsed = Request::parse(&rendered).unwrap();
        assert_eq!(parsed.target(), "/items/1?force=true");
        assert_eq!(parsed.body().map(|b| &b[..]), Some(&b"data"[..]));
    }

    #[test]
    fn test_render_request_line() {
        let mut request = Request::new(Method::GET, "/docs?page=2#intro");
        request.set_version(Version::HTTP_10);
        assert_eq!(&request.render()[..], b"GET /docs?page=2#intro HTTP/1.0\r\n\r\n");
    }

    #[test]
    fn test_split_target() {
        assert_eq!(split_target(""), ("/".to_string(), None, None));
        assert_eq!(split_target("http://host:80/x?y"), ("/x".to_string(), Some("y".to_string()), None));
        assert_eq!(split_target("http://host"), ("/".to_string(), None, None));
        assert_eq!(split_target("///a#f"), ("/a".to_string(), None, Some("f".to_string())));
    }

    #[test]
    fn test_route_relative_path() {
        let mut request = Request::new(Method::GET, "/static/css/site.css");
        assert_eq!(request.route_relative_path(), "/static/css/site.css");

        request.set_route_path("/static/");
        request.set_route_path("/other");
        assert_eq!(request.route_path(), Some("/static/"));
        assert_eq!(request.route_relative_path(), "/css/site.css");
    }

    #[test]
    fn test_upgrade_never_buffers() {
        let mut request = Request::from_head(b"GET /ws HTTP/1.1\r\nConnection: upgrade\r\nUpgrade: echo").unwrap();
        request.buffer_body();
        assert_eq!(request.body_mode(), BodyMode::Callback);

        let _body = request.stream_body();
        assert_eq!(request.body_mode(), BodyMode::Stream);
        assert!(request.take_body_sender().is_some());
    }
}
