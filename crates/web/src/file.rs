//! Static file responses.
//!
//! Files are opened and streamed on a spawned task, the handler answers with a
//! [`Deferred`] that resolves once the response head is known.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use http::header::{self, HeaderValue};
use http::StatusCode;
use hopper_http::codec::range::{ByteRangeSplicer, range_not_satisfiable};
use hopper_http::handler::{Handler, RouteOutcome};
use hopper_http::protocol::{Body, Deferred, Request, Response};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::content_type::content_type_for;

/// `Last-Modified` format, always in GMT
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Serves one file, whatever the request path.
#[derive(Debug, Clone)]
pub struct FileHandler {
    path: PathBuf,
    ranges: bool,
}

impl FileHandler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ranges: false }
    }

    /// Answers `Range` requests with partial content.
    pub fn with_ranges(mut self, ranges: bool) -> Self {
        self.ranges = ranges;
        self
    }
}

impl Handler for FileHandler {
    fn on_request(&self, req: &mut Request) -> RouteOutcome {
        serve_file(self.path.clone(), req, self.ranges)
    }
}

/// The request headers a file response depends on.
#[derive(Debug, Default)]
pub(crate) struct Conditions {
    range: Option<String>,
    if_range: Option<DateTime<Utc>>,
    if_modified_since: Option<DateTime<Utc>>,
    if_unmodified_since: Option<DateTime<Utc>>,
}

impl Conditions {
    pub(crate) fn of(req: &Request, ranges: bool) -> Self {
        let date = |name: header::HeaderName| req.header(name).as_deref().and_then(parse_http_date);
        let mut conditions = Conditions { if_modified_since: date(header::IF_MODIFIED_SINCE), ..Default::default() };
        if ranges {
            conditions.range = req.header(header::RANGE);
            conditions.if_range = date(header::IF_RANGE);
            conditions.if_unmodified_since = date(header::IF_UNMODIFIED_SINCE);
        }
        conditions
    }
}

/// Answers `req` with the file at `path`, later.
pub(crate) fn serve_file(path: PathBuf, req: &Request, ranges: bool) -> RouteOutcome {
    let conditions = Conditions::of(req, ranges);
    defer(async move { respond_file(&path, &conditions, ranges).await })
}

/// Runs `response` on its own task and answers with its result once ready.
pub(crate) fn defer<F>(response: F) -> RouteOutcome
where
    F: Future<Output = Response> + Send + 'static,
{
    let deferred = Deferred::<RouteOutcome>::new();
    let resolver = deferred.clone();

    tokio::spawn(async move {
        let response = response.await;
        if !resolver.resolve(response.into()) {
            debug!("file response no longer wanted");
        }
    });

    deferred.into()
}

/// The response for the file at `path`, errors included.
pub(crate) async fn respond_file(path: &Path, conditions: &Conditions, ranges: bool) -> Response {
    match file_response(path, conditions, ranges).await {
        Ok(response) => response,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Response::new(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(path = %path.display(), cause = %e, "can't read file");
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn file_response(path: &Path, conditions: &Conditions, ranges: bool) -> io::Result<Response> {
    let file = File::open(path).await?;
    let metadata = file.metadata().await?;
    if !metadata.is_file() {
        return Ok(Response::new(StatusCode::NOT_FOUND));
    }
    let modified = metadata.modified().ok().map(to_seconds);

    if let (Some(modified), Some(since)) = (modified, conditions.if_modified_since) {
        if modified <= since {
            return Ok(Response::new(StatusCode::NOT_MODIFIED));
        }
    }
    if let (Some(modified), Some(since)) = (modified, conditions.if_unmodified_since) {
        if modified > since {
            return Ok(Response::new(StatusCode::PRECONDITION_FAILED));
        }
    }

    let content_type = content_type_for(path);
    let mut response = Response::new(StatusCode::OK);
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(content_type.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(value) = modified.and_then(|m| HeaderValue::from_str(&format_http_date(m)).ok()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if ranges {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }

    let size = metadata.len();
    // a stale If-Range date asks for the whole file
    let fresh = match conditions.if_range {
        Some(if_range) => modified.is_some_and(|m| m <= if_range),
        None => true,
    };
    match conditions.range.as_deref().filter(|_| fresh) {
        Some(range) => match ByteRangeSplicer::new(range, size, Some(content_type.as_ref())) {
            Ok(splicer) => splicer.apply(&mut response, file),
            Err(e) => range_not_satisfiable(&mut response, size, &e),
        },
        None => {
            response.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response.set_body(Body::stream(ReaderStream::new(file)));
        }
    }
    Ok(response)
}

fn to_seconds(time: SystemTime) -> DateTime<Utc> {
    let time = DateTime::<Utc>::from(time);
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or(time)
}

pub(crate) fn format_http_date(time: DateTime<Utc>) -> String {
    time.format(HTTP_DATE_FORMAT).to_string()
}

/// Parses an IMF-fixdate, as sent in conditional request headers.
pub(crate) fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim()).ok().map(|date| date.with_timezone(&Utc))
}
