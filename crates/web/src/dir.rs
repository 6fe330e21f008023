use std::path::{Component, Path, PathBuf};

use http::header::{self, HeaderValue};
use http::StatusCode;
use hopper_http::handler::{Handler, RouteOutcome};
use hopper_http::protocol::{Request, Response};
use tracing::debug;

use crate::file::{Conditions, defer, respond_file};

/// Serves the files below a base directory.
///
/// The request path is resolved relative to the matched route, so a handler
/// routed at `/static` serves `/static/css/app.css` from `<base>/css/app.css`.
/// Directories are answered with their index file when one is configured,
/// `403 Forbidden` otherwise.
#[derive(Debug, Clone)]
pub struct DirHandler {
    base: PathBuf,
    index: Option<String>,
    ranges: bool,
}

impl DirHandler {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into(), index: None, ranges: false }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn with_ranges(mut self, ranges: bool) -> Self {
        self.ranges = ranges;
        self
    }
}

impl Handler for DirHandler {
    fn on_request(&self, req: &mut Request) -> RouteOutcome {
        let Some(relative) = relative_path(req.route_relative_path()) else {
            debug!(path = req.path(), "reject path leaving the base directory");
            return StatusCode::NOT_FOUND.into();
        };

        let base = self.base.clone();
        let index = self.index.clone();
        let ranges = self.ranges;
        let path = req.path().to_string();
        let conditions = Conditions::of(req, ranges);

        defer(async move {
            if !tokio::fs::metadata(&base).await.is_ok_and(|m| m.is_dir()) {
                return Response::new(StatusCode::NOT_FOUND);
            }

            let target = base.join(relative);
            let metadata = match tokio::fs::metadata(&target).await {
                Ok(metadata) => metadata,
                Err(_) => return Response::new(StatusCode::NOT_FOUND),
            };
            if metadata.is_file() {
                return respond_file(&target, &conditions, ranges).await;
            }
            if !metadata.is_dir() {
                return Response::new(StatusCode::NOT_FOUND);
            }

            if !path.ends_with('/') {
                let mut response = Response::new(StatusCode::MOVED_PERMANENTLY);
                if let Ok(location) = HeaderValue::from_str(&format!("{path}/")) {
                    response.headers_mut().insert(header::LOCATION, location);
                }
                return response;
            }

            if let Some(index) = index {
                let index = target.join(index);
                if tokio::fs::metadata(&index).await.is_ok_and(|m| m.is_file()) {
                    return respond_file(&index, &conditions, ranges).await;
                }
            }
            Response::new(StatusCode::FORBIDDEN)
        })
    }
}

/// `path` as a relative file system path, `None` if it would leave the base.
fn relative_path(path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(relative)
}
