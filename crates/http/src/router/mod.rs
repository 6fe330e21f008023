//! Prefix routing.
//!
//! Routes are registered with a path prefix and scanned in registration order,
//! the first whose prefix contains the request path wins. Both sides are
//! compared with exactly one trailing `/`, so `/a/b` matches `/a/b` and `/a/b/c`
//! but not `/a/bc`.

use http::StatusCode;
use thiserror::Error;
use tracing::trace;

use crate::handler::RouteOutcome;
use crate::protocol::Request;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("route {path} can't be bound to a deferred response")]
    DeferredRoute { path: String },
}

#[derive(Debug, Clone)]
struct Route {
    /// Normalised path, `/` plus the path trimmed of slashes
    path: String,
    /// `path` with one trailing `/`, used for matching
    prefix: String,
    outcome: RouteOutcome,
}

/// An immutable route table.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

#[derive(Debug, Default)]
pub struct RouterBuilder {
    routes: Vec<Route>,
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

fn with_trailing_slash(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

impl RouterBuilder {
    /// Binds a path prefix. Registering the same path again replaces the outcome
    /// and keeps the original position.
    pub fn route(mut self, path: &str, outcome: impl Into<RouteOutcome>) -> Self {
        let path = normalize(path);
        let outcome = outcome.into();
        match self.routes.iter_mut().find(|r| r.path == path) {
            Some(route) => route.outcome = outcome,
            None => {
                let prefix = with_trailing_slash(&path);
                self.routes.push(Route { path, prefix, outcome });
            }
        }
        self
    }

    pub fn build(self) -> Result<Router, RouterError> {
        if let Some(route) = self.routes.iter().find(|r| matches!(r.outcome, RouteOutcome::Deferred(_))) {
            return Err(RouterError::DeferredRoute { path: route.path.clone() });
        }
        Ok(Router { routes: self.routes })
    }
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Registered paths, in matching order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.path.as_str())
    }

    /// Finds the route of `req` and records it as the request's route path.
    ///
    /// Without a match the outcome is a 404 and the route path stays `None`.
    pub fn route(&self, req: &mut Request) -> RouteOutcome {
        let path = with_trailing_slash(req.path());
        match self.routes.iter().find(|r| path.starts_with(&r.prefix)) {
            Some(route) => {
                trace!(path = req.path(), route = %route.path, "route matched");
                req.set_route_path(route.path.as_str());
                route.outcome.clone()
            }
            None => {
                trace!(path = req.path(), "no route matched");
                RouteOutcome::Status(StatusCode::NOT_FOUND)
            }
        }
    }
}
