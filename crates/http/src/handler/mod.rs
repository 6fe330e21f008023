//! Request handlers.
//!
//! A [`Handler`] is driven through a request in this order:
//!
//! 1. [`on_headers`](Handler::on_headers): the head arrived. Returning another
//!    handler hands the request over to it (its `on_headers` runs next), returning
//!    a terminal [`RouteOutcome`] answers right away.
//! 2. [`on_data`](Handler::on_data): once per body chunk, unless the body is
//!    buffered or streamed.
//! 3. [`on_request`](Handler::on_request): the body was read, produce the response
//!    or a [`Deferred`] one.
//! 4. [`on_response`](Handler::on_response): headers can still be changed.
//! 5. [`on_response_headers`](Handler::on_response_headers): headers were sent.
//! 6. [`on_end`](Handler::on_end): always last, also when the connection closes
//!    early. A handler that handed the request over never sees it.
//!
//! Hooks are synchronous. Work that has to wait returns a [`Deferred`] from
//! `on_request` and resolves it from a spawned task.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;

use crate::protocol::{Deferred, Request, Response};

pub trait Handler: Send + Sync {
    fn on_headers(&self, _req: &mut Request) -> Option<RouteOutcome> {
        None
    }

    fn on_data(&self, _req: &mut Request, _data: &Bytes) {}

    fn on_request(&self, _req: &mut Request) -> RouteOutcome {
        RouteOutcome::Status(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn on_response(&self, _req: &mut Request, _res: &mut Response) {}

    fn on_response_headers(&self, _req: &Request, _res: &Response) {}

    fn on_end(&self, _req: &Request, _res: Option<&Response>) {}
}

/// What a route, or a handler hook, resolves to.
#[derive(Clone)]
pub enum RouteOutcome {
    /// An empty response with this status
    Status(StatusCode),
    /// A `200 OK` plain text response
    Text(String),
    Response(Response),
    /// Hand the request over to this handler
    Handler(Arc<dyn Handler>),
    /// A response that will be available later
    Deferred(Deferred<RouteOutcome>),
}

impl RouteOutcome {
    pub fn handler(handler: impl Handler + 'static) -> Self {
        RouteOutcome::Handler(Arc::new(handler))
    }

    /// Whether this outcome ends the request without a handler.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RouteOutcome::Status(_) | RouteOutcome::Text(_) | RouteOutcome::Response(_))
    }

    /// The response of a terminal outcome.
    pub fn into_response(self) -> Result<Response, RouteOutcome> {
        match self {
            RouteOutcome::Status(status) => Ok(Response::new(status)),
            RouteOutcome::Text(text) => Ok(Response::text(StatusCode::OK, text)),
            RouteOutcome::Response(response) => Ok(response),
            other => Err(other),
        }
    }
}

impl fmt::Debug for RouteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteOutcome::Status(status) => f.debug_tuple("Status").field(status).finish(),
            RouteOutcome::Text(text) => f.debug_tuple("Text").field(text).finish(),
            RouteOutcome::Response(response) => f.debug_tuple("Response").field(&response.status()).finish(),
            RouteOutcome::Handler(_) => f.write_str("Handler"),
            RouteOutcome::Deferred(deferred) => f.debug_tuple("Deferred").field(deferred).finish(),
        }
    }
}

impl From<StatusCode> for RouteOutcome {
    fn from(status: StatusCode) -> Self {
        RouteOutcome::Status(status)
    }
}

impl From<&str> for RouteOutcome {
    fn from(text: &str) -> Self {
        RouteOutcome::Text(text.to_string())
    }
}

impl From<String> for RouteOutcome {
    fn from(text: String) -> Self {
        RouteOutcome::Text(text)
    }
}

impl From<Response> for RouteOutcome {
    fn from(response: Response) -> Self {
        RouteOutcome::Response(response)
    }
}

impl From<Arc<dyn Handler>> for RouteOutcome {
    fn from(handler: Arc<dyn Handler>) -> Self {
        RouteOutcome::Handler(handler)
    }
}

impl From<Deferred<RouteOutcome>> for RouteOutcome {
    fn from(deferred: Deferred<RouteOutcome>) -> Self {
        RouteOutcome::Deferred(deferred)
    }
}

/// A handler made of a closure, see [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F> Handler for HandlerFn<F>
where
    F: Fn(&mut Request) -> RouteOutcome + Send + Sync,
{
    fn on_headers(&self, req: &mut Request) -> Option<RouteOutcome> {
        req.buffer_body();
        None
    }

    fn on_request(&self, req: &mut Request) -> RouteOutcome {
        (self.f)(req)
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

/// Wraps a closure as a [`Handler`].
///
/// The request body is buffered, the closure runs once it was read completely.
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&mut Request) -> RouteOutcome + Send + Sync,
{
    HandlerFn { f }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BodyMode;
    use http::Method;

    #[test]
    fn test_handler_fn_buffers_body() {
        let handler = handler_fn(|req| format!("hello {}", req.query_param("name").unwrap_or("nobody")).into());
        let mut req = Request::new(Method::GET, "/greet?name=joe");

        assert!(handler.on_headers(&mut req).is_none());
        assert_eq!(req.body_mode(), BodyMode::Buffer);

        let RouteOutcome::Text(text) = handler.on_request(&mut req) else { panic!("expected a text outcome") };
        assert_eq!(text, "hello joe");
    }

    #[test]
    fn test_terminal_outcomes() {
        let response = RouteOutcome::from(StatusCode::NO_CONTENT).into_response().unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = RouteOutcome::from("hi").into_response().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().len(), Some(2));

        let deferred = RouteOutcome::from(Deferred::new());
        assert!(!deferred.is_terminal());
        assert!(deferred.into_response().is_err());
    }

    #[test]
    fn test_default_on_request_is_error() {
        struct Nothing;
        impl Handler for Nothing {}

        let outcome = Nothing.on_request(&mut Request::new(Method::GET, "/"));
        assert!(matches!(outcome, RouteOutcome::Status(StatusCode::INTERNAL_SERVER_ERROR)));
    }
}
