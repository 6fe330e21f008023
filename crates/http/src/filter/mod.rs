//! Connection and request filters.
//!
//! A [`Filter`] hooks into every connection of a server: access control, logging,
//! rate limiting and the like. Every hook has a no-op default, a filter
//! implements the ones it cares about. Hooks fire in this order over a request:
//!
//! | hook                  | may answer | repeats |
//! |-----------------------|------------|---------|
//! | `on_conn_open`        | yes        |         |
//! | `on_conn_data`        | yes        | yes     |
//! | `on_req_headers`      | yes        |         |
//! | `on_req_route`        | yes        |         |
//! | `after_req_headers`   | yes        |         |
//! | `on_request`          | yes        |         |
//! | `on_req_data`         | no         | yes     |
//! | `on_res_promise`      | no         |         |
//! | `on_response`         | no         |         |
//! | `after_res_headers`   | no         |         |
//! | `on_res_end`          | no         |         |
//! | `on_conn_close`       | no         |         |
//!
//! Filters run in registration order. A filter that answers with a response, or
//! closes the connection, stops the remaining filters for that hook only.
//! `on_conn_close` reaches every filter, whatever happened before.

use std::sync::Arc;

use tracing::debug;

use crate::connection::Connection;
use crate::handler::RouteOutcome;
use crate::protocol::{Deferred, Request, Response};

pub trait Filter: Send + Sync {
    fn on_conn_open(&self, _conn: &mut Connection) -> Option<Response> {
        None
    }

    /// Raw bytes as read from the transport.
    fn on_conn_data(&self, _conn: &mut Connection, _data: &[u8]) -> Option<Response> {
        None
    }

    fn on_req_headers(&self, _conn: &mut Connection, _req: &mut Request) -> Option<Response> {
        None
    }

    /// The route was looked up, `req.route_path()` is `None` if none matched.
    fn on_req_route(&self, _conn: &mut Connection, _req: &mut Request, _outcome: &RouteOutcome) -> Option<Response> {
        None
    }

    /// The handler chain ran its header hooks, `outcome` is its early answer if any.
    fn after_req_headers(
        &self,
        _conn: &mut Connection,
        _req: &mut Request,
        _outcome: Option<&RouteOutcome>,
    ) -> Option<Response> {
        None
    }

    fn on_request(&self, _conn: &mut Connection, _req: &mut Request) -> Option<Response> {
        None
    }

    fn on_req_data(&self, _conn: &mut Connection, _req: &Request, _data: &[u8]) {}

    fn on_res_promise(&self, _conn: &mut Connection, _req: Option<&Request>, _deferred: &Deferred<RouteOutcome>) {}

    /// `filtered` is set when the response came from a filter.
    fn on_response(&self, _conn: &mut Connection, _req: Option<&Request>, _res: &mut Response, _filtered: bool) {}

    fn after_res_headers(&self, _conn: &mut Connection, _req: Option<&Request>, _res: &Response, _filtered: bool) {}

    fn on_res_end(
        &self,
        _conn: &mut Connection,
        _req: Option<&Request>,
        _res: &Response,
        _close: bool,
        _filtered: bool,
    ) {
    }

    fn on_conn_close(&self, _conn: &Connection, _req: Option<&Request>, _res: Option<&Response>) {}
}

/// Result of running one hook over the chain.
#[derive(Debug)]
pub enum FilterFlow {
    Continue,
    /// A filter answered, the remaining ones were skipped
    Respond(Response),
    /// A filter closed the connection
    Closed,
}

/// The filters of a server, in registration order.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs a hook that may answer, stopping at the first filter that answers or
    /// closes the connection.
    pub fn run<F>(&self, conn: &mut Connection, mut hook: F) -> FilterFlow
    where
        F: FnMut(&dyn Filter, &mut Connection) -> Option<Response>,
    {
        for (index, filter) in self.filters.iter().enumerate() {
            let response = hook(filter.as_ref(), conn);
            if conn.is_closing() {
                debug!(conn_id = conn.id(), filter = index, "filter closed the connection");
                return FilterFlow::Closed;
            }
            if let Some(response) = response {
                debug!(conn_id = conn.id(), filter = index, status = %response.status(), "filter answered");
                return FilterFlow::Respond(response);
            }
        }
        FilterFlow::Continue
    }

    /// Runs a notification hook. Returns `false` if a filter closed the connection.
    pub fn notify<F>(&self, conn: &mut Connection, mut hook: F) -> bool
    where
        F: FnMut(&dyn Filter, &mut Connection),
    {
        for (index, filter) in self.filters.iter().enumerate() {
            hook(filter.as_ref(), conn);
            if conn.is_closing() {
                debug!(conn_id = conn.id(), filter = index, "filter closed the connection");
                return false;
            }
        }
        true
    }

    /// Runs the final close notification on every filter.
    pub fn close_all(&self, conn: &Connection, req: Option<&Request>, res: Option<&Response>) {
        for filter in &self.filters {
            filter.on_conn_close(conn, req, res);
        }
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain").field("filters", &self.filters.len()).finish()
    }
}
