use std::sync::Arc;
use std::time::Duration;

use crate::filter::{Filter, FilterChain};
use crate::router::Router;

pub const DEFAULT_SERVER_NAME: &str = "hopper";
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_HANDLER_REDIRECTS: usize = 5;

/// Everything a connection needs from its server, shared by all connections.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// `Server` header value, empty to leave the header out
    pub server_name: String,
    /// Idle time allowed between requests, zero disables keep-alive
    pub keep_alive_timeout: Duration,
    /// How many times a request may be handed from one handler to another
    pub max_handler_redirects: usize,
    pub router: Router,
    pub filters: FilterChain,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            max_handler_redirects: DEFAULT_MAX_HANDLER_REDIRECTS,
            router: Router::default(),
            filters: FilterChain::default(),
        }
    }
}

impl ServerSettings {
    pub fn new(router: Router) -> Self {
        Self { router, ..Default::default() }
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn with_keep_alive_timeout(mut self, keep_alive_timeout: Duration) -> Self {
        self.keep_alive_timeout = keep_alive_timeout;
        self
    }

    pub fn with_max_handler_redirects(mut self, max_handler_redirects: usize) -> Self {
        self.max_handler_redirects = max_handler_redirects;
        self
    }

    pub fn with_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn keep_alive_enabled(&self) -> bool {
        !self.keep_alive_timeout.is_zero()
    }
}
