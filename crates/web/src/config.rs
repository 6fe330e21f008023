//! JSON server configuration.
//!
//! ```json
//! {
//!   "listen": ["127.0.0.1:8080"],
//!   "server_name": "hopper",
//!   "keep_alive_timeout": 10,
//!   "max_handler_redirects": 5,
//!   "routes": [
//!     { "path": "/health", "text": "ok" },
//!     { "path": "/admin", "status": 403 }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};

use hopper_http::connection::{DEFAULT_KEEP_ALIVE_TIMEOUT, DEFAULT_MAX_HANDLER_REDIRECTS, DEFAULT_SERVER_NAME};
use serde::Deserialize;

use crate::server::ServerError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// `host:port` addresses to listen on
    #[serde(default)]
    pub listen: Vec<String>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// `Server` header value, empty to leave it out
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Seconds an idle connection is kept, 0 disables keep-alive
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout: u64,
    #[serde(default = "default_max_handler_redirects")]
    pub max_handler_redirects: usize,
    /// Routes in matching order
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Certificate and key, in PEM files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// A route answering with a fixed response.
///
/// `text` alone answers `200 OK` with the text, `status` alone an empty response,
/// both a text response with that status.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub path: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub text: Option<String>,
}

fn default_server_name() -> String {
    DEFAULT_SERVER_NAME.to_string()
}

fn default_keep_alive_timeout() -> u64 {
    DEFAULT_KEEP_ALIVE_TIMEOUT.as_secs()
}

fn default_max_handler_redirects() -> usize {
    DEFAULT_MAX_HANDLER_REDIRECTS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec![],
            tls: None,
            server_name: default_server_name(),
            keep_alive_timeout: default_keep_alive_timeout(),
            max_handler_redirects: default_max_handler_redirects(),
            routes: vec![],
        }
    }
}

impl ServerConfig {
    pub fn from_json(json: &str) -> Result<Self, ServerError> {
        serde_json::from_str(json).map_err(|source| ServerError::Config { source })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|source| ServerError::ConfigFile { path: path.to_path_buf(), source })?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_json(r#"{ "listen": ["127.0.0.1:8080"] }"#).unwrap();
        assert_eq!(config.listen, vec!["127.0.0.1:8080"]);
        assert_eq!(config.server_name, "hopper");
        assert_eq!(config.keep_alive_timeout, 10);
        assert_eq!(config.max_handler_redirects, 5);
        assert!(config.tls.is_none());
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_full_config() {
        let json = indoc! {r#"
            {
              "listen": ["0.0.0.0:80", "[::]:80"],
              "tls": { "cert": "/etc/hopper/cert.pem", "key": "/etc/hopper/key.pem" },
              "server_name": "",
              "keep_alive_timeout": 0,
              "max_handler_redirects": 2,
              "routes": [
                { "path": "/health", "text": "ok" },
                { "path": "/gone", "status": 410 }
              ]
            }
        "#};
        let config = ServerConfig::from_json(json).unwrap();
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.tls.unwrap().cert, PathBuf::from("/etc/hopper/cert.pem"));
        assert_eq!(config.server_name, "");
        assert_eq!(config.keep_alive_timeout, 0);
        assert_eq!(config.max_handler_redirects, 2);
        assert_eq!(config.routes[0].text.as_deref(), Some("ok"));
        assert_eq!(config.routes[1].status, Some(410));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let result = ServerConfig::from_json(r#"{ "listen": [], "keepalive": 3 }"#);
        assert!(matches!(result, Err(ServerError::Config { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ServerConfig::from_file("/nonexistent/hopper.json");
        assert!(matches!(result, Err(ServerError::ConfigFile { .. })));
    }
}
