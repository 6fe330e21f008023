use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hopper_http::connection::{Connection, HttpConnection, ServerSettings};
use hopper_http::filter::Filter;
use hopper_http::handler::{Handler, RouteOutcome};
use hopper_http::protocol::{HttpError, Response};
use hopper_http::router::{Router, RouterBuilder, RouterError};
use http::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use crate::config::{RouteConfig, ServerConfig, TlsConfig};

pub struct ServerBuilder {
    address: Vec<SocketAddr>,
    router: RouterBuilder,
    settings: ServerSettings,
    log_level: Level,
    tls: Option<TlsConfig>,
    error: Option<ServerError>,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("address must be set")]
    MissingAddress,
    #[error("invalid address {address}: {source}")]
    InvalidAddress { address: String, source: io::Error },
    #[error("route {path} needs a status or a text")]
    InvalidRoute { path: String },
    #[error("route {path} has an invalid status {status}")]
    InvalidStatus { path: String, status: u16 },
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("invalid configuration: {source}")]
    Config { source: serde_json::Error },
    #[error("can't read configuration {}: {source}", path.display())]
    ConfigFile { path: PathBuf, source: io::Error },
    #[error("tls is configured, terminate it in front of the server and hand streams to serve_connection")]
    TlsUnsupported,
    #[error("bind server error: {source}")]
    Bind { source: io::Error },
}

impl ServerBuilder {
    fn new() -> Self {
        Self {
            address: vec![],
            router: Router::builder(),
            settings: ServerSettings::default(),
            log_level: Level::INFO,
            tls: None,
            error: None,
        }
    }

    /// Takes every option of `config`. Invalid entries surface from [`build`](Self::build).
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut builder = Self::new()
            .server_name(config.server_name.clone())
            .keep_alive_timeout(Duration::from_secs(config.keep_alive_timeout))
            .max_handler_redirects(config.max_handler_redirects);

        for address in &config.listen {
            builder = builder.address(address.as_str());
        }
        if let Some(tls) = &config.tls {
            builder = builder.tls(tls.clone());
        }
        for route in &config.routes {
            match config_route(route) {
                Ok(outcome) => builder = builder.route(&route.path, outcome),
                Err(e) => builder.fail(e),
            }
        }
        builder
    }

    fn fail(&mut self, error: ServerError) {
        self.error.get_or_insert(error);
    }

    pub fn address<A: ToSocketAddrs + fmt::Debug>(mut self, address: A) -> Self {
        match address.to_socket_addrs() {
            Ok(resolved) => self.address.extend(resolved),
            Err(source) => self.fail(ServerError::InvalidAddress { address: format!("{address:?}"), source }),
        }
        self
    }

    pub fn route(mut self, path: &str, outcome: impl Into<RouteOutcome>) -> Self {
        self.router = self.router.route(path, outcome);
        self
    }

    pub fn handler(self, path: &str, handler: impl Handler + 'static) -> Self {
        self.route(path, RouteOutcome::handler(handler))
    }

    pub fn filter(mut self, filter: impl Filter + 'static) -> Self {
        self.settings = self.settings.with_filter(filter);
        self
    }

    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.settings = self.settings.with_server_name(server_name);
        self
    }

    pub fn keep_alive_timeout(mut self, keep_alive_timeout: Duration) -> Self {
        self.settings = self.settings.with_keep_alive_timeout(keep_alive_timeout);
        self
    }

    pub fn max_handler_redirects(mut self, max_handler_redirects: usize) -> Self {
        self.settings = self.settings.with_max_handler_redirects(max_handler_redirects);
        self
    }

    pub fn log_level(mut self, log_level: Level) -> Self {
        self.log_level = log_level;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn build(self) -> Result<Server, ServerError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let mut settings = self.settings;
        settings.router = self.router.build()?;
        Ok(Server { address: self.address, settings: Arc::new(settings), log_level: self.log_level, tls: self.tls })
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder").field("address", &self.address).field("settings", &self.settings).finish_non_exhaustive()
    }
}

fn config_route(route: &RouteConfig) -> Result<RouteOutcome, ServerError> {
    let status = route
        .status
        .map(|status| {
            StatusCode::from_u16(status).ok().ok_or_else(|| ServerError::InvalidStatus { path: route.path.clone(), status })
        })
        .transpose()?;

    match (status, &route.text) {
        (Some(status), Some(text)) => Ok(Response::text(status, text.clone()).into()),
        (Some(status), None) => Ok(status.into()),
        (None, Some(text)) => Ok(text.clone().into()),
        (None, None) => Err(ServerError::InvalidRoute { path: route.path.clone() }),
    }
}

#[derive(Debug)]
pub struct Server {
    address: Vec<SocketAddr>,
    settings: Arc<ServerSettings>,
    log_level: Level,
    tls: Option<TlsConfig>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn from_config(config: &ServerConfig) -> Result<Server, ServerError> {
        ServerBuilder::from_config(config).build()
    }

    pub fn settings(&self) -> &Arc<ServerSettings> {
        &self.settings
    }

    /// The configured TLS material, for an acceptor in front of [`serve_connection`](Self::serve_connection).
    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    /// Listens on the configured addresses and serves every accepted connection on its own task.
    ///
    /// Only plain TCP is served, a server with TLS material refuses to start.
    pub async fn start(self) -> Result<(), ServerError> {
        if self.tls.is_some() {
            error!("tls material configured, refuse to serve plain tcp");
            return Err(ServerError::TlsUnsupported);
        }
        if self.address.is_empty() {
            return Err(ServerError::MissingAddress);
        }

        let subscriber = FmtSubscriber::builder().with_max_level(self.log_level).finish();
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            warn!("a global subscriber is already set, keep it");
        }

        info!("start listening at {:?}", self.address);
        let tcp_listener = match TcpListener::bind(self.address.as_slice()).await {
            Ok(tcp_listener) => tcp_listener,
            Err(e) => {
                error!(cause = %e, "bind server error");
                return Err(ServerError::Bind { source: e });
            }
        };

        loop {
            let (tcp_stream, remote_addr) = match tcp_listener.accept().await {
                Ok(stream_and_addr) => stream_and_addr,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            };

            let settings = Arc::clone(&self.settings);
            tokio::spawn(async move {
                let conn = Connection::new(tcp_stream.local_addr().ok(), Some(remote_addr), false);
                let (reader, writer) = tcp_stream.into_split();
                match HttpConnection::new(reader, writer, conn, settings).process().await {
                    Ok(()) => {
                        info!("finished process, connection shutdown");
                    }
                    Err(e) => {
                        error!("service has error, cause {}, connection shutdown", e);
                    }
                }
            });
        }
    }

    /// Serves one already accepted stream until it closes.
    ///
    /// `tls` tells filters and handlers whether the stream was decrypted in front of us.
    pub async fn serve_connection<S>(
        &self,
        stream: S,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        tls: bool,
    ) -> Result<(), HttpError>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Connection::new(local_addr, remote_addr, tls);
        HttpConnection::new(reader, writer, conn, Arc::clone(&self.settings)).process().await
    }
}
