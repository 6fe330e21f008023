//! An asynchronous HTTP/1.x protocol engine
//!
//! This crate implements the wire side of an HTTP/1.0 and HTTP/1.1 server on top
//! of tokio: framing, body codecs, request and response models, and the
//! connection state machine that ties them to a router, filters and handlers.
//! It does not listen on sockets itself, any `AsyncRead`/`AsyncWrite` pair can be
//! served.
//!
//! # Features
//!
//! - Header block framing with a 4KiB cap
//! - Content-Length, chunked (with extensions and trailers) and tunnelled bodies
//! - Multipart form parsing and multipart/byteranges rendering
//! - Byte range requests
//! - Keep-alive, pipelining-safe sequential exchanges, `Expect: 100-continue`
//! - Protocol upgrades
//! - Deferred responses resolved from other tasks
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hopper_http::connection::{Connection, HttpConnection, ServerSettings};
//! use hopper_http::handler::{RouteOutcome, handler_fn};
//! use hopper_http::router::Router;
//! use tokio::net::TcpListener;
//! use tracing::{error, warn};
//!
//! #[tokio::main]
//! async fn main() {
//!     let router = Router::builder()
//!         .route("/hello", "Hello World!")
//!         .route("/echo", RouteOutcome::handler(handler_fn(|req| {
//!             format!("{} bytes", req.body().map_or(0, |body| body.len())).into()
//!         })))
//!         .build()
//!         .expect("valid routes");
//!     let settings = Arc::new(ServerSettings::new(router));
//!
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.expect("bind");
//!     loop {
//!         let (stream, remote_addr) = match listener.accept().await {
//!             Ok(accepted) => accepted,
//!             Err(e) => {
//!                 warn!(cause = %e, "failed to accept");
//!                 continue;
//!             }
//!         };
//!
//!         let settings = settings.clone();
//!         tokio::spawn(async move {
//!             let conn = Connection::new(stream.local_addr().ok(), Some(remote_addr), false);
//!             let (reader, writer) = stream.into_split();
//!             if let Err(e) = HttpConnection::new(reader, writer, conn, settings).process().await {
//!                 error!(cause = %e, "connection failed");
//!             }
//!         });
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! - [`codec`]: incremental decoders and encoders, free of I/O
//! - [`protocol`]: requests, responses, bodies, errors and deferred values
//! - [`router`]: prefix routing of requests to outcomes
//! - [`handler`]: the per-request handler hooks
//! - [`filter`]: connection-wide hooks that may answer early
//! - [`connection`]: the connection state machine
//!
//! # Limitations
//!
//! - HTTP/1.x only
//! - No TLS, terminate it in front of the engine
//! - Maximum header size: 4KiB
//! - Maximum number of headers: 64

pub mod codec;
pub mod connection;
pub mod filter;
pub mod handler;
pub mod protocol;
pub mod router;

mod utils;
pub(crate) use utils::ensure;
