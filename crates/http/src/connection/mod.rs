//! HTTP connection handling module
//!
//! # Components
//!
//! - [`HttpConnection`]: drives one transport through its exchanges
//!   - Frames and parses request heads
//!   - Runs filters, routing and the handler chain
//!   - Delivers request bodies by callback, buffer or stream
//!   - Waits for deferred responses
//!   - Keep-alive, `Expect: 100-continue` and protocol upgrades
//!
//! - [`Connection`]: the connection as filters see it, with its id, addresses and state
//!
//! - [`ConnectionHandle`]: a cloneable way to close a connection from anywhere
//!
//! - [`ServerSettings`]: what all connections of a server share

mod handle;
mod http_connection;
mod settings;

pub use handle::{Connection, ConnectionHandle, ConnectionState};
pub use http_connection::HttpConnection;
pub use settings::{DEFAULT_KEEP_ALIVE_TIMEOUT, DEFAULT_MAX_HANDLER_REDIRECTS, DEFAULT_SERVER_NAME, ServerSettings};
