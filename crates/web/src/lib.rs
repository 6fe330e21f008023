//! The hopper server.
//!
//! Binds listeners, loads the JSON configuration and provides the file serving
//! handlers on top of the `hopper-http` engine.
//!
//! ```no_run
//! use hopper_web::{DirHandler, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::builder()
//!         .address("127.0.0.1:8080")
//!         .route("/health", "ok")
//!         .handler("/static", DirHandler::new("./public").with_index("index.html"))
//!         .build()
//!         .expect("valid server");
//!
//!     if let Err(e) = server.start().await {
//!         eprintln!("server stopped: {e}");
//!     }
//! }
//! ```

pub mod config;
mod content_type;
mod dir;
mod file;
mod server;

pub use config::{RouteConfig, ServerConfig, TlsConfig};
pub use content_type::content_type_for;
pub use dir::DirHandler;
pub use file::FileHandler;
pub use server::{Server, ServerBuilder, ServerError};
