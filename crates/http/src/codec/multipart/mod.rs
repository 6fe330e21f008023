//! Multipart bodies
//!
//! - [`MultipartScanner`]: splits a body into parts at boundary delimiters,
//!   withholding any tail that could be the start of a delimiter split across reads
//! - [`MultipartEncoder`]: renders parts and precomputes the body size

mod boundary_scanner;
mod multipart_encoder;

pub use boundary_scanner::{MultipartEvent, MultipartScanner};
pub use multipart_encoder::{MultipartEncoder, MultipartItem, generate_boundary};
