//! Header block processing
//!
//! # Components
//!
//! - [`HeaderFramer`]: cuts a header block off the front of a growing buffer
//!   - Searches the whole buffer for the blank-line terminator
//!   - Leaves the body prefix in the buffer
//!   - Enforces the 4KiB header size cap
//!
//! - [`HeaderEncoder`]: encodes response heads to bytes
//!   - Status line with canonical or custom reason phrase
//!   - Title-cased header names
//!   - Keeps `Content-Length` and `Transfer-Encoding` consistent with the body framing

mod header_encoder;
mod header_framer;

pub(crate) use header_encoder::allows_body;
pub(crate) use header_encoder::FastWrite;
pub use header_encoder::HeaderEncoder;
pub use header_framer::HeaderFramer;
pub use header_framer::MAX_HEADER_BYTES;
