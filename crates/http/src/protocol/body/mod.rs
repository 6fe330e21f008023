//! Message bodies.
//!
//! - [`ReqBody`] / [`ReqBodySender`]: a request body streamed from the connection to
//!   a handler through a bounded channel. A reader that falls behind pauses socket
//!   reads, a reader that goes away makes the connection skip the rest of the body.
//! - [`Body`]: a response body, either absent, in memory, or a streaming producer.

mod req_body;
mod res_body;

pub use req_body::{ReqBody, ReqBodySender, body_channel};
pub use res_body::{Body, BodyStream, BoxError};
