//! Message model and protocol level types.
//!
//! - [`message`]: [`Message`], [`PayloadItem`] and [`PayloadSize`], the units the
//!   codecs exchange with the connection
//! - [`Request`] / [`Response`]: structured messages with wire rendering and parsing
//! - [`body`]: streamed request bodies and response bodies
//! - [`Deferred`]: a response that isn't available yet
//! - [`error`]: [`HttpError`], [`ParseError`] and [`SendError`]
//! - [`DateService`]: cached `Date` header values

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::BodyMode;
pub use request::Request;

mod response;
pub use response::Response;
pub use response::ResponseHead;

mod deferred;
pub use deferred::Deferred;
pub use deferred::Settled;

mod form;
pub use form::{Form, FormFile, parse_form};

mod date;
pub use date::DateService;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;

pub mod body;
pub mod headers;

pub use body::Body;
