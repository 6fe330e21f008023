//! Wire format codecs
//!
//! Every codec here is an incremental byte-in/event-out transform built on
//! [`tokio_util::codec::Decoder`] and [`tokio_util::codec::Encoder`]. None of them
//! touch I/O, so they can be fed arbitrarily split input.
//!
//! - [`header`]: header block framing and response head encoding
//! - [`body`]: length-delimited and chunked payloads
//! - [`multipart`]: multipart boundary scanning and rendering
//! - [`range`]: byte-range normalisation and splicing
//! - [`ResponseEncoder`]: head plus payload framing of an outgoing response

pub mod body;
pub mod header;
pub mod multipart;
pub mod range;
mod response_encoder;

pub use body::{ChunkEvent, ChunkedDecoder, ChunkedEncoder, PayloadDecoder, PayloadEncoder};
pub use header::{HeaderEncoder, HeaderFramer};
pub use multipart::{MultipartEncoder, MultipartEvent, MultipartItem, MultipartScanner};
pub use range::{ByteRangeSplicer, RangeError, RangeSet};
pub use response_encoder::ResponseEncoder;
