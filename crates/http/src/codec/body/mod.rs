//! HTTP body handling module for processing request and response payloads
//!
//! This module provides functionality for encoding and decoding HTTP message bodies
//! using different transfer strategies.
//!
//! # Components
//!
//! ## Decoders
//! - [`ChunkedDecoder`]: Reports chunk framing events of a chunked body
//! - [`LengthDecoder`]: Processes fixed-length payloads
//! - [`PayloadDecoder`]: Main decoder that coordinates different decoding strategies
//!
//! ## Encoders
//! - [`ChunkedEncoder`]: Chunked transfer encoding with coalescing, extensions and trailers
//! - [`LengthEncoder`]: Handles fixed-length payload encoding
//! - [`PayloadEncoder`]: Main encoder that manages different encoding strategies

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use chunked_decoder::{ChunkEvent, ChunkedDecoder, MAX_CHUNK_LINE_BYTES, MAX_TRAILER_BYTES};
pub use chunked_encoder::{ChunkObserver, ChunkedEncoder};
pub use length_decoder::LengthDecoder;
pub use length_encoder::LengthEncoder;
pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
