//! Byte ranges
//!
//! - [`RangeSet`]: parses and normalises a `Range` header against a resource size
//! - [`ByteRangeSplicer`]: streams the selected bytes, as `multipart/byteranges`
//!   when more than one range remains

mod range_set;
mod range_splicer;

pub use range_set::{RangeError, RangeSet};
pub use range_splicer::{ByteRangeSplicer, range_not_satisfiable};
