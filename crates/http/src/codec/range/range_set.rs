//! `Range: bytes=...` parsing and normalisation against a resource of known size.

use std::ops::RangeInclusive;

use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("can not parse range: \"{header}\"")]
    Malformed { header: String },

    #[error("no valid range found in \"{header}\", input size: {size}")]
    Unsatisfiable { header: String, size: u64 },
}

/// A normalised set of byte ranges: clamped, merged and in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<(u64, u64)>,
    size: u64,
}

impl RangeSet {
    /// Parses a `Range` header value against a resource of `size` bytes.
    ///
    /// - `start-end` is clamped to the last byte of the resource
    /// - `start-` runs to the end of the resource
    /// - `-suffix` covers the last `suffix` bytes, all of them when `suffix > size`
    ///
    /// Ranges that are empty after clamping are dropped, overlapping or adjacent
    /// ranges are merged. A set left empty is [`RangeError::Unsatisfiable`].
    pub fn parse(header: &str, size: u64) -> Result<Self, RangeError> {
        let malformed = || RangeError::Malformed { header: header.to_string() };

        let (unit, specs) = header.split_once('=').ok_or_else(malformed)?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return Err(malformed());
        }

        let mut ranges = Vec::new();
        for spec in specs.split(',') {
            let spec = spec.trim();
            if spec.is_empty() {
                continue;
            }

            let (start, end) = spec.split_once('-').ok_or_else(malformed)?;
            let start = parse_position(start).map_err(|_| malformed())?;
            let end = parse_position(end).map_err(|_| malformed())?;

            let range = match (start, end) {
                (None, None) => return Err(malformed()),
                (None, Some(suffix)) => {
                    if suffix == 0 || size == 0 {
                        continue;
                    }
                    (size.saturating_sub(suffix), size - 1)
                }
                (Some(start), None) => (start, size.saturating_sub(1)),
                (Some(start), Some(end)) => (start, std::cmp::min(end, size.saturating_sub(1))),
            };

            if size == 0 || range.1 < range.0 || range.0 >= size {
                trace!(start = range.0, end = range.1, size, "drop unsatisfiable range");
                continue;
            }
            ranges.push(range);
        }

        let ranges = merge(ranges);
        if ranges.is_empty() {
            return Err(RangeError::Unsatisfiable { header: header.to_string(), size });
        }
        Ok(Self { ranges, size })
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    pub fn iter(&self) -> impl Iterator<Item = RangeInclusive<u64>> + '_ {
        self.ranges.iter().map(|&(start, end)| start..=end)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn resource_size(&self) -> u64 {
        self.size
    }

    /// Number of resource bytes covered by all ranges.
    pub fn byte_count(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end + 1 - start).sum()
    }

    /// `Content-Range` value of one range of this set.
    pub fn content_range(&self, range: (u64, u64)) -> String {
        format!("bytes {}-{}/{}", range.0, range.1, self.size)
    }
}

fn parse_position(s: &str) -> Result<Option<u64>, std::num::ParseIntError> {
    let s = s.trim();
    if s.is_empty() { Ok(None) } else { s.parse().map(Some) }
}

/// Folds overlapping and touching ranges into their union.
fn merge(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ranges.sort_unstable();
    ranges.into_iter().fold(Vec::new(), |mut merged: Vec<(u64, u64)>, (start, end)| {
        match merged.last_mut() {
            Some(last) if last.1.saturating_add(1) >= start => last.1 = std::cmp::max(last.1, end),
            _ => merged.push((start, end)),
        }
        merged
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_ranges_merge() {
        let set = RangeSet::parse("bytes=0-499,500-999", 1000).unwrap();
        assert_eq!(set.ranges(), &[(0, 999)]);
    }

    #[test]
    fn test_disjoint_ranges() {
        let set = RangeSet::parse("bytes=200-299, 0-99", 1000).unwrap();
        assert_eq!(set.ranges(), &[(0, 99), (200, 299)]);
        assert_eq!(set.byte_count(), 200);
    }

    #[test]
    fn test_overlapping_ranges() {
        let set = RangeSet::parse("bytes=10-20,0-5,4-12,30-", 40).unwrap();
        assert_eq!(set.ranges(), &[(0, 20), (30, 39)]);
    }

    #[test]
    fn test_suffix_and_open_ranges() {
        assert_eq!(RangeSet::parse("bytes=-100", 1000).unwrap().ranges(), &[(900, 999)]);
        assert_eq!(RangeSet::parse("bytes=-5000", 1000).unwrap().ranges(), &[(0, 999)]);
        assert_eq!(RangeSet::parse("bytes=990-", 1000).unwrap().ranges(), &[(990, 999)]);
        assert_eq!(RangeSet::parse("bytes=0-5000", 1000).unwrap().ranges(), &[(0, 999)]);
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(matches!(RangeSet::parse("items=0-1", 10), Err(RangeError::Malformed { .. })));
        assert!(matches!(RangeSet::parse("bytes=a-b", 10), Err(RangeError::Malformed { .. })));
        assert!(matches!(RangeSet::parse("bytes=-", 10), Err(RangeError::Malformed { .. })));
        assert!(matches!(RangeSet::parse("bytes=5-2", 10), Err(RangeError::Unsatisfiable { .. })));
        assert!(matches!(RangeSet::parse("bytes=20-", 10), Err(RangeError::Unsatisfiable { .. })));
    }

    #[test]
    fn test_content_range() {
        let set = RangeSet::parse("bytes=0-9", 100).unwrap();
        assert_eq!(set.content_range(set.ranges()[0]), "bytes 0-9/100");
    }
}
