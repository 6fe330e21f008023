//! Multipart boundary scanner.
//!
//! Splits a body into parts at `\r\n--boundary` delimiters, as used by
//! `multipart/form-data` and `multipart/byteranges`. The scanner works on a
//! growing buffer and tolerates delimiters that straddle two reads: any tail of
//! the buffer that could still turn into a delimiter is left in the buffer until
//! more bytes arrive, so a data event never carries a piece of the marker.
//!
//! Each part's content goes through a nested [`HeaderFramer`]. Once the part's
//! header block is framed a [`MultipartEvent::Part`] is emitted, and the rest of
//! the content follows as [`MultipartEvent::Data`].

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::header::HeaderFramer;
use crate::protocol::ParseError;
use crate::protocol::headers::parse_header_lines;
use crate::utils::find_subslice;

/// Events produced while scanning a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartEvent {
    /// Bytes before the first delimiter
    Preamble(Bytes),
    /// A part's header block was read, names are title-cased
    Part { headers: Vec<(String, String)>, index: usize },
    /// Content bytes of the part with the same 1-based index
    Data { data: Bytes, index: usize },
    /// The closing delimiter was read, anything after it is ignored
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Scanning,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// A delimiter starts at `data_end` (line break included) and ends at `delim_end`
    Delimiter { data_end: usize, delim_end: usize, last: bool },
    /// The first `safe_len` bytes can't be part of a delimiter, the rest is withheld
    Partial { safe_len: usize },
}

/// Decoder that turns a multipart body into [`MultipartEvent`]s.
#[derive(Debug)]
pub struct MultipartScanner {
    /// `--` followed by the boundary token
    marker: Vec<u8>,
    state: ScanState,
    /// Nothing consumed yet: a delimiter may start without a preceding line break
    at_start: bool,
    /// 1-based index of the current part, 0 while in the preamble
    index: usize,
    framer: HeaderFramer,
    part_buf: BytesMut,
    pending: VecDeque<MultipartEvent>,
}

impl MultipartScanner {
    pub fn new(boundary: &str) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());

        Self {
            marker,
            state: ScanState::Scanning,
            at_start: true,
            index: 0,
            framer: HeaderFramer::new(),
            part_buf: BytesMut::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ScanState::Done
    }

    /// Number of delimiters seen so far, which is the index of the current part.
    pub fn parts(&self) -> usize {
        self.index
    }

    fn scan(&self, src: &[u8]) -> Scan {
        let marker = &self.marker[..];
        let mut from = 0;

        while let Some(offset) = find_subslice(&src[from..], marker) {
            let pos = from + offset;
            from = pos + 1;

            let data_end = if pos == 0 {
                if !self.at_start {
                    continue;
                }
                0
            } else if src[pos - 1] == b'\n' {
                if pos >= 2 && src[pos - 2] == b'\r' { pos - 2 } else { pos - 1 }
            } else {
                continue;
            };

            let tail = &src[pos + marker.len()..];
            if tail.starts_with(b"--") {
                return Scan::Delimiter { data_end, delim_end: pos + marker.len() + 2, last: true };
            } else if tail.starts_with(b"\r\n") {
                return Scan::Delimiter { data_end, delim_end: pos + marker.len() + 2, last: false };
            } else if tail.starts_with(b"\n") {
                return Scan::Delimiter { data_end, delim_end: pos + marker.len() + 1, last: false };
            } else if tail.is_empty() || tail == b"-" || tail == b"\r" {
                // can't tell yet whether this is a delimiter
                return Scan::Partial { safe_len: data_end };
            }
        }

        if self.at_start && src.len() < marker.len() && marker.starts_with(src) {
            return Scan::Partial { safe_len: 0 };
        }

        let withheld = std::cmp::max(overlap(src, b"\r\n", marker), overlap(src, b"\n", marker));
        Scan::Partial { safe_len: src.len() - withheld }
    }

    fn deliver(&mut self, data: BytesMut) -> Result<(), ParseError> {
        if self.index == 0 {
            if !data.is_empty() {
                self.pending.push_back(MultipartEvent::Preamble(data.freeze()));
            }
            return Ok(());
        }

        if self.framer.is_framed() {
            if !data.is_empty() {
                self.pending.push_back(MultipartEvent::Data { data: data.freeze(), index: self.index });
            }
            return Ok(());
        }

        self.part_buf.extend_from_slice(&data);
        if let Some(block) = self.framer.decode(&mut self.part_buf)? {
            let headers = parse_header_lines(&block);
            trace!(index = self.index, headers = headers.len(), "read multipart part headers");
            self.pending.push_back(MultipartEvent::Part { headers, index: self.index });

            if !self.part_buf.is_empty() {
                let data = self.part_buf.split().freeze();
                self.pending.push_back(MultipartEvent::Data { data, index: self.index });
            }
        }
        Ok(())
    }

    fn on_delimiter(&mut self, last: bool) -> Result<(), ParseError> {
        if self.index > 0 && !self.framer.is_framed() {
            return Err(ParseError::invalid_multipart(format!("part #{} ended inside its headers", self.index)));
        }

        self.index += 1;
        self.framer.reset();
        self.part_buf.clear();
        // a part without headers starts right with the blank line
        self.part_buf.extend_from_slice(b"\r\n");

        if last {
            self.state = ScanState::Done;
            self.pending.push_back(MultipartEvent::Done);
            trace!(parts = self.index - 1, "finished multipart body");
        }
        Ok(())
    }

    fn step(&mut self, src: &mut BytesMut) -> Result<(), ParseError> {
        match self.scan(src) {
            Scan::Delimiter { data_end, delim_end, last } => {
                let data = src.split_to(data_end);
                src.advance(delim_end - data_end);
                self.at_start = false;
                self.deliver(data)?;
                self.on_delimiter(last)
            }
            Scan::Partial { safe_len } => {
                if safe_len > 0 {
                    let data = src.split_to(safe_len);
                    self.at_start = false;
                    self.deliver(data)?;
                }
                Ok(())
            }
        }
    }
}

impl Decoder for MultipartScanner {
    type Item = MultipartEvent;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            match self.state {
                ScanState::Scanning => {}
                ScanState::Done => {
                    // epilogue
                    src.clear();
                    return Ok(None);
                }
                ScanState::Failed => return Ok(None),
            }

            if src.is_empty() {
                return Ok(None);
            }

            let before = src.len();
            if let Err(e) = self.step(src) {
                self.state = ScanState::Failed;
                self.pending.clear();
                return Err(e);
            }

            if self.pending.is_empty() && src.len() == before {
                return Ok(None);
            }
        }
    }
}

/// Length of the longest suffix of `buf` that is a prefix of `lead` + `marker`.
fn overlap(buf: &[u8], lead: &[u8], marker: &[u8]) -> usize {
    let needle_len = lead.len() + marker.len();
    let max = std::cmp::min(buf.len(), needle_len);

    (1..=max)
        .rev()
        .find(|&len| {
            let suffix = &buf[buf.len() - len..];
            suffix.iter().zip(lead.iter().chain(marker.iter())).all(|(a, b)| a == b)
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "------abc123";

    fn body() -> String {
        concat!(
            "preamble text\r\n",
            "--------abc123\r\n",
            "Content-Disposition: form-data; name=\"field\"\r\n",
            "\r\n",
            "value with --------abc12 inside\r\n",
            "--------abc123\r\n",
            "content-type: text/plain\r\n",
            "content-disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n",
            "\r\n",
            "line one\r\n",
            "line two\r\n",
            "--------abc123--\r\n",
            "epilogue",
        )
        .to_string()
    }

    /// Folds events into (headers, data) per part, so differently split feeds compare equal.
    fn collect(events: &[MultipartEvent]) -> (Vec<u8>, Vec<(Vec<(String, String)>, Vec<u8>)>, bool) {
        let mut preamble = vec![];
        let mut parts: Vec<(Vec<(String, String)>, Vec<u8>)> = vec![];
        let mut done = false;
        for event in events {
            match event {
                MultipartEvent::Preamble(data) => preamble.extend_from_slice(data),
                MultipartEvent::Part { headers, index } => {
                    assert_eq!(*index, parts.len() + 1);
                    parts.push((headers.clone(), vec![]));
                }
                MultipartEvent::Data { data, index } => {
                    assert_eq!(*index, parts.len());
                    parts.last_mut().unwrap().1.extend_from_slice(data);
                }
                MultipartEvent::Done => done = true,
            }
        }
        (preamble, parts, done)
    }

    fn feed(pieces: &[&[u8]]) -> Vec<MultipartEvent> {
        let mut scanner = MultipartScanner::new(BOUNDARY);
        let mut buffer = BytesMut::new();
        let mut events = vec![];
        for piece in pieces {
            buffer.extend_from_slice(piece);
            while let Some(event) = scanner.decode(&mut buffer).unwrap() {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn test_parts() {
        let body = body();
        let (preamble, parts, done) = collect(&feed(&[body.as_bytes()]));

        assert_eq!(preamble, b"preamble text");
        assert!(done);
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[0].0,
            vec![("Content-Disposition".to_string(), "form-data; name=\"field\"".to_string())]
        );
        assert_eq!(parts[0].1, b"value with --------abc12 inside");
        assert_eq!(parts[1].0[0], ("Content-Type".to_string(), "text/plain".to_string()));
        assert_eq!(parts[1].1, b"line one\r\nline two");
    }

    #[test]
    fn test_split_at_every_offset() {
        let body = body();
        let bytes = body.as_bytes();
        let expected = collect(&feed(&[bytes]));

        for split in 0..=bytes.len() {
            let events = feed(&[&bytes[..split], &bytes[split..]]);
            assert_eq!(collect(&events), expected, "split at {split}");

            for event in &events {
                if let MultipartEvent::Data { data, .. } = event {
                    assert!(find_subslice(data, b"\r\n--------abc123\r\n").is_none(), "split at {split}");
                }
            }
        }
    }

    #[test]
    fn test_byte_by_byte() {
        let body = body();
        let pieces: Vec<&[u8]> = body.as_bytes().chunks(1).collect();
        assert_eq!(collect(&feed(&pieces)), collect(&feed(&[body.as_bytes()])));
    }

    #[test]
    fn test_delimiter_at_start_and_bare_lf() {
        let body = b"--xyz\nA: 1\n\nfirst\n--xyz\n\nsecond\n--xyz--";
        let mut scanner = MultipartScanner::new("xyz");
        let mut buffer = BytesMut::from(&body[..]);
        let mut events = vec![];
        while let Some(event) = scanner.decode(&mut buffer).unwrap() {
            events.push(event);
        }

        let (preamble, parts, done) = collect(&events);
        assert!(preamble.is_empty());
        assert!(done);
        assert_eq!(parts[0], (vec![("A".to_string(), "1".to_string())], b"first".to_vec()));
        // a part without headers
        assert_eq!(parts[1], (vec![], b"second".to_vec()));
    }

    #[test]
    fn test_epilogue_is_ignored() {
        let mut scanner = MultipartScanner::new("b");
        let mut buffer = BytesMut::new();
        let mut events = vec![];
        for piece in [&b"--b\r\n\r\nx\r\n--b--"[..], &b"\r\n--b\r\nmore"[..]] {
            buffer.extend_from_slice(piece);
            while let Some(event) = scanner.decode(&mut buffer).unwrap() {
                events.push(event);
            }
        }

        assert_eq!(events.last(), Some(&MultipartEvent::Done));
        assert_eq!(events.iter().filter(|e| matches!(e, MultipartEvent::Part { .. })).count(), 1);
        assert!(scanner.is_done());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unterminated_part_headers() {
        let mut scanner = MultipartScanner::new("b");
        let mut buffer = BytesMut::from(&b"--b\r\nA: 1\r\n--b--"[..]);
        let result = loop {
            match scanner.decode(&mut buffer) {
                Ok(Some(_)) => continue,
                other => break other,
            }
        };
        assert!(matches!(result, Err(ParseError::InvalidMultipart { .. })));
    }

    #[test]
    fn test_overlap() {
        assert_eq!(overlap(b"data\r\n--b", b"\r\n", b"--bo"), 5);
        assert_eq!(overlap(b"data\r", b"\r\n", b"--bo"), 1);
        assert_eq!(overlap(b"data", b"\n", b"--bo"), 0);
    }
}
