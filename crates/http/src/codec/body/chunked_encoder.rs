//! Encoder implementation for HTTP chunked transfer encoding.
//!
//! Writes are coalesced until at least `min_chunk` bytes are pending (0 disables
//! coalescing). The end of the payload always flushes what is buffered, then writes
//! the terminal chunk followed by the registered trailers.

use crate::codec::header::FastWrite;
use crate::protocol::headers::put_title_case;
use crate::protocol::{PayloadItem, SendError};
use bytes::{Buf, BufMut, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use tokio_util::codec::Encoder;
use tracing::trace;

/// Callback fired before every emitted chunk with its payload, its extension and
/// the trailers that will close the body. The terminal chunk reports an empty payload.
pub type ChunkObserver = Arc<dyn Fn(&[u8], &str, &mut HeaderMap) + Send + Sync>;

#[derive(Clone)]
pub struct ChunkedEncoder {
    eof: bool,
    min_chunk: usize,
    buffer: BytesMut,
    extension: Option<String>,
    trailers: HeaderMap,
    observer: Option<ChunkObserver>,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self::with_min_chunk(0)
    }

    pub fn with_min_chunk(min_chunk: usize) -> Self {
        Self {
            eof: false,
            min_chunk,
            buffer: BytesMut::new(),
            extension: None,
            trailers: HeaderMap::new(),
            observer: None,
        }
    }

    pub fn min_chunk(&self) -> usize {
        self.min_chunk
    }

    pub fn set_min_chunk(&mut self, min_chunk: usize) {
        self.min_chunk = min_chunk;
    }

    /// Attaches an extension to the next emitted chunk only.
    ///
    /// Line breaks are stripped so the extension can't end the size line early.
    pub fn set_extension(&mut self, extension: impl AsRef<str>) {
        let extension: String = extension.as_ref().chars().filter(|c| *c != '\r' && *c != '\n').collect();
        self.extension = Some(extension);
    }

    pub fn set_observer(&mut self, observer: ChunkObserver) {
        self.observer = Some(observer);
    }

    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    pub fn trailers_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailers
    }

    pub fn append_trailer(&mut self, name: HeaderName, value: HeaderValue) {
        self.trailers.append(name, value);
    }

    pub fn append_trailers(&mut self, trailers: &HeaderMap) {
        for (name, value) in trailers.iter() {
            self.trailers.append(name.clone(), value.clone());
        }
    }

    pub fn is_finish(&self) -> bool {
        self.eof
    }

    fn emit(&mut self, data: &[u8], dst: &mut BytesMut) -> Result<(), SendError> {
        let extension = self.extension.take().unwrap_or_default();
        if let Some(observer) = &self.observer {
            observer(data, &extension, &mut self.trailers);
        }

        dst.reserve(data.len() + extension.len() + 16);
        if extension.is_empty() {
            write!(FastWrite(dst), "{:x}\r\n", data.len())?;
        } else {
            write!(FastWrite(dst), "{:x};{}\r\n", data.len(), extension)?;
        }

        if !data.is_empty() {
            dst.put_slice(data);
            dst.put_slice(b"\r\n");
        }
        Ok(())
    }
}

impl Default for ChunkedEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChunkedEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedEncoder")
            .field("eof", &self.eof)
            .field("min_chunk", &self.min_chunk)
            .field("buffered", &self.buffer.len())
            .field("extension", &self.extension)
            .field("trailers", &self.trailers)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for ChunkedEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Ok(());
        }

        match item {
            PayloadItem::Chunk(mut bytes) => {
                // an empty chunk on the wire would end the body
                if !bytes.has_remaining() {
                    return Ok(());
                }

                while bytes.has_remaining() {
                    let chunk = bytes.chunk();
                    let len = chunk.len();
                    self.buffer.extend_from_slice(chunk);
                    bytes.advance(len);
                }

                if self.buffer.len() >= self.min_chunk {
                    let data = self.buffer.split();
                    trace!(size = data.len(), "emit chunk");
                    self.emit(&data, dst)?;
                }
                Ok(())
            }
            PayloadItem::Eof => {
                if !self.buffer.is_empty() {
                    let data = self.buffer.split();
                    self.emit(&data, dst)?;
                }

                self.eof = true;
                self.emit(&[], dst)?;
                for (name, value) in self.trailers.iter() {
                    put_title_case(dst, name.as_str().as_bytes());
                    dst.put_slice(b": ");
                    dst.put_slice(value.as_bytes());
                    dst.put_slice(b"\r\n");
                }
                dst.put_slice(b"\r\n");
                trace!(trailers = self.trailers.len(), "finished chunked body");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::body::chunked_decoder::{ChunkEvent, ChunkedDecoder};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::codec::Decoder;

    fn encode_all(encoder: &mut ChunkedEncoder, writes: &[&[u8]]) -> BytesMut {
        let mut dst = BytesMut::new();
        for write in writes {
            encoder.encode(PayloadItem::Chunk(Bytes::copy_from_slice(write)), &mut dst).unwrap();
        }
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();
        dst
    }

    fn decode_events(input: &[u8], split: usize) -> Vec<ChunkEvent> {
        let mut decoder = ChunkedDecoder::new();
        let mut buffer = BytesMut::new();
        let mut events = vec![];
        for piece in [&input[..split], &input[split..]] {
            buffer.extend_from_slice(piece);
            while let Some(event) = decoder.decode(&mut buffer).unwrap() {
                events.push(event);
            }
        }
        events
    }

    fn data_of(events: &[ChunkEvent]) -> Vec<u8> {
        events
            .iter()
            .flat_map(|e| match e {
                ChunkEvent::Data { data, .. } => data.to_vec(),
                _ => vec![],
            })
            .collect()
    }

    #[test]
    fn test_wire_format() {
        let mut encoder = ChunkedEncoder::new();
        let dst = encode_all(&mut encoder, &[b"hello", b"0123456789abcdefg"]);
        assert_eq!(&dst[..], b"5\r\nhello\r\n11\r\n0123456789abcdefg\r\n0\r\n\r\n");
        assert!(encoder.is_finish());
    }

    #[test]
    fn test_coalesce_until_min_chunk() {
        let mut encoder = ChunkedEncoder::with_min_chunk(8);
        let dst = encode_all(&mut encoder, &[b"abc", b"def", b"ghi", b"j"]);
        assert_eq!(&dst[..], b"9\r\nabcdefghi\r\n1\r\nj\r\n0\r\n\r\n");
    }

    #[test]
    fn test_extension_is_one_shot() {
        let mut encoder = ChunkedEncoder::new();
        let mut dst = BytesMut::new();
        encoder.set_extension("sig=a\r\nb");
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"ab")), &mut dst).unwrap();
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"cd")), &mut dst).unwrap();
        assert_eq!(&dst[..], b"2;sig=ab\r\nab\r\n2\r\ncd\r\n");
    }

    #[test]
    fn test_trailers_from_observer() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut encoder = ChunkedEncoder::new();
        encoder.append_trailer(HeaderName::from_static("x-static"), HeaderValue::from_static("1"));

        let seen = count.clone();
        encoder.set_observer(Arc::new(move |data, _ext, trailers| {
            let total = seen.fetch_add(data.len(), Ordering::SeqCst) + data.len();
            trailers.insert(HeaderName::from_static("x-count"), HeaderValue::from(total));
        }));

        let dst = encode_all(&mut encoder, &[b"abc", b"de"]);
        assert_eq!(&dst[..], b"3\r\nabc\r\n2\r\nde\r\n0\r\nX-Static: 1\r\nX-Count: 5\r\n\r\n");
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_writes_after_eof_are_ignored() {
        let mut encoder = ChunkedEncoder::new();
        let mut dst = encode_all(&mut encoder, &[b"a"]);
        let len = dst.len();
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"late")), &mut dst).unwrap();
        assert_eq!(dst.len(), len);
    }

    #[test]
    fn test_round_trip_any_split() {
        let writes: [&[u8]; 4] = [b"first write", b"", b"x", &[b'z'; 300]];
        let expected: Vec<u8> = writes.concat();

        let mut encoder = ChunkedEncoder::with_min_chunk(4);
        encoder.append_trailer(HeaderName::from_static("x-done"), HeaderValue::from_static("yes"));
        let encoded = encode_all(&mut encoder, &writes);

        let whole = decode_events(&encoded, encoded.len());
        assert_eq!(data_of(&whole), expected);
        assert_eq!(whole.last(), Some(&ChunkEvent::Done { trailers: Bytes::from_static(b"X-Done: yes"), chunks: 3 }));

        for split in 0..encoded.len() {
            let events = decode_events(&encoded, split);
            assert_eq!(data_of(&events), expected, "split at {split}");
            assert_eq!(events.last(), whole.last(), "split at {split}");
        }
    }
}
