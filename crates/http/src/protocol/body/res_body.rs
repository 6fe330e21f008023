use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of a [`Response`](crate::protocol::Response).
#[derive(Clone, Default)]
pub enum Body {
    /// No body at all
    #[default]
    Empty,
    /// An in-memory body, sent with `Content-Length`
    Full(Bytes),
    /// A streamed body, sent with its declared `Content-Length` or chunked
    Stream(BodyStream),
}

/// A streaming body producer.
///
/// Clones share the same producer, the first one to [`take`](Self::take) it
/// streams it. A response with a streamed body can therefore be sent once.
#[derive(Clone)]
pub struct BodyStream {
    inner: Arc<Mutex<Option<UnsyncBoxBody<Bytes, BoxError>>>>,
}

impl BodyStream {
    pub fn from_body<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let body = body.map_err(|e| -> BoxError { e.into() }).boxed_unsync();
        Self { inner: Arc::new(Mutex::new(Some(body))) }
    }

    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::from_body(StreamBody::new(stream.map_ok(Frame::data).map_err(|e| -> BoxError { e.into() })))
    }

    /// Takes the producer out, `None` if it was already taken.
    pub fn take(&self) -> Option<UnsyncBoxBody<Bytes, BoxError>> {
        match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream").finish_non_exhaustive()
    }
}

impl Body {
    pub fn stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Body::Stream(BodyStream::from_stream(stream))
    }

    pub fn from_body<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Body::Stream(BodyStream::from_body(body))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Full(bytes) => bytes.is_empty(),
            Body::Stream(_) => false,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    /// Length of an in-memory body.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::Stream(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Full(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Body::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Full(bytes)
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Full(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Full(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Full(Bytes::from(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_is_taken_once() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))];
        let body = Body::stream(futures::stream::iter(chunks));
        let copy = body.clone();

        let Body::Stream(stream) = body else { panic!("expected a stream body") };
        let collected = stream.take().unwrap().collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"ab"));

        let Body::Stream(stream) = copy else { panic!("expected a stream body") };
        assert!(stream.take().is_none());
    }

    #[test]
    fn test_lengths() {
        assert_eq!(Body::from("hello").len(), Some(5));
        assert_eq!(Body::Empty.len(), Some(0));
        assert!(Body::from(String::new()).is_empty());
    }
}
