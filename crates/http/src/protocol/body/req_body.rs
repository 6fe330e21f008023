use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use http_body::{Body, Frame, SizeHint};
use tracing::{debug, trace};

use crate::protocol::{ParseError, PayloadItem, PayloadSize};

/// Creates the two ends of a streamed request body.
///
/// The connection keeps the [`ReqBodySender`] and pushes decoded payload items
/// into it while the handler reads the [`ReqBody`]. The channel is bounded, so a
/// slow reader stops the connection from reading more of the socket.
pub fn body_channel(payload_size: PayloadSize) -> (ReqBodySender, ReqBody) {
    let (data_sender, data_receiver) = mpsc::channel(8);
    (
        ReqBodySender { data_sender, eof: false, abandoned: false, skipped: 0 },
        ReqBody { receiver: data_receiver, payload_size, end: false },
    )
}

/// Producer side of a streamed request body, owned by the connection.
#[derive(Debug)]
pub struct ReqBodySender {
    data_sender: mpsc::Sender<Result<PayloadItem, ParseError>>,
    eof: bool,
    abandoned: bool,
    skipped: usize,
}

impl ReqBodySender {
    /// Hands one payload item to the reader, waiting while the channel is full.
    ///
    /// Returns `false` once the reader is gone. The connection keeps calling it so
    /// the rest of the body is still consumed from the wire, the bytes are dropped.
    pub async fn send(&mut self, item: PayloadItem) -> bool {
        if self.eof {
            return false;
        }
        let is_eof = item.is_eof();

        if !self.abandoned {
            if let Some(bytes) = item.as_bytes() {
                trace!(size = bytes.len(), "stream request body chunk");
            }
            if self.data_sender.send(Ok(item)).await.is_err() {
                debug!("request body reader dropped, skip the rest of the body");
                self.abandoned = true;
            }
        } else if let Some(bytes) = item.as_bytes() {
            self.skipped += bytes.len();
        }

        if is_eof {
            self.eof = true;
            if self.skipped > 0 {
                debug!(size = self.skipped, "skip request body");
            }
        }
        !self.abandoned
    }

    /// Reports a decoding error to the reader and closes the channel.
    pub async fn fail(&mut self, error: ParseError) {
        if !self.abandoned && !self.eof {
            let _ = self.data_sender.send(Err(error)).await;
        }
        self.eof = true;
        self.data_sender.close_channel();
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }
}

/// Consumer side of a streamed request body, implementing [`http_body::Body`].
#[derive(Debug)]
pub struct ReqBody {
    receiver: mpsc::Receiver<Result<PayloadItem, ParseError>>,
    payload_size: PayloadSize,
    end: bool,
}

impl Body for ReqBody {
    type Data = Bytes;
    type Error = ParseError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.end {
            return Poll::Ready(None);
        }

        match this.receiver.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(PayloadItem::Chunk(data)))) => Poll::Ready(Some(Ok(Frame::data(data)))),
            Poll::Ready(Some(Ok(PayloadItem::Eof))) => {
                this.end = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.end = true;
                Poll::Ready(Some(Err(e)))
            }
            // the connection went away before the end of the body
            Poll::Ready(None) => {
                this.end = true;
                Poll::Ready(Some(Err(ParseError::invalid_body("request body closed before its end"))))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.end
    }

    fn size_hint(&self) -> SizeHint {
        self.payload_size.into()
    }
}

impl From<PayloadSize> for SizeHint {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(length) => SizeHint::with_exact(length),
            PayloadSize::Chunked | PayloadSize::Tunnel => SizeHint::new(),
            PayloadSize::Empty => SizeHint::with_exact(0),
        }
    }
}
