use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use http::header::{self, HeaderValue};
use http::{Method, Version};
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio_util::codec::{Decoder, FramedWrite};
use tracing::{debug, error, info, trace, warn};

use crate::codec::header::allows_body;
use crate::codec::{HeaderFramer, PayloadDecoder, ResponseEncoder};
use crate::connection::{Connection, ConnectionState, ServerSettings};
use crate::filter::FilterFlow;
use crate::handler::{Handler, RouteOutcome};
use crate::protocol::body::{BoxError, ReqBodySender};
use crate::protocol::{
    Body, BodyMode, DateService, HttpError, Message, ParseError, PayloadItem, PayloadSize, Request, Response,
    ResponseHead, SendError, Settled,
};
use crate::utils::contains_token;

/// Initial capacity of the read buffer
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// What the response writer is fed with
type OutMessage = Message<(ResponseHead, PayloadSize), Bytes>;

/// One HTTP/1.x connection, from the first byte to the last.
///
/// `HttpConnection` owns the connection's codecs and drives every exchange:
/// - frames the request head and parses it
/// - runs the filter chain, the router and the handler chain
/// - delivers the request body as the handler asked for it
/// - waits for deferred responses
/// - renders the response and its body, then either waits for the next request
///   or closes
///
/// Requests are served one after the other, the next head is only read once
/// the current response was written.
///
/// # Type Parameters
///
/// * `R`: The async readable stream type
/// * `W`: The async writable stream type
pub struct HttpConnection<R, W> {
    reader: R,
    read_buf: BytesMut,
    framed_write: FramedWrite<W, ResponseEncoder>,
    framer: HeaderFramer,
    conn: Connection,
    settings: Arc<ServerSettings>,
}

impl<R, W> std::fmt::Debug for HttpConnection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection").field("conn", &self.conn).field("buffered", &self.read_buf.len()).finish_non_exhaustive()
    }
}

/// Per-request state, alive until the handler's `on_end`.
#[derive(Default)]
struct Exchange {
    request: Option<Request>,
    handler: Option<Arc<dyn Handler>>,
    response: Option<Response>,
    head_sent: bool,
}

impl Exchange {
    fn end(&mut self) {
        if let (Some(handler), Some(request)) = (self.handler.take(), self.request.as_ref()) {
            handler.on_end(request, self.response.as_ref());
        }
    }
}

/// Result of one read from the transport.
enum Inbound {
    Read,
    Eof,
    /// The connection was closed through a handle or a filter
    Closed,
    /// The keep-alive timer fired
    Expired,
    /// A filter answered the raw data
    Filtered(Response),
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, conn: Connection, settings: Arc<ServerSettings>) -> Self {
        Self {
            reader,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            framed_write: FramedWrite::new(writer, ResponseEncoder::new()),
            framer: HeaderFramer::new(),
            conn,
            settings,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Serves the connection until it closes.
    ///
    /// Returns the error that ended the connection, if any. Filters always get
    /// their `on_conn_close` notification before this returns.
    pub async fn process(mut self) -> Result<(), HttpError> {
        debug!(conn_id = self.conn.id(), remote = ?self.conn.remote_addr(), tls = self.conn.is_tls(), "connection open");

        let mut ex = Exchange::default();
        let result = self.serve(&mut ex).await;
        self.teardown(&mut ex).await;
        result
    }

    async fn serve(&mut self, ex: &mut Exchange) -> Result<(), HttpError> {
        let settings = Arc::clone(&self.settings);
        match settings.filters.run(&mut self.conn, |f, conn| f.on_conn_open(conn)) {
            FilterFlow::Continue => {}
            FilterFlow::Respond(response) => {
                self.respond(ex, None, response, true, true).await?;
                return Ok(());
            }
            FilterFlow::Closed => return Ok(()),
        }

        let mut idle = false;
        loop {
            let head = match self.read_head(ex, idle).await {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(()),
                Err(e) => return self.fail(ex, e).await,
            };

            self.conn.set_state(ConnectionState::Exchange);
            let keep_alive = match self.exchange(ex, head).await {
                Ok(keep_alive) => keep_alive,
                Err(e) => return self.fail(ex, e).await,
            };
            if !keep_alive || self.conn.is_closing() {
                return Ok(());
            }

            ex.end();
            *ex = Exchange::default();
            self.framer.reset();
            self.framed_write.encoder_mut().reset();
            self.conn.set_state(ConnectionState::KeepAliveIdle);
            idle = true;
        }
    }

    /// Reads until a complete request head is framed.
    ///
    /// `None` means the connection is done: closed by the peer, by a handle, by
    /// a filter, or idle for too long.
    async fn read_head(&mut self, ex: &mut Exchange, idle: bool) -> Result<Option<Bytes>, HttpError> {
        loop {
            if let Some(head) = self.framer.decode(&mut self.read_buf)? {
                trace!(conn_id = self.conn.id(), size = head.len(), "framed request head");
                return Ok(Some(head));
            }

            let timeout = (idle && self.read_buf.is_empty()).then_some(self.settings.keep_alive_timeout);
            match self.read_more(timeout).await? {
                Inbound::Read => {}
                Inbound::Eof => {
                    if !self.read_buf.is_empty() {
                        debug!(conn_id = self.conn.id(), "connection closed in the middle of a request head");
                    }
                    return Ok(None);
                }
                Inbound::Closed => return Ok(None),
                Inbound::Expired => {
                    debug!(conn_id = self.conn.id(), "keep-alive timeout, close the connection");
                    return Ok(None);
                }
                Inbound::Filtered(response) => {
                    self.respond(ex, None, response, true, true).await?;
                    return Ok(None);
                }
            }
        }
    }

    /// Reads more bytes into the read buffer and shows them to the filters.
    async fn read_more(&mut self, timeout: Option<Duration>) -> Result<Inbound, HttpError> {
        let token = self.conn.token().clone();
        let before = self.read_buf.len();
        self.read_buf.reserve(READ_BUFFER_SIZE);

        let read = async {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.reader.read_buf(&mut self.read_buf)).await.ok(),
                None => Some(self.reader.read_buf(&mut self.read_buf).await),
            }
        };

        let size = select! {
            biased;
            () = token.cancelled() => return Ok(Inbound::Closed),
            read = read => match read {
                None => return Ok(Inbound::Expired),
                Some(Ok(0)) => return Ok(Inbound::Eof),
                Some(Ok(size)) => size,
                Some(Err(e)) => return Err(HttpError::transport(e)),
            },
        };
        trace!(conn_id = self.conn.id(), size, "read from transport");

        let data = &self.read_buf[before..];
        match self.settings.filters.run(&mut self.conn, |f, conn| f.on_conn_data(conn, data)) {
            FilterFlow::Continue => Ok(Inbound::Read),
            FilterFlow::Respond(response) => Ok(Inbound::Filtered(response)),
            FilterFlow::Closed => Ok(Inbound::Closed),
        }
    }

    /// Runs one exchange. Returns whether the connection stays open for another one.
    async fn exchange(&mut self, ex: &mut Exchange, head: Bytes) -> Result<bool, HttpError> {
        let mut request = Request::from_head(&head)?;
        request.set_addrs(self.conn.local_addr(), self.conn.remote_addr());
        request.set_connection(self.conn.handle());
        info!(
            conn_id = self.conn.id(),
            method = %request.method(),
            path = request.path(),
            version = ?request.version(),
            "receive request"
        );

        let result = self.drive(ex, &mut request).await;
        ex.request = Some(request);
        result
    }

    async fn drive(&mut self, ex: &mut Exchange, req: &mut Request) -> Result<bool, HttpError> {
        let settings = Arc::clone(&self.settings);
        let filters = &settings.filters;
        let declared_body = matches!(req.payload_size(), PayloadSize::Length(_) | PayloadSize::Chunked);

        let flow = filters.run(&mut self.conn, |f, conn| f.on_req_headers(conn, &mut *req));
        if let Some(done) = self.filtered(ex, &mut *req, flow, declared_body).await {
            return done;
        }

        let outcome = settings.router.route(req);
        let flow = filters.run(&mut self.conn, |f, conn| f.on_req_route(conn, &mut *req, &outcome));
        if let Some(done) = self.filtered(ex, &mut *req, flow, declared_body).await {
            return done;
        }

        let mut handler = match outcome {
            RouteOutcome::Handler(handler) => handler,
            terminal => return self.deliver(ex, req, terminal, declared_body).await,
        };
        ex.handler = Some(Arc::clone(&handler));

        // a handler may hand the request over, the new one starts from its header hook
        let max_redirects = settings.max_handler_redirects;
        let mut redirects_left = max_redirects;
        let mut early = None;
        while let Some(outcome) = handler.on_headers(req) {
            if self.conn.is_closing() {
                return Ok(false);
            }
            match outcome {
                RouteOutcome::Handler(next) => {
                    if redirects_left == 0 {
                        return Err(HttpError::redirect_overflow(max_redirects));
                    }
                    redirects_left -= 1;
                    trace!(conn_id = self.conn.id(), hops = max_redirects - redirects_left, "request handed over");
                    handler = next;
                    ex.handler = Some(Arc::clone(&handler));
                }
                outcome => {
                    early = Some(outcome);
                    break;
                }
            }
        }
        if self.conn.is_closing() {
            return Ok(false);
        }

        let flow = filters.run(&mut self.conn, |f, conn| f.after_req_headers(conn, &mut *req, early.as_ref()));
        if let Some(done) = self.filtered(ex, &mut *req, flow, declared_body).await {
            return done;
        }

        // answered before the body was read, the connection can't be reused
        if let Some(outcome) = early {
            return self.deliver(ex, req, outcome, declared_body).await;
        }

        if declared_body {
            if let Some(done) = self.read_body(ex, req, &handler).await? {
                return Ok(done);
            }
        }

        let flow = filters.run(&mut self.conn, |f, conn| f.on_request(conn, &mut *req));
        if let Some(done) = self.filtered(ex, &mut *req, flow, false).await {
            return done;
        }

        let outcome = handler.on_request(req);
        if self.conn.is_closing() {
            return Ok(false);
        }
        self.deliver(ex, req, outcome, false).await
    }

    /// Turns a filter verdict into the end of the exchange, `None` to carry on.
    async fn filtered(
        &mut self,
        ex: &mut Exchange,
        req: &mut Request,
        flow: FilterFlow,
        close: bool,
    ) -> Option<Result<bool, HttpError>> {
        match flow {
            FilterFlow::Continue => None,
            FilterFlow::Respond(response) => Some(self.respond(ex, Some(req), response, close, true).await),
            FilterFlow::Closed => Some(Ok(false)),
        }
    }

    /// Reads the request body and hands it over as the handler asked for.
    ///
    /// Returns `Some` when the exchange ended while reading.
    async fn read_body(
        &mut self,
        ex: &mut Exchange,
        req: &mut Request,
        handler: &Arc<dyn Handler>,
    ) -> Result<Option<bool>, HttpError> {
        let settings = Arc::clone(&self.settings);
        let token = self.conn.token().clone();

        if req.headers().get(header::EXPECT).is_some_and(|v| v.as_bytes().len() >= 4 && &v.as_bytes()[..4] == b"100-") {
            let writer = self.framed_write.get_mut();
            writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.map_err(SendError::io)?;
            writer.flush().await.map_err(SendError::io)?;
            debug!(conn_id = self.conn.id(), "receive expect request header, sent continue response");
        }

        let mode = req.body_mode();
        let mut sender = req.take_body_sender();
        let mut decoder = PayloadDecoder::for_size(req.payload_size());
        let mut buffer = BytesMut::new();

        loop {
            let item = match decoder.decode(&mut self.read_buf) {
                Ok(item) => item,
                Err(e) => {
                    if let Some(sender) = sender.as_mut() {
                        sender.fail(ParseError::invalid_body("malformed request body")).await;
                    }
                    return Err(e.into());
                }
            };

            match item {
                Some(PayloadItem::Chunk(data)) => {
                    if !settings.filters.notify(&mut self.conn, |f, conn| f.on_req_data(conn, &*req, &data)) {
                        return Ok(Some(false));
                    }
                    match mode {
                        BodyMode::Stream => {
                            if let Some(sender) = sender.as_mut() {
                                select! {
                                    biased;
                                    () = token.cancelled() => return Ok(Some(false)),
                                    _ = sender.send(PayloadItem::Chunk(data)) => {}
                                }
                            }
                        }
                        BodyMode::Buffer => buffer.extend_from_slice(&data),
                        BodyMode::Callback => {
                            handler.on_data(req, &data);
                            if self.conn.is_closing() {
                                return Ok(Some(false));
                            }
                        }
                    }
                }
                Some(PayloadItem::Eof) => break,
                None => match self.read_more(None).await? {
                    Inbound::Read => {}
                    Inbound::Eof => {
                        if let Some(sender) = sender.as_mut() {
                            sender.fail(ParseError::invalid_body("connection closed before the body ended")).await;
                        }
                        return Err(ParseError::invalid_body("connection closed before the request body ended").into());
                    }
                    Inbound::Closed | Inbound::Expired => return Ok(Some(false)),
                    Inbound::Filtered(response) => {
                        return self.respond(ex, Some(req), response, true, true).await.map(Some);
                    }
                },
            }
        }

        if let Some(trailers) = decoder.take_trailers() {
            req.parse_trailers(&trailers);
        }

        match mode {
            BodyMode::Stream => {
                if let Some(sender) = sender.as_mut() {
                    select! {
                        biased;
                        () = token.cancelled() => return Ok(Some(false)),
                        _ = sender.send(PayloadItem::Eof) => {}
                    }
                }
            }
            BodyMode::Buffer => req.set_buffered_body(buffer.freeze())?,
            BodyMode::Callback => {}
        }
        Ok(None)
    }

    /// Resolves an outcome into a response and sends it, waiting for deferred ones.
    async fn deliver(
        &mut self,
        ex: &mut Exchange,
        req: &mut Request,
        outcome: RouteOutcome,
        close: bool,
    ) -> Result<bool, HttpError> {
        let settings = Arc::clone(&self.settings);
        let token = self.conn.token().clone();

        let mut outcome = outcome;
        loop {
            outcome = match outcome.into_response() {
                Ok(response) => return self.respond(ex, Some(req), response, close, false).await,
                Err(RouteOutcome::Deferred(deferred)) => {
                    if deferred.is_pending() {
                        trace!(conn_id = self.conn.id(), "wait for deferred response");
                        if !settings.filters.notify(&mut self.conn, |f, conn| f.on_res_promise(conn, Some(&*req), &deferred)) {
                            deferred.cancel();
                            return Ok(false);
                        }
                    }

                    let settled = select! {
                        biased;
                        () = token.cancelled() => None,
                        settled = deferred.settled() => Some(settled),
                    };
                    match settled {
                        Some(Settled::Resolved(next)) => next,
                        Some(Settled::Cancelled) => {
                            debug!(conn_id = self.conn.id(), "deferred response cancelled, close the connection");
                            self.conn.close();
                            return Ok(false);
                        }
                        None => {
                            deferred.cancel();
                            return Ok(false);
                        }
                    }
                }
                Err(_) => return Err(HttpError::contract_violation("a handler is not a response")),
            };
        }
    }

    /// Renders `response` and writes it with its body.
    ///
    /// `close` forces the connection to close afterwards. Returns whether the
    /// connection stays open.
    async fn respond(
        &mut self,
        ex: &mut Exchange,
        mut req: Option<&mut Request>,
        mut response: Response,
        close: bool,
        filtered: bool,
    ) -> Result<bool, HttpError> {
        if self.conn.is_closing() || ex.head_sent {
            return Ok(false);
        }
        let settings = Arc::clone(&self.settings);

        let mut close = close || req.as_deref().is_none_or(|r| !r.is_keep_alive()) || response.is_close();
        let upgrade = !close && response.is_upgrade() && req.as_deref().is_some_and(Request::is_upgrade);
        // a zero keep-alive only rules out reuse, an upgraded connection is never reused
        close = close || (!upgrade && !settings.keep_alive_enabled());
        if upgrade && !response.body().is_stream() {
            return Err(HttpError::contract_violation("an upgraded response needs a stream body"));
        }

        let response_close = response.is_close();
        let headers = response.headers_mut();
        if close {
            if !response_close {
                headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
            }
        } else if !headers.contains_key(header::CONNECTION) {
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            headers.insert(header::HeaderName::from_static("keep-alive"), keep_alive_value(settings.keep_alive_timeout));
        }
        if !settings.server_name.is_empty() && !headers.contains_key(header::SERVER) {
            if let Ok(server) = HeaderValue::from_str(&settings.server_name) {
                headers.insert(header::SERVER, server);
            }
        }
        if let Some(date) = DateService::global().http_date() {
            headers.insert(header::DATE, date);
        }
        if let Some(req) = req.as_deref() {
            response.set_version(req.version());
        }

        if !settings.filters.notify(&mut self.conn, |f, conn| f.on_response(conn, req.as_deref(), &mut response, filtered)) {
            return Ok(false);
        }
        let handler = if filtered { None } else { ex.handler.clone() };
        if let (Some(handler), Some(req)) = (&handler, req.as_deref_mut()) {
            handler.on_response(req, &mut response);
            if self.conn.is_closing() {
                return Ok(false);
            }
        }

        let head_only = req.as_deref().is_some_and(|r| r.method() == Method::HEAD);
        let body = response.take_body();
        let payload_size = if upgrade {
            PayloadSize::Tunnel
        } else if !allows_body(response.status()) {
            PayloadSize::Empty
        } else {
            match &body {
                Body::Empty => PayloadSize::Empty,
                Body::Full(bytes) if bytes.is_empty() => PayloadSize::Empty,
                Body::Full(bytes) => PayloadSize::Length(bytes.len() as u64),
                Body::Stream(_) => match declared_length(&response) {
                    Some(0) => PayloadSize::Empty,
                    Some(length) => PayloadSize::Length(length),
                    None if response.version() == Version::HTTP_10 => {
                        return Err(HttpError::contract_violation("a stream body needs a content-length on HTTP/1.0"));
                    }
                    None => PayloadSize::Chunked,
                },
            }
        };

        info!(conn_id = self.conn.id(), status = %response.status(), ?payload_size, close, "send response");
        let head = response.head();
        ex.head_sent = true;
        let header = Message::<_, Bytes>::Header((head, payload_size));
        if head_only || payload_size.is_empty() {
            self.framed_write.send(header).await?;
            self.framed_write.encoder_mut().reset();
        } else {
            self.framed_write.feed(header).await?;
        }

        if !settings.filters.notify(&mut self.conn, |f, conn| f.after_res_headers(conn, req.as_deref(), &response, filtered)) {
            return Ok(false);
        }
        if let (Some(handler), Some(req)) = (&handler, req.as_deref()) {
            handler.on_response_headers(req, &response);
            if self.conn.is_closing() {
                return Ok(false);
            }
        }

        if upgrade {
            self.conn.set_state(ConnectionState::Upgraded);
            if let Body::Stream(stream) = body {
                let outbound = stream.take().ok_or_else(|| HttpError::contract_violation("stream body was already sent"))?;
                self.tunnel(req.as_deref_mut(), handler.as_ref(), outbound).await?;
            }
            self.framed_write.encoder_mut().reset();
            close = true;
        } else if !head_only && !payload_size.is_empty() {
            self.write_body(body).await?;
        }
        self.flush().await?;

        let notified = settings.filters.notify(&mut self.conn, |f, conn| {
            f.on_res_end(conn, req.as_deref(), &response, close, filtered);
        });
        ex.response = Some(response);
        Ok(notified && !close)
    }

    async fn write_body(&mut self, body: Body) -> Result<(), HttpError> {
        match body {
            Body::Empty => Ok(()),
            Body::Full(bytes) => {
                self.framed_write.feed(Message::<(_, _), Bytes>::Payload(PayloadItem::Chunk(bytes))).await?;
                self.framed_write.feed(Message::<(_, _), Bytes>::Payload(PayloadItem::Eof)).await?;
                Ok(())
            }
            Body::Stream(stream) => {
                let mut body = stream.take().ok_or_else(|| HttpError::contract_violation("stream body was already sent"))?;
                let token = self.conn.token().clone();
                // a body longer than its content-length is cut at the declared length
                while !self.framed_write.encoder().is_finish() {
                    let frame = select! {
                        biased;
                        () = token.cancelled() => return Ok(()),
                        frame = body.frame() => frame,
                    };
                    match frame {
                        Some(Ok(frame)) => match frame.into_data() {
                            Ok(data) if data.is_empty() => {}
                            Ok(data) => self.framed_write.send(Message::<(_, _), Bytes>::Payload(PayloadItem::Chunk(data))).await?,
                            Err(_) => trace!(conn_id = self.conn.id(), "ignore non data frame of response body"),
                        },
                        Some(Err(e)) => return Err(SendError::invalid_body(format!("response body failed: {e}")).into()),
                        None => {
                            self.framed_write.feed(Message::<(_, _), Bytes>::Payload(PayloadItem::Eof)).await?;
                            break;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Pipes an upgraded connection: inbound bytes go to the handler, the response
    /// body goes out unframed. Ends when either side ends.
    async fn tunnel(
        &mut self,
        mut req: Option<&mut Request>,
        handler: Option<&Arc<dyn Handler>>,
        mut outbound: UnsyncBoxBody<Bytes, BoxError>,
    ) -> Result<(), HttpError> {
        debug!(conn_id = self.conn.id(), "connection upgraded");
        let token = self.conn.token().clone();
        let mut sender = req.as_deref_mut().and_then(Request::take_body_sender);
        self.flush().await?;

        // bytes that arrived right behind the request head
        if !self.read_buf.is_empty() {
            let data = self.read_buf.split().freeze();
            self.tunnel_inbound(req.as_deref_mut(), handler, sender.as_mut(), data).await;
        }

        loop {
            select! {
                biased;
                () = token.cancelled() => break,
                frame = outbound.frame() => match frame {
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            self.framed_write.send(Message::<(_, _), Bytes>::Payload(PayloadItem::Chunk(data))).await?;
                        }
                    }
                    Some(Err(e)) => return Err(SendError::invalid_body(format!("upgraded stream failed: {e}")).into()),
                    None => break,
                },
                read = self.reader.read_buf(&mut self.read_buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let data = self.read_buf.split().freeze();
                        self.tunnel_inbound(req.as_deref_mut(), handler, sender.as_mut(), data).await;
                    }
                    Err(e) => return Err(HttpError::transport(e)),
                },
            }
        }

        if let Some(sender) = sender.as_mut() {
            select! {
                biased;
                () = token.cancelled() => {}
                _ = sender.send(PayloadItem::Eof) => {}
            }
        }
        debug!(conn_id = self.conn.id(), "upgraded connection ended");
        Ok(())
    }

    async fn tunnel_inbound(
        &mut self,
        req: Option<&mut Request>,
        handler: Option<&Arc<dyn Handler>>,
        sender: Option<&mut ReqBodySender>,
        data: Bytes,
    ) {
        let Some(req) = req else { return };
        let settings = Arc::clone(&self.settings);
        if !settings.filters.notify(&mut self.conn, |f, conn| f.on_req_data(conn, &*req, &data)) {
            return;
        }

        match (sender, handler) {
            (Some(sender), _) => {
                sender.send(PayloadItem::Chunk(data)).await;
            }
            (None, Some(handler)) => handler.on_data(req, &data),
            (None, None) => trace!(conn_id = self.conn.id(), size = data.len(), "drop upgraded bytes, nobody reads them"),
        }
    }

    /// Ends a failed exchange: a best-effort error response if nothing was sent yet.
    async fn fail(&mut self, ex: &mut Exchange, e: HttpError) -> Result<(), HttpError> {
        error!(conn_id = self.conn.id(), cause = %e, "exchange failed");
        if !ex.head_sent && !self.conn.is_closing() {
            let mut req = ex.request.take();
            let response = Response::new(e.status_code());
            if let Err(send_error) = self.respond(ex, req.as_mut(), response, true, false).await {
                debug!(conn_id = self.conn.id(), cause = %send_error, "can't send error response");
            }
            ex.request = req;
        }
        Err(e)
    }

    async fn flush(&mut self) -> Result<(), SendError> {
        SinkExt::<OutMessage>::flush(&mut self.framed_write).await
    }

    async fn teardown(&mut self, ex: &mut Exchange) {
        if let Err(e) = self.flush().await {
            debug!(conn_id = self.conn.id(), cause = %e, "can't flush before close");
        }
        if let Err(e) = self.framed_write.get_mut().shutdown().await {
            trace!(conn_id = self.conn.id(), cause = %e, "can't shutdown transport");
        }

        if !self.framed_write.encoder().is_finish() {
            warn!(conn_id = self.conn.id(), "connection closed in the middle of a response body");
        }

        self.conn.close();
        ex.end();
        self.settings.filters.close_all(&self.conn, ex.request.as_ref(), ex.response.as_ref());
        debug!(conn_id = self.conn.id(), "connection closed");
    }
}

/// The `Keep-Alive` value for an enabled timeout, at least one second.
fn keep_alive_value(timeout: Duration) -> HeaderValue {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    HeaderValue::from_str(&format!("timeout={}", secs.max(1))).unwrap_or(HeaderValue::from_static("timeout=1"))
}

/// The `Content-Length` a handler declared for a streamed body.
fn declared_length(response: &Response) -> Option<u64> {
    if response.headers().get_all(header::TRANSFER_ENCODING).iter().any(|v| contains_token(v.as_bytes(), "chunked")) {
        return None;
    }
    response.headers().get(header::CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DEFAULT_MAX_HANDLER_REDIRECTS;
    use crate::filter::Filter;
    use crate::handler::handler_fn;
    use crate::protocol::Deferred;
    use crate::router::Router;
    use http::StatusCode;
    use indoc::indoc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    fn start(settings: ServerSettings) -> (DuplexStream, JoinHandle<Result<(), HttpError>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let connection = HttpConnection::new(reader, writer, Connection::new(None, None, false), Arc::new(settings));
        (client, tokio::spawn(connection.process()))
    }

    fn router() -> Router {
        Router::builder()
            .route("/hello", "hi")
            .route("/forbidden", StatusCode::FORBIDDEN)
            .route(
                "/echo",
                RouteOutcome::handler(handler_fn(|req| {
                    let body = req.body().cloned().unwrap_or_default();
                    Response::new(StatusCode::OK).with_body(body).into()
                })),
            )
            .build()
            .unwrap()
    }

    /// Reads one response framed by its `Content-Length`, or everything until EOF.
    async fn read_response(client: &mut DuplexStream) -> String {
        let mut buf = Vec::new();
        loop {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_string();
                let length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .map(|v| v.trim().parse::<usize>().unwrap());
                if let Some(length) = length {
                    if buf.len() >= end + 4 + length {
                        return String::from_utf8(buf.drain(..end + 4 + length).collect()).unwrap();
                    }
                }
            }
            let mut chunk = [0u8; 4096];
            let n = client.read(&mut chunk).await.unwrap();
            if n == 0 {
                return String::from_utf8_lossy(&buf).to_string();
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn test_keep_alive_reuse() {
        let (mut client, task) = start(ServerSettings::new(router()));

        client.write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Connection: keep-alive\r\n"));
        assert!(response.contains("Keep-Alive: timeout=10\r\n"));
        assert!(response.contains("Server: hopper\r\n"));
        assert!(response.contains("Date: "));
        assert!(response.ends_with("\r\n\r\nhi"));

        let request = "POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
        client.write_all(request.as_bytes()).await.unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nhello"));

        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_chunked_request_body() {
        let (mut client, task) = start(ServerSettings::new(router()));

        let request = indoc! {"
            POST /echo HTTP/1.1
            Transfer-Encoding: chunked

            5
            hello
            6
             world
            0

        "};
        client.write_all(request.as_bytes()).await.unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nhello world"));

        let request = concat!(
            "POST /echo HTTP/1.1\r\n",
            "Transfer-Encoding: chunked\r\n",
            "\r\n",
            "3;name=first\r\nabc\r\n",
            "a\r\n0123456789\r\n",
            "0\r\n",
            "X-Checksum: 13\r\n",
            "\r\n",
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nabc0123456789"));

        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_head_sends_headers_only() {
        let (mut client, task) = start(ServerSettings::new(router()));

        client.write_all(b"HEAD /hello HTTP/1.1\r\n\r\nGET /forbidden HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        while !response.contains("403 Forbidden") {
            let mut chunk = [0u8; 4096];
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            response.push_str(&String::from_utf8_lossy(&chunk[..n]));
        }

        let (head, rest) = response.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 2"));
        // the next response follows right after the head
        assert!(rest.starts_with("HTTP/1.1 403 Forbidden\r\n"));

        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_terminal_before_body_closes() {
        let (mut client, task) = start(ServerSettings::new(router()));

        client.write_all(b"POST /forbidden HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc").await.unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(response.contains("Connection: close\r\n"));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_http10_closes() {
        let (mut client, task) = start(ServerSettings::new(router()));

        client.write_all(b"GET /hello HTTP/1.0\r\n\r\n").await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_not_found() {
        let (mut client, task) = start(ServerSettings::new(router()));

        client.write_all(b"GET /missing HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(task.await.unwrap().is_ok());
    }

    struct Bouncer {
        hops: Arc<AtomicUsize>,
    }

    impl Handler for Bouncer {
        fn on_headers(&self, _req: &mut Request) -> Option<RouteOutcome> {
            self.hops.fetch_add(1, Ordering::SeqCst);
            Some(RouteOutcome::handler(Bouncer { hops: self.hops.clone() }))
        }
    }

    #[tokio::test]
    async fn test_redirect_bound() {
        let hops = Arc::new(AtomicUsize::new(0));
        let router = Router::builder().route("/", RouteOutcome::handler(Bouncer { hops: hops.clone() })).build().unwrap();
        let (mut client, task) = start(ServerSettings::new(router));

        client.write_all(b"GET /loop HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        // the first handler plus five hand-overs
        assert_eq!(hops.load(Ordering::SeqCst), DEFAULT_MAX_HANDLER_REDIRECTS + 1);
        assert!(matches!(task.await.unwrap(), Err(HttpError::RedirectOverflow { max: 5 })));
    }

    struct Recorder {
        name: &'static str,
        answer: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Filter for Recorder {
        fn on_req_headers(&self, _conn: &mut Connection, _req: &mut Request) -> Option<Response> {
            self.log.lock().unwrap().push(format!("{}:headers", self.name));
            self.answer.then(|| Response::text(StatusCode::FORBIDDEN, "denied"))
        }

        fn on_response(&self, _conn: &mut Connection, _req: Option<&Request>, _res: &mut Response, filtered: bool) {
            self.log.lock().unwrap().push(format!("{}:response:{filtered}", self.name));
        }

        fn on_conn_close(&self, _conn: &Connection, _req: Option<&Request>, _res: Option<&Response>) {
            self.log.lock().unwrap().push(format!("{}:close", self.name));
        }
    }

    #[tokio::test]
    async fn test_filter_short_circuit() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut settings = ServerSettings::new(router());
        for (name, answer) in [("a", false), ("b", true), ("c", false)] {
            settings = settings.with_filter(Recorder { name, answer, log: log.clone() });
        }
        let (mut client, task) = start(settings);

        client.write_all(b"GET /hello HTTP/1.1\r\n\r\n").await.unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(response.ends_with("denied"));

        drop(client);
        assert!(task.await.unwrap().is_ok());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a:headers",
                "b:headers",
                "a:response:true",
                "b:response:true",
                "c:response:true",
                "a:close",
                "b:close",
                "c:close"
            ]
        );
    }

    #[tokio::test]
    async fn test_header_size_cap() {
        let (mut client, task) = start(ServerSettings::new(router()));

        let mut request = b"GET / HTTP/1.1\r\nX-Long: ".to_vec();
        request.resize(5000, b'a');
        client.write_all(&request).await.unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"));
        assert!(matches!(
            task.await.unwrap(),
            Err(HttpError::RequestError { source: ParseError::TooLargeHeader { .. } })
        ));
    }

    #[tokio::test]
    async fn test_keep_alive_timeout() {
        let settings = ServerSettings::new(router()).with_keep_alive_timeout(Duration::from_millis(50));
        let (mut client, task) = start(settings);

        client.write_all(b"GET /hello HTTP/1.1\r\n\r\n").await.unwrap();
        let response = read_response(&mut client).await;
        assert!(response.contains("Keep-Alive: timeout=1\r\n"));

        // nothing else is sent, the server gives up on the connection
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(task.await.unwrap().is_ok());
    }

    struct Later;

    impl Handler for Later {
        fn on_request(&self, _req: &mut Request) -> RouteOutcome {
            let deferred = Deferred::<RouteOutcome>::new();
            let resolver = deferred.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                resolver.resolve(RouteOutcome::Text("later".to_string()));
            });
            deferred.into()
        }
    }

    struct Never;

    impl Handler for Never {
        fn on_request(&self, _req: &mut Request) -> RouteOutcome {
            let deferred = Deferred::<RouteOutcome>::new();
            deferred.cancel();
            deferred.into()
        }
    }

    #[tokio::test]
    async fn test_deferred_response() {
        let router = Router::builder()
            .route("/later", RouteOutcome::handler(Later))
            .route("/never", RouteOutcome::handler(Never))
            .build()
            .unwrap();
        let (mut client, task) = start(ServerSettings::new(router));

        client.write_all(b"GET /later HTTP/1.1\r\n\r\n").await.unwrap();
        let response = read_response(&mut client).await;
        assert!(response.ends_with("\r\n\r\nlater"));

        // a cancelled response closes the connection without an answer
        client.write_all(b"GET /never HTTP/1.1\r\n\r\n").await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(task.await.unwrap().is_ok());
    }

    fn streamed() -> Response {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"de"))];
        Response::new(StatusCode::OK).with_body(Body::stream(futures::stream::iter(chunks)))
    }

    #[tokio::test]
    async fn test_streamed_response_is_chunked() {
        let router = Router::builder()
            .route("/stream", RouteOutcome::handler(handler_fn(|_| streamed().into())))
            .build()
            .unwrap();
        let (mut client, task) = start(ServerSettings::new(router));

        client.write_all(b"GET /stream HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.contains("Transfer-Encoding: chunked\r\n"));
        assert!(response.ends_with("\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n"));
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_streamed_response_without_length_on_http10() {
        let router = Router::builder()
            .route("/stream", RouteOutcome::handler(handler_fn(|_| streamed().into())))
            .build()
            .unwrap();
        let (mut client, task) = start(ServerSettings::new(router));

        client.write_all(b"GET /stream HTTP/1.0\r\n\r\n").await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.0 500 Internal Server Error\r\n"));
        assert!(matches!(task.await.unwrap(), Err(HttpError::ContractViolation { .. })));
    }

    struct Echo;

    impl Handler for Echo {
        fn on_request(&self, req: &mut Request) -> RouteOutcome {
            let inbound = req.stream_body();
            Response::new(StatusCode::SWITCHING_PROTOCOLS)
                .with_header(header::CONNECTION, HeaderValue::from_static("Upgrade"))
                .with_header(header::UPGRADE, HeaderValue::from_static("echo"))
                .with_body(Body::from_body(inbound))
                .into()
        }
    }

    async fn upgrade_echo(settings: ServerSettings) {
        let (mut client, task) = start(settings);

        client.write_all(b"GET /echo HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n").await.unwrap();
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            client.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Connection: Upgrade\r\n"));
        assert!(!head.contains("Content-Length"));

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    fn echo_router() -> Router {
        Router::builder().route("/echo", RouteOutcome::handler(Echo)).build().unwrap()
    }

    #[tokio::test]
    async fn test_upgrade_tunnel() {
        upgrade_echo(ServerSettings::new(echo_router())).await;
    }

    #[tokio::test]
    async fn test_upgrade_without_keep_alive() {
        upgrade_echo(ServerSettings::new(echo_router()).with_keep_alive_timeout(Duration::ZERO)).await;
    }

    #[test]
    fn test_keep_alive_value() {
        assert_eq!(keep_alive_value(Duration::from_secs(10)), "timeout=10");
        assert_eq!(keep_alive_value(Duration::from_millis(50)), "timeout=1");
        assert_eq!(keep_alive_value(Duration::from_millis(2500)), "timeout=3");
    }
}
