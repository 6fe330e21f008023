use bytes::BytesMut;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use hopper_http::codec::{ChunkedDecoder, HeaderFramer, MultipartScanner, RangeSet};
use hopper_http::connection::{Connection, HttpConnection, ServerSettings};
use hopper_http::router::Router;
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::Decoder;

// Mock IO for testing
#[derive(Clone)]
struct MockIO {
    read_data: Vec<u8>,
    write_data: Vec<u8>,
    read_pos: usize,
}

impl MockIO {
    fn new(read_data: Vec<u8>) -> Self {
        Self { read_data, write_data: Vec::new(), read_pos: 0 }
    }
}

impl AsyncRead for MockIO {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let remaining = &self.read_data[self.read_pos..];
        let amt = std::cmp::min(remaining.len(), buf.remaining());
        buf.put_slice(&remaining[..amt]);
        self.read_pos += amt;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockIO {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        self.write_data.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }
}

fn bench_header_framer(c: &mut Criterion) {
    let request = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\nUser-Agent: bench\r\n\r\n";

    c.bench_function("frame_request_head", |b| {
        b.iter(|| {
            let mut framer = HeaderFramer::new();
            let mut bytes = BytesMut::from(&request[..]);
            black_box(framer.decode(&mut bytes).unwrap());
        });
    });
}

fn bench_chunked_decoder(c: &mut Criterion) {
    let mut body = Vec::new();
    for _ in 0..64 {
        body.extend_from_slice(b"400\r\n");
        body.extend_from_slice(&[b'x'; 0x400]);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b"0\r\nX-Checksum: 42\r\n\r\n");

    c.bench_function("decode_chunked_64k", |b| {
        b.iter(|| {
            let mut decoder = ChunkedDecoder::new();
            let mut bytes = BytesMut::from(&body[..]);
            while let Some(event) = decoder.decode(&mut bytes).unwrap() {
                black_box(event);
            }
        });
    });
}

fn bench_multipart_scanner(c: &mut Criterion) {
    let mut body = Vec::new();
    for index in 0..8 {
        body.extend_from_slice(b"--bench-boundary\r\n");
        body.extend_from_slice(format!("Content-Disposition: form-data; name=\"field{index}\"\r\n\r\n").as_bytes());
        body.extend_from_slice(&[b'y'; 4096]);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b"--bench-boundary--\r\n");

    c.bench_function("scan_multipart_8_parts", |b| {
        b.iter(|| {
            let mut scanner = MultipartScanner::new("bench-boundary");
            let mut bytes = BytesMut::from(&body[..]);
            while let Some(event) = scanner.decode(&mut bytes).unwrap() {
                black_box(event);
            }
        });
    });
}

fn bench_range_parse(c: &mut Criterion) {
    c.bench_function("parse_byte_ranges", |b| {
        b.iter(|| black_box(RangeSet::parse(black_box("bytes=0-99,50-149,-500,1000-"), 10_000).unwrap()));
    });
}

fn bench_http_connection(c: &mut Criterion) {
    let request = b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n";
    let router = Router::builder().route("/hello", "Hello World!").build().unwrap();
    let settings = Arc::new(ServerSettings::new(router));
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

    c.bench_function("process_simple_request", |b| {
        b.to_async(&runtime).iter(|| {
            let mock_io = MockIO::new(request.to_vec());
            let (reader, writer) = (mock_io.clone(), mock_io);
            let connection = HttpConnection::new(reader, writer, Connection::new(None, None, false), settings.clone());
            async move { black_box(connection.process().await.unwrap()) }
        });
    });
}

criterion_group!(
    benches,
    bench_header_framer,
    bench_chunked_decoder,
    bench_multipart_scanner,
    bench_range_parse,
    bench_http_connection
);
criterion_main!(benches);
