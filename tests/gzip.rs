//! End-to-end tests driving the full Layer/Service stack by manual polling.

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode, header};
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use regex::Regex;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::io::{self, Read, Write};
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use tower::{Layer, Service};
use tower_gzip::{
    CompressionBody, CompressionLayer, CompressionObserver, CompressionService, DecompressionBody,
};

struct TestBody {
    frames: VecDeque<Frame<Bytes>>,
}

impl TestBody {
    fn new(frames: Vec<Frame<Bytes>>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::new(vec![Frame::data(data.into())])
    }

    fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Body for TestBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.frames.pop_front() {
            Some(frame) => Poll::Ready(Some(Ok(frame))),
            None => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Service adapter turning a closure into an inner handler.
struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F> {
    fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, ReqBody> Service<Request<ReqBody>> for HandlerFn<F>
where
    F: FnMut(Request<ReqBody>) -> Response<TestBody>,
{
    type Response = Response<TestBody>;
    type Error = Infallible;
    type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        std::future::ready(Ok((self.f)(req)))
    }
}

fn service<F>(
    layer: CompressionLayer,
    handler: F,
) -> CompressionService<HandlerFn<F>>
where
    F: FnMut(Request<DecompressionBody<TestBody>>) -> Response<TestBody>,
{
    layer.layer(HandlerFn::new(handler))
}

fn call<F>(
    svc: &mut CompressionService<HandlerFn<F>>,
    req: Request<TestBody>,
) -> Response<CompressionBody<TestBody>>
where
    F: FnMut(Request<DecompressionBody<TestBody>>) -> Response<TestBody>,
{
    let waker = Waker::noop();
    let mut cx = Context::from_waker(waker);
    let mut future = pin!(svc.call(req));
    for _ in 0..64 {
        if let Poll::Ready(result) = future.as_mut().poll(&mut cx) {
            return result.unwrap();
        }
    }
    panic!("service future did not resolve");
}

fn read_body<B>(body: B) -> io::Result<(Vec<u8>, Option<HeaderMap>)>
where
    B: Body<Data = Bytes, Error = io::Error>,
{
    let waker = Waker::noop();
    let mut cx = Context::from_waker(waker);
    let mut future = pin!(body.collect());
    for _ in 0..64 {
        if let Poll::Ready(result) = future.as_mut().poll(&mut cx) {
            let collected = result?;
            let trailers = collected.trailers().cloned();
            return Ok((collected.to_bytes().to_vec(), trailers));
        }
    }
    panic!("body did not resolve in a synchronous test");
}

fn response_bytes(response: Response<CompressionBody<TestBody>>) -> (http::response::Parts, Vec<u8>) {
    let (parts, body) = response.into_parts();
    let (data, _) = read_body(body).unwrap();
    (parts, data)
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .unwrap();
    out
}

fn get(uri: &str, headers: &[(&str, &str)]) -> Request<TestBody> {
    request(uri, headers, TestBody::empty())
}

fn request(uri: &str, headers: &[(&str, &str)], body: TestBody) -> Request<TestBody> {
    let mut builder = Request::builder().uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(body).unwrap()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<TestBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(TestBody::from_bytes(body))
        .unwrap()
}

#[test]
fn hello_world_is_compressed() {
    let mut svc = service(CompressionLayer::new(), |_req| {
        text_response(StatusCode::OK, "hello, world! hello, world!")
    });
    let response = call(&mut svc, get("/hello", &[("accept-encoding", "gzip")]));

    assert_eq!(response.status(), StatusCode::OK);
    let (parts, data) = response_bytes(response);
    assert_eq!(parts.headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
    assert_eq!(parts.headers.get(header::VARY).unwrap(), "accept-encoding");
    assert!(parts.headers.get(header::CONTENT_LENGTH).is_none());
    assert_eq!(gunzip(&data), b"hello, world! hello, world!");
}

#[test]
fn not_found_is_untouched() {
    let mut svc = service(CompressionLayer::new(), |_req| {
        text_response(StatusCode::NOT_FOUND, "no such page")
    });
    let response = call(&mut svc, get("/missing", &[("accept-encoding", "gzip")]));

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let (parts, data) = response_bytes(response);
    assert!(parts.headers.get(header::CONTENT_ENCODING).is_none());
    assert!(parts.headers.get(header::VARY).is_none());
    assert_eq!(data, b"no such page");
}

#[test]
fn no_accept_encoding_passes_through() {
    let mut svc = service(CompressionLayer::new(), |_req| {
        text_response(StatusCode::OK, "identity please")
    });
    let response = call(&mut svc, get("/hello", &[]));

    let (parts, data) = response_bytes(response);
    assert!(parts.headers.get(header::CONTENT_ENCODING).is_none());
    assert_eq!(data, b"identity please");
}

#[test]
fn gzip_rejected_by_quality_passes_through() {
    let mut svc = service(CompressionLayer::new(), |_req| {
        text_response(StatusCode::OK, "identity please")
    });
    let response = call(&mut svc, get("/hello", &[("accept-encoding", "gzip;q=0")]));

    let (parts, data) = response_bytes(response);
    assert!(parts.headers.get(header::CONTENT_ENCODING).is_none());
    assert_eq!(data, b"identity please");
}

#[test]
fn excluded_paths_pass_through() {
    let layer = CompressionLayer::new()
        .excluded_paths(["/internal/"])
        .excluded_path_regexes([Regex::new(r"\.raw$").unwrap()]);
    let mut svc = service(layer, |_req| text_response(StatusCode::OK, "static bytes"));

    for uri in ["/img/logo.png", "/internal/status", "/dump.raw"] {
        let response = call(&mut svc, get(uri, &[("accept-encoding", "gzip")]));
        let (parts, data) = response_bytes(response);
        assert!(
            parts.headers.get(header::CONTENT_ENCODING).is_none(),
            "{uri} must not be compressed"
        );
        assert_eq!(data, b"static bytes");
    }
}

#[test]
fn upgrade_request_passes_through() {
    let mut svc = service(CompressionLayer::new(), |_req| {
        text_response(StatusCode::OK, "switching soon")
    });
    let response = call(
        &mut svc,
        get(
            "/ws",
            &[("accept-encoding", "gzip"), ("connection", "Upgrade")],
        ),
    );

    let (parts, data) = response_bytes(response);
    assert!(parts.headers.get(header::CONTENT_ENCODING).is_none());
    assert_eq!(data, b"switching soon");
}

#[test]
fn custom_predicate_vetoes_compression() {
    let layer = CompressionLayer::new().compress_when(|view| view.uri.path() != "/opt-out");
    let mut svc = service(layer, |_req| text_response(StatusCode::OK, "your choice"));

    let response = call(&mut svc, get("/opt-out", &[("accept-encoding", "gzip")]));
    let (parts, _) = response_bytes(response);
    assert!(parts.headers.get(header::CONTENT_ENCODING).is_none());

    let response = call(&mut svc, get("/opt-in", &[("accept-encoding", "gzip")]));
    let (parts, data) = response_bytes(response);
    assert_eq!(parts.headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
    assert_eq!(gunzip(&data), b"your choice");
}

#[test]
fn upstream_gzip_body_is_not_recompressed() {
    let fixture = gzip(b"already compressed upstream");
    let body_fixture = fixture.clone();
    let mut svc = service(CompressionLayer::new(), move |_req| {
        Response::builder()
            .header(header::CONTENT_ENCODING, "gzip")
            .body(TestBody::from_bytes(body_fixture.clone()))
            .unwrap()
    });
    let response = call(&mut svc, get("/pre", &[("accept-encoding", "gzip")]));

    let (parts, data) = response_bytes(response);
    assert_eq!(parts.headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
    // Byte-identical: decoding once must yield the plaintext.
    assert_eq!(data, fixture);
    assert_eq!(gunzip(&data), b"already compressed upstream");
}

#[test]
fn upstream_gzip_claim_without_magic_is_compressed_once() {
    let mut svc = service(CompressionLayer::new(), |_req| {
        Response::builder()
            .header(header::CONTENT_ENCODING, "gzip")
            .body(TestBody::from_bytes("plain bytes despite the header"))
            .unwrap()
    });
    let response = call(&mut svc, get("/liar", &[("accept-encoding", "gzip")]));

    let (parts, data) = response_bytes(response);
    assert_eq!(parts.headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
    assert_eq!(gunzip(&data), b"plain bytes despite the header");
}

#[test]
fn upstream_foreign_encoding_passes_through() {
    let mut svc = service(CompressionLayer::new(), |_req| {
        Response::builder()
            .header(header::CONTENT_ENCODING, "br")
            .body(TestBody::from_bytes("brotli bytes"))
            .unwrap()
    });
    let response = call(&mut svc, get("/br", &[("accept-encoding", "gzip")]));

    let (parts, data) = response_bytes(response);
    assert_eq!(parts.headers.get(header::CONTENT_ENCODING).unwrap(), "br");
    assert_eq!(data, b"brotli bytes");
}

#[test]
fn short_body_of_unknown_length_stays_plain_and_gains_length() {
    let mut svc = service(CompressionLayer::new().min_length(100), |_req| {
        Response::new(TestBody::new(vec![
            Frame::data(Bytes::from("ti")),
            Frame::data(Bytes::from("ny")),
        ]))
    });
    let response = call(&mut svc, get("/tiny", &[("accept-encoding", "gzip")]));

    let (parts, data) = response_bytes(response);
    assert!(parts.headers.get(header::CONTENT_ENCODING).is_none());
    assert_eq!(parts.headers.get(header::CONTENT_LENGTH).unwrap(), "4");
    assert_eq!(data, b"tiny");
}

#[test]
fn body_crossing_threshold_is_compressed_streaming() {
    let mut svc = service(CompressionLayer::new().min_length(10), |_req| {
        Response::new(TestBody::new(vec![
            Frame::data(Bytes::from("0123456789")),
            Frame::data(Bytes::from("abc")),
        ]))
    });
    let response = call(&mut svc, get("/grow", &[("accept-encoding", "gzip")]));

    let (parts, data) = response_bytes(response);
    assert_eq!(parts.headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
    assert!(parts.headers.get(header::CONTENT_LENGTH).is_none());
    assert_eq!(gunzip(&data), b"0123456789abc");
}

#[test]
fn declared_short_length_skips_buffering() {
    let mut svc = service(CompressionLayer::new().min_length(100), |_req| {
        Response::builder()
            .header(header::CONTENT_LENGTH, "5")
            .body(TestBody::from_bytes("small"))
            .unwrap()
    });
    let response = call(&mut svc, get("/small", &[("accept-encoding", "gzip")]));

    let (parts, data) = response_bytes(response);
    assert!(parts.headers.get(header::CONTENT_ENCODING).is_none());
    assert_eq!(parts.headers.get(header::CONTENT_LENGTH).unwrap(), "5");
    assert_eq!(data, b"small");
}

#[test]
fn whole_body_buffered_at_threshold_gets_exact_length() {
    let mut svc = service(CompressionLayer::new().min_length(5), |_req| {
        Response::new(TestBody::from_bytes("exactly buffered"))
    });
    let response = call(&mut svc, get("/whole", &[("accept-encoding", "gzip")]));

    let (parts, data) = response_bytes(response);
    assert_eq!(parts.headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
    assert_eq!(gunzip(&data), b"exactly buffered");
    let declared: usize = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(declared, data.len());
}

#[test]
fn empty_body_under_min_length_is_untouched() {
    let mut svc = service(CompressionLayer::new().min_length(10), |_req| {
        Response::new(TestBody::empty())
    });
    let response = call(&mut svc, get("/empty", &[("accept-encoding", "gzip")]));

    let (parts, data) = response_bytes(response);
    assert!(parts.headers.get(header::CONTENT_ENCODING).is_none());
    assert!(parts.headers.get(header::CONTENT_LENGTH).is_none());
    assert!(data.is_empty());
}

#[test]
fn vary_is_appended_to_existing_values() {
    let mut svc = service(CompressionLayer::new(), |_req| {
        Response::builder()
            .header(header::VARY, "Origin")
            .body(TestBody::from_bytes("varied"))
            .unwrap()
    });
    let response = call(&mut svc, get("/vary", &[("accept-encoding", "gzip")]));

    let vary: Vec<_> = response
        .headers()
        .get_all(header::VARY)
        .iter()
        .map(|v| v.to_str().unwrap().to_owned())
        .collect();
    assert_eq!(vary, vec!["Origin", "accept-encoding"]);
}

#[test]
fn strong_etag_is_weakened() {
    let mut svc = service(CompressionLayer::new(), |_req| {
        Response::builder()
            .header(header::ETAG, "\"v1\"")
            .body(TestBody::from_bytes("tagged"))
            .unwrap()
    });
    let response = call(&mut svc, get("/etag", &[("accept-encoding", "gzip")]));
    assert_eq!(response.headers().get(header::ETAG).unwrap(), "W/\"v1\"");
}

#[test]
fn gzip_request_body_is_decoded_and_headers_stripped() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();
    let layer = CompressionLayer::new().decompress_requests(true);
    let mut svc = service(layer, move |req: Request<DecompressionBody<TestBody>>| {
        assert!(req.headers().get(header::CONTENT_ENCODING).is_none());
        assert!(req.headers().get(header::CONTENT_LENGTH).is_none());
        let (_, body) = req.into_parts();
        let (data, _) = read_body(body).unwrap();
        *seen_in_handler.lock().unwrap() = data;
        text_response(StatusCode::OK, "received")
    });

    let compressed = gzip(b"request payload");
    let length = compressed.len().to_string();
    let response = call(
        &mut svc,
        request(
            "/upload",
            &[("content-encoding", "gzip"), ("content-length", &length)],
            TestBody::from_bytes(compressed),
        ),
    );

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(*seen.lock().unwrap(), b"request payload");
}

#[test]
fn chained_gzip_request_body_is_decoded() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();
    let layer = CompressionLayer::new().decompress_requests(true);
    let mut svc = service(layer, move |req: Request<DecompressionBody<TestBody>>| {
        let (_, body) = req.into_parts();
        let (data, _) = read_body(body).unwrap();
        *seen_in_handler.lock().unwrap() = data;
        text_response(StatusCode::OK, "received")
    });

    let double = gzip(&gzip(b"twice wrapped"));
    let response = call(
        &mut svc,
        request(
            "/upload",
            &[("content-encoding", "gzip, gzip")],
            TestBody::from_bytes(double),
        ),
    );

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(*seen.lock().unwrap(), b"twice wrapped");
}

#[test]
fn unsupported_request_encoding_is_rejected_before_the_handler() {
    let handler_ran = Arc::new(AtomicBool::new(false));
    let flag = handler_ran.clone();
    let layer = CompressionLayer::new().decompress_requests(true);
    let mut svc = service(layer, move |_req| {
        flag.store(true, Ordering::SeqCst);
        text_response(StatusCode::OK, "should not run")
    });

    let response = call(
        &mut svc,
        request(
            "/upload",
            &[("content-encoding", "deflate")],
            TestBody::from_bytes("x"),
        ),
    );

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(
        response.headers().get(header::ACCEPT_ENCODING).unwrap(),
        "gzip"
    );
    assert!(!handler_ran.load(Ordering::SeqCst));
    let (_, data) = response_bytes(response);
    assert!(data.is_empty());
}

#[test]
fn malformed_request_body_fails_at_read_time() {
    let layer = CompressionLayer::new().decompress_requests(true);
    let mut svc = service(layer, |req: Request<DecompressionBody<TestBody>>| {
        let (_, body) = req.into_parts();
        match read_body(body) {
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                text_response(StatusCode::BAD_REQUEST, "bad gzip")
            }
            other => panic!("expected InvalidData, got {other:?}"),
        }
    });

    let response = call(
        &mut svc,
        request(
            "/upload",
            &[("content-encoding", "gzip")],
            TestBody::from_bytes("definitely not gzip"),
        ),
    );
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[test]
fn decompress_only_never_compresses_responses() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();
    let mut svc = service(
        CompressionLayer::new().decompress_only(),
        move |req: Request<DecompressionBody<TestBody>>| {
            let (_, body) = req.into_parts();
            let (data, _) = read_body(body).unwrap();
            *seen_in_handler.lock().unwrap() = data;
            text_response(StatusCode::OK, "plain response body")
        },
    );

    let response = call(
        &mut svc,
        request(
            "/upload",
            &[("accept-encoding", "gzip"), ("content-encoding", "gzip")],
            TestBody::from_bytes(gzip(b"uploaded")),
        ),
    );

    let (parts, data) = response_bytes(response);
    assert!(parts.headers.get(header::CONTENT_ENCODING).is_none());
    assert_eq!(data, b"plain response body");
    assert_eq!(*seen.lock().unwrap(), b"uploaded");
}

#[test]
fn observer_is_notified_with_byte_counts() {
    #[derive(Default)]
    struct Counts {
        compressed_in: AtomicU64,
        compressed_out: AtomicU64,
        decompressed_out: AtomicU64,
        passthrough: AtomicU64,
    }

    impl CompressionObserver for Counts {
        fn on_response_compressed(&self, bytes_in: u64, bytes_out: u64) {
            self.compressed_in.store(bytes_in, Ordering::SeqCst);
            self.compressed_out.store(bytes_out, Ordering::SeqCst);
        }

        fn on_response_passthrough(&self) {
            self.passthrough.fetch_add(1, Ordering::SeqCst);
        }

        fn on_request_decompressed(&self, _bytes_in: u64, bytes_out: u64) {
            self.decompressed_out.store(bytes_out, Ordering::SeqCst);
        }
    }

    let counts = Arc::new(Counts::default());
    let layer = CompressionLayer::new()
        .decompress_requests(true)
        .observer(counts.clone());
    let mut svc = service(layer, |req: Request<DecompressionBody<TestBody>>| {
        let (_, body) = req.into_parts();
        read_body(body).unwrap();
        text_response(StatusCode::OK, "a response worth compressing")
    });

    let response = call(
        &mut svc,
        request(
            "/upload",
            &[("accept-encoding", "gzip"), ("content-encoding", "gzip")],
            TestBody::from_bytes(gzip(b"uploaded payload")),
        ),
    );
    let (_, data) = response_bytes(response);

    assert_eq!(
        counts.compressed_in.load(Ordering::SeqCst),
        "a response worth compressing".len() as u64
    );
    assert_eq!(counts.compressed_out.load(Ordering::SeqCst), data.len() as u64);
    assert_eq!(
        counts.decompressed_out.load(Ordering::SeqCst),
        "uploaded payload".len() as u64
    );
    assert_eq!(counts.passthrough.load(Ordering::SeqCst), 0);

    // A request that cannot accept gzip counts as a pass-through.
    let response = call(&mut svc, get("/plain", &[]));
    response_bytes(response);
    assert_eq!(counts.passthrough.load(Ordering::SeqCst), 1);
}

#[test]
fn trailers_survive_compression() {
    let mut svc = service(CompressionLayer::new(), |_req| {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc123".parse().unwrap());
        Response::new(TestBody::new(vec![
            Frame::data(Bytes::from("body with trailers")),
            Frame::trailers(trailers),
        ]))
    });
    let response = call(&mut svc, get("/trailers", &[("accept-encoding", "gzip")]));

    let (parts, body) = response.into_parts();
    assert_eq!(parts.headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
    let (data, trailers) = read_body(body).unwrap();
    assert_eq!(gunzip(&data), b"body with trailers");
    assert_eq!(trailers.unwrap().get("x-checksum").unwrap(), "abc123");
}
