use crate::body::{CompressedState, CompressionBody, copy_to_bytes};
use crate::layer::Config;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Response, StatusCode, header};
use http_body::{Body, Frame};
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

pin_project! {
    /// Future for compression service responses.
    ///
    /// Usually resolves as soon as the inner future does, once status and
    /// headers are known. When the compression decision depends on body
    /// bytes it keeps polling the body into a buffer first.
    pub struct ResponseFuture<F, B> {
        #[pin]
        state: FutureState<F, B>,
        eligible: bool,
        config: Arc<Config>,
    }
}

pin_project! {
    #[project = FutureStateProj]
    #[project_replace = FutureStateReplace]
    enum FutureState<F, B> {
        Inner {
            #[pin]
            future: F,
        },
        Sampling {
            sampler: Option<Sampler<B>>,
        },
        // Request carried an undecodable Content-Encoding; the inner
        // service never ran.
        Unsupported,
    }
}

impl<F, B> ResponseFuture<F, B> {
    pub(crate) fn new(future: F, eligible: bool, config: Arc<Config>) -> Self {
        Self {
            state: FutureState::Inner { future },
            eligible,
            config,
        }
    }

    pub(crate) fn unsupported(config: Arc<Config>) -> Self {
        Self {
            state: FutureState::Unsupported,
            eligible: false,
            config,
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Output = Result<Response<CompressionBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        loop {
            match this.state.as_mut().project() {
                FutureStateProj::Unsupported => {
                    return Poll::Ready(Ok(unsupported_response()));
                }

                FutureStateProj::Inner { future } => {
                    let response = ready!(future.poll(cx))?;
                    if !*this.eligible {
                        note_passthrough(this.config);
                        return Poll::Ready(Ok(response.map(CompressionBody::passthrough)));
                    }

                    let (mut parts, body) = response.into_parts();
                    let decision = decide(&parts, this.config.min_length);
                    tracing::trace!(?decision, status = %parts.status, "response compression decision");
                    match decision {
                        Decision::Passthrough => {
                            note_passthrough(this.config);
                            return Poll::Ready(Ok(Response::from_parts(
                                parts,
                                CompressionBody::passthrough(body),
                            )));
                        }
                        Decision::Compress => {
                            apply_compression_headers(&mut parts.headers);
                            let state = CompressedState::new(
                                this.config.pool.acquire(),
                                this.config.observer.clone(),
                            );
                            return Poll::Ready(Ok(Response::from_parts(
                                parts,
                                CompressionBody::compressed(body, state),
                            )));
                        }
                        Decision::Sample { check_magic } => {
                            let sampler = Sampler::new(
                                parts,
                                body,
                                check_magic,
                                this.config.min_length.unwrap_or(0),
                            );
                            this.state.as_mut().project_replace(FutureState::Sampling {
                                sampler: Some(sampler),
                            });
                        }
                    }
                }

                FutureStateProj::Sampling { sampler } => {
                    let Some(mut active) = sampler.take() else {
                        panic!("ResponseFuture polled after completion");
                    };
                    match active.poll_sample(cx) {
                        Poll::Pending => {
                            *sampler = Some(active);
                            return Poll::Pending;
                        }
                        Poll::Ready(verdict) => {
                            return Poll::Ready(Ok(active.resolve(verdict, this.config)));
                        }
                    }
                }
            }
        }
    }
}

fn unsupported_response<B>() -> Response<CompressionBody<B>> {
    let mut response = Response::new(CompressionBody::empty());
    *response.status_mut() = StatusCode::UNSUPPORTED_MEDIA_TYPE;
    response.headers_mut().insert(
        header::ACCEPT_ENCODING,
        header::HeaderValue::from_static("gzip"),
    );
    response
}

/// What to do with a response, decided from its final status and headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Passthrough,
    Compress,
    /// Headers alone were not enough; peek at body bytes first.
    Sample { check_magic: bool },
}

fn decide(parts: &http::response::Parts, min_length: Option<usize>) -> Decision {
    if parts.status.is_client_error() || parts.status.is_server_error() {
        return Decision::Passthrough;
    }

    if let Some(encoding) = parts
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
    {
        let encoding = encoding.trim();
        // An upstream gzip claim is verified against the magic bytes; bodies
        // that turn out to be plain get compressed exactly once.
        if encoding.eq_ignore_ascii_case("gzip") || encoding.eq_ignore_ascii_case("x-gzip") {
            return Decision::Sample { check_magic: true };
        }
        return Decision::Passthrough;
    }

    if parts.headers.contains_key(header::CONTENT_RANGE) {
        return Decision::Passthrough;
    }

    if is_uncompressible_content_type(&parts.headers) {
        return Decision::Passthrough;
    }

    if let Some(min) = min_length {
        match declared_content_length(&parts.headers) {
            Some(len) if len < min => return Decision::Passthrough,
            Some(_) => return Decision::Compress,
            None => return Decision::Sample { check_magic: false },
        }
    }

    Decision::Compress
}

/// Rewrites response headers for a body that will be gzip-compressed.
fn apply_compression_headers(headers: &mut HeaderMap) {
    if !headers.contains_key(header::CONTENT_ENCODING) {
        headers.insert(
            header::CONTENT_ENCODING,
            header::HeaderValue::from_static("gzip"),
        );
    }

    // Compressed size is unknown, and byte ranges no longer line up.
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::ACCEPT_RANGES);

    add_vary_accept_encoding(headers);
    weaken_etag(headers);
}

/// Adds Accept-Encoding to the Vary header if not already covered.
fn add_vary_accept_encoding(headers: &mut HeaderMap) {
    for vary in headers.get_all(header::VARY) {
        if let Ok(vary_str) = vary.to_str() {
            let covered = vary_str.split(',').any(|v| {
                let v = v.trim();
                v == "*" || v.eq_ignore_ascii_case("accept-encoding")
            });
            if covered {
                return;
            }
        }
    }

    headers.append(
        header::VARY,
        header::HeaderValue::from_static("accept-encoding"),
    );
}

/// Turns a strong ETag into a weak one; the compressed representation is no
/// longer byte-identical to what the validator was computed over.
fn weaken_etag(headers: &mut HeaderMap) {
    let Some(etag) = headers.get(header::ETAG).and_then(|v| v.to_str().ok()) else {
        return;
    };
    if etag.starts_with("W/") {
        return;
    }
    if let Ok(weak) = header::HeaderValue::from_str(&format!("W/{etag}")) {
        headers.insert(header::ETAG, weak);
    }
}

/// Checks if the content type should not be compressed.
fn is_uncompressible_content_type(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    // Skip all images except SVG
    if content_type.starts_with("image/") {
        return !content_type.starts_with("image/svg+xml");
    }

    // Event streams must flow one event at a time; a gzip window would
    // hold events back.
    content_type.starts_with("text/event-stream")
}

fn note_passthrough(config: &Config) {
    if let Some(observer) = &config.observer {
        observer.on_response_passthrough();
    }
}

fn declared_content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
}

/// Buffers body bytes until a deferred compression decision can be made.
struct Sampler<B> {
    parts: http::response::Parts,
    body: Option<Pin<Box<B>>>,
    check_magic: bool,
    min_length: usize,
    chunks: VecDeque<Bytes>,
    total: usize,
    trailers: Option<HeaderMap>,
}

#[derive(Debug)]
enum SampleVerdict {
    /// Magic bytes confirmed the upstream gzip claim; forward untouched.
    AlreadyCompressed,
    /// Decision made mid-body; compress the buffer, then keep streaming.
    CompressStreaming,
    /// Body ended while sampling; compress the whole buffer eagerly.
    CompressWhole,
    /// Body ended while sampling and stays uncompressed.
    PassthroughWhole,
    BodyError(io::Error),
}

impl<B> Sampler<B>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn new(parts: http::response::Parts, body: B, check_magic: bool, min_length: usize) -> Self {
        Self {
            parts,
            body: Some(Box::pin(body)),
            check_magic,
            min_length,
            chunks: VecDeque::new(),
            total: 0,
            trailers: None,
        }
    }

    fn poll_sample(&mut self, cx: &mut Context<'_>) -> Poll<SampleVerdict> {
        loop {
            let polled = match self.body.as_mut() {
                Some(body) => body.as_mut().poll_frame(cx),
                None => return Poll::Ready(self.end_verdict()),
            };
            match polled {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => self.body = None,
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(SampleVerdict::BodyError(io::Error::other(e.into())));
                }
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => {
                        let data = copy_to_bytes(data);
                        if data.is_empty() {
                            continue;
                        }
                        self.total += data.len();
                        self.chunks.push_back(data);
                        if self.check_magic {
                            if let Some(is_gzip) = self.leading_magic() {
                                return Poll::Ready(if is_gzip {
                                    SampleVerdict::AlreadyCompressed
                                } else {
                                    SampleVerdict::CompressStreaming
                                });
                            }
                        } else if self.total >= self.min_length {
                            return Poll::Ready(SampleVerdict::CompressStreaming);
                        }
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            self.trailers = Some(trailers);
                        }
                    }
                },
            }
        }
    }

    /// Checks the first two buffered bytes against the gzip magic number,
    /// or `None` when fewer than two bytes have arrived.
    fn leading_magic(&self) -> Option<bool> {
        let first = self.chunks.front()?;
        if first.len() >= 2 {
            return Some(first[0] == 0x1f && first[1] == 0x8b);
        }
        if self.total >= 2 {
            let second = self.chunks.get(1)?.first()?;
            return Some(first[0] == 0x1f && *second == 0x8b);
        }
        None
    }

    fn end_verdict(&self) -> SampleVerdict {
        if self.total == 0 {
            return SampleVerdict::PassthroughWhole;
        }
        if self.check_magic {
            // One lone byte cannot be a gzip stream.
            return SampleVerdict::CompressWhole;
        }
        if self.total >= self.min_length {
            SampleVerdict::CompressWhole
        } else {
            SampleVerdict::PassthroughWhole
        }
    }

    fn resolve(mut self, verdict: SampleVerdict, config: &Config) -> Response<CompressionBody<B>> {
        tracing::trace!(?verdict, buffered = self.total, "deferred compression decision");
        let body = match verdict {
            SampleVerdict::AlreadyCompressed => {
                note_passthrough(config);
                let mut prelude: VecDeque<Frame<Bytes>> =
                    self.chunks.into_iter().map(Frame::data).collect();
                if let Some(trailers) = self.trailers.take() {
                    prelude.push_back(Frame::trailers(trailers));
                }
                CompressionBody::sampled_passthrough(prelude, self.body)
            }

            SampleVerdict::CompressStreaming => {
                apply_compression_headers(&mut self.parts.headers);
                let state = CompressedState::with_prelude(
                    config.pool.acquire(),
                    config.observer.clone(),
                    self.chunks,
                    self.trailers,
                );
                CompressionBody::sampled_compressed(self.body, state)
            }

            SampleVerdict::CompressWhole => {
                apply_compression_headers(&mut self.parts.headers);
                let mut encoder = config.pool.acquire();
                let mut out = BytesMut::new();
                let result = self
                    .chunks
                    .iter()
                    .try_for_each(|chunk| encoder.encode(chunk, &mut out))
                    .and_then(|()| encoder.finish(&mut out));
                match result {
                    Ok(()) => {
                        let out = out.freeze();
                        // The whole compressed payload is in hand, so an
                        // exact Content-Length can go back on.
                        self.parts
                            .headers
                            .insert(header::CONTENT_LENGTH, header::HeaderValue::from(out.len()));
                        if let Some(observer) = &config.observer {
                            observer.on_response_compressed(self.total as u64, out.len() as u64);
                        }
                        CompressionBody::full(Some(Ok(out)), self.trailers)
                    }
                    Err(e) => CompressionBody::full(Some(Err(e)), None),
                }
            }

            SampleVerdict::PassthroughWhole => {
                note_passthrough(config);
                if self.total == 0 {
                    CompressionBody::full(None, self.trailers)
                } else {
                    if !self.parts.headers.contains_key(header::CONTENT_LENGTH) {
                        self.parts.headers.insert(
                            header::CONTENT_LENGTH,
                            header::HeaderValue::from(self.total),
                        );
                    }
                    let mut payload = BytesMut::with_capacity(self.total);
                    for chunk in &self.chunks {
                        payload.extend_from_slice(chunk);
                    }
                    CompressionBody::full(Some(Ok(payload.freeze())), self.trailers)
                }
            }

            SampleVerdict::BodyError(e) => CompressionBody::full(Some(Err(e)), None),
        };

        Response::from_parts(self.parts, body)
    }
}
