use crate::body::CompressionBody;
use crate::decompress::{self, DecompressionBody};
use crate::future::ResponseFuture;
use crate::layer::Config;
use crate::predicate;
use http::{Request, Response, header};
use http_body::Body;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

/// A Tower service that gzip-compresses response bodies and, when enabled,
/// decodes gzip-encoded request bodies before the inner service sees them.
#[derive(Clone)]
pub struct CompressionService<S> {
    inner: S,
    config: Arc<Config>,
}

impl<S> CompressionService<S> {
    pub(crate) fn new(inner: S, config: Arc<Config>) -> Self {
        Self { inner, config }
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: fmt::Debug> fmt::Debug for CompressionService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionService")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CompressionService<S>
where
    S: Service<Request<DecompressionBody<ReqBody>>, Response = Response<ResBody>>,
    ReqBody: Body,
    ResBody: Body,
    ResBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<CompressionBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let eligible = !self.config.decompress_only && predicate::should_compress(&req, &self.config);

        let req = if self.config.decompress_requests && !req.body().is_end_stream() {
            match decompress::gzip_chain_len(req.headers()) {
                Ok(0) => req.map(DecompressionBody::identity),
                Ok(layers) => {
                    tracing::trace!(layers, "decoding gzip request body");
                    let (mut parts, body) = req.into_parts();
                    // The inner service sees the decoded representation, for
                    // which both headers are wrong.
                    parts.headers.remove(header::CONTENT_ENCODING);
                    parts.headers.remove(header::CONTENT_LENGTH);
                    let body =
                        DecompressionBody::gzip(body, layers, self.config.observer.clone());
                    Request::from_parts(parts, body)
                }
                Err(err) => {
                    tracing::debug!(error = %err, "rejecting request body encoding");
                    return ResponseFuture::unsupported(self.config.clone());
                }
            }
        } else {
            req.map(DecompressionBody::identity)
        };

        tracing::trace!(eligible, "response compression eligibility");
        ResponseFuture::new(self.inner.call(req), eligible, self.config.clone())
    }
}
