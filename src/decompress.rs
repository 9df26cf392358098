use crate::error::DecompressionError;
use crate::observer::CompressionObserver;
use bytes::Bytes;
use flate2::write::GzDecoder;
use http::{HeaderMap, header};
use http_body::{Body, Frame};
use pin_project_lite::pin_project;
use std::io::{self, Write};
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Counts the gzip layers declared by `Content-Encoding`.
///
/// The header is an ordered, comma-separated token list; RFC 7231 allows the
/// same coding to appear more than once. Tokens are trimmed and matched
/// case-insensitively, empty segments are skipped, and any token other than
/// `gzip`/`x-gzip` aborts with [`DecompressionError::UnsupportedEncoding`].
/// Returns `Ok(0)` when the header is absent.
pub(crate) fn gzip_chain_len(headers: &HeaderMap) -> Result<usize, DecompressionError> {
    let mut layers = 0;
    for value in headers.get_all(header::CONTENT_ENCODING) {
        let value = value
            .to_str()
            .map_err(|_| DecompressionError::unsupported("<non-ascii>"))?;
        for token in value.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if token.eq_ignore_ascii_case("gzip") || token.eq_ignore_ascii_case("x-gzip") {
                layers += 1;
            } else {
                return Err(DecompressionError::unsupported(token));
            }
        }
    }
    Ok(layers)
}

pin_project! {
    /// A request body handed to the inner service, either untouched or
    /// decoded through a chain of gzip decoders.
    pub struct DecompressionBody<B> {
        #[pin]
        pub(crate) kind: DecodeKind<B>,
    }
}

pin_project! {
    #[project = DecodeKindProj]
    pub(crate) enum DecodeKind<B> {
        Identity {
            #[pin]
            inner: B,
        },
        Gzip {
            #[pin]
            inner: B,
            state: DecodeState,
        },
    }
}

impl<B> DecompressionBody<B> {
    /// Wraps a body without decoding it.
    pub fn identity(inner: B) -> Self {
        Self {
            kind: DecodeKind::Identity { inner },
        }
    }

    /// Wraps a body in `layers` gzip decoding stages, outermost first.
    pub(crate) fn gzip(
        inner: B,
        layers: usize,
        observer: Option<Arc<dyn CompressionObserver>>,
    ) -> Self {
        Self {
            kind: DecodeKind::Gzip {
                inner,
                state: DecodeState::new(layers, observer),
            },
        }
    }
}

/// Decoding state for a gzip-encoded request body.
pub(crate) struct DecodeState {
    stages: Vec<GzDecoder<Vec<u8>>>,
    pending_trailers: Option<HeaderMap>,
    finished: bool,
    bytes_in: u64,
    bytes_out: u64,
    observer: Option<Arc<dyn CompressionObserver>>,
}

impl DecodeState {
    fn new(layers: usize, observer: Option<Arc<dyn CompressionObserver>>) -> Self {
        Self {
            stages: (0..layers).map(|_| GzDecoder::new(Vec::new())).collect(),
            pending_trailers: None,
            finished: false,
            bytes_in: 0,
            bytes_out: 0,
            observer,
        }
    }

    /// Pushes one wire chunk through every decoding stage and returns the
    /// plaintext produced so far (possibly empty while stages buffer).
    fn decode(&mut self, input: &[u8]) -> io::Result<Bytes> {
        self.bytes_in += input.len() as u64;
        let mut current = input.to_vec();
        for stage in &mut self.stages {
            if !current.is_empty() {
                stage.write_all(&current).map_err(DecompressionError::malformed)?;
            }
            stage.flush().map_err(DecompressionError::malformed)?;
            current = mem::take(stage.get_mut());
        }
        self.bytes_out += current.len() as u64;
        Ok(Bytes::from(current))
    }

    /// Finishes every stage in acquisition order, validating each gzip
    /// container, and returns any remaining plaintext.
    fn finish(&mut self) -> io::Result<Bytes> {
        self.finished = true;
        let mut carried: Vec<u8> = Vec::new();
        for stage in &mut self.stages {
            if !carried.is_empty() {
                stage.write_all(&carried).map_err(DecompressionError::malformed)?;
            }
            stage.try_finish().map_err(DecompressionError::malformed)?;
            carried = mem::take(stage.get_mut());
        }
        self.bytes_out += carried.len() as u64;
        if let Some(observer) = self.observer.take() {
            observer.on_request_decompressed(self.bytes_in, self.bytes_out);
        }
        Ok(Bytes::from(carried))
    }
}

impl<B> Body for DecompressionBody<B>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project().kind.project() {
            DecodeKindProj::Identity { inner } => crate::body::poll_passthrough(inner, cx),
            DecodeKindProj::Gzip { mut inner, state } => loop {
                if state.finished {
                    return match state.pending_trailers.take() {
                        Some(trailers) => Poll::Ready(Some(Ok(Frame::trailers(trailers)))),
                        None => Poll::Ready(None),
                    };
                }
                match inner.as_mut().poll_frame(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(None) => match state.finish() {
                        Ok(tail) if !tail.is_empty() => {
                            return Poll::Ready(Some(Ok(Frame::data(tail))));
                        }
                        Ok(_) => continue,
                        Err(e) => return Poll::Ready(Some(Err(e))),
                    },
                    Poll::Ready(Some(Err(e))) => {
                        return Poll::Ready(Some(Err(io::Error::other(e.into()))));
                    }
                    Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                        Ok(data) => {
                            let chunk = crate::body::copy_to_bytes(data);
                            match state.decode(&chunk) {
                                Ok(out) if out.is_empty() => continue,
                                Ok(out) => return Poll::Ready(Some(Ok(Frame::data(out)))),
                                Err(e) => return Poll::Ready(Some(Err(e))),
                            }
                        }
                        Err(frame) => {
                            if let Ok(trailers) = frame.into_trailers() {
                                // Drain the decoders before re-emitting the
                                // trailers so no data frame follows them.
                                state.pending_trailers = Some(trailers);
                                match state.finish() {
                                    Ok(tail) if !tail.is_empty() => {
                                        return Poll::Ready(Some(Ok(Frame::data(tail))));
                                    }
                                    Ok(_) => continue,
                                    Err(e) => return Poll::Ready(Some(Err(e))),
                                }
                            }
                        }
                    },
                }
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            DecodeKind::Identity { inner } => inner.is_end_stream(),
            DecodeKind::Gzip { state, .. } => state.finished && state.pending_trailers.is_none(),
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match &self.kind {
            DecodeKind::Identity { inner } => inner.size_hint(),
            // Decoded length is unknown until the chain drains.
            DecodeKind::Gzip { .. } => http_body::SizeHint::default(),
        }
    }
}
