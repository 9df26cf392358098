use crate::observer::CompressionObserver;
use crate::pool::PooledEncoder;
use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame};
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pin_project! {
    /// A response body that is gzip-compressed, passed through unchanged, or
    /// replayed from bytes buffered while the compression decision was still
    /// pending.
    pub struct CompressionBody<B> {
        #[pin]
        pub(crate) kind: Kind<B>,
    }
}

pin_project! {
    #[project = KindProj]
    pub(crate) enum Kind<B> {
        // Decision made from headers alone, body untouched.
        Passthrough {
            #[pin]
            inner: B,
        },
        // Decision made from headers alone, body streamed through gzip.
        Compressed {
            #[pin]
            inner: B,
            state: CompressedState,
        },
        // Sampled frames are replayed verbatim before the rest of the body.
        SampledPassthrough {
            prelude: VecDeque<Frame<Bytes>>,
            inner: Option<Pin<Box<B>>>,
        },
        // Sampled chunks sit in the encoder's input queue ahead of the rest.
        SampledCompressed {
            inner: Option<Pin<Box<B>>>,
            state: CompressedState,
        },
        // The whole body was consumed while sampling.
        Full {
            payload: Option<io::Result<Bytes>>,
            trailers: Option<HeaderMap>,
        },
        Empty,
    }
}

impl<B> CompressionBody<B> {
    pub(crate) fn passthrough(inner: B) -> Self {
        Self {
            kind: Kind::Passthrough { inner },
        }
    }

    pub(crate) fn compressed(inner: B, state: CompressedState) -> Self {
        Self {
            kind: Kind::Compressed { inner, state },
        }
    }

    pub(crate) fn sampled_passthrough(
        prelude: VecDeque<Frame<Bytes>>,
        inner: Option<Pin<Box<B>>>,
    ) -> Self {
        Self {
            kind: Kind::SampledPassthrough { prelude, inner },
        }
    }

    pub(crate) fn sampled_compressed(inner: Option<Pin<Box<B>>>, state: CompressedState) -> Self {
        Self {
            kind: Kind::SampledCompressed { inner, state },
        }
    }

    pub(crate) fn full(payload: Option<io::Result<Bytes>>, trailers: Option<HeaderMap>) -> Self {
        Self {
            kind: Kind::Full { payload, trailers },
        }
    }

    pub(crate) fn empty() -> Self {
        Self { kind: Kind::Empty }
    }
}

/// Streaming state for an actively compressed response body.
pub(crate) struct CompressedState {
    encoder: PooledEncoder,
    pending: VecDeque<Bytes>,
    trailers: Option<HeaderMap>,
    phase: Phase,
    saw_input: bool,
    bytes_in: u64,
    bytes_out: u64,
    observer: Option<Arc<dyn CompressionObserver>>,
}

/// State machine for compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Consuming queued and inner-body data, compressing as it arrives.
    Reading,
    /// Inner body is done, draining the encoder and writing the footer.
    Finishing,
    /// Emitting buffered trailers after the footer.
    Trailers,
    Done,
}

impl CompressedState {
    pub(crate) fn new(
        encoder: PooledEncoder,
        observer: Option<Arc<dyn CompressionObserver>>,
    ) -> Self {
        Self::with_prelude(encoder, observer, VecDeque::new(), None)
    }

    pub(crate) fn with_prelude(
        encoder: PooledEncoder,
        observer: Option<Arc<dyn CompressionObserver>>,
        pending: VecDeque<Bytes>,
        trailers: Option<HeaderMap>,
    ) -> Self {
        Self {
            encoder,
            pending,
            trailers,
            phase: Phase::Reading,
            saw_input: false,
            bytes_in: 0,
            bytes_out: 0,
            observer,
        }
    }

    fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    fn notify(&mut self) {
        if let Some(observer) = self.observer.take() {
            if self.saw_input {
                observer.on_response_compressed(self.bytes_in, self.bytes_out);
            }
        }
    }

    /// Transition out of `Reading` once no more input will arrive.
    ///
    /// A body that never produced a byte gets no gzip framing at all: the
    /// encoder is discarded and the stream ends empty.
    fn input_exhausted(&mut self) {
        self.phase = if self.saw_input {
            Phase::Finishing
        } else if self.trailers.is_some() {
            Phase::Trailers
        } else {
            Phase::Done
        };
    }

    fn poll_frame<B>(
        &mut self,
        cx: &mut Context<'_>,
        mut inner: Option<Pin<&mut B>>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        loop {
            match self.phase {
                Phase::Done => return Poll::Ready(None),

                Phase::Trailers => {
                    self.phase = Phase::Done;
                    self.notify();
                    match self.trailers.take() {
                        Some(trailers) => return Poll::Ready(Some(Ok(Frame::trailers(trailers)))),
                        None => return Poll::Ready(None),
                    }
                }

                Phase::Finishing => {
                    let mut out = BytesMut::new();
                    if let Err(e) = self.encoder.finish(&mut out) {
                        self.phase = Phase::Done;
                        return Poll::Ready(Some(Err(e)));
                    }
                    self.bytes_out += out.len() as u64;
                    if self.trailers.is_some() {
                        self.phase = Phase::Trailers;
                    } else {
                        self.phase = Phase::Done;
                        self.notify();
                    }
                    if !out.is_empty() {
                        return Poll::Ready(Some(Ok(Frame::data(out.freeze()))));
                    }
                }

                Phase::Reading => {
                    if let Some(chunk) = self.pending.pop_front() {
                        if chunk.is_empty() {
                            continue;
                        }
                        self.saw_input = true;
                        self.bytes_in += chunk.len() as u64;
                        let mut out = BytesMut::new();
                        if let Err(e) = self.encoder.encode(&chunk, &mut out) {
                            self.phase = Phase::Done;
                            return Poll::Ready(Some(Err(e)));
                        }
                        if out.is_empty() {
                            // Encoder buffered the whole chunk; keep reading.
                            continue;
                        }
                        self.bytes_out += out.len() as u64;
                        return Poll::Ready(Some(Ok(Frame::data(out.freeze()))));
                    }

                    let Some(body) = inner.as_mut() else {
                        self.input_exhausted();
                        continue;
                    };
                    match body.as_mut().poll_frame(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(None) => self.input_exhausted(),
                        Poll::Ready(Some(Err(e))) => {
                            self.phase = Phase::Done;
                            return Poll::Ready(Some(Err(io::Error::other(e.into()))));
                        }
                        Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                            Ok(data) => self.pending.push_back(copy_to_bytes(data)),
                            Err(frame) => {
                                if let Ok(trailers) = frame.into_trailers() {
                                    self.trailers = Some(trailers);
                                    self.input_exhausted();
                                }
                            }
                        },
                    }
                }
            }
        }
    }
}

impl<B> Body for CompressionBody<B>
where
    B: Body,
    B::Data: Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project().kind.project() {
            KindProj::Passthrough { inner } => poll_passthrough(inner, cx),
            KindProj::Compressed { inner, state } => state.poll_frame(cx, Some(inner)),
            KindProj::SampledPassthrough { prelude, inner } => {
                if let Some(frame) = prelude.pop_front() {
                    return Poll::Ready(Some(Ok(frame)));
                }
                match inner {
                    Some(body) => poll_passthrough(body.as_mut(), cx),
                    None => Poll::Ready(None),
                }
            }
            KindProj::SampledCompressed { inner, state } => {
                state.poll_frame(cx, inner.as_mut().map(|body| body.as_mut()))
            }
            KindProj::Full { payload, trailers } => {
                if let Some(result) = payload.take() {
                    return Poll::Ready(Some(result.map(Frame::data)));
                }
                match trailers.take() {
                    Some(trailers) => Poll::Ready(Some(Ok(Frame::trailers(trailers)))),
                    None => Poll::Ready(None),
                }
            }
            KindProj::Empty => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Passthrough { inner } => inner.is_end_stream(),
            Kind::Compressed { state, .. } | Kind::SampledCompressed { state, .. } => {
                state.is_done()
            }
            Kind::SampledPassthrough { prelude, inner } => {
                prelude.is_empty() && inner.as_ref().is_none_or(|body| body.is_end_stream())
            }
            Kind::Full { payload, trailers } => payload.is_none() && trailers.is_none(),
            Kind::Empty => true,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match &self.kind {
            Kind::Passthrough { inner } => inner.size_hint(),
            Kind::Full {
                payload: Some(Ok(data)),
                trailers: None,
            } => http_body::SizeHint::with_exact(data.len() as u64),
            Kind::Empty => http_body::SizeHint::with_exact(0),
            // Compressed size is unknown until the stream drains.
            _ => http_body::SizeHint::default(),
        }
    }
}

/// Forwards frames unchanged, converting data chunks to [`Bytes`].
pub(crate) fn poll_passthrough<B>(
    inner: Pin<&mut B>,
    cx: &mut Context<'_>,
) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match inner.poll_frame(cx) {
        Poll::Pending => Poll::Pending,
        Poll::Ready(None) => Poll::Ready(None),
        Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame.map_data(copy_to_bytes)))),
        Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(io::Error::other(e.into())))),
    }
}

pub(crate) fn copy_to_bytes<D: Buf>(mut data: D) -> Bytes {
    let mut bytes = BytesMut::with_capacity(data.remaining());
    while data.has_remaining() {
        let chunk = data.chunk();
        bytes.extend_from_slice(chunk);
        data.advance(chunk.len());
    }
    bytes.freeze()
}
