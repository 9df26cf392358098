use crate::observer::CompressionObserver;
use crate::pool::EncoderPool;
use crate::predicate::{ExclusionRules, PredicateFn, RequestView};
use crate::service::CompressionService;
use compression_core::Level;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use tower::Layer;

/// Shared, immutable middleware configuration.
pub(crate) struct Config {
    pub(crate) min_length: Option<usize>,
    pub(crate) rules: ExclusionRules,
    pub(crate) predicate: Option<PredicateFn>,
    pub(crate) combine_predicate: bool,
    pub(crate) decompress_only: bool,
    pub(crate) decompress_requests: bool,
    pub(crate) observer: Option<Arc<dyn CompressionObserver>>,
    pub(crate) pool: EncoderPool,
}

/// A Tower layer that gzip-compresses HTTP response bodies.
///
/// Built with chained setters; every service produced by one layer shares a
/// single encoder pool.
///
/// ```
/// use tower_gzip::{CompressionLayer, Level};
///
/// let layer = CompressionLayer::new()
///     .level(Level::Best)
///     .min_length(860)
///     .excluded_paths(["/internal/"]);
/// ```
#[derive(Clone)]
pub struct CompressionLayer {
    level: Level,
    min_length: Option<usize>,
    rules: ExclusionRules,
    predicate: Option<PredicateFn>,
    combine_predicate: bool,
    decompress_only: bool,
    decompress_requests: bool,
    observer: Option<Arc<dyn CompressionObserver>>,
    pool: EncoderPool,
}

impl CompressionLayer {
    /// Creates a layer with the default compression level, no length
    /// threshold, and the default excluded extensions
    /// (`.png`, `.gif`, `.jpeg`, `.jpg`).
    pub fn new() -> Self {
        Self {
            level: Level::Default,
            min_length: None,
            rules: ExclusionRules::with_default_extensions(),
            predicate: None,
            combine_predicate: false,
            decompress_only: false,
            decompress_requests: false,
            observer: None,
            pool: EncoderPool::new(Level::Default),
        }
    }

    /// Sets the gzip compression level.
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        // Pooled encoders are bound to a level; a new level needs a new pool.
        self.pool = EncoderPool::new(level);
        self
    }

    /// Sets the minimum body length required for compression.
    ///
    /// Responses with a known `Content-Length` below this value pass through
    /// unchanged. Responses of unknown length are buffered until the
    /// threshold is reached or the body ends, whichever comes first.
    pub fn min_length(mut self, length: usize) -> Self {
        self.min_length = Some(length);
        self
    }

    /// Replaces the set of excluded path extensions. Extensions carry the
    /// leading dot and match the final path segment exactly.
    pub fn excluded_extensions<I>(mut self, extensions: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.rules.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the set of excluded path prefixes; matching requests are
    /// never compressed.
    pub fn excluded_paths<I>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.rules.prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the set of excluded path regular expressions, matched
    /// against the request path; any match excludes the request from
    /// compression.
    pub fn excluded_path_regexes<I>(mut self, regexes: I) -> Self
    where
        I: IntoIterator<Item = Regex>,
    {
        self.rules.regexes = regexes.into_iter().collect();
        self
    }

    /// Installs a custom eligibility predicate.
    ///
    /// By default the predicate fully replaces the path-based rules. Combine
    /// it with them via [`combine_with_defaults`](Self::combine_with_defaults).
    /// The `Accept-Encoding` and `Connection: Upgrade` checks always run
    /// first either way.
    pub fn compress_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestView<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// When `true`, a custom predicate is combined with the path-based rules
    /// instead of replacing them: a negative vote is final, a positive vote
    /// still has to pass the exclusions.
    pub fn combine_with_defaults(mut self, combine: bool) -> Self {
        self.combine_predicate = combine;
        self
    }

    /// Decodes gzip request bodies without ever compressing responses.
    pub fn decompress_only(mut self) -> Self {
        self.decompress_only = true;
        self.decompress_requests = true;
        self
    }

    /// Enables decoding of gzip-encoded request bodies. Requests declaring
    /// an encoding this middleware cannot decode are answered with
    /// `415 Unsupported Media Type` before the inner service runs.
    pub fn decompress_requests(mut self, decompress: bool) -> Self {
        self.decompress_requests = decompress;
        self
    }

    /// Installs an observer notified of compression activity.
    pub fn observer(mut self, observer: Arc<dyn CompressionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub(crate) fn config(&self) -> Arc<Config> {
        Arc::new(Config {
            min_length: self.min_length,
            rules: self.rules.clone(),
            predicate: self.predicate.clone(),
            combine_predicate: self.combine_predicate,
            decompress_only: self.decompress_only,
            decompress_requests: self.decompress_requests,
            observer: self.observer.clone(),
            pool: self.pool.clone(),
        })
    }
}

impl Default for CompressionLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompressionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionLayer")
            .field("level", &self.level)
            .field("min_length", &self.min_length)
            .field("rules", &self.rules)
            .field("combine_predicate", &self.combine_predicate)
            .field("decompress_only", &self.decompress_only)
            .field("decompress_requests", &self.decompress_requests)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CompressionService::new(inner, self.config())
    }
}
