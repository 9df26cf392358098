use crate::layer::Config;
use http::{HeaderMap, Method, Request, Uri, header};
use regex::Regex;
use std::sync::Arc;

/// Extensions excluded from compression when no explicit list is configured.
pub(crate) const DEFAULT_EXCLUDED_EXTENSIONS: &[&str] = &[".png", ".gif", ".jpeg", ".jpg"];

/// Borrowed view of a request, handed to custom compression predicates.
#[derive(Debug)]
pub struct RequestView<'a> {
    /// The request method.
    pub method: &'a Method,
    /// The request URI.
    pub uri: &'a Uri,
    /// The request headers.
    pub headers: &'a HeaderMap,
}

pub(crate) type PredicateFn = Arc<dyn Fn(&RequestView<'_>) -> bool + Send + Sync>;

/// Static exclusion rules matched against the request path.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExclusionRules {
    pub(crate) extensions: Vec<String>,
    pub(crate) prefixes: Vec<String>,
    pub(crate) regexes: Vec<Regex>,
}

impl ExclusionRules {
    pub(crate) fn with_default_extensions() -> Self {
        Self {
            extensions: DEFAULT_EXCLUDED_EXTENSIONS
                .iter()
                .map(|e| (*e).to_owned())
                .collect(),
            ..Self::default()
        }
    }

    fn is_excluded(&self, path: &str) -> bool {
        if let Some(extension) = path_extension(path) {
            if self.extensions.iter().any(|e| e == extension) {
                return true;
            }
        }
        self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
            || self.regexes.iter().any(|r| r.is_match(path))
    }
}

/// Returns the path's file extension including the leading dot, taken from
/// the final path segment.
fn path_extension(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.rfind('.').map(|dot| &file[dot..])
}

/// Decides whether the response to `req` is eligible for gzip compression.
///
/// Exclusions short-circuit in order: missing `gzip` in `Accept-Encoding`,
/// protocol upgrades, the custom predicate, then path-based rules. In
/// combine mode a negative custom vote is final but a positive vote still
/// has to pass the path exclusions.
pub(crate) fn should_compress<B>(req: &Request<B>, config: &Config) -> bool {
    let headers = req.headers();
    if !accepts_gzip(headers) || is_connection_upgrade(headers) {
        return false;
    }

    if let Some(predicate) = &config.predicate {
        let view = RequestView {
            method: req.method(),
            uri: req.uri(),
            headers,
        };
        let vote = predicate(&view);
        if !config.combine_predicate {
            return vote;
        }
        if !vote {
            return false;
        }
    }

    !config.rules.is_excluded(req.uri().path())
}

/// Checks whether any `Accept-Encoding` value carries a usable `gzip` token.
pub(crate) fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| {
            let (encoding, quality) = parse_encoding_with_quality(part.trim());
            quality > 0.0
                && (encoding.eq_ignore_ascii_case("gzip") || encoding.eq_ignore_ascii_case("x-gzip"))
        })
}

fn is_connection_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Parses an encoding entry like "gzip" or "gzip;q=0.8" into (encoding, quality).
fn parse_encoding_with_quality(s: &str) -> (&str, f32) {
    let mut parts = s.splitn(2, ';');
    let encoding = parts.next().unwrap_or("").trim();

    let quality = parts
        .next()
        .and_then(|q| {
            let q = q.trim();
            if q.starts_with("q=") || q.starts_with("Q=") {
                q[2..].parse::<f32>().ok()
            } else {
                None
            }
        })
        .unwrap_or(1.0);

    (encoding, quality)
}
