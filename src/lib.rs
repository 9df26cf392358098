//! Gzip request/response middleware for Tower.
//!
//! This crate provides a Tower layer that compresses HTTP response bodies
//! with gzip based on the client's `Accept-Encoding` header, and can decode
//! gzip-encoded request bodies before the inner service sees them.
//!
//! # Example
//!
//! ```ignore
//! use tower_gzip::CompressionLayer;
//! use tower::ServiceBuilder;
//!
//! let service = ServiceBuilder::new()
//!     .layer(CompressionLayer::new().min_length(860))
//!     .service(my_service);
//! ```
//!
//! # Compression Rules
//!
//! The middleware will **not** compress responses when:
//! - `Accept-Encoding` carries no usable `gzip` token (a `q=0` entry counts
//!   as absent)
//! - The request asks for a protocol upgrade (`Connection: Upgrade`)
//! - The request path matches an excluded extension, prefix, or regex, or a
//!   custom predicate votes against it
//! - The response status is a client or server error
//! - `Content-Encoding` is already set (a `gzip` value is verified against
//!   the body's magic bytes; bodies that turn out to be plain are
//!   compressed exactly once)
//! - `Content-Range` is present (range responses)
//! - `Content-Type` starts with `image/` (except `image/svg+xml`) or
//!   `text/event-stream`
//! - The body is shorter than the configured minimum length; bodies of
//!   unknown length are buffered until the threshold settles the question
//!
//! # Response Modifications
//!
//! When compression is applied:
//! - `Content-Encoding: gzip` is set
//! - `Content-Length` and `Accept-Ranges` are removed (restored with the
//!   exact compressed length when the whole body was buffered)
//! - `accept-encoding` is appended to `Vary` unless already covered
//! - A strong `ETag` is weakened to `W/"…"`
//!
//! # Request Decompression
//!
//! With [`CompressionLayer::decompress_requests`] enabled, a request
//! `Content-Encoding` made up of `gzip` tokens is decoded transparently
//! (chained encodings included) and the `Content-Encoding`/`Content-Length`
//! headers are stripped. Any other token yields a synthesized
//! `415 Unsupported Media Type` before the inner service runs; a malformed
//! gzip container surfaces as an `InvalidData` [`std::io::Error`] from the
//! request body.

#![deny(missing_docs)]

mod body;
mod decompress;
mod error;
mod future;
mod layer;
mod observer;
mod pool;
mod predicate;
mod service;

pub use body::CompressionBody;
pub use decompress::DecompressionBody;
pub use error::DecompressionError;
pub use future::ResponseFuture;
pub use layer::CompressionLayer;
pub use observer::CompressionObserver;
pub use predicate::RequestView;
pub use service::CompressionService;

pub use compression_core::Level;
