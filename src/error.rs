use std::io;
use thiserror::Error;

/// Errors produced while decoding a gzip-encoded request body.
///
/// `UnsupportedEncoding` is detected from headers alone and turned into a
/// `415 Unsupported Media Type` response before the inner service runs.
/// `MalformedBody` can only be observed once body bytes flow; it is carried
/// inside the [`io::Error`] (kind `InvalidData`) returned by the request
/// body, which hosts conventionally map to `400 Bad Request`.
#[derive(Debug, Error)]
pub enum DecompressionError {
    /// `Content-Encoding` names a coding this middleware cannot decode.
    #[error("unsupported content encoding {encoding:?}")]
    UnsupportedEncoding {
        /// The offending encoding token, lowercased.
        encoding: String,
    },

    /// The gzip container in the request body could not be parsed.
    #[error("malformed gzip request body")]
    MalformedBody {
        /// The underlying decoder error.
        #[source]
        source: io::Error,
    },
}

impl DecompressionError {
    pub(crate) fn unsupported(token: &str) -> Self {
        Self::UnsupportedEncoding {
            encoding: token.to_ascii_lowercase(),
        }
    }

    /// Wraps a decoder failure into an `InvalidData` I/O error suitable for
    /// returning from a body poll.
    pub(crate) fn malformed(source: io::Error) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, Self::MalformedBody { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_lowercases_token() {
        let err = DecompressionError::unsupported("Deflate");
        assert_eq!(err.to_string(), "unsupported content encoding \"deflate\"");
    }

    #[test]
    fn test_malformed_is_invalid_data() {
        let inner = io::Error::new(io::ErrorKind::UnexpectedEof, "truncated");
        let err = DecompressionError::malformed(inner);
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("malformed gzip"));
    }
}
