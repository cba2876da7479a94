//! Protocol error types.

use thiserror::Error;

/// Errors from envelope parsing and bundle codecs.
///
/// Variants carry rendered strings rather than source errors so the type
/// stays `Clone` — resolved request outcomes are fanned out to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// Inbound message is not a valid envelope.
    #[error("malformed envelope: {0}")]
    Envelope(String),

    /// JSON (de)serialization failure.
    #[error("json: {0}")]
    Json(String),

    /// Base64 decoding failure.
    #[error("base64: {0}")]
    Base64(String),

    /// Compression or decompression failure.
    #[error("compression: {0}")]
    Compression(String),

    /// Decompressed bundle exceeds the size cap.
    #[error("bundle too large: decompressed size exceeds {max} bytes")]
    BundleTooLarge {
        /// The enforced cap in bytes.
        max: usize,
    },
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<base64::DecodeError> for ProtoError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Base64(err.to_string())
    }
}
