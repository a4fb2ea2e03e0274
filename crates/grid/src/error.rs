//! Grid error types

use crate::codec::CodecError;

/// Errors raised by cache operations
#[derive(Debug, Clone)]
pub enum CacheError {
  /// The cache was destroyed; the handle is invalid process-wide
  Destroyed(String),
  /// Payload bytes could not be decoded or re-encoded
  Codec(CodecError),
  /// The named format has no registered codec
  UnknownFormat(String),
}

impl std::fmt::Display for CacheError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheError::Destroyed(name) => write!(f, "cache '{}' has been destroyed", name),
      CacheError::Codec(e) => write!(f, "{}", e),
      CacheError::UnknownFormat(name) => write!(f, "no codec registered for format '{}'", name),
    }
  }
}

impl std::error::Error for CacheError {}

impl From<CodecError> for CacheError {
  fn from(e: CodecError) -> Self {
    CacheError::Codec(e)
  }
}
