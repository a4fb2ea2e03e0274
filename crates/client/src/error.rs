//! Client error model

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
  /// Could not obtain the cache reference within the request deadline
  #[error("failed to get a reference to cache '{name}' after {waited:?}")]
  Timeout { name: String, waited: Duration },

  /// The underlying channel was closed; reconnecting may succeed
  #[error("remote cache service has been stopped")]
  ServiceStopped,

  /// The handle was released and must be re-ensured
  #[error("cache '{0}' is no longer active")]
  Inactive(String),

  #[error("failed to connect: {0}")]
  Connect(String),

  #[error("{0}")]
  Codec(String),

  /// A status returned by the proxy, passed through verbatim
  #[error(transparent)]
  Status(#[from] tonic::Status),
}

impl ClientError {
  pub fn codec(err: impl std::fmt::Display) -> Self {
    ClientError::Codec(err.to_string())
  }

  /// True when the remote cache was destroyed.
  pub fn is_destroyed(&self) -> bool {
    matches!(self, ClientError::Status(s) if s.code() == tonic::Code::FailedPrecondition)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn destroyed_detection() {
    let err = ClientError::from(tonic::Status::failed_precondition("gone"));
    assert!(err.is_destroyed());
    assert!(!ClientError::ServiceStopped.is_destroyed());
  }
}
