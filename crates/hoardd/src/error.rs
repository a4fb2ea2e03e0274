//! Proxy error model and the status adapter
//!
//! Every asynchronous stage funnels failures through this module: proxy
//! errors map onto their gRPC status, backend errors are classified, and
//! anything unexpected becomes INTERNAL. Status errors pass through
//! verbatim so a handler can never downgrade or re-wrap one.

use thiserror::Error;
use tonic::Status;

use grid::CacheError;

#[derive(Debug, Error)]
pub enum ProxyError {
  #[error("{0}")]
  InvalidArgument(String),

  #[error("no session with scope '{0}'")]
  ScopeNotFound(String),

  #[error("no grid instance named '{0}'")]
  NoInstance(String),

  #[error("cache '{0}' has been destroyed")]
  CacheDestroyed(String),

  #[error("event buffer overflow")]
  EventBufferOverflow,

  #[error("{0}")]
  Internal(String),
}

impl ProxyError {
  pub fn invalid(msg: impl Into<String>) -> Self {
    ProxyError::InvalidArgument(msg.into())
  }

  pub fn internal(err: impl std::fmt::Display) -> Self {
    ProxyError::Internal(err.to_string())
  }
}

impl From<ProxyError> for Status {
  fn from(err: ProxyError) -> Self {
    match err {
      ProxyError::InvalidArgument(msg) => Status::invalid_argument(msg),
      ProxyError::ScopeNotFound(scope) => {
        Status::not_found(format!("no session with scope '{}'", scope))
      }
      ProxyError::NoInstance(name) => {
        Status::internal(format!("no grid instance named '{}'", name))
      }
      ProxyError::CacheDestroyed(name) => {
        Status::failed_precondition(format!("cache '{}' has been destroyed", name))
      }
      ProxyError::EventBufferOverflow => Status::resource_exhausted("event buffer overflow"),
      ProxyError::Internal(msg) => Status::internal(msg),
    }
  }
}

impl From<CacheError> for ProxyError {
  fn from(err: CacheError) -> Self {
    match err {
      CacheError::Destroyed(name) => ProxyError::CacheDestroyed(name),
      // stored bytes that fail to decode are a backend fault, not the caller's
      CacheError::Codec(e) => ProxyError::Internal(e.to_string()),
      CacheError::UnknownFormat(name) => {
        ProxyError::InvalidArgument(format!("unknown serialization format '{}'", name))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_codes_match_error_kinds() {
    let cases: Vec<(ProxyError, tonic::Code)> = vec![
      (ProxyError::invalid("bad"), tonic::Code::InvalidArgument),
      (
        ProxyError::ScopeNotFound("s".into()),
        tonic::Code::NotFound,
      ),
      (ProxyError::NoInstance("i".into()), tonic::Code::Internal),
      (
        ProxyError::CacheDestroyed("c".into()),
        tonic::Code::FailedPrecondition,
      ),
      (
        ProxyError::EventBufferOverflow,
        tonic::Code::ResourceExhausted,
      ),
      (ProxyError::internal("boom"), tonic::Code::Internal),
    ];
    for (err, code) in cases {
      assert_eq!(Status::from(err).code(), code);
    }
  }

  #[test]
  fn backend_errors_classify() {
    let destroyed: ProxyError = CacheError::Destroyed("people".into()).into();
    assert!(matches!(destroyed, ProxyError::CacheDestroyed(_)));

    let unknown: ProxyError = CacheError::UnknownFormat("pof".into()).into();
    assert!(matches!(unknown, ProxyError::InvalidArgument(_)));
  }
}
