//! Error taxonomy for the sync engine.
//!
//! Errors are tagged once, at the transport boundary. Everything above that
//! boundary (retry, rollback, reconciliation) decides what to do from
//! [`Error::kind`] alone.

use std::time::Duration;

/// Error code the server uses for a missing resource.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Error code the server uses for a compare-and-swap mismatch.
pub const VERSION_CONFLICT: &str = "VERSION_CONFLICT";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
  /// Connection refused, DNS failure, reset mid-request.
  #[error("transport failure: {0}")]
  Transport(String),
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  /// Structured rejection returned by the server.
  #[error("{code}: {message}")]
  Business { code: String, message: String },
  /// The submitted version no longer matches the server's.
  #[error("version conflict: {0}")]
  Conflict(String),
  #[error("permission denied: {0}")]
  PermissionDenied(String),
  /// A realtime connection could not be established or was lost.
  #[error("connection failed: {0}")]
  Connection(String),
}

/// Coarse classification driving retry and rollback decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Transport,
  Timeout,
  Business,
  Conflict,
}

impl Error {
  pub fn business(code: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Business {
      code: code.into(),
      message: message.into(),
    }
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::business(NOT_FOUND, message)
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Transport(_) | Self::Connection(_) => ErrorKind::Transport,
      Self::Timeout(_) => ErrorKind::Timeout,
      Self::Business { .. } | Self::PermissionDenied(_) => ErrorKind::Business,
      Self::Conflict(_) => ErrorKind::Conflict,
    }
  }

  /// Only failures that never reached the server's business logic retry.
  pub fn is_retryable(&self) -> bool {
    matches!(self.kind(), ErrorKind::Transport | ErrorKind::Timeout)
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::Business { code, .. } if code == NOT_FOUND)
  }

  pub fn is_conflict(&self) -> bool {
    self.kind() == ErrorKind::Conflict
  }

  /// Map a server error code to its tagged variant.
  pub fn from_code(code: &str, message: impl Into<String>) -> Self {
    match code {
      VERSION_CONFLICT => Self::Conflict(message.into()),
      _ => Self::business(code, message),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_transport_and_timeout_retry() {
    assert!(Error::Transport("refused".into()).is_retryable());
    assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
    assert!(Error::Connection("reset".into()).is_retryable());
    assert!(!Error::business("VALIDATION", "bad title").is_retryable());
    assert!(!Error::Conflict("stale".into()).is_retryable());
    assert!(!Error::PermissionDenied("nope".into()).is_retryable());
  }

  #[test]
  fn test_from_code_distinguishes_conflict() {
    assert!(Error::from_code(VERSION_CONFLICT, "v2 != v4").is_conflict());
    assert!(Error::from_code(NOT_FOUND, "gone").is_not_found());
    assert_eq!(
      Error::from_code("INTERNAL", "boom").kind(),
      ErrorKind::Business
    );
  }
}
