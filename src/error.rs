//! Error taxonomy shared by every layer of the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the library.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Everything that can go wrong between the cache and its collaborators.
///
/// The type is `Clone` because a single failure is both stored on a cache
/// entry and handed back to the caller that triggered it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// Rejected before touching the cache or the network.
  #[error("validation failed: {message}")]
  Validation { message: String },
  /// Transient transport failure.
  #[error("network error: {message}")]
  Network { message: String },
  /// The server refused the credentials (401-class).
  #[error("authentication required: {message}")]
  Auth { message: String },
  /// Credential renewal failed; the session is gone.
  #[error("session expired")]
  SessionExpired,
  /// The server answered, but with a failure or an unexpected shape.
  #[error("server error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
  Server { status: Option<u16>, message: String },
  /// Durable storage refused a write because it is full.
  #[error("storage quota exceeded: {message}")]
  StorageQuota { message: String },
  /// Any other durable storage failure.
  #[error("storage error: {message}")]
  Storage { message: String },
  /// A persisted payload could not be decoded.
  #[error("corrupt payload: {message}")]
  Serialization { message: String },
}

impl SyncError {
  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation {
      message: message.into(),
    }
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::Network {
      message: message.into(),
    }
  }

  pub fn auth(message: impl Into<String>) -> Self {
    Self::Auth {
      message: message.into(),
    }
  }

  pub fn server(message: impl Into<String>) -> Self {
    Self::Server {
      status: None,
      message: message.into(),
    }
  }

  pub fn storage(message: impl Into<String>) -> Self {
    Self::Storage {
      message: message.into(),
    }
  }

  pub fn quota(message: impl Into<String>) -> Self {
    Self::StorageQuota {
      message: message.into(),
    }
  }

  pub fn serialization(message: impl Into<String>) -> Self {
    Self::Serialization {
      message: message.into(),
    }
  }

  /// Map an HTTP status code reported by a transport.
  ///
  /// 401 becomes [`SyncError::Auth`]; every other non-success status is a
  /// [`SyncError::Server`] carrying the status.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      401 => Self::Auth { message },
      _ => Self::Server {
        status: Some(status),
        message,
      },
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Validation { .. } => ErrorKind::Validation,
      Self::Network { .. } => ErrorKind::Network,
      Self::Auth { .. } => ErrorKind::Auth,
      Self::SessionExpired => ErrorKind::SessionExpired,
      Self::Server { .. } => ErrorKind::Server,
      Self::StorageQuota { .. } => ErrorKind::StorageQuota,
      Self::Storage { .. } => ErrorKind::Storage,
      Self::Serialization { .. } => ErrorKind::Serialization,
    }
  }

  /// Whether this failure ends the session and requires a hard purge.
  pub fn ends_session(&self) -> bool {
    matches!(self, Self::SessionExpired)
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(err: serde_json::Error) -> Self {
    Self::serialization(err.to_string())
  }
}

/// Discriminant of [`SyncError`], used where only the category matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Validation,
  Network,
  Auth,
  SessionExpired,
  Server,
  StorageQuota,
  Storage,
  Serialization,
}

/// Serialisable record of the last failure seen by a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
  pub kind: ErrorKind,
  pub message: String,
  pub at: DateTime<Utc>,
}

impl ErrorInfo {
  pub fn new(error: &SyncError, at: DateTime<Utc>) -> Self {
    Self {
      kind: error.kind(),
      message: error.to_string(),
      at,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unauthorized_status_maps_to_auth() {
    assert_eq!(SyncError::from_status(401, "nope").kind(), ErrorKind::Auth);
  }

  #[test]
  fn test_other_statuses_map_to_server() {
    let err = SyncError::from_status(503, "down");
    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(err.to_string(), "server error (503): down");
  }

  #[test]
  fn test_only_session_expiry_ends_session() {
    assert!(SyncError::SessionExpired.ends_session());
    assert!(!SyncError::auth("token").ends_session());
    assert!(!SyncError::network("offline").ends_session());
  }
}
