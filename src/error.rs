use thiserror::Error;

/// Errors surfaced to relay clients. Each variant maps to a stable wire code.
///
/// `Room` is deliberately generic: it covers room-not-found, hash collisions
/// on create, and unspecified operation failures, so a caller probing for
/// live hashes learns nothing from the error shape.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
  #[error("room operation failed")]
  Room,

  #[error("room is full")]
  RoomFull,

  #[error("sender is not a member of this room")]
  NotInRoom,

  #[error("delete authorization failed")]
  InvalidDeleteToken,

  #[error("envelope is structurally invalid")]
  InvalidEnvelope,

  #[error("unparseable frame")]
  InvalidFormat,

  #[error("rate limit exceeded")]
  RateLimited,

  #[error("server room capacity reached")]
  CapacityExceeded,
}

impl RelayError {
  /// Stable wire code, part of the client contract.
  pub fn code(&self) -> &'static str {
    match self {
      RelayError::Room => "ROOM_ERROR",
      RelayError::RoomFull => "ROOM_FULL",
      RelayError::NotInRoom => "NOT_IN_ROOM",
      RelayError::InvalidDeleteToken => "INVALID_DELETE_TOKEN",
      RelayError::InvalidEnvelope => "INVALID_ENVELOPE",
      RelayError::InvalidFormat => "INVALID_FORMAT",
      RelayError::RateLimited => "RATE_LIMITED",
      RelayError::CapacityExceeded => "CAPACITY_EXCEEDED",
    }
  }
}
