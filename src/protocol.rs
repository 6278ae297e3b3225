//! Wire protocol: the ciphertext envelope and the tagged client/server
//! events shared by the push and poll transports.
//!
//! Everything on the wire is JSON. Client frames are validated by a single
//! parse-then-dispatch: the frame is decoded into [`ClientEvent`], and for
//! `message` frames the embedded envelope is checked structurally with
//! [`validate_envelope`] before any membership or room lookup happens. The
//! relay never interprets `payload` or `nonce`; they are opaque ciphertext.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// One encrypted message in flight. The relay forwards it byte-for-byte:
/// `payload` and `nonce` are opaque, and `ts` is a sender-asserted
/// timestamp kept as a raw JSON number so it round-trips unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
  pub room: String,
  pub from: String,
  pub payload: String,
  pub nonce: String,
  pub ts: serde_json::Number,
}

impl Envelope {
  /// Sender-asserted timestamp as a comparable number.
  pub fn ts_value(&self) -> f64 {
    self.ts.as_f64().unwrap_or(f64::NAN)
  }
}

/// Structural validation of an incoming envelope.
///
/// All five fields must be present, string-typed where required, with
/// non-empty ciphertext and nonce and a numeric timestamp. Anything else
/// is [`RelayError::InvalidEnvelope`]; content is never inspected.
pub fn validate_envelope(raw: &Value) -> Result<Envelope, RelayError> {
  let obj = raw.as_object().ok_or(RelayError::InvalidEnvelope)?;

  let room = obj
    .get("room")
    .and_then(Value::as_str)
    .ok_or(RelayError::InvalidEnvelope)?;
  let from = obj
    .get("from")
    .and_then(Value::as_str)
    .ok_or(RelayError::InvalidEnvelope)?;
  let payload = obj
    .get("payload")
    .and_then(Value::as_str)
    .ok_or(RelayError::InvalidEnvelope)?;
  let nonce = obj
    .get("nonce")
    .and_then(Value::as_str)
    .ok_or(RelayError::InvalidEnvelope)?;
  let ts = match obj.get("ts") {
    Some(Value::Number(n)) => n.clone(),
    _ => return Err(RelayError::InvalidEnvelope),
  };

  if payload.is_empty() || nonce.is_empty() {
    return Err(RelayError::InvalidEnvelope);
  }

  Ok(Envelope {
    room: room.to_string(),
    from: from.to_string(),
    payload: payload.to_string(),
    nonce: nonce.to_string(),
    ts,
  })
}

/// Client-to-server events on the push transport.
///
/// The `message` envelope stays a raw [`Value`] here so a malformed
/// envelope yields `INVALID_ENVELOPE` rather than failing the whole frame
/// parse as `INVALID_FORMAT`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
  #[serde(rename_all = "camelCase")]
  CreateRoom { room_hash: String, ttl: i64 },
  #[serde(rename_all = "camelCase")]
  JoinRoom { room_hash: String },
  #[serde(rename_all = "camelCase")]
  LeaveRoom { room_hash: String },
  #[serde(rename_all = "camelCase")]
  DeleteRoom {
    room_hash: String,
    delete_token: String,
  },
  Message { envelope: Value },
  Ping,
}

/// Server-to-client events, mirroring room state machine transitions.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
  #[serde(rename_all = "camelCase")]
  RoomCreated {
    room_hash: String,
    peer_id: String,
    delete_token: String,
  },
  #[serde(rename_all = "camelCase")]
  RoomJoined {
    room_hash: String,
    peer_id: String,
    peer_count: usize,
  },
  #[serde(rename_all = "camelCase")]
  PeerJoined {
    room_hash: String,
    peer_id: String,
    peer_count: usize,
  },
  #[serde(rename_all = "camelCase")]
  PeerLeft {
    room_hash: String,
    peer_id: String,
    peer_count: usize,
  },
  Message { envelope: Envelope },
  #[serde(rename_all = "camelCase")]
  RoomExpired { room_hash: String },
  #[serde(rename_all = "camelCase")]
  RoomDeleted { room_hash: String },
  #[serde(rename_all = "camelCase")]
  Error {
    message: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    room_hash: Option<String>,
  },
  Pong,
}

impl ServerEvent {
  /// Build the wire error event for a failed client operation.
  pub fn error(err: RelayError, room_hash: Option<String>) -> Self {
    ServerEvent::Error {
      message: err.to_string(),
      code: err.code(),
      room_hash,
    }
  }
}
