//! Poll transport adapter: a stateless request surface over the same room
//! state machine the push transport uses.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
  extract::{rejection::JsonRejection, ConnectInfo, Path, Query, Request, State},
  http::{HeaderMap, HeaderValue, Method, StatusCode},
  middleware::Next,
  response::{IntoResponse, Response},
  Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{error::RelayError, protocol::Envelope, relay::Relay, room::Seat};

/// Resolve the rate-limit client key for a request.
///
/// With no trusted proxies the socket address is authoritative and the
/// forwarded header is ignored entirely. Behind `n` trusted hops, the
/// forwarded-for entry at `len - n` (clamped to the first entry) is the
/// real client; a missing or empty header falls back to the socket.
pub fn resolve_client_key(addr: SocketAddr, headers: &HeaderMap, trusted_proxies: usize) -> String {
  if trusted_proxies == 0 {
    return addr.ip().to_string();
  }
  let Some(forwarded) = headers
    .get("x-forwarded-for")
    .and_then(|value| value.to_str().ok())
  else {
    return addr.ip().to_string();
  };
  let hops: Vec<&str> = forwarded
    .split(',')
    .map(str::trim)
    .filter(|hop| !hop.is_empty())
    .collect();
  if hops.is_empty() {
    return addr.ip().to_string();
  }
  let index = hops.len().saturating_sub(trusted_proxies);
  hops[index].to_string()
}

/// CORS and security headers on every poll response; `OPTIONS` preflights
/// short-circuit to 204 with the same headers.
pub async fn security_headers(
  State(relay): State<Arc<Relay>>,
  request: Request,
  next: Next,
) -> Response {
  if request.method() == Method::OPTIONS {
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_headers(response.headers_mut(), &relay.config.cors_origin);
    return response;
  }
  let mut response = next.run(request).await;
  apply_headers(response.headers_mut(), &relay.config.cors_origin);
  response
}

fn apply_headers(headers: &mut HeaderMap, cors_origin: &str) {
  let origin = HeaderValue::from_str(cors_origin)
    .unwrap_or_else(|_| HeaderValue::from_static("*"));
  headers.insert("access-control-allow-origin", origin);
  headers.insert(
    "access-control-allow-methods",
    HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
  );
  headers.insert(
    "access-control-allow-headers",
    HeaderValue::from_static("content-type, x-delete-token"),
  );
  headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
  headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
  headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
  headers.insert(
    "strict-transport-security",
    HeaderValue::from_static("max-age=31536000; includeSubDomains"),
  );
}

fn status_for(err: RelayError) -> StatusCode {
  match err {
    RelayError::Room => StatusCode::NOT_FOUND,
    RelayError::RoomFull | RelayError::NotInRoom | RelayError::InvalidDeleteToken => {
      StatusCode::FORBIDDEN
    }
    RelayError::InvalidEnvelope | RelayError::InvalidFormat => StatusCode::BAD_REQUEST,
    RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
    RelayError::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
  }
}

fn error_response(err: RelayError, status: StatusCode) -> Response {
  (
    status,
    Json(json!({"code": err.code(), "message": err.to_string()})),
  )
    .into_response()
}

/// Unparseable bodies are a 400; bodies past the size cap keep their 413
/// so oversized requests are cancelled rather than interpreted.
fn body_rejection(rejection: JsonRejection) -> Response {
  let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
    StatusCode::PAYLOAD_TOO_LARGE
  } else {
    StatusCode::BAD_REQUEST
  };
  error_response(RelayError::InvalidFormat, status)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBody {
  room_hash: String,
  ttl: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateReply {
  room_hash: String,
  peer_id: String,
  delete_token: String,
  peer_count: usize,
}

pub async fn create_room(
  State(relay): State<Arc<Relay>>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  headers: HeaderMap,
  body: Result<Json<CreateBody>, JsonRejection>,
) -> Response {
  let body = match body {
    Ok(Json(body)) => body,
    Err(rejection) => return body_rejection(rejection),
  };
  let client_key = resolve_client_key(addr, &headers, relay.config.trusted_proxies);
  match relay
    .create_room(&client_key, &body.room_hash, body.ttl, Seat::Poll)
    .await
  {
    Ok(created) => (
      StatusCode::CREATED,
      Json(CreateReply {
        room_hash: body.room_hash,
        peer_id: created.peer_id,
        delete_token: created.delete_token,
        peer_count: created.peer_count,
      }),
    )
      .into_response(),
    // A hash collision on create is a conflict, still under the generic code.
    Err(RelayError::Room) => error_response(RelayError::Room, StatusCode::CONFLICT),
    Err(err) => error_response(err, status_for(err)),
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinReply {
  room_hash: String,
  peer_id: String,
  peer_count: usize,
}

pub async fn join_room(
  State(relay): State<Arc<Relay>>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  headers: HeaderMap,
  Path(hash): Path<String>,
) -> Response {
  let client_key = resolve_client_key(addr, &headers, relay.config.trusted_proxies);
  match relay.join_room(&client_key, &hash, Seat::Poll).await {
    Ok(joined) => Json(JoinReply {
      room_hash: hash,
      peer_id: joined.peer_id,
      peer_count: joined.peer_count,
    })
    .into_response(),
    Err(err) => error_response(err, status_for(err)),
  }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBody {
  peer_id: String,
  envelope: Value,
}

pub async fn send_message(
  State(relay): State<Arc<Relay>>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  headers: HeaderMap,
  Path(hash): Path<String>,
  body: Result<Json<SendBody>, JsonRejection>,
) -> Response {
  let body = match body {
    Ok(Json(body)) => body,
    Err(rejection) => return body_rejection(rejection),
  };
  let client_key = resolve_client_key(addr, &headers, relay.config.trusted_proxies);
  // The relay pins the envelope to the path's room after the rate gate.
  match relay
    .send_message(&client_key, &body.peer_id, &body.envelope, Some(&hash))
    .await
  {
    Ok(()) => Json(json!({"sent": true})).into_response(),
    Err(err) => error_response(err, status_for(err)),
  }
}

#[derive(Deserialize)]
pub struct PollQuery {
  since: Option<f64>,
  #[serde(rename = "peerId")]
  peer_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PollReply {
  messages: Vec<Envelope>,
  peer_count: usize,
  room_hash: String,
}

pub async fn poll_room(
  State(relay): State<Arc<Relay>>,
  Path(hash): Path<String>,
  Query(query): Query<PollQuery>,
) -> Response {
  let since = query.since.unwrap_or(0.0);
  match relay.poll(&hash, query.peer_id.as_deref(), since).await {
    Ok(result) => Json(PollReply {
      messages: result.messages,
      peer_count: result.peer_count,
      room_hash: hash,
    })
    .into_response(),
    Err(err) => error_response(err, status_for(err)),
  }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveBody {
  peer_id: String,
}

pub async fn leave_room(
  State(relay): State<Arc<Relay>>,
  Path(hash): Path<String>,
  body: Result<Json<LeaveBody>, JsonRejection>,
) -> Response {
  let body = match body {
    Ok(Json(body)) => body,
    Err(rejection) => return body_rejection(rejection),
  };
  match relay.leave_room(&hash, &body.peer_id).await {
    Ok(_) => Json(json!({"left": true})).into_response(),
    Err(err) => error_response(err, status_for(err)),
  }
}

pub async fn delete_room(
  State(relay): State<Arc<Relay>>,
  Path(hash): Path<String>,
  headers: HeaderMap,
) -> Response {
  let token = headers
    .get("x-delete-token")
    .and_then(|value| value.to_str().ok())
    .unwrap_or_default();
  match relay.delete_room(&hash, token).await {
    Ok(()) => Json(json!({"deleted": true})).into_response(),
    Err(err) => error_response(err, status_for(err)),
  }
}

pub async fn health(State(relay): State<Arc<Relay>>) -> Response {
  let stats = relay.stats().await;
  let (rss, heap) = process_memory();
  let status = if relay.is_shutting_down() {
    "shutting_down"
  } else {
    "ok"
  };
  Json(json!({
    "status": status,
    "uptime": stats.uptime_secs,
    "rooms": stats.rooms,
    "peers": {
      "ws": stats.push_peers,
      "http": stats.poll_peers,
      "total": stats.push_peers + stats.poll_peers,
    },
    "memory": {"rss": rss, "heap": heap},
    "limits": {
      "maxRooms": relay.settings.max_rooms,
      "maxPeersPerRoom": relay.settings.max_peers_per_room,
      "backlogCap": relay.settings.backlog_cap,
      "maxFrameBytes": relay.settings.max_frame_bytes,
    },
    "counters": {
      "roomsCreated": stats.rooms_created,
      "messagesRelayed": stats.messages_relayed,
    },
  }))
  .into_response()
}

/// Best-effort process memory (resident and data segment, in bytes).
/// Platforms without procfs report zeros.
fn process_memory() -> (u64, u64) {
  #[cfg(target_os = "linux")]
  {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
      return (0, 0);
    };
    let field = |name: &str| -> u64 {
      status
        .lines()
        .find(|line| line.starts_with(name))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
    };
    (field("VmRSS:"), field("VmData:"))
  }
  #[cfg(not(target_os = "linux"))]
  {
    (0, 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn addr() -> SocketAddr {
    "10.0.0.9:40000".parse().unwrap()
  }

  #[test]
  fn socket_address_wins_without_trusted_proxies() {
    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", "1.1.1.1, 2.2.2.2".parse().unwrap());
    assert_eq!(resolve_client_key(addr(), &headers, 0), "10.0.0.9");
  }

  #[test]
  fn forwarded_entry_is_selected_by_hop_count() {
    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", "1.1.1.1, 2.2.2.2, 3.3.3.3".parse().unwrap());
    // One trusted hop: the entry just before it.
    assert_eq!(resolve_client_key(addr(), &headers, 1), "3.3.3.3");
    assert_eq!(resolve_client_key(addr(), &headers, 2), "2.2.2.2");
    // More trusted hops than entries clamps to the first.
    assert_eq!(resolve_client_key(addr(), &headers, 5), "1.1.1.1");
  }

  #[test]
  fn missing_or_empty_header_falls_back_to_socket() {
    let headers = HeaderMap::new();
    assert_eq!(resolve_client_key(addr(), &headers, 2), "10.0.0.9");

    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", "".parse().unwrap());
    assert_eq!(resolve_client_key(addr(), &headers, 2), "10.0.0.9");
  }

  #[test]
  fn error_statuses_follow_the_wire_contract() {
    assert_eq!(status_for(RelayError::Room), StatusCode::NOT_FOUND);
    assert_eq!(status_for(RelayError::RoomFull), StatusCode::FORBIDDEN);
    assert_eq!(status_for(RelayError::NotInRoom), StatusCode::FORBIDDEN);
    assert_eq!(
      status_for(RelayError::InvalidDeleteToken),
      StatusCode::FORBIDDEN
    );
    assert_eq!(
      status_for(RelayError::RateLimited),
      StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
      status_for(RelayError::CapacityExceeded),
      StatusCode::SERVICE_UNAVAILABLE
    );
  }

  #[test]
  fn process_memory_never_panics() {
    let (_rss, _heap) = process_memory();
  }
}
