//! Push transport adapter: a framed bidirectional connection multiplexing
//! any number of room memberships, with heartbeat liveness and full
//! cleanup on disconnect.
//!
//! Each connection owns a connection record: its outbound channel, its
//! membership map (room hash to the peer id minted for that room), and
//! its heartbeat state. Rooms hold the sending half, so fan-out reaches
//! the writer loop here without touching the socket from room code.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
  extract::{
    ws::{close_code, CloseFrame, Message, WebSocket},
    ConnectInfo, State, WebSocketUpgrade,
  },
  http::HeaderMap,
  response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
  error::RelayError,
  http::resolve_client_key,
  protocol::{ClientEvent, ServerEvent},
  relay::Relay,
  room::{new_room_set, Outbound, RoomSet, Seat},
};

pub async fn ws_handler(
  ws: WebSocketUpgrade,
  State(relay): State<Arc<Relay>>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  headers: HeaderMap,
) -> impl IntoResponse {
  let client_key = resolve_client_key(addr, &headers, relay.config.trusted_proxies);
  ws.on_upgrade(move |socket| handle_connection(socket, client_key, relay))
}

/// Per-connection event loop. One task owns both socket halves: inbound
/// frames, outbound fan-out, and the heartbeat timer are serialized here.
async fn handle_connection(socket: WebSocket, client_key: String, relay: Arc<Relay>) {
  let (mut sink, mut stream) = socket.split();
  let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
  let rooms: RoomSet = new_room_set();

  let mut heartbeat = tokio::time::interval_at(
    tokio::time::Instant::now() + relay.settings.heartbeat_interval,
    relay.settings.heartbeat_interval,
  );
  let mut awaiting_pong = false;

  tracing::debug!(client = %client_key, "push connection opened");

  loop {
    tokio::select! {
      outbound = rx.recv() => match outbound {
        Some(Outbound::Event(event)) => {
          if send_event(&mut sink, &event).await.is_err() {
            break;
          }
        }
        Some(Outbound::Close(reason)) => {
          let _ = sink
            .send(Message::Close(Some(CloseFrame {
              code: close_code::AWAY,
              reason: reason.into(),
            })))
            .await;
          break;
        }
        None => break,
      },
      frame = stream.next() => match frame {
        Some(Ok(Message::Text(text))) => {
          handle_frame(&text, &client_key, &relay, &tx, &rooms).await;
        }
        Some(Ok(Message::Binary(_))) => {
          let _ = tx.send(Outbound::Event(ServerEvent::error(
            RelayError::InvalidFormat,
            None,
          )));
        }
        Some(Ok(Message::Ping(data))) => {
          if sink.send(Message::Pong(data)).await.is_err() {
            break;
          }
        }
        Some(Ok(Message::Pong(_))) => awaiting_pong = false,
        Some(Ok(Message::Close(_))) | None => break,
        Some(Err(_)) => break,
      },
      _ = heartbeat.tick() => {
        if awaiting_pong {
          tracing::debug!(client = %client_key, "heartbeat missed, terminating connection");
          break;
        }
        awaiting_pong = true;
        if sink.send(Message::Ping(Vec::new())).await.is_err() {
          break;
        }
      }
    }
  }

  // Disconnect cleanup touches only the rooms this connection joined.
  let memberships: Vec<(String, String)> = {
    let mut set = rooms.lock().expect("connection room set lock poisoned");
    set.drain().collect()
  };
  for (hash, peer_id) in memberships {
    let _ = relay.leave_room(&hash, &peer_id).await;
  }
  tracing::debug!(client = %client_key, "push connection closed");
}

async fn send_event(
  sink: &mut SplitSink<WebSocket, Message>,
  event: &ServerEvent,
) -> Result<(), axum::Error> {
  match serde_json::to_string(event) {
    Ok(text) => sink.send(Message::Text(text)).await,
    Err(_) => Ok(()),
  }
}

/// Decode and dispatch one inbound frame. Replies and errors go through
/// the connection's outbound channel so they interleave correctly with
/// room fan-out.
pub(crate) async fn handle_frame(
  text: &str,
  client_key: &str,
  relay: &Arc<Relay>,
  tx: &mpsc::UnboundedSender<Outbound>,
  rooms: &RoomSet,
) {
  if text.len() > relay.settings.max_frame_bytes {
    tracing::warn!(client = %client_key, bytes = text.len(), "oversized frame rejected");
    let _ = tx.send(Outbound::Event(ServerEvent::error(
      RelayError::InvalidFormat,
      None,
    )));
    return;
  }

  let event = match serde_json::from_str::<ClientEvent>(text) {
    Ok(event) => event,
    Err(_) => {
      let _ = tx.send(Outbound::Event(ServerEvent::error(
        RelayError::InvalidFormat,
        None,
      )));
      return;
    }
  };

  if let Some(reply) = dispatch(event, client_key, relay, tx, rooms).await {
    let _ = tx.send(Outbound::Event(reply));
  }
}

async fn dispatch(
  event: ClientEvent,
  client_key: &str,
  relay: &Arc<Relay>,
  tx: &mpsc::UnboundedSender<Outbound>,
  rooms: &RoomSet,
) -> Option<ServerEvent> {
  match event {
    ClientEvent::CreateRoom { room_hash, ttl } => {
      let seat = Seat::Push {
        tx: tx.clone(),
        rooms: rooms.clone(),
      };
      match relay.create_room(client_key, &room_hash, ttl, seat).await {
        Ok(created) => Some(ServerEvent::RoomCreated {
          room_hash,
          peer_id: created.peer_id,
          delete_token: created.delete_token,
        }),
        Err(err) => Some(ServerEvent::error(err, Some(room_hash))),
      }
    }

    ClientEvent::JoinRoom { room_hash } => {
      let seat = Seat::Push {
        tx: tx.clone(),
        rooms: rooms.clone(),
      };
      match relay.join_room(client_key, &room_hash, seat).await {
        Ok(joined) => Some(ServerEvent::RoomJoined {
          room_hash,
          peer_id: joined.peer_id,
          peer_count: joined.peer_count,
        }),
        Err(err) => Some(ServerEvent::error(err, Some(room_hash))),
      }
    }

    ClientEvent::LeaveRoom { room_hash } => {
      let peer_id = {
        let set = rooms.lock().expect("connection room set lock poisoned");
        set.get(&room_hash).cloned()
      };
      let Some(peer_id) = peer_id else {
        return Some(ServerEvent::error(RelayError::Room, Some(room_hash)));
      };
      match relay.leave_room(&room_hash, &peer_id).await {
        Ok(peer_count) => Some(ServerEvent::PeerLeft {
          room_hash,
          peer_id,
          peer_count,
        }),
        Err(err) => Some(ServerEvent::error(err, Some(room_hash))),
      }
    }

    ClientEvent::DeleteRoom {
      room_hash,
      delete_token,
    } => {
      let was_member = {
        let set = rooms.lock().expect("connection room set lock poisoned");
        set.contains_key(&room_hash)
      };
      match relay.delete_room(&room_hash, &delete_token).await {
        // Members hear room_deleted through the room fan-out; reply
        // directly only when the deleter was not seated in the room.
        Ok(()) if was_member => None,
        Ok(()) => Some(ServerEvent::RoomDeleted { room_hash }),
        Err(err) => Some(ServerEvent::error(err, Some(room_hash))),
      }
    }

    ClientEvent::Message { envelope } => {
      let addressed = envelope
        .get("room")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
      let sender_id = {
        let set = rooms.lock().expect("connection room set lock poisoned");
        set.get(&addressed).cloned().unwrap_or_default()
      };
      match relay
        .send_message(client_key, &sender_id, &envelope, None)
        .await
      {
        Ok(()) => None,
        Err(err) => {
          let room_hash = (!addressed.is_empty()).then_some(addressed);
          Some(ServerEvent::error(err, room_hash))
        }
      }
    }

    ClientEvent::Ping => Some(ServerEvent::Pong),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{Config, RelaySettings};
  use crate::rate_limit::RateLimits;

  fn relay() -> Arc<Relay> {
    Arc::new(Relay::new(
      Config::default(),
      RelaySettings::default(),
      RateLimits::default(),
    ))
  }

  struct Conn {
    tx: mpsc::UnboundedSender<Outbound>,
    rx: mpsc::UnboundedReceiver<Outbound>,
    rooms: RoomSet,
  }

  fn conn() -> Conn {
    let (tx, rx) = mpsc::unbounded_channel();
    Conn {
      tx,
      rx,
      rooms: new_room_set(),
    }
  }

  async fn recv_event(conn: &mut Conn) -> ServerEvent {
    match conn.rx.recv().await.expect("event") {
      Outbound::Event(event) => event,
      Outbound::Close(reason) => panic!("unexpected close: {}", reason),
    }
  }

  async fn frame(relay: &Arc<Relay>, conn: &Conn, text: &str) {
    handle_frame(text, "test-client", relay, &conn.tx, &conn.rooms).await;
  }

  #[tokio::test]
  async fn create_and_token_delete_round_trip() {
    let relay = relay();
    let mut a = conn();

    frame(
      &relay,
      &a,
      r#"{"event":"create_room","roomHash":"H1","ttl":120}"#,
    )
    .await;
    let (peer_id, token) = match recv_event(&mut a).await {
      ServerEvent::RoomCreated {
        room_hash,
        peer_id,
        delete_token,
      } => {
        assert_eq!(room_hash, "H1");
        (peer_id, delete_token)
      }
      other => panic!("unexpected event: {:?}", other),
    };
    assert!(!peer_id.is_empty());

    let delete = format!(
      r#"{{"event":"delete_room","roomHash":"H1","deleteToken":"{}"}}"#,
      token
    );
    frame(&relay, &a, &delete).await;
    match recv_event(&mut a).await {
      ServerEvent::RoomDeleted { room_hash } => assert_eq!(room_hash, "H1"),
      other => panic!("unexpected event: {:?}", other),
    }
    // The connection's channel stays open: a ping still answers.
    frame(&relay, &a, r#"{"event":"ping"}"#).await;
    assert_eq!(recv_event(&mut a).await, ServerEvent::Pong);
  }

  #[tokio::test]
  async fn wrong_delete_token_leaves_room_intact() {
    let relay = relay();
    let mut a = conn();
    frame(
      &relay,
      &a,
      r#"{"event":"create_room","roomHash":"H4","ttl":120}"#,
    )
    .await;
    recv_event(&mut a).await;

    let mut c = conn();
    frame(
      &relay,
      &c,
      r#"{"event":"delete_room","roomHash":"H4","deleteToken":"guess"}"#,
    )
    .await;
    match recv_event(&mut c).await {
      ServerEvent::Error { code, .. } => assert_eq!(code, "INVALID_DELETE_TOKEN"),
      other => panic!("unexpected event: {:?}", other),
    }
    assert!(relay.registry.lookup("H4").await.is_some());
  }

  #[tokio::test]
  async fn oversized_and_unparseable_frames_yield_invalid_format() {
    let relay = relay();
    let mut a = conn();

    let oversized = format!(
      r#"{{"event":"message","envelope":{{"room":"H","from":"p","payload":"{}","nonce":"n","ts":1}}}}"#,
      "x".repeat(65 * 1024)
    );
    frame(&relay, &a, &oversized).await;
    match recv_event(&mut a).await {
      ServerEvent::Error { code, .. } => assert_eq!(code, "INVALID_FORMAT"),
      other => panic!("unexpected event: {:?}", other),
    }

    frame(&relay, &a, "not json").await;
    match recv_event(&mut a).await {
      ServerEvent::Error { code, .. } => assert_eq!(code, "INVALID_FORMAT"),
      other => panic!("unexpected event: {:?}", other),
    }
    // Neither frame created any state.
    assert!(relay.registry.is_empty().await);
  }

  #[tokio::test]
  async fn message_to_unjoined_room_reports_not_in_room() {
    let relay = relay();
    let mut a = conn();
    frame(
      &relay,
      &a,
      r#"{"event":"create_room","roomHash":"H1","ttl":120}"#,
    )
    .await;
    recv_event(&mut a).await;

    let mut b = conn();
    frame(
      &relay,
      &b,
      r#"{"event":"message","envelope":{"room":"H1","from":"x","payload":"c","nonce":"n","ts":1}}"#,
    )
    .await;
    match recv_event(&mut b).await {
      ServerEvent::Error { code, room_hash, .. } => {
        assert_eq!(code, "NOT_IN_ROOM");
        assert_eq!(room_hash.as_deref(), Some("H1"));
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }

  #[tokio::test]
  async fn rejoining_same_room_on_one_connection_is_refused() {
    let relay = relay();
    let mut a = conn();
    frame(
      &relay,
      &a,
      r#"{"event":"create_room","roomHash":"H1","ttl":120}"#,
    )
    .await;
    recv_event(&mut a).await;

    frame(&relay, &a, r#"{"event":"join_room","roomHash":"H1"}"#).await;
    match recv_event(&mut a).await {
      ServerEvent::Error { code, .. } => assert_eq!(code, "ROOM_ERROR"),
      other => panic!("unexpected event: {:?}", other),
    }
  }

  #[tokio::test]
  async fn leave_without_membership_is_generic() {
    let relay = relay();
    let mut a = conn();
    frame(&relay, &a, r#"{"event":"leave_room","roomHash":"H-none"}"#).await;
    match recv_event(&mut a).await {
      ServerEvent::Error { code, .. } => assert_eq!(code, "ROOM_ERROR"),
      other => panic!("unexpected event: {:?}", other),
    }
  }
}
