//! Rooms and the registry that owns them.
//!
//! A [`Room`] is the per-hash authority over membership, the bounded
//! message backlog, the delete token, and event fan-out. The
//! [`RoomRegistry`] keys rooms by their opaque hash and enforces the
//! server-wide capacity and uniqueness invariants. Both push and poll
//! members live in the same room; they differ only in how events reach
//! them (a live sender handle vs. the backlog).
//!
//! Locking discipline: the registry map lock is taken before any room
//! lock, and a connection's room-set mutex is only taken while a room
//! lock is held (destruction paths) or with no other lock held
//! (disconnect cleanup). Operations that may destroy a room take the map
//! write lock so the emptied-room transition and the registry removal are
//! one atomic step.

use std::{
  collections::{HashMap, VecDeque},
  sync::{Arc, Mutex},
  time::{Duration, Instant},
};
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, RwLock};

use crate::{
  config::RelaySettings,
  error::RelayError,
  protocol::{Envelope, ServerEvent},
  token,
};

/// Frames flowing to one push connection's writer loop.
#[derive(Debug, Clone)]
pub enum Outbound {
  Event(ServerEvent),
  /// Terminate the connection after flushing, with a close reason.
  Close(&'static str),
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

/// A connection's own membership map (room hash to the peer id minted for
/// that room). Shared between the connection task and the rooms it joined
/// so cleanup on either side is O(rooms this connection joined).
pub type RoomSet = Arc<Mutex<HashMap<String, String>>>;

pub fn new_room_set() -> RoomSet {
  Arc::new(Mutex::new(HashMap::new()))
}

/// How a creator or joiner is attached to a room.
pub enum Seat {
  /// A push peer: events are delivered through `tx`, and `rooms` is the
  /// owning connection's membership map.
  Push { tx: OutboundSender, rooms: RoomSet },
  /// A poll peer: liveness is tracked by last-seen timestamp.
  Poll,
}

struct PushMember {
  tx: OutboundSender,
  rooms: RoomSet,
}

/// Per-room state. Mutated only under its registry-held lock.
pub struct Room {
  hash: String,
  delete_token: String,
  created_at: Instant,
  ttl: Duration,
  push_members: HashMap<String, PushMember>,
  poll_members: HashMap<String, Instant>,
  backlog: VecDeque<Envelope>,
  backlog_cap: usize,
  max_peers: usize,
}

impl Room {
  fn new(hash: String, ttl: Duration, settings: &RelaySettings) -> Self {
    Self {
      hash,
      delete_token: token::mint(),
      created_at: Instant::now(),
      ttl,
      push_members: HashMap::new(),
      poll_members: HashMap::new(),
      backlog: VecDeque::new(),
      backlog_cap: settings.backlog_cap,
      max_peers: settings.max_peers_per_room,
    }
  }

  pub fn hash(&self) -> &str {
    &self.hash
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  pub fn peer_count(&self) -> usize {
    self.push_members.len() + self.poll_members.len()
  }

  pub fn push_count(&self) -> usize {
    self.push_members.len()
  }

  pub fn poll_count(&self) -> usize {
    self.poll_members.len()
  }

  pub fn is_empty(&self) -> bool {
    self.push_members.is_empty() && self.poll_members.is_empty()
  }

  pub fn is_full(&self) -> bool {
    self.peer_count() >= self.max_peers
  }

  pub fn is_member(&self, peer_id: &str) -> bool {
    self.push_members.contains_key(peer_id) || self.poll_members.contains_key(peer_id)
  }

  pub fn expired(&self, now: Instant) -> bool {
    now.duration_since(self.created_at) > self.ttl
  }

  /// Constant-time comparison against the room's delete token.
  pub fn token_matches(&self, presented: &str) -> bool {
    self
      .delete_token
      .as_bytes()
      .ct_eq(presented.as_bytes())
      .into()
  }

  fn insert_member(&mut self, peer_id: String, seat: Seat) {
    match seat {
      Seat::Push { tx, rooms } => {
        rooms
          .lock()
          .expect("connection room set lock poisoned")
          .insert(self.hash.clone(), peer_id.clone());
        self.push_members.insert(peer_id, PushMember { tx, rooms });
      }
      Seat::Poll => {
        self.poll_members.insert(peer_id, Instant::now());
      }
    }
  }

  fn remove_member(&mut self, peer_id: &str) -> bool {
    if let Some(member) = self.push_members.remove(peer_id) {
      member
        .rooms
        .lock()
        .expect("connection room set lock poisoned")
        .remove(&self.hash);
      return true;
    }
    self.poll_members.remove(peer_id).is_some()
  }

  /// Refresh a poll member's last-seen timestamp. Returns false for
  /// unknown peers.
  pub fn touch_poll(&mut self, peer_id: &str) -> bool {
    match self.poll_members.get_mut(peer_id) {
      Some(last_seen) => {
        *last_seen = Instant::now();
        true
      }
      None => false,
    }
  }

  /// Append an accepted envelope to the backlog, evicting the oldest past
  /// the cap. Entries are immutable once inserted.
  pub fn append(&mut self, envelope: Envelope) {
    self.backlog.push_back(envelope);
    while self.backlog.len() > self.backlog_cap {
      self.backlog.pop_front();
    }
  }

  /// Backlog envelopes with `ts` strictly greater than `since`, in
  /// backlog order. The cursor is the sender-asserted timestamp, so this
  /// is best-effort under duplicate values.
  pub fn messages_since(&self, since: f64) -> Vec<Envelope> {
    self
      .backlog
      .iter()
      .filter(|e| e.ts_value() > since)
      .cloned()
      .collect()
  }

  /// Deliver an event to every push member except `exclude`.
  pub fn fan_out(&self, event: &ServerEvent, exclude: Option<&str>) {
    for (peer_id, member) in &self.push_members {
      if Some(peer_id.as_str()) == exclude {
        continue;
      }
      let _ = member.tx.send(Outbound::Event(event.clone()));
    }
  }

  /// Tear the room down: deliver `event` to every push member, detach the
  /// room from each member connection's room set, and optionally close
  /// the connections (graceful shutdown).
  fn dissolve(&mut self, event: ServerEvent, close: Option<&'static str>) {
    for member in self.push_members.values() {
      let _ = member.tx.send(Outbound::Event(event.clone()));
      if let Some(reason) = close {
        let _ = member.tx.send(Outbound::Close(reason));
      }
      member
        .rooms
        .lock()
        .expect("connection room set lock poisoned")
        .remove(&self.hash);
    }
    self.push_members.clear();
    self.poll_members.clear();
  }
}

/// Result of a poll read: the in-range backlog plus the current member
/// count.
pub struct PollResult {
  pub messages: Vec<Envelope>,
  pub peer_count: usize,
}

/// Reply to a successful create.
#[derive(Debug)]
pub struct CreatedRoom {
  pub peer_id: String,
  pub delete_token: String,
  pub peer_count: usize,
}

/// Reply to a successful join.
#[derive(Debug)]
pub struct JoinedRoom {
  pub peer_id: String,
  pub peer_count: usize,
}

/// Keyed store of rooms by opaque hash. Enforces the server capacity cap
/// and the one-room-per-hash invariant; per-room state belongs to [`Room`].
pub struct RoomRegistry {
  rooms: RwLock<HashMap<String, Arc<RwLock<Room>>>>,
  settings: RelaySettings,
}

impl RoomRegistry {
  pub fn new(settings: RelaySettings) -> Self {
    Self {
      rooms: RwLock::new(HashMap::new()),
      settings,
    }
  }

  pub async fn len(&self) -> usize {
    self.rooms.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.rooms.read().await.is_empty()
  }

  /// Create a room and seat the creator atomically. The capacity and
  /// uniqueness checks are serialized with the insert, so two racing
  /// creates for one hash cannot both succeed. A hash collision reports
  /// the same generic error as a failed lookup.
  pub async fn create(
    &self,
    hash: &str,
    ttl_seconds: i64,
    seat: Seat,
  ) -> Result<CreatedRoom, RelayError> {
    if hash.is_empty() || hash.len() > 128 {
      return Err(RelayError::Room);
    }

    let mut rooms = self.rooms.write().await;
    if rooms.len() >= self.settings.max_rooms {
      return Err(RelayError::CapacityExceeded);
    }
    if rooms.contains_key(hash) {
      return Err(RelayError::Room);
    }

    let ttl = self.settings.clamp_ttl(ttl_seconds);
    let mut room = Room::new(hash.to_string(), ttl, &self.settings);
    let peer_id = token::mint();
    let delete_token = room.delete_token.clone();
    room.insert_member(peer_id.clone(), seat);

    rooms.insert(hash.to_string(), Arc::new(RwLock::new(room)));
    tracing::debug!(room = %hash, ttl_secs = ttl.as_secs(), "room created");

    Ok(CreatedRoom {
      peer_id,
      delete_token,
      peer_count: 1,
    })
  }

  pub async fn lookup(&self, hash: &str) -> Option<Arc<RwLock<Room>>> {
    self.rooms.read().await.get(hash).cloned()
  }

  /// Seat a joiner, emitting `peer_joined` to the existing members.
  pub async fn join(&self, hash: &str, seat: Seat) -> Result<JoinedRoom, RelayError> {
    let rooms = self.rooms.read().await;
    let room = rooms.get(hash).ok_or(RelayError::Room)?;
    let mut room = room.write().await;

    if room.is_full() {
      return Err(RelayError::RoomFull);
    }

    let peer_id = token::mint();
    room.insert_member(peer_id.clone(), seat);
    let peer_count = room.peer_count();

    room.fan_out(
      &ServerEvent::PeerJoined {
        room_hash: hash.to_string(),
        peer_id: peer_id.clone(),
        peer_count,
      },
      Some(&peer_id),
    );

    Ok(JoinedRoom {
      peer_id,
      peer_count,
    })
  }

  /// Remove one member (leave, disconnect, or poll timeout all land
  /// here), emitting `peer_left` to the remaining members and destroying
  /// the room synchronously when it empties. Unknown hash and unknown
  /// peer both report the generic room error.
  pub async fn remove_member(&self, hash: &str, peer_id: &str) -> Result<usize, RelayError> {
    let mut rooms = self.rooms.write().await;
    let room_handle = rooms.get(hash).cloned().ok_or(RelayError::Room)?;
    let mut room = room_handle.write().await;

    if !room.remove_member(peer_id) {
      return Err(RelayError::Room);
    }

    let peer_count = room.peer_count();
    room.fan_out(
      &ServerEvent::PeerLeft {
        room_hash: hash.to_string(),
        peer_id: peer_id.to_string(),
        peer_count,
      },
      None,
    );

    if room.is_empty() {
      drop(room);
      rooms.remove(hash);
      tracing::debug!(room = %hash, "room emptied and destroyed");
    }

    Ok(peer_count)
  }

  /// Accept a validated envelope from a current member: append it to the
  /// backlog and fan it out to the other push members. The append and the
  /// fan-out happen under the room lock, so backlog order and observed
  /// event order agree. The sender's own push connection gets no echo;
  /// the backlog keeps the message visible to every poller.
  pub async fn publish(&self, sender_id: &str, envelope: Envelope) -> Result<(), RelayError> {
    let rooms = self.rooms.read().await;
    let room = rooms.get(&envelope.room).ok_or(RelayError::Room)?;
    let mut room = room.write().await;

    if !room.is_member(sender_id) {
      return Err(RelayError::NotInRoom);
    }
    room.touch_poll(sender_id);
    room.append(envelope.clone());
    room.fan_out(&ServerEvent::Message { envelope }, Some(sender_id));
    Ok(())
  }

  /// Read the backlog past the caller's cursor. A known poll `peer_id`
  /// has its last-seen timestamp refreshed as a side effect.
  pub async fn poll(
    &self,
    hash: &str,
    peer_id: Option<&str>,
    since: f64,
  ) -> Result<PollResult, RelayError> {
    let rooms = self.rooms.read().await;
    let room = rooms.get(hash).ok_or(RelayError::Room)?;
    let mut room = room.write().await;

    if let Some(peer_id) = peer_id {
      room.touch_poll(peer_id);
    }
    Ok(PollResult {
      messages: room.messages_since(since),
      peer_count: room.peer_count(),
    })
  }

  /// Token-authorized destruction. The comparison is constant-time; a
  /// mismatch leaves the room untouched.
  pub async fn delete(&self, hash: &str, presented_token: &str) -> Result<(), RelayError> {
    let mut rooms = self.rooms.write().await;
    let room_handle = rooms.get(hash).cloned().ok_or(RelayError::Room)?;
    let mut room = room_handle.write().await;

    if !room.token_matches(presented_token) {
      return Err(RelayError::InvalidDeleteToken);
    }

    room.dissolve(
      ServerEvent::RoomDeleted {
        room_hash: hash.to_string(),
      },
      None,
    );
    drop(room);
    rooms.remove(hash);
    tracing::debug!(room = %hash, "room deleted by token");
    Ok(())
  }

  /// Destroy every room whose TTL has elapsed, emitting `room_expired`.
  /// Returns the number of rooms destroyed.
  pub async fn expire_due(&self, now: Instant) -> usize {
    let due: Vec<String> = {
      let rooms = self.rooms.read().await;
      let mut due = Vec::new();
      for (hash, room) in rooms.iter() {
        if room.read().await.expired(now) {
          due.push(hash.clone());
        }
      }
      due
    };

    let mut destroyed = 0;
    for hash in due {
      let mut rooms = self.rooms.write().await;
      let Some(room_handle) = rooms.get(hash.as_str()).cloned() else {
        continue;
      };
      let mut room = room_handle.write().await;
      if !room.expired(now) {
        continue;
      }
      room.dissolve(
        ServerEvent::RoomExpired {
          room_hash: hash.clone(),
        },
        None,
      );
      drop(room);
      rooms.remove(hash.as_str());
      destroyed += 1;
      tracing::debug!(room = %hash, "room expired");
    }
    destroyed
  }

  /// Evict poll members idle past `timeout`, with the same `peer_left`
  /// fan-out as an explicit leave. Rooms emptied by an eviction are
  /// destroyed in the same sweep.
  pub async fn sweep_poll_members(&self, now: Instant, timeout: Duration) -> usize {
    let mut rooms = self.rooms.write().await;
    let mut evicted = 0;
    let mut emptied = Vec::new();

    for (hash, room_handle) in rooms.iter() {
      let mut room = room_handle.write().await;
      let stale: Vec<String> = room
        .poll_members
        .iter()
        .filter(|(_, last_seen)| now.duration_since(**last_seen) > timeout)
        .map(|(peer_id, _)| peer_id.clone())
        .collect();

      for peer_id in stale {
        room.remove_member(&peer_id);
        evicted += 1;
        let peer_count = room.peer_count();
        room.fan_out(
          &ServerEvent::PeerLeft {
            room_hash: hash.clone(),
            peer_id,
            peer_count,
          },
          None,
        );
      }

      if room.is_empty() {
        emptied.push(hash.clone());
      }
    }

    for hash in emptied {
      rooms.remove(&hash);
      tracing::debug!(room = %hash, "room emptied by poll timeout");
    }
    evicted
  }

  /// Drain the registry on shutdown: every live room gets `room_expired`
  /// and its push connections are closed with a shutdown reason.
  pub async fn shutdown_all(&self, reason: &'static str) -> usize {
    let mut rooms = self.rooms.write().await;
    let drained = rooms.len();
    for (hash, room_handle) in rooms.iter() {
      let mut room = room_handle.write().await;
      room.dissolve(
        ServerEvent::RoomExpired {
          room_hash: hash.clone(),
        },
        Some(reason),
      );
    }
    rooms.clear();
    drained
  }

  /// Current (push, poll) member totals across all rooms.
  pub async fn member_totals(&self) -> (usize, usize) {
    let rooms = self.rooms.read().await;
    let mut push = 0;
    let mut poll = 0;
    for room in rooms.values() {
      let room = room.read().await;
      push += room.push_count();
      poll += room.poll_count();
    }
    (push, poll)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn settings() -> RelaySettings {
    RelaySettings::default()
  }

  fn envelope(ts: i64) -> Envelope {
    crate::protocol::validate_envelope(&json!({
      "room": "H", "from": "p", "payload": "c", "nonce": "n", "ts": ts
    }))
    .unwrap()
  }

  #[tokio::test]
  async fn create_collision_reports_generic_error() {
    let registry = RoomRegistry::new(settings());
    registry.create("H1", 120, Seat::Poll).await.unwrap();
    let err = registry.create("H1", 120, Seat::Poll).await.unwrap_err();
    assert_eq!(err, RelayError::Room);
    // Identical to the error for a hash that never existed.
    let missing = registry.join("H-none", Seat::Poll).await.unwrap_err();
    assert_eq!(err, missing);
  }

  #[tokio::test]
  async fn capacity_cap_is_enforced() {
    let registry = RoomRegistry::new(RelaySettings {
      max_rooms: 2,
      ..settings()
    });
    registry.create("H1", 120, Seat::Poll).await.unwrap();
    registry.create("H2", 120, Seat::Poll).await.unwrap();
    assert_eq!(
      registry.create("H3", 120, Seat::Poll).await.unwrap_err(),
      RelayError::CapacityExceeded
    );
  }

  #[tokio::test]
  async fn ttl_is_clamped_on_create() {
    let registry = RoomRegistry::new(settings());
    registry.create("H1", 59, Seat::Poll).await.unwrap();
    let room = registry.lookup("H1").await.unwrap();
    assert_eq!(room.read().await.ttl(), Duration::from_secs(60));

    registry.create("H2", 1_000_000, Seat::Poll).await.unwrap();
    let room = registry.lookup("H2").await.unwrap();
    assert_eq!(room.read().await.ttl(), Duration::from_secs(86_400));
  }

  #[tokio::test]
  async fn room_full_refuses_and_departure_reopens_slot() {
    let registry = RoomRegistry::new(RelaySettings {
      max_peers_per_room: 2,
      ..settings()
    });
    registry.create("H1", 120, Seat::Poll).await.unwrap();
    let joined = registry.join("H1", Seat::Poll).await.unwrap();
    assert_eq!(joined.peer_count, 2);
    assert_eq!(
      registry.join("H1", Seat::Poll).await.unwrap_err(),
      RelayError::RoomFull
    );

    registry
      .remove_member("H1", &joined.peer_id)
      .await
      .unwrap();
    registry.join("H1", Seat::Poll).await.unwrap();
  }

  #[tokio::test]
  async fn last_leave_destroys_room_synchronously() {
    let registry = RoomRegistry::new(settings());
    let created = registry.create("H1", 120, Seat::Poll).await.unwrap();
    registry
      .remove_member("H1", &created.peer_id)
      .await
      .unwrap();
    assert!(registry.lookup("H1").await.is_none());
    // Second leave is indistinguishable from a hash that never existed.
    assert_eq!(
      registry
        .remove_member("H1", &created.peer_id)
        .await
        .unwrap_err(),
      RelayError::Room
    );
  }

  #[tokio::test]
  async fn delete_requires_matching_token() {
    let registry = RoomRegistry::new(settings());
    let created = registry.create("H1", 120, Seat::Poll).await.unwrap();

    assert_eq!(
      registry.delete("H1", "guess").await.unwrap_err(),
      RelayError::InvalidDeleteToken
    );
    assert!(registry.lookup("H1").await.is_some());

    registry.delete("H1", &created.delete_token).await.unwrap();
    assert!(registry.lookup("H1").await.is_none());
    // Idempotent in effect: the room is gone, so the retry is generic.
    assert_eq!(
      registry
        .delete("H1", &created.delete_token)
        .await
        .unwrap_err(),
      RelayError::Room
    );
  }

  #[tokio::test]
  async fn expire_due_destroys_only_elapsed_rooms() {
    let registry = RoomRegistry::new(RelaySettings {
      min_ttl: Duration::ZERO,
      ..settings()
    });
    registry.create("H-exp", 0, Seat::Poll).await.unwrap();
    registry.create("H-live", 120, Seat::Poll).await.unwrap();

    let destroyed = registry.expire_due(Instant::now()).await;
    assert_eq!(destroyed, 1);
    assert!(registry.lookup("H-exp").await.is_none());
    assert!(registry.lookup("H-live").await.is_some());
  }

  #[tokio::test]
  async fn poll_sweep_evicts_idle_members_and_empty_rooms() {
    let registry = RoomRegistry::new(settings());
    registry.create("H1", 120, Seat::Poll).await.unwrap();

    // A sweep with a generous timeout keeps the member.
    let evicted = registry
      .sweep_poll_members(Instant::now(), Duration::from_secs(120))
      .await;
    assert_eq!(evicted, 0);

    // Zero tolerance evicts immediately and destroys the emptied room.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let evicted = registry
      .sweep_poll_members(Instant::now(), Duration::ZERO)
      .await;
    assert_eq!(evicted, 1);
    assert!(registry.lookup("H1").await.is_none());
  }

  #[tokio::test]
  async fn backlog_evicts_oldest_past_cap() {
    let registry = RoomRegistry::new(RelaySettings {
      backlog_cap: 200,
      ..settings()
    });
    registry.create("H1", 120, Seat::Poll).await.unwrap();
    let room = registry.lookup("H1").await.unwrap();
    let mut room = room.write().await;

    for ts in 1..=201 {
      room.append(envelope(ts));
    }
    assert_eq!(room.backlog.len(), 200);
    // The first envelope is eviction-visible: no cursor returns it.
    let all = room.messages_since(0.0);
    assert_eq!(all.first().unwrap().ts_value(), 2.0);
    assert_eq!(all.last().unwrap().ts_value(), 201.0);
  }

  #[tokio::test]
  async fn poll_cursor_is_strictly_greater_than() {
    let registry = RoomRegistry::new(settings());
    registry.create("H1", 120, Seat::Poll).await.unwrap();
    let room = registry.lookup("H1").await.unwrap();
    let mut room = room.write().await;
    room.append(envelope(100));
    room.append(envelope(200));

    assert_eq!(room.messages_since(0.0).len(), 2);
    assert_eq!(room.messages_since(100.0).len(), 1);
    assert!(room.messages_since(200.0).is_empty());
  }

  #[tokio::test]
  async fn delete_token_comparison_accepts_exact_only() {
    let registry = RoomRegistry::new(settings());
    let created = registry.create("H1", 120, Seat::Poll).await.unwrap();
    let room = registry.lookup("H1").await.unwrap();
    let room = room.read().await;
    assert!(room.token_matches(&created.delete_token));
    assert!(!room.token_matches(""));
    assert!(!room.token_matches(&created.delete_token[..21]));
  }
}
