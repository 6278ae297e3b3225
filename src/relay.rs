//! The relay aggregate: one value owning the room registry, the rate
//! limiter, the tunable limits, and the lifetime counters.
//!
//! Both transports dispatch through the methods here, so push and poll
//! peers see one room state machine: the rate gate runs first, then
//! structural validation, then the registry operation. There is no hidden
//! module-level state; tests instantiate isolated relays.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use serde_json::Value;

use crate::{
  config::{Config, RelaySettings},
  error::RelayError,
  protocol::validate_envelope,
  rate_limit::{Action, RateLimiter, RateLimits},
  room::{CreatedRoom, JoinedRoom, PollResult, RoomRegistry, Seat},
};

/// Point-in-time operational snapshot, served by the health probe.
pub struct RelayStats {
  pub uptime_secs: u64,
  pub rooms: usize,
  pub push_peers: usize,
  pub poll_peers: usize,
  pub rooms_created: u64,
  pub messages_relayed: u64,
}

pub struct Relay {
  pub registry: RoomRegistry,
  pub limiter: RateLimiter,
  pub settings: RelaySettings,
  pub config: Config,
  started: Instant,
  shutting_down: AtomicBool,
  rooms_created: AtomicU64,
  messages_relayed: AtomicU64,
}

impl Relay {
  pub fn new(config: Config, settings: RelaySettings, limits: RateLimits) -> Self {
    Self {
      registry: RoomRegistry::new(settings.clone()),
      limiter: RateLimiter::new(limits),
      settings,
      config,
      started: Instant::now(),
      shutting_down: AtomicBool::new(false),
      rooms_created: AtomicU64::new(0),
      messages_relayed: AtomicU64::new(0),
    }
  }

  /// Create a room with the caller seated as its first member. The rate
  /// gate runs before the registry is touched.
  pub async fn create_room(
    &self,
    client_key: &str,
    hash: &str,
    ttl_seconds: i64,
    seat: Seat,
  ) -> Result<CreatedRoom, RelayError> {
    self.limiter.check(client_key, Action::Create).await?;
    let created = self.registry.create(hash, ttl_seconds, seat).await?;
    self.rooms_created.fetch_add(1, Ordering::Relaxed);
    Ok(created)
  }

  pub async fn join_room(
    &self,
    client_key: &str,
    hash: &str,
    seat: Seat,
  ) -> Result<JoinedRoom, RelayError> {
    self.limiter.check(client_key, Action::Join).await?;
    // A connection holds at most one seat per room; a repeat join is a
    // generic failure, checked only after the rate gate has charged it.
    if let Seat::Push { rooms, .. } = &seat {
      let seated = rooms
        .lock()
        .expect("connection room set lock poisoned")
        .contains_key(hash);
      if seated {
        return Err(RelayError::Room);
      }
    }
    self.registry.join(hash, seat).await
  }

  pub async fn leave_room(&self, hash: &str, peer_id: &str) -> Result<usize, RelayError> {
    self.registry.remove_member(hash, peer_id).await
  }

  pub async fn delete_room(&self, hash: &str, token: &str) -> Result<(), RelayError> {
    self.registry.delete(hash, token).await
  }

  /// Relay one envelope. Validation order is fixed: rate gate, then
  /// structural envelope checks, then room lookup and membership, so a
  /// malformed or rate-limited request cannot probe for live hashes.
  /// `expected_room` pins the envelope to the room it was addressed to
  /// (the poll surface passes the path hash); a mismatch is a structural
  /// failure, charged like any other message attempt.
  pub async fn send_message(
    &self,
    client_key: &str,
    sender_id: &str,
    raw_envelope: &Value,
    expected_room: Option<&str>,
  ) -> Result<(), RelayError> {
    self.limiter.check(client_key, Action::Message).await?;
    let envelope = validate_envelope(raw_envelope)?;
    if let Some(expected) = expected_room {
      if envelope.room != expected {
        return Err(RelayError::InvalidEnvelope);
      }
    }
    self.registry.publish(sender_id, envelope).await?;
    self.messages_relayed.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  pub async fn poll(
    &self,
    hash: &str,
    peer_id: Option<&str>,
    since: f64,
  ) -> Result<PollResult, RelayError> {
    self.registry.poll(hash, peer_id, since).await
  }

  pub fn is_shutting_down(&self) -> bool {
    self.shutting_down.load(Ordering::SeqCst)
  }

  /// Idempotent shutdown entry: flips the flag, expires every live room,
  /// and closes push connections with the given reason. Returns the
  /// number of rooms drained (zero on repeat calls).
  pub async fn begin_shutdown(&self, reason: &'static str) -> usize {
    if self.shutting_down.swap(true, Ordering::SeqCst) {
      return 0;
    }
    let drained = self.registry.shutdown_all(reason).await;
    tracing::info!(rooms = drained, "registry drained for shutdown");
    drained
  }

  pub async fn stats(&self) -> RelayStats {
    let (push_peers, poll_peers) = self.registry.member_totals().await;
    RelayStats {
      uptime_secs: self.started.elapsed().as_secs(),
      rooms: self.registry.len().await,
      push_peers,
      poll_peers,
      rooms_created: self.rooms_created.load(Ordering::Relaxed),
      messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
    }
  }
}
