//! Periodic sweeper: TTL-expired rooms, timed-out poll peers, and stale
//! rate windows. Sweeps run through the same registry entry points as
//! client-driven destruction, so an expiry is observationally identical
//! to a delete.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::relay::Relay;

/// Spawn the janitor task. It ticks at the configured interval until the
/// shutdown channel flips.
pub fn spawn(relay: Arc<Relay>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(relay.settings.janitor_interval);
    interval.tick().await; // immediate first tick carries no work

    loop {
      tokio::select! {
        _ = interval.tick() => sweep(&relay).await,
        result = shutdown.changed() => {
          if result.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    tracing::debug!("janitor stopped");
  })
}

/// One full pass: expire rooms, evict idle poll peers, drop stale rate
/// windows.
pub async fn sweep(relay: &Relay) {
  let now = Instant::now();

  let expired = relay.registry.expire_due(now).await;
  if expired > 0 {
    tracing::info!(rooms = expired, "expired rooms destroyed");
  }

  let evicted = relay
    .registry
    .sweep_poll_members(now, relay.settings.poll_timeout)
    .await;
  if evicted > 0 {
    tracing::info!(peers = evicted, "idle poll peers evicted");
  }

  relay.limiter.sweep().await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{Config, RelaySettings};
  use crate::rate_limit::RateLimits;
  use crate::room::Seat;
  use std::time::Duration;

  #[tokio::test]
  async fn sweep_destroys_expired_rooms_and_idle_poll_peers() {
    let relay = Relay::new(
      Config::default(),
      RelaySettings {
        min_ttl: Duration::ZERO,
        poll_timeout: Duration::ZERO,
        ..RelaySettings::default()
      },
      RateLimits::default(),
    );

    relay
      .create_room("a", "H-exp", 0, Seat::Poll)
      .await
      .unwrap();
    relay
      .create_room("a", "H-idle", 3600, Seat::Poll)
      .await
      .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    sweep(&relay).await;

    // The first room hit its TTL; the second lost its only poll peer.
    assert!(relay.registry.lookup("H-exp").await.is_none());
    assert!(relay.registry.lookup("H-idle").await.is_none());
  }

  #[tokio::test]
  async fn spawned_janitor_stops_on_shutdown_signal() {
    let relay = Arc::new(Relay::new(
      Config::default(),
      RelaySettings {
        janitor_interval: Duration::from_millis(10),
        ..RelaySettings::default()
      },
      RateLimits::default(),
    ));
    let (tx, rx) = watch::channel(false);
    let handle = spawn(relay, rx);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
      .await
      .expect("janitor exits promptly")
      .unwrap();
  }
}
