//! Per-client rate limiting for room creation, joins, and message sends.

use std::{
  collections::HashMap,
  time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::error::RelayError;

/// Rate-limited client actions, each with an independent counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  Create,
  Join,
  Message,
}

/// Configuration for the sliding-window limiter.
#[derive(Debug, Clone)]
pub struct RateLimits {
  /// Window length; counters reset when a window is older than this.
  pub window: Duration,
  /// Room creations allowed per window.
  pub max_creates: u32,
  /// Room joins allowed per window.
  pub max_joins: u32,
  /// Message sends allowed per window.
  pub max_messages: u32,
}

impl Default for RateLimits {
  fn default() -> Self {
    Self {
      window: Duration::from_secs(60),
      max_creates: 5,
      max_joins: 20,
      max_messages: 60,
    }
  }
}

#[derive(Debug)]
struct ClientWindow {
  started: Instant,
  creates: u32,
  joins: u32,
  messages: u32,
}

impl ClientWindow {
  fn new(now: Instant) -> Self {
    Self {
      started: now,
      creates: 0,
      joins: 0,
      messages: 0,
    }
  }

  fn reset(&mut self, now: Instant) {
    self.started = now;
    self.creates = 0;
    self.joins = 0;
    self.messages = 0;
  }
}

/// Sliding-window counter per client key per action.
///
/// The check runs before any room-state side effect and before any
/// validation that could leak room existence, so a rate-limited caller
/// learns nothing about the hash it addressed.
pub struct RateLimiter {
  limits: RateLimits,
  windows: RwLock<HashMap<String, ClientWindow>>,
}

impl RateLimiter {
  pub fn new(limits: RateLimits) -> Self {
    Self {
      limits,
      windows: RwLock::new(HashMap::new()),
    }
  }

  /// Admit or deny one action for `client_key`. Admission increments the
  /// action's counter; denial leaves all state untouched.
  pub async fn check(&self, client_key: &str, action: Action) -> Result<(), RelayError> {
    let now = Instant::now();
    let mut windows = self.windows.write().await;
    let window = windows
      .entry(client_key.to_string())
      .or_insert_with(|| ClientWindow::new(now));

    if now.duration_since(window.started) > self.limits.window {
      window.reset(now);
    }

    let (counter, limit) = match action {
      Action::Create => (&mut window.creates, self.limits.max_creates),
      Action::Join => (&mut window.joins, self.limits.max_joins),
      Action::Message => (&mut window.messages, self.limits.max_messages),
    };

    if *counter >= limit {
      tracing::warn!(client = %client_key, ?action, "rate limit exceeded");
      return Err(RelayError::RateLimited);
    }

    *counter += 1;
    Ok(())
  }

  /// Drop windows idle for more than twice the window length. Run by the
  /// janitor so the table stays bounded by recently active clients.
  pub async fn sweep(&self) {
    let cutoff = self.limits.window * 2;
    let now = Instant::now();
    let mut windows = self.windows.write().await;
    windows.retain(|_, w| now.duration_since(w.started) <= cutoff);
  }

  #[cfg(test)]
  pub(crate) async fn tracked_clients(&self) -> usize {
    self.windows.read().await.len()
  }
}
