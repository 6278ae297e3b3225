//! Process-environment configuration and tunable relay limits.

use std::env;
use std::time::Duration;

/// Configuration read from the process environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
  /// Listen port (`RELAY_PORT`, default 3001).
  pub port: u16,
  /// Allowed CORS origin for poll responses (`CORS_ORIGIN`, default `*`).
  pub cors_origin: String,
  /// Reverse-proxy hop count for client address resolution
  /// (`TRUSTED_PROXIES`, default 0; 0 means the forwarded header is ignored).
  pub trusted_proxies: usize,
  /// Structured-log verbosity (`LOG_LEVEL`, default `info`).
  pub log_level: String,
}

impl Config {
  pub fn from_env() -> Self {
    Self {
      port: env_u16("RELAY_PORT", 3001),
      cors_origin: env_string("CORS_ORIGIN", "*"),
      trusted_proxies: env_usize("TRUSTED_PROXIES", 0),
      log_level: env_string("LOG_LEVEL", "info"),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      port: 3001,
      cors_origin: "*".to_string(),
      trusted_proxies: 0,
      log_level: "info".to_string(),
    }
  }
}

fn env_string(name: &str, default: &str) -> String {
  env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u16(name: &str, default: u16) -> u16 {
  env::var(name)
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
  env::var(name)
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(default)
}

/// Hard limits and timing for the relay. Every bound lives here so tests
/// can instantiate a shrunken relay without touching constants.
#[derive(Debug, Clone)]
pub struct RelaySettings {
  /// Server-wide cap on live rooms.
  pub max_rooms: usize,
  /// Cap on push + poll members per room.
  pub max_peers_per_room: usize,
  /// Bounded per-room backlog; overflow evicts oldest.
  pub backlog_cap: usize,
  /// Maximum decoded frame / request body size in bytes.
  pub max_frame_bytes: usize,
  /// Room TTL clamp, lower bound.
  pub min_ttl: Duration,
  /// Room TTL clamp, upper bound.
  pub max_ttl: Duration,
  /// Interval between server-sent liveness probes on push connections.
  pub heartbeat_interval: Duration,
  /// Poll members idle longer than this are evicted by the janitor.
  pub poll_timeout: Duration,
  /// Janitor sweep period.
  pub janitor_interval: Duration,
  /// Hard ceiling on graceful-shutdown draining.
  pub shutdown_deadline: Duration,
}

impl Default for RelaySettings {
  fn default() -> Self {
    Self {
      max_rooms: 10_000,
      max_peers_per_room: 50,
      backlog_cap: 200,
      max_frame_bytes: 64 * 1024,
      min_ttl: Duration::from_secs(60),
      max_ttl: Duration::from_secs(86_400),
      heartbeat_interval: Duration::from_secs(30),
      poll_timeout: Duration::from_secs(120),
      janitor_interval: Duration::from_secs(10),
      shutdown_deadline: Duration::from_secs(5),
    }
  }
}

impl RelaySettings {
  /// Clamp a client-supplied TTL (in seconds) into the configured range.
  pub fn clamp_ttl(&self, ttl_seconds: i64) -> Duration {
    let ttl = Duration::from_secs(ttl_seconds.max(0) as u64);
    ttl.clamp(self.min_ttl, self.max_ttl)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ttl_is_clamped_into_range() {
    let settings = RelaySettings::default();
    assert_eq!(settings.clamp_ttl(59), Duration::from_secs(60));
    assert_eq!(settings.clamp_ttl(120), Duration::from_secs(120));
    assert_eq!(settings.clamp_ttl(1_000_000), Duration::from_secs(86_400));
    assert_eq!(settings.clamp_ttl(-5), Duration::from_secs(60));
  }

  #[test]
  fn env_defaults_apply() {
    let config = Config::default();
    assert_eq!(config.port, 3001);
    assert_eq!(config.cors_origin, "*");
    assert_eq!(config.trusted_proxies, 0);
  }
}
