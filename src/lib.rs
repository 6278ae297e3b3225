//! Zero-knowledge relay for end-to-end-encrypted ephemeral rooms.
//!
//! The relay forwards opaque ciphertext envelopes between peers in
//! short-lived rooms without ever decrypting content. Peers connect over
//! a persistent WebSocket (real-time push) or a stateless HTTP surface
//! (pull-based polling); both transports share one in-memory room
//! registry and interoperate peer-to-peer.

pub mod config;
pub mod error;
pub mod http;
pub mod janitor;
pub mod protocol;
pub mod rate_limit;
pub mod relay;
pub mod room;
pub mod server;
pub mod token;
pub mod ws;

pub use config::{Config, RelaySettings};
pub use error::RelayError;
pub use protocol::{ClientEvent, Envelope, ServerEvent};
pub use rate_limit::{RateLimiter, RateLimits};
pub use relay::Relay;
pub use room::{RoomRegistry, Seat};
pub use server::{router, Server};
