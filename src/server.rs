//! Server lifecycle: route assembly, startup, and graceful shutdown.
//!
//! One listener serves both transports: the push upgrade route and the
//! poll routes live on the same Router and share one in-memory relay.
//! Shutdown drains the registry (every live room hears `room_expired`,
//! push sockets close with a shutting-down reason) and then stops the
//! listener, with a hard deadline bounding the whole stop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
  extract::DefaultBodyLimit,
  middleware,
  routing::{delete, get, post},
  Router,
};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

use crate::{
  config::{Config, RelaySettings},
  http, janitor,
  rate_limit::RateLimits,
  relay::Relay,
  ws,
};

pub struct Server {
  relay: Arc<Relay>,
}

impl Server {
  /// Build a server with the stock limits.
  pub fn new(config: Config) -> Self {
    Self::with_settings(config, RelaySettings::default(), RateLimits::default())
  }

  /// Build a server with explicit limits; tests use this to shrink caps.
  pub fn with_settings(config: Config, settings: RelaySettings, limits: RateLimits) -> Self {
    Self {
      relay: Arc::new(Relay::new(config, settings, limits)),
    }
  }

  pub fn relay(&self) -> Arc<Relay> {
    self.relay.clone()
  }

  pub fn router(&self) -> Router {
    router(self.relay.clone())
  }

  /// Bind the configured port and serve until `shutdown` resolves.
  /// Returns the process exit code: 0 for a clean drain, 1 when the
  /// shutdown deadline forced termination.
  pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<i32> {
    let addr = SocketAddr::from(([0, 0, 0, 0], self.relay.config.port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "relay listening");
    self.run_on(listener, shutdown).await
  }

  /// Serve on an already-bound listener (tests bind port 0).
  pub async fn run_on(
    self,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
  ) -> anyhow::Result<i32> {
    let relay = self.relay.clone();

    let (janitor_tx, janitor_rx) = watch::channel(false);
    let janitor = janitor::spawn(relay.clone(), janitor_rx);

    let (close_tx, close_rx) = oneshot::channel::<()>();
    let app = router(relay.clone());
    let serve = axum::serve(
      listener,
      app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
      let _ = close_rx.await;
    });
    let server_task = tokio::spawn(async move { serve.await });

    shutdown.await;
    tracing::info!("shutdown signal received, draining");

    let _ = janitor_tx.send(true);
    relay.begin_shutdown("shutting down").await;
    let _ = close_tx.send(());

    let drain = async move {
      let _ = janitor.await;
      server_task.await
    };
    match tokio::time::timeout(relay.settings.shutdown_deadline, drain).await {
      Ok(joined) => {
        joined??;
        tracing::info!("relay stopped cleanly");
        Ok(0)
      }
      Err(_) => {
        tracing::warn!(
          deadline_secs = relay.settings.shutdown_deadline.as_secs(),
          "shutdown deadline exceeded, forcing exit"
        );
        Ok(1)
      }
    }
  }
}

/// The unified route table: one push upgrade route beside the poll
/// surface, all dispatching into the shared relay.
pub fn router(relay: Arc<Relay>) -> Router {
  Router::new()
    .route("/ws", get(ws::ws_handler))
    .route("/rooms", post(http::create_room))
    .route("/rooms/:hash/join", post(http::join_room))
    .route("/rooms/:hash/send", post(http::send_message))
    .route("/rooms/:hash/poll", get(http::poll_room))
    .route("/rooms/:hash/leave", post(http::leave_room))
    .route("/rooms/:hash", delete(http::delete_room))
    .route("/health", get(http::health))
    .layer(middleware::from_fn_with_state(
      relay.clone(),
      http::security_headers,
    ))
    .layer(DefaultBodyLimit::max(relay.settings.max_frame_bytes))
    .with_state(relay)
}
