use tracing_subscriber::EnvFilter;
use velum::{Config, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let config = Config::from_env();

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
    )
    .with_target(true)
    .init();

  tracing::info!(
    port = config.port,
    trusted_proxies = config.trusted_proxies,
    "starting velum relay"
  );

  let server = Server::new(config);
  let code = server.run(shutdown_signal()).await?;
  if code != 0 {
    std::process::exit(code);
  }
  Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
      _ = sigint.recv() => {},
      _ = sigterm.recv() => {},
    }
  }
  #[cfg(not(unix))]
  {
    let _ = tokio::signal::ctrl_c().await;
  }
}
