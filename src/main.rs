use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use pagecap::cdp::CdpEngine;
use pagecap::config::ServerConfig;
use pagecap::handler::{self, AppState};
use pagecap::server;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let config = ServerConfig::parse();
    init_logging(&config.log_level);

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> Result<()> {
    // The browser must be up before the first request is accepted.
    let engine_config = config.engine_config();
    let engine = tokio::task::spawn_blocking(move || CdpEngine::launch(engine_config))
        .await
        .context("browser launch task failed")?
        .context("failed to start browser")?;
    let engine = Arc::new(engine);
    info!("browser started");

    let renders = CancellationToken::new();
    let state = AppState::new(engine.clone())
        .with_renders(renders.clone())
        .with_request_timeout(config.request_timeout())
        .with_redacted_errors(config.redact_errors);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    server::serve(
        listener,
        handler::router(state),
        renders,
        config.shutdown_grace(),
        server::shutdown_signal(),
    )
    .await
    .context("server error")?;

    match Arc::try_unwrap(engine) {
        Ok(engine) => engine.close()?,
        Err(_) => warn!("browser still referenced by abandoned requests; it is killed on exit"),
    }
    info!("stopped");
    Ok(())
}

fn init_logging(level: &str) {
    // `log` records from this crate and from headless_chrome are bridged into the subscriber.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
