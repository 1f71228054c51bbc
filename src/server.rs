//! Listener lifecycle: serving, signal handling and bounded graceful shutdown

use std::future::Future;
use std::time::Duration;

use axum::Router;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Time handlers get to unwind once their renders have been cancelled
const ABORT_WAIT: Duration = Duration::from_secs(1);

/// Serve `app` on `listener` until `shutdown` resolves.
///
/// After `shutdown` the listener stops accepting and in-flight requests get
/// `grace` to finish. Whatever is still running then has `renders` cancelled
/// under it and the server task is torn down.
pub async fn serve<F>(
    listener: TcpListener,
    app: Router,
    renders: CancellationToken,
    grace: Duration,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    let draining = CancellationToken::new();
    let drain_signal = draining.clone();

    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { drain_signal.cancelled().await })
            .await
    });
    info!("listening on {}", addr);

    tokio::select! {
        joined = &mut server => return flatten(joined),
        _ = shutdown => {}
    }

    info!("shutting down...");
    draining.cancel();

    if let Ok(joined) = tokio::time::timeout(grace, &mut server).await {
        return flatten(joined);
    }

    warn!(
        "requests still in flight after {}ms; cancelling their renders",
        grace.as_millis()
    );
    renders.cancel();
    match tokio::time::timeout(ABORT_WAIT, &mut server).await {
        Ok(joined) => flatten(joined),
        Err(_) => {
            server.abort();
            Ok(())
        }
    }
}

fn flatten(joined: std::result::Result<std::io::Result<()>, JoinError>) -> Result<()> {
    joined
        .map_err(|e| Error::Other(format!("server task failed: {}", e)))?
        .map_err(Error::from)
}

/// Resolves on SIGINT (Ctrl+C) or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
