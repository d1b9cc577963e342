//! Daemon entry point: bind, serve, and tear down on stop, idle timeout, or signal.

use crate::context::DaemonContext;
use crate::lifecycle::ShutdownReason;
use crate::server::{self, BindError};
use std::sync::Arc;
use tracing::{info, warn};
use warmsearch_core::BrowserDriver;

/// Runs until shutdown and returns why it stopped. The socket file is gone on return.
pub async fn run<D: BrowserDriver>(ctx: Arc<DaemonContext<D>>) -> Result<ShutdownReason, BindError> {
    let socket = ctx.config.socket_path.clone();
    let listener = server::bind(&socket).await?;
    ctx.lifecycle.mark_listening();
    info!(
        socket = %socket.display(),
        max_concurrent = ctx.config.max_concurrent,
        idle_timeout_secs = ctx.config.idle_timeout.as_secs(),
        "daemon listening"
    );

    // Warm the browser without blocking the listener; status reports `initializing` until
    // this lands.
    let warmup = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = ctx.browser.get().await {
                warn!("browser warm-up failed, the first search retries: {e}");
            }
        })
    };
    let idle = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let busy = ctx.clone();
            ctx.lifecycle.watch_idle(move || busy.is_busy()).await
        })
    };
    let signals = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let name = wait_for_signal().await;
            ctx.lifecycle.request_shutdown(ShutdownReason::Signal(name));
        })
    };

    server::serve(listener, ctx.clone()).await;
    let reason = ctx.lifecycle.stopped().await;
    // Nothing new reaches the daemon once the socket is gone.
    server::remove_socket(&socket);
    idle.abort();
    signals.abort();
    warmup.abort();

    ctx.release_resources().await;
    ctx.lifecycle.mark_stopped();
    info!(%reason, "daemon stopped");
    Ok(reason)
}

async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}
