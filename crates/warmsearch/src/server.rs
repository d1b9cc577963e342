//! Unix socket listener: one request line in, one JSON reply out, then close.

use crate::context::DaemonContext;
use crate::lifecycle::ShutdownReason;
use crate::pipeline::RetrievalError;
use crate::protocol::{encode, parse_request, Command, ProtocolError, Reply, StopAck};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use warmsearch_core::BrowserDriver;

#[derive(thiserror::Error, Debug)]
pub enum BindError {
    #[error("a daemon is already listening on {}", .0.display())]
    AlreadyRunning(PathBuf),
    #[error("cannot prepare socket path {}: {source}", .path.display())]
    Prepare {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot bind {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Binds the daemon socket, clearing a stale socket left by a dead daemon. A socket that
/// still accepts connections belongs to a live daemon and is left alone, and a path that is
/// not a socket at all is never removed.
pub async fn bind(path: &Path) -> Result<UnixListener, BindError> {
    let prepare = |source| BindError::Prepare {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(prepare)?;
    }
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        use std::os::unix::fs::FileTypeExt;
        if !meta.file_type().is_socket() {
            return Err(prepare(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "path exists and is not a socket",
            )));
        }
        if UnixStream::connect(path).await.is_ok() {
            return Err(BindError::AlreadyRunning(path.to_path_buf()));
        }
        info!(socket = %path.display(), "removing stale socket");
        std::fs::remove_file(path).map_err(prepare)?;
    }
    let listener = UnixListener::bind(path).map_err(|source| BindError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(prepare)?;
    }
    Ok(listener)
}

pub fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "socket removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(socket = %path.display(), "failed to remove socket: {e}"),
    }
}

/// Accepts connections until shutdown is requested. Each connection runs on its own task.
pub async fn serve<D: BrowserDriver>(listener: UnixListener, ctx: Arc<DaemonContext<D>>) {
    let mut shutdown = ctx.lifecycle.subscribe();
    if shutdown.borrow().is_some() {
        return;
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move { handle_connection(stream, ctx).await });
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || shutdown.borrow().is_some() {
                    debug!("listener closing");
                    break;
                }
            }
        }
    }
}

/// Reads one newline-terminated request, buffering partial writes. EOF ends the request
/// too, so a client that closes its write side without a newline is still served.
/// `Ok(None)` means the peer connected and left without sending anything.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: R,
    max_bytes: usize,
    timeout: Duration,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut reader = BufReader::new(reader.take(max_bytes as u64 + 1));
    let mut line = Vec::new();
    match tokio::time::timeout(timeout, reader.read_until(b'\n', &mut line)).await {
        Err(_) => Err(ProtocolError::ReadTimeout(timeout.as_millis() as u64)),
        Ok(Err(e)) => Err(ProtocolError::Malformed(e.to_string())),
        Ok(Ok(0)) => Ok(None),
        Ok(Ok(_)) if line.len() > max_bytes => Err(ProtocolError::TooLarge(max_bytes)),
        Ok(Ok(_)) => Ok(Some(line)),
    }
}

async fn handle_connection<D: BrowserDriver>(stream: UnixStream, ctx: Arc<DaemonContext<D>>) {
    let (read_half, mut write_half) = stream.into_split();
    let request = read_request(
        read_half,
        ctx.config.max_request_bytes,
        ctx.config.read_timeout,
    )
    .await;
    let command = match request.and_then(|line| line.map(|l| parse_request(&l)).transpose()) {
        Ok(None) => {
            debug!("connection closed before sending a request");
            return;
        }
        Ok(Some(cmd)) => cmd,
        Err(e) => {
            debug!("rejecting request: {e}");
            ctx.lifecycle.touch();
            write_reply(&mut write_half, &Reply::from(e)).await;
            return;
        }
    };

    match command {
        Command::Status => {
            ctx.lifecycle.touch();
            write_reply(&mut write_half, &Reply::Status(ctx.status())).await;
        }
        Command::Stop => {
            info!("stop requested by client");
            write_reply(&mut write_half, &Reply::Stopped(StopAck { stopped: true })).await;
            ctx.lifecycle.request_shutdown(ShutdownReason::StopRequest);
        }
        Command::Search(query) => {
            let t0 = Instant::now();
            ctx.lifecycle.request_started();
            // A separate task so a panic in the pipeline becomes an error reply.
            let task = {
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.search(&query).await })
            };
            let reply = match task.await {
                Ok(reply) => reply,
                Err(e) => {
                    error!("search task failed: {e}");
                    RetrievalError::Internal("search task aborted".to_string())
                        .into_reply(t0.elapsed().as_millis() as u64)
                }
            };
            ctx.lifecycle.request_finished(ctx.is_busy());
            write_reply(&mut write_half, &reply).await;
        }
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(w: &mut W, reply: &Reply) {
    let bytes = encode(reply);
    let sent = async {
        w.write_all(&bytes).await?;
        w.flush().await?;
        w.shutdown().await
    };
    if let Err(e) = sent.await {
        debug!("client went away before the reply was written: {e}");
    }
}
