//! Client side of the socket protocol, with auto-start of a missing daemon.

use crate::config::ClientConfig;
use crate::hints::remediation_hint;
use crate::protocol::{
    decode_reply, encode, ProtocolError, Reply, SearchSuccess, StatusReport, WireRequest,
    STATUS_COMMAND, STOP_COMMAND,
};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{debug, info};

const SPAWN_POLL: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("no daemon is listening on {}", .0.display())]
    NotRunning(PathBuf),
    #[error("failed to start daemon: {0}")]
    Spawn(String),
    #[error("daemon did not start listening within {0}ms")]
    StartTimeout(u64),
    #[error("daemon connection failed: {0}")]
    Connection(String),
    #[error("daemon did not reply within {0}ms")]
    Timeout(u64),
    #[error("unreadable reply from daemon: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{message}")]
    Server {
        message: String,
        code: Option<String>,
        hint: Option<String>,
        retry_after_ms: Option<u64>,
    },
    #[error("daemon sent an unexpected kind of reply")]
    UnexpectedReply,
}

impl ClientError {
    pub fn code(&self) -> &str {
        match self {
            Self::NotRunning(_) => "daemon_unavailable",
            Self::Spawn(_) | Self::StartTimeout(_) => "daemon_start_failed",
            Self::Connection(_) => "daemon_unavailable",
            Self::Timeout(_) => "daemon_timeout",
            Self::Protocol(_) | Self::UnexpectedReply => "protocol_error",
            Self::Server { code, .. } => code.as_deref().unwrap_or("search_failed"),
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Server { hint: Some(h), .. } => Some(h.clone()),
            _ => remediation_hint(self.code()).map(str::to_string),
        }
    }

    fn is_unreachable(&self) -> bool {
        matches!(self, Self::NotRunning(_))
    }
}

pub struct DaemonClient {
    config: ClientConfig,
}

impl DaemonClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(ClientConfig::from_env())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Searches, starting the daemon first if none is listening and auto-start is on.
    pub async fn search(&self, query: &str) -> Result<SearchSuccess, ClientError> {
        match self.request(query, true).await? {
            Reply::Search(found) => Ok(found),
            Reply::Failure(f) => Err(ClientError::Server {
                message: f.error,
                code: f.code,
                hint: f.hint,
                retry_after_ms: f.retry_after_ms,
            }),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// Never starts a daemon.
    pub async fn status(&self) -> Result<StatusReport, ClientError> {
        match self.request(STATUS_COMMAND, false).await? {
            Reply::Status(s) => Ok(s),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// `Ok(false)` when no daemon was running.
    pub async fn stop(&self) -> Result<bool, ClientError> {
        match self.request(STOP_COMMAND, false).await {
            Ok(Reply::Stopped(ack)) => Ok(ack.stopped),
            Ok(_) => Err(ClientError::UnexpectedReply),
            Err(e) if e.is_unreachable() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn request(&self, query: &str, may_spawn: bool) -> Result<Reply, ClientError> {
        match self.exchange(query).await {
            Err(e) if e.is_unreachable() && may_spawn && self.config.auto_spawn => {
                info!(socket = %self.config.socket_path.display(), "daemon not running, starting it");
                self.spawn_daemon()?;
                self.wait_until_listening().await?;
                self.exchange(query).await
            }
            other => other,
        }
    }

    async fn exchange(&self, query: &str) -> Result<Reply, ClientError> {
        let path = &self.config.socket_path;
        let mut stream = UnixStream::connect(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                ClientError::NotRunning(path.clone())
            }
            _ => ClientError::Connection(e.to_string()),
        })?;
        let timeout = self.config.request_timeout;
        let io = async {
            stream.write_all(&encode(&WireRequest::new(query))).await?;
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        };
        let buf = tokio::time::timeout(timeout, io)
            .await
            .map_err(|_| ClientError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        Ok(decode_reply(&buf)?)
    }

    fn daemon_command(&self) -> Result<Command, ClientError> {
        let binary = match &self.config.daemon_binary {
            Some(b) => b.clone(),
            None => std::env::current_exe()
                .map_err(|e| ClientError::Spawn(format!("cannot locate own binary: {e}")))?,
        };
        let mut cmd = Command::new(binary);
        cmd.arg("daemon").arg("--socket").arg(&self.config.socket_path);
        if !self.config.visibility.is_headless() {
            cmd.arg("--headed");
        }
        Ok(cmd)
    }

    /// Starts a detached daemon whose stderr goes to the log file.
    fn spawn_daemon(&self) -> Result<(), ClientError> {
        let mut cmd = self.daemon_command()?;
        let stderr = match open_log(&self.config.log_path) {
            Ok(f) => Stdio::from(f),
            Err(e) => {
                debug!(log = %self.config.log_path.display(), "daemon log unavailable: {e}");
                Stdio::null()
            }
        };
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(stderr);
        {
            use std::os::unix::process::CommandExt;
            // Own process group: the client's Ctrl-C must not take the daemon down.
            cmd.process_group(0);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| ClientError::Spawn(e.to_string()))?;
        info!(pid = child.id(), "daemon spawned");
        // Reap the daemon if this process outlives it.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }

    async fn wait_until_listening(&self) -> Result<(), ClientError> {
        let give_up = Instant::now() + self.config.spawn_timeout;
        loop {
            if UnixStream::connect(&self.config.socket_path).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= give_up {
                return Err(ClientError::StartTimeout(
                    self.config.spawn_timeout.as_millis() as u64,
                ));
            }
            tokio::time::sleep(SPAWN_POLL).await;
        }
    }
}

fn open_log(path: &std::path::Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}
