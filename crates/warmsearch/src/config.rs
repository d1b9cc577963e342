//! Environment-driven configuration for the daemon and its clients.

use std::path::PathBuf;
use std::time::Duration;
use warmsearch_core::{SearchTarget, Visibility};

pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    env(key)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_truthy(key: &str) -> bool {
    matches!(
        env(key).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_bool(key: &str, default: bool) -> bool {
    match env(key).map(|s| s.to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn sanitize_user(raw: &str) -> String {
    let s: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if s.is_empty() {
        "user".to_string()
    } else {
        s
    }
}

/// `$XDG_RUNTIME_DIR/warmsearch/warmsearch.sock`, else `/tmp/warmsearch-<user>.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime_dir) = env("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir)
            .join("warmsearch")
            .join("warmsearch.sock");
    }
    let user = env("USER").unwrap_or_else(|| "user".to_string());
    std::env::temp_dir().join(format!("warmsearch-{}.sock", sanitize_user(&user)))
}

pub fn socket_path_from_env() -> PathBuf {
    env("WARMSEARCH_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(default_socket_path)
}

fn state_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("warmsearch")
}

pub fn default_profile_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("warmsearch")
        .join("profile")
}

pub fn default_log_path() -> PathBuf {
    state_root().join("daemon.log")
}

/// What happens when consecutive challenges reach the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Relaunch the browser and cool down.
    Restart,
    /// Relaunch visibly and wait (bounded) for an operator to clear the challenge.
    Interactive { timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub max_concurrent: usize,
    pub cache_max: usize,
    pub cache_ttl: Option<Duration>,
    /// Zero disables idle shutdown.
    pub idle_timeout: Duration,
    /// Spans one whole retrieval, admission wait included.
    pub deadline: Duration,
    pub nav_timeout: Duration,
    pub ready_timeout: Duration,
    pub ready_poll: Duration,
    pub challenge_threshold: u32,
    pub cooldown: Duration,
    pub escalation: Escalation,
    /// Interval between challenge checks during interactive recovery.
    pub recovery_poll: Duration,
    pub visibility: Visibility,
    /// Largest accepted request line, newline included.
    pub max_request_bytes: usize,
    pub read_timeout: Duration,
    pub target: SearchTarget,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_concurrent: 3,
            cache_max: 100,
            cache_ttl: None,
            idle_timeout: Duration::from_secs(300),
            deadline: Duration::from_secs(45),
            nav_timeout: Duration::from_secs(15),
            ready_timeout: Duration::from_secs(8),
            ready_poll: Duration::from_millis(150),
            challenge_threshold: 3,
            cooldown: Duration::from_secs(60),
            escalation: Escalation::Restart,
            recovery_poll: Duration::from_secs(1),
            visibility: Visibility::Headless,
            max_request_bytes: 64 * 1024,
            read_timeout: Duration::from_secs(10),
            target: SearchTarget::duckduckgo(),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let escalation = match env("WARMSEARCH_ESCALATION")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "interactive" => Escalation::Interactive {
                timeout: Duration::from_secs(
                    env_u64("WARMSEARCH_RECOVERY_TIMEOUT_SECS", 120).clamp(5, 3600),
                ),
            },
            _ => Escalation::Restart,
        };
        Self {
            socket_path: socket_path_from_env(),
            max_concurrent: env_u64("WARMSEARCH_MAX_CONCURRENT", d.max_concurrent as u64)
                .clamp(1, 32) as usize,
            cache_max: env_u64("WARMSEARCH_CACHE_MAX", d.cache_max as u64).clamp(1, 100_000)
                as usize,
            cache_ttl: env("WARMSEARCH_CACHE_TTL_SECS")
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            idle_timeout: Duration::from_secs(env_u64(
                "WARMSEARCH_IDLE_TIMEOUT_SECS",
                d.idle_timeout.as_secs(),
            )),
            deadline: Duration::from_millis(
                env_u64("WARMSEARCH_DEADLINE_MS", d.deadline.as_millis() as u64)
                    .clamp(1_000, 600_000),
            ),
            nav_timeout: Duration::from_millis(
                env_u64("WARMSEARCH_NAV_TIMEOUT_MS", d.nav_timeout.as_millis() as u64)
                    .clamp(500, 300_000),
            ),
            ready_timeout: Duration::from_millis(
                env_u64("WARMSEARCH_READY_TIMEOUT_MS", d.ready_timeout.as_millis() as u64)
                    .clamp(100, 120_000),
            ),
            challenge_threshold: env_u64(
                "WARMSEARCH_CHALLENGE_THRESHOLD",
                d.challenge_threshold as u64,
            )
            .clamp(1, 100) as u32,
            cooldown: Duration::from_secs(
                env_u64("WARMSEARCH_COOLDOWN_SECS", d.cooldown.as_secs()).min(3600),
            ),
            escalation,
            visibility: if env_truthy("WARMSEARCH_HEADED") {
                Visibility::Headed
            } else {
                Visibility::Headless
            },
            ..d
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    /// Spawn a daemon when none is listening (searches only).
    pub auto_spawn: bool,
    /// Binary started with `daemon --socket <path>`; defaults to the current executable.
    pub daemon_binary: Option<PathBuf>,
    pub spawn_timeout: Duration,
    pub request_timeout: Duration,
    /// Passed to a spawned daemon as `--headed`.
    pub visibility: Visibility,
    /// Spawned daemon stderr is appended here.
    pub log_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            auto_spawn: true,
            daemon_binary: None,
            spawn_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(120),
            visibility: Visibility::Headless,
            log_path: default_log_path(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            socket_path: socket_path_from_env(),
            auto_spawn: env_bool("WARMSEARCH_AUTO_SPAWN", d.auto_spawn),
            daemon_binary: env("WARMSEARCH_DAEMON_BINARY").map(PathBuf::from),
            spawn_timeout: Duration::from_millis(
                env_u64("WARMSEARCH_SPAWN_TIMEOUT_MS", d.spawn_timeout.as_millis() as u64)
                    .clamp(500, 300_000),
            ),
            request_timeout: Duration::from_millis(
                env_u64(
                    "WARMSEARCH_REQUEST_TIMEOUT_MS",
                    d.request_timeout.as_millis() as u64,
                )
                .clamp(1_000, 900_000),
            ),
            visibility: if env_truthy("WARMSEARCH_HEADED") {
                Visibility::Headed
            } else {
                Visibility::Headless
            },
            log_path: d.log_path,
        }
    }
}
