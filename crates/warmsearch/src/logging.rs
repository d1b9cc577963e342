//! tracing-subscriber setup shared by every entrypoint.

use tracing_subscriber::EnvFilter;

/// Default verbosity when `RUST_LOG` is unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Info => "warn,warmsearch=info,warmsearch_local=info",
            Self::Debug => "info,warmsearch=debug,warmsearch_local=debug,warmsearch_core=debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match crate::config::env("WARMSEARCH_LOG_FORMAT")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// `WARMSEARCH_DEBUG` raises `base` to `Debug`.
pub fn level_from_env(base: LogLevel) -> LogLevel {
    if crate::config::env_truthy("WARMSEARCH_DEBUG") {
        LogLevel::Debug
    } else {
        base
    }
}

pub fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()))
}

/// Logs go to stderr; stdout carries command output and the MCP transport.
pub fn init(level: LogLevel, format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_writer(std::io::stderr)
        .with_target(true);
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.with_ansi(false).try_init(),
    };
}
