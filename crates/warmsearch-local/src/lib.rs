//! Concrete collaborators for the warmsearch daemon: a Chrome DevTools driver and a
//! results-page parser.

pub mod chromium;
pub mod extract;

pub use chromium::{ChromiumConfig, ChromiumDriver, ChromiumPage, ChromiumSession};
pub use extract::ResultsMarkdownParser;

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
