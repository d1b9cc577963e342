use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("browser profile unavailable: {0}")]
    ProfileUnavailable(String),
    #[error("browser profile locked: {0}")]
    ProfileLocked(String),
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("page setup failed: {0}")]
    PageSetup(String),
    #[error("browser call failed: {0}")]
    Driver(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether the shared browser shows a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Headless,
    Headed,
}

impl Visibility {
    pub fn is_headless(self) -> bool {
        matches!(self, Self::Headless)
    }
}

/// Where queries are sent and how the resulting page is read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchTarget {
    pub name: String,
    /// Base URL; the query is appended as `query_param`.
    pub endpoint: String,
    pub query_param: String,
    /// CSS selectors whose presence means an anti-bot challenge is showing.
    pub challenge_selectors: Vec<String>,
    /// Body text fragments that mean the same thing.
    pub challenge_text: Vec<String>,
    /// Selector that marks the results as rendered.
    pub ready_selector: String,
    /// Container holding the results (also used for the content-length readiness check).
    pub content_selector: String,
    pub min_content_chars: usize,
    /// One block per result inside `content_selector`.
    pub result_selector: String,
    pub title_selector: String,
    pub snippet_selector: String,
    /// Result blocks matching this selector are skipped (ads).
    pub skip_selector: Option<String>,
    pub max_results: usize,
}

impl SearchTarget {
    pub fn duckduckgo() -> Self {
        Self {
            name: "duckduckgo".to_string(),
            endpoint: "https://html.duckduckgo.com/html/".to_string(),
            query_param: "q".to_string(),
            challenge_selectors: vec![".anomaly-modal".to_string(), "#challenge-form".to_string()],
            challenge_text: vec![
                "Unfortunately, bots use DuckDuckGo too".to_string(),
                "Please complete the following challenge".to_string(),
            ],
            ready_selector: ".result".to_string(),
            content_selector: "#links".to_string(),
            min_content_chars: 200,
            result_selector: ".result".to_string(),
            title_selector: ".result__a".to_string(),
            snippet_selector: ".result__snippet".to_string(),
            skip_selector: Some(".result--ad".to_string()),
            max_results: 10,
        }
    }

    pub fn url_for(&self, query: &str) -> Result<String> {
        let url = url::Url::parse_with_params(&self.endpoint, &[(self.query_param.as_str(), query)])
            .map_err(|e| Error::InvalidUrl(format!("{}: {e}", self.endpoint)))?;
        Ok(url.to_string())
    }
}

impl Default for SearchTarget {
    fn default() -> Self {
        Self::duckduckgo()
    }
}

/// Result of navigating a page to the query endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavOutcome {
    Loaded { final_url: String },
    /// A challenge marker matched; `marker` names which one.
    Challenge { marker: String },
    /// The navigation step hit its own timeout; the page may still hold partial content.
    TimedOut,
    Failed(String),
}

#[async_trait::async_trait]
pub trait BrowserDriver: Send + Sync + 'static {
    type Session: Send + Sync + 'static;
    type Page: Send + Sync + 'static;

    async fn launch(&self, visibility: Visibility) -> Result<Self::Session>;
    async fn close(&self, session: &Self::Session);

    /// Opens a tab with stealth scripts and resource blocking already applied.
    async fn open_page(&self, session: &Self::Session) -> Result<Self::Page>;
    async fn close_page(&self, page: Self::Page);

    async fn navigate(
        &self,
        page: &Self::Page,
        url: &str,
        target: &SearchTarget,
        timeout: Duration,
    ) -> NavOutcome;
    async fn challenge_present(&self, page: &Self::Page, target: &SearchTarget) -> Result<bool>;
    async fn selector_present(&self, page: &Self::Page, selector: &str) -> Result<bool>;
    /// Length of the visible text under `selector`, 0 when absent.
    async fn text_len(&self, page: &Self::Page, selector: &str) -> Result<usize>;
    async fn html(&self, page: &Self::Page) -> Result<String>;
}

/// Turns a results page into Markdown. `None` means nothing worth returning was found.
pub trait Parser: Send + Sync {
    fn extract(&self, html: &str, target: &SearchTarget) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_for_encodes_query() {
        let t = SearchTarget::duckduckgo();
        let u = t.url_for("capital of France & more").expect("url");
        assert!(u.starts_with("https://html.duckduckgo.com/html/?q="));
        assert!(u.contains("capital+of+France+%26+more"));
    }

    #[test]
    fn url_for_rejects_bad_endpoint() {
        let t = SearchTarget {
            endpoint: "not a url".to_string(),
            ..SearchTarget::default()
        };
        assert!(matches!(t.url_for("x"), Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn visibility_serializes_lowercase() {
        let v = serde_json::to_value(Visibility::Headed).expect("ser");
        assert_eq!(v, serde_json::json!("headed"));
        assert!(Visibility::default().is_headless());
    }
}
