//! Scripted in-memory browser used by unit tests.
//!
//! Navigation behavior is picked from the URL: `challenge` shows an anti-bot page,
//! `explode` panics, `blank` renders nothing, `stall` times out with results, `broken`
//! fails. Anything else renders a results page.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use warmsearch_core::{BrowserDriver, Error, NavOutcome, Result, SearchTarget, Visibility};

#[derive(Debug, Default)]
pub struct FakeSession {
    pub id: u64,
    pub visibility: Visibility,
}

#[derive(Debug)]
pub struct FakePage {
    pub id: u64,
    html: Mutex<String>,
}

#[derive(Default)]
pub struct FakeDriver {
    next_id: AtomicU64,
    launches: AtomicUsize,
    headed_launches: AtomicUsize,
    closes: AtomicUsize,
    pages_opened: AtomicUsize,
    pages_closed: AtomicUsize,
    navigations: AtomicUsize,
    fail_open: AtomicBool,
    launch_error: Mutex<Option<fn(String) -> Error>>,
    challenge_all: AtomicBool,
    /// Challenge polls that still report the challenge during recovery.
    challenge_polls_left: AtomicUsize,
    nav_delay: Mutex<Duration>,
    launch_delay: Mutex<Duration>,
}

pub fn results_html(title: &str, snippet: &str) -> String {
    format!(
        r#"<html><body><div id="links"><div class="result"><a class="result__a" href="https://example.com/r">{title}</a><a class="result__snippet">{snippet}</a></div></div></body></html>"#
    )
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nav_delay(self, d: Duration) -> Self {
        *self.nav_delay.lock().unwrap_or_else(|e| e.into_inner()) = d;
        self
    }

    pub fn with_launch_delay(self, d: Duration) -> Self {
        *self.launch_delay.lock().unwrap_or_else(|e| e.into_inner()) = d;
        self
    }

    pub fn fail_open_pages(&self, on: bool) {
        self.fail_open.store(on, Ordering::SeqCst);
    }

    pub fn fail_launch(&self, make: Option<fn(String) -> Error>) {
        *self.launch_error.lock().unwrap_or_else(|e| e.into_inner()) = make;
    }

    pub fn challenge_everything(&self, on: bool) {
        self.challenge_all.store(on, Ordering::SeqCst);
    }

    pub fn clear_challenge_after_polls(&self, polls: usize) {
        self.challenge_polls_left.store(polls, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn headed_launches(&self) -> usize {
        self.headed_launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn pages_opened(&self) -> usize {
        self.pages_opened.load(Ordering::SeqCst)
    }

    pub fn pages_closed(&self) -> usize {
        self.pages_closed.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BrowserDriver for FakeDriver {
    type Session = FakeSession;
    type Page = FakePage;

    async fn launch(&self, visibility: Visibility) -> Result<FakeSession> {
        let delay = *self.launch_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let err = *self.launch_error.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(make) = err {
            return Err(make("scripted launch failure".to_string()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !visibility.is_headless() {
            self.headed_launches.fetch_add(1, Ordering::SeqCst);
        }
        Ok(FakeSession {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            visibility,
        })
    }

    async fn close(&self, _session: &FakeSession) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn open_page(&self, _session: &FakeSession) -> Result<FakePage> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::PageSetup("scripted".to_string()));
        }
        self.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(FakePage {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            html: Mutex::new(String::new()),
        })
    }

    async fn close_page(&self, _page: FakePage) {
        self.pages_closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn navigate(
        &self,
        page: &FakePage,
        url: &str,
        _target: &SearchTarget,
        _timeout: Duration,
    ) -> NavOutcome {
        self.navigations.fetch_add(1, Ordering::SeqCst);
        let delay = *self.nav_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if url.contains("explode") {
            panic!("scripted driver panic");
        }
        if self.challenge_all.load(Ordering::SeqCst) || url.contains("challenge") {
            return NavOutcome::Challenge {
                marker: ".anomaly-modal".to_string(),
            };
        }
        if url.contains("broken") {
            return NavOutcome::Failed("net::ERR_CONNECTION_RESET".to_string());
        }
        let html = if url.contains("blank") {
            "<html><body></body></html>".to_string()
        } else if url.contains("France") || url.contains("france") {
            results_html("Paris - Wikipedia", "Paris is the capital of France.")
        } else {
            results_html("Example result", url)
        };
        *page.html.lock().unwrap_or_else(|e| e.into_inner()) = html;
        if url.contains("stall") {
            return NavOutcome::TimedOut;
        }
        NavOutcome::Loaded {
            final_url: url.to_string(),
        }
    }

    async fn challenge_present(&self, page: &FakePage, _target: &SearchTarget) -> Result<bool> {
        let left = self.challenge_polls_left.load(Ordering::SeqCst);
        if left == 0 {
            *page.html.lock().unwrap_or_else(|e| e.into_inner()) =
                results_html("Recovered result", "cleared by operator");
            return Ok(false);
        }
        self.challenge_polls_left.store(left - 1, Ordering::SeqCst);
        Ok(true)
    }

    async fn selector_present(&self, page: &FakePage, selector: &str) -> Result<bool> {
        let html = page.html.lock().unwrap_or_else(|e| e.into_inner());
        Ok(html.contains(selector.trim_start_matches(['.', '#'])))
    }

    async fn text_len(&self, page: &FakePage, _selector: &str) -> Result<usize> {
        Ok(page.html.lock().unwrap_or_else(|e| e.into_inner()).len())
    }

    async fn html(&self, page: &FakePage) -> Result<String> {
        Ok(page.html.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}
