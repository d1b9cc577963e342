#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warmsearch::config::DaemonConfig;
use warmsearch::lifecycle::ShutdownReason;
use warmsearch::server::BindError;
use warmsearch::DaemonContext;
use warmsearch_core::{BrowserDriver, Error, NavOutcome, Result, SearchTarget, Visibility};
use warmsearch_local::ResultsMarkdownParser;

/// Browser stand-in that renders canned result pages after a fixed delay.
#[derive(Default)]
pub struct ScriptedBrowser {
    pub launch_delay: Duration,
    pub nav_delay: Duration,
    pub locked_profile: bool,
    pub launches: AtomicUsize,
    pub navigations: AtomicUsize,
}

pub struct Tab {
    html: Mutex<String>,
}

fn results_page(title: &str, snippet: &str) -> String {
    format!(
        r#"<html><body><div id="links"><div class="result"><a class="result__a" href="https://example.org/{}">{title}</a><a class="result__snippet">{snippet}</a></div></div></body></html>"#,
        title.len()
    )
}

#[async_trait::async_trait]
impl BrowserDriver for ScriptedBrowser {
    type Session = ();
    type Page = Tab;

    async fn launch(&self, _visibility: Visibility) -> Result<()> {
        tokio::time::sleep(self.launch_delay).await;
        if self.locked_profile {
            return Err(Error::ProfileLocked("held by pid 4242".to_string()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _session: &()) {}

    async fn open_page(&self, _session: &()) -> Result<Tab> {
        Ok(Tab {
            html: Mutex::new(String::new()),
        })
    }

    async fn close_page(&self, _page: Tab) {}

    async fn navigate(
        &self,
        page: &Tab,
        url: &str,
        _target: &SearchTarget,
        _timeout: Duration,
    ) -> NavOutcome {
        self.navigations.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.nav_delay).await;
        if url.contains("bots") {
            return NavOutcome::Challenge {
                marker: "#challenge-form".to_string(),
            };
        }
        let html = if url.contains("France") {
            results_page("Paris - Wikipedia", "Paris is the capital and largest city of France.")
        } else {
            results_page("Some result", "Nothing in particular.")
        };
        *page.html.lock().unwrap_or_else(|e| e.into_inner()) = html;
        NavOutcome::Loaded {
            final_url: url.to_string(),
        }
    }

    async fn challenge_present(&self, _page: &Tab, _target: &SearchTarget) -> Result<bool> {
        Ok(false)
    }

    async fn selector_present(&self, page: &Tab, selector: &str) -> Result<bool> {
        let html = page.html.lock().unwrap_or_else(|e| e.into_inner());
        Ok(html.contains(selector.trim_start_matches(['.', '#'])))
    }

    async fn text_len(&self, page: &Tab, _selector: &str) -> Result<usize> {
        Ok(page.html.lock().unwrap_or_else(|e| e.into_inner()).len())
    }

    async fn html(&self, page: &Tab) -> Result<String> {
        Ok(page.html.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

pub struct RunningDaemon {
    pub ctx: Arc<DaemonContext<ScriptedBrowser>>,
    pub handle: tokio::task::JoinHandle<std::result::Result<ShutdownReason, BindError>>,
}

pub fn daemon_config(dir: &Path) -> DaemonConfig {
    DaemonConfig {
        socket_path: dir.join("warmsearch.sock"),
        idle_timeout: Duration::ZERO,
        ready_timeout: Duration::from_secs(2),
        ..DaemonConfig::default()
    }
}

pub async fn start(config: DaemonConfig, browser: ScriptedBrowser) -> RunningDaemon {
    let socket = config.socket_path.clone();
    let ctx = DaemonContext::new(
        config,
        Arc::new(browser),
        Arc::new(ResultsMarkdownParser::default()),
    );
    let handle = tokio::spawn(warmsearch::daemon::run(ctx.clone()));
    for _ in 0..200 {
        if tokio::net::UnixStream::connect(&socket).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    RunningDaemon { ctx, handle }
}

/// Sends raw bytes and reads the reply until the daemon closes the connection.
pub async fn raw_exchange(socket: &Path, chunks: &[&[u8]], gap: Duration) -> serde_json::Value {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = tokio::net::UnixStream::connect(socket)
        .await
        .expect("connect");
    for chunk in chunks {
        stream.write_all(chunk).await.expect("write");
        tokio::time::sleep(gap).await;
    }
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.expect("read");
    assert_eq!(buf.last(), Some(&b'\n'), "reply must end with a newline");
    serde_json::from_slice(&buf).expect("reply json")
}
