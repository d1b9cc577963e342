//! Chrome DevTools Protocol driver.
//!
//! One browser process (or one attached endpoint) per session, one tab per page. The
//! profile directory persists across relaunches.

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, SetBlockedUrLsParams};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::{Handler, Page};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warmsearch_core::{BrowserDriver, Error, NavOutcome, Result, SearchTarget, Visibility};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

const LAUNCH_ARGS: [&str; 12] = [
    "--no-sandbox",
    "--disable-dev-shm-usage",
    "--disable-blink-features=AutomationControlled",
    "--exclude-switches=enable-automation",
    "--disable-plugins-discovery",
    "--disable-default-apps",
    "--no-first-run",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-background-timer-throttling",
    "--disable-features=TranslateUI",
    "--disable-component-extensions-with-background-pages",
];

/// Runs before any page script on every navigation of a pooled tab.
const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
window.chrome = window.chrome || { runtime: {} };
"#;

const LOCK_FILE: &str = "SingletonLock";

#[derive(Debug, Clone)]
pub struct ChromiumConfig {
    pub executable: Option<PathBuf>,
    pub profile_dir: PathBuf,
    /// Attach to an already-running browser instead of launching one.
    pub cdp_endpoint: Option<String>,
    pub user_agent: String,
    pub window: (u32, u32),
    /// URL patterns dropped at the network layer (images, fonts, media).
    pub blocked_patterns: Vec<String>,
    pub launch_timeout: Duration,
}

impl ChromiumConfig {
    pub fn new(profile_dir: PathBuf) -> Self {
        Self {
            executable: None,
            profile_dir,
            cdp_endpoint: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            window: (1366, 768),
            blocked_patterns: default_blocked_patterns(),
            launch_timeout: Duration::from_secs(30),
        }
    }

    /// `WARMSEARCH_PROFILE_DIR` overrides `default_profile_dir`.
    pub fn from_env(default_profile_dir: PathBuf) -> Self {
        let profile_dir = crate::env("WARMSEARCH_PROFILE_DIR")
            .map(PathBuf::from)
            .unwrap_or(default_profile_dir);
        let mut cfg = Self::new(profile_dir);
        cfg.executable = crate::env("WARMSEARCH_CHROME").map(PathBuf::from);
        cfg.cdp_endpoint = crate::env("WARMSEARCH_CDP_ENDPOINT");
        if let Some(ua) = crate::env("WARMSEARCH_USER_AGENT") {
            cfg.user_agent = ua;
        }
        cfg.launch_timeout = Duration::from_millis(
            crate::env_u64("WARMSEARCH_LAUNCH_TIMEOUT_MS", 30_000).clamp(1_000, 300_000),
        );
        cfg
    }
}

pub fn default_blocked_patterns() -> Vec<String> {
    [
        "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico", "*.woff", "*.woff2",
        "*.ttf", "*.otf", "*.mp4", "*.webm", "*.mp3",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub struct ChromiumSession {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
    /// False when attached over `cdp_endpoint`; an attached browser is never closed.
    owned: bool,
}

pub struct ChromiumPage {
    page: Page,
}

pub struct ChromiumDriver {
    config: ChromiumConfig,
}

impl ChromiumDriver {
    pub fn new(config: ChromiumConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChromiumConfig {
        &self.config
    }

    async fn connect(&self, endpoint: &str) -> Result<ChromiumSession> {
        let ws = resolve_ws_endpoint(endpoint, self.config.launch_timeout).await?;
        let (browser, handler) =
            tokio::time::timeout(self.config.launch_timeout, Browser::connect(ws.clone()))
                .await
                .map_err(|_| Error::Launch(format!("timed out attaching to {ws}")))?
                .map_err(|e| Error::Launch(format!("attach to {ws}: {e}")))?;
        info!(endpoint = %ws, "attached to running browser");
        Ok(ChromiumSession {
            browser: Mutex::new(browser),
            handler: spawn_handler(handler),
            owned: false,
        })
    }

    async fn eval<T: DeserializeOwned>(&self, page: &ChromiumPage, js: String) -> Result<T> {
        let res = page
            .page
            .evaluate(js)
            .await
            .map_err(|e| Error::Driver(e.to_string()))?;
        res.into_value::<T>()
            .map_err(|e| Error::Driver(format!("unexpected evaluation result: {e}")))
    }

    async fn probe_challenge(
        &self,
        page: &ChromiumPage,
        target: &SearchTarget,
    ) -> Result<Option<String>> {
        let marker: String = self.eval(page, challenge_probe_js(target)).await?;
        Ok(Some(marker).filter(|m| !m.is_empty()))
    }
}

#[async_trait::async_trait]
impl BrowserDriver for ChromiumDriver {
    type Session = ChromiumSession;
    type Page = ChromiumPage;

    async fn launch(&self, visibility: Visibility) -> Result<ChromiumSession> {
        if let Some(endpoint) = self.config.cdp_endpoint.as_deref() {
            return self.connect(endpoint).await;
        }
        prepare_profile(&self.config.profile_dir)?;

        let mut args: Vec<String> = LAUNCH_ARGS.iter().map(|s| s.to_string()).collect();
        args.push(format!("--user-agent={}", self.config.user_agent));
        let mut builder = BrowserConfig::builder()
            .user_data_dir(&self.config.profile_dir)
            .window_size(self.config.window.0, self.config.window.1)
            .request_timeout(self.config.launch_timeout)
            .args(args);
        if !visibility.is_headless() {
            builder = builder.with_head();
        }
        if let Some(exe) = &self.config.executable {
            builder = builder.chrome_executable(exe);
        }
        let cfg = builder.build().map_err(Error::Launch)?;

        let (browser, handler) =
            match tokio::time::timeout(self.config.launch_timeout, Browser::launch(cfg)).await {
                Err(_) => {
                    return Err(Error::Launch(format!(
                        "browser did not start within {}ms",
                        self.config.launch_timeout.as_millis()
                    )))
                }
                Ok(Err(e)) => return Err(classify_launch_error(&e.to_string())),
                Ok(Ok(pair)) => pair,
            };
        info!(
            profile = %self.config.profile_dir.display(),
            headless = visibility.is_headless(),
            "browser launched"
        );
        Ok(ChromiumSession {
            browser: Mutex::new(browser),
            handler: spawn_handler(handler),
            owned: true,
        })
    }

    async fn close(&self, session: &ChromiumSession) {
        if session.owned {
            let mut browser = session.browser.lock().await;
            if let Err(e) = browser.close().await {
                debug!("browser close error (ignored): {e}");
            }
            if let Err(e) = browser.wait().await {
                debug!("browser wait error (ignored): {e}");
            }
        }
        session.handler.abort();
    }

    async fn open_page(&self, session: &ChromiumSession) -> Result<ChromiumPage> {
        let page = {
            let browser = session.browser.lock().await;
            browser.new_page("about:blank").await
        }
        .map_err(|e| Error::PageSetup(format!("new tab: {e}")))?;

        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(STEALTH_SCRIPT))
            .await
            .map_err(|e| Error::PageSetup(format!("stealth script: {e}")))?;
        if !self.config.blocked_patterns.is_empty() {
            page.execute(EnableParams::default())
                .await
                .map_err(|e| Error::PageSetup(format!("network enable: {e}")))?;
            page.execute(SetBlockedUrLsParams::new(self.config.blocked_patterns.clone()))
                .await
                .map_err(|e| Error::PageSetup(format!("resource blocking: {e}")))?;
        }
        Ok(ChromiumPage { page })
    }

    async fn close_page(&self, page: ChromiumPage) {
        if let Err(e) = page.page.close().await {
            debug!("tab close error (ignored): {e}");
        }
    }

    async fn navigate(
        &self,
        page: &ChromiumPage,
        url: &str,
        target: &SearchTarget,
        timeout: Duration,
    ) -> NavOutcome {
        let timed_out = match tokio::time::timeout(timeout, page.page.goto(url)).await {
            Err(_) => true,
            Ok(Err(e)) => return NavOutcome::Failed(e.to_string()),
            Ok(Ok(_)) => false,
        };
        // A challenge interstitial can stall the load event, so probe even after a timeout.
        match self.probe_challenge(page, target).await {
            Ok(Some(marker)) => return NavOutcome::Challenge { marker },
            Ok(None) => {}
            Err(e) if timed_out => debug!("challenge probe after timeout failed: {e}"),
            Err(e) => return NavOutcome::Failed(e.to_string()),
        }
        if timed_out {
            warn!(timeout_ms = timeout.as_millis() as u64, "navigation timed out");
            return NavOutcome::TimedOut;
        }
        let final_url = page
            .page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());
        NavOutcome::Loaded { final_url }
    }

    async fn challenge_present(&self, page: &ChromiumPage, target: &SearchTarget) -> Result<bool> {
        Ok(self.probe_challenge(page, target).await?.is_some())
    }

    async fn selector_present(&self, page: &ChromiumPage, selector: &str) -> Result<bool> {
        self.eval(page, selector_present_js(selector)).await
    }

    async fn text_len(&self, page: &ChromiumPage, selector: &str) -> Result<usize> {
        self.eval(page, text_len_js(selector)).await
    }

    async fn html(&self, page: &ChromiumPage) -> Result<String> {
        page.page
            .content()
            .await
            .map_err(|e| Error::Driver(format!("read page content: {e}")))
    }
}

fn spawn_handler(mut handler: Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            let Err(e) = event else { continue };
            let msg = e.to_string();
            // Newer Chrome builds emit CDP messages chromiumoxide does not model.
            if msg.contains("data did not match any variant of untagged enum Message") {
                continue;
            }
            if msg.contains("connection closed")
                || msg.contains("websocket closed")
                || msg.contains("transport error")
            {
                warn!("browser connection lost: {msg}");
                break;
            }
            debug!("cdp handler error (continuing): {msg}");
        }
        debug!("cdp handler finished");
    })
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: String,
}

async fn resolve_ws_endpoint(endpoint: &str, timeout: Duration) -> Result<String> {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return Ok(endpoint.to_string());
    }
    let base = url::Url::parse(endpoint)
        .map_err(|e| Error::InvalidUrl(format!("{endpoint}: {e}")))?;
    let version_url = base
        .join("/json/version")
        .map_err(|e| Error::InvalidUrl(format!("{endpoint}: {e}")))?;
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::NotConfigured(e.to_string()))?;
    let info: VersionInfo = client
        .get(version_url.clone())
        .send()
        .await
        .map_err(|e| Error::Launch(format!("GET {version_url}: {e}")))?
        .json()
        .await
        .map_err(|e| Error::Launch(format!("GET {version_url}: {e}")))?;
    Ok(info.ws_url)
}

/// Creates the profile directory and clears a lock left behind by a dead browser.
pub(crate) fn prepare_profile(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::ProfileUnavailable(format!("{}: {e}", dir.display())))?;
    let lock = dir.join(LOCK_FILE);
    let Ok(target) = std::fs::read_link(&lock) else {
        return Ok(());
    };
    let Some(pid) = lock_owner_pid(&target.to_string_lossy()) else {
        return Ok(());
    };
    // Liveness is only checkable through /proc; elsewhere the launch itself reports the lock.
    if !cfg!(target_os = "linux") {
        return Ok(());
    }
    if Path::new("/proc").join(pid.to_string()).exists() {
        return Err(Error::ProfileLocked(format!(
            "{} is in use by pid {pid}",
            dir.display()
        )));
    }
    debug!(pid, "removing stale profile lock");
    std::fs::remove_file(&lock)
        .map_err(|e| Error::ProfileUnavailable(format!("{}: {e}", lock.display())))
}

/// `SingletonLock` points at `<hostname>-<pid>`.
pub(crate) fn lock_owner_pid(target: &str) -> Option<u32> {
    target.rsplit_once('-')?.1.trim().parse().ok()
}

pub(crate) fn classify_launch_error(msg: &str) -> Error {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("singletonlock")
        || lower.contains("processsingleton")
        || lower.contains("profile appears to be in use")
    {
        Error::ProfileLocked(msg.to_string())
    } else if lower.contains("user data directory") && lower.contains("permission denied") {
        Error::ProfileUnavailable(msg.to_string())
    } else {
        Error::Launch(msg.to_string())
    }
}

fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn js_array(items: &[String]) -> String {
    serde_json::Value::from(items.to_vec()).to_string()
}

pub(crate) fn challenge_probe_js(target: &SearchTarget) -> String {
    format!(
        r#"(() => {{
  const sels = {sels};
  const texts = {texts};
  for (const s of sels) {{
    try {{ if (document.querySelector(s)) return s; }} catch (e) {{}}
  }}
  const body = document.body ? (document.body.innerText || '') : '';
  for (const t of texts) {{
    if (body.includes(t)) return t;
  }}
  return '';
}})()"#,
        sels = js_array(&target.challenge_selectors),
        texts = js_array(&target.challenge_text),
    )
}

pub(crate) fn selector_present_js(selector: &str) -> String {
    format!(
        "(() => {{ try {{ return !!document.querySelector({}); }} catch (e) {{ return false; }} }})()",
        js_string(selector)
    )
}

pub(crate) fn text_len_js(selector: &str) -> String {
    format!(
        "(() => {{ let el = null; try {{ el = document.querySelector({}); }} catch (e) {{}} return el ? (el.innerText || '').length : 0; }})()",
        js_string(selector)
    )
}
