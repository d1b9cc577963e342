//! The daemon's state, created once at startup and shared by every connection.

use crate::admission::AdmissionController;
use crate::browser::SharedBrowser;
use crate::cache::ResultCache;
use crate::challenge::ChallengeTracker;
use crate::config::DaemonConfig;
use crate::lifecycle::Lifecycle;
use crate::pool::PagePool;
use crate::protocol::{BrowserState, StatusReport};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use warmsearch_core::{BrowserDriver, Parser, Visibility};

pub struct DaemonContext<D: BrowserDriver> {
    pub(crate) config: DaemonConfig,
    pub(crate) driver: Arc<D>,
    pub(crate) parser: Arc<dyn Parser>,
    pub(crate) browser: SharedBrowser<D>,
    pub(crate) pool: Arc<PagePool<D>>,
    pub(crate) admission: AdmissionController,
    cache: Mutex<ResultCache>,
    challenge: Mutex<ChallengeTracker>,
    pub(crate) lifecycle: Lifecycle,
    started: Instant,
}

impl<D: BrowserDriver> DaemonContext<D> {
    pub fn new(config: DaemonConfig, driver: Arc<D>, parser: Arc<dyn Parser>) -> Arc<Self> {
        let browser = SharedBrowser::new(driver.clone(), config.visibility);
        let pool = Arc::new(PagePool::new(driver.clone(), config.max_concurrent));
        Arc::new(Self {
            browser,
            pool,
            admission: AdmissionController::new(config.max_concurrent),
            cache: Mutex::new(ResultCache::new(config.cache_max, config.cache_ttl)),
            challenge: Mutex::new(ChallengeTracker::new(
                config.challenge_threshold,
                config.cooldown,
            )),
            lifecycle: Lifecycle::new(config.idle_timeout),
            started: Instant::now(),
            driver,
            parser,
            config,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn pool(&self) -> &PagePool<D> {
        &self.pool
    }

    pub fn browser(&self) -> &SharedBrowser<D> {
        &self.browser
    }

    pub(crate) fn cache_lock(&self) -> MutexGuard<'_, ResultCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn challenge_lock(&self) -> MutexGuard<'_, ChallengeTracker> {
        self.challenge.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cache_len(&self) -> usize {
        self.cache_lock().len()
    }

    /// Retrievals hold a slot or wait for one.
    pub fn is_busy(&self) -> bool {
        self.admission.active() > 0 || self.admission.waiting() > 0
    }

    pub fn status(&self) -> StatusReport {
        let (consecutive, state) = {
            let mut t = self.challenge_lock();
            // Lets an elapsed cooldown report as normal.
            t.cooldown_remaining(Instant::now());
            (t.consecutive(), t.state().as_str())
        };
        StatusReport {
            status: "running".to_string(),
            uptime: self.started.elapsed().as_secs(),
            cache_size: self.cache_len(),
            browser: if self.browser.is_ready() {
                BrowserState::Connected
            } else {
                BrowserState::Initializing
            },
            pool_size: Some(self.pool.idle_len()),
            headless: Some(self.browser.visibility() == Visibility::Headless),
            active: Some(self.admission.active()),
            queued: Some(self.admission.waiting()),
            consecutive_challenges: Some(consecutive),
            challenge_state: Some(state.to_string()),
        }
    }

    /// Stops admitting work, closes pooled tabs, then the browser.
    pub async fn release_resources(&self) {
        self.admission.close();
        self.pool.drain().await;
        self.browser.shutdown().await;
    }
}
