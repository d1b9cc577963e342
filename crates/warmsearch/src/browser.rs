//! The single shared browser session.
//!
//! Launch is lazy and single-flight: concurrent callers that find no session queue on
//! `init` and the first one launches while the rest reuse its result. After `shutdown`
//! the browser stays closed: a recovery still running cannot relaunch it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use warmsearch_core::{BrowserDriver, Error, Result, Visibility};

pub struct SharedBrowser<D: BrowserDriver> {
    driver: Arc<D>,
    session: RwLock<Option<Arc<D::Session>>>,
    visibility: RwLock<Visibility>,
    init: tokio::sync::Mutex<()>,
    launches: AtomicU64,
    closed: AtomicBool,
}

impl<D: BrowserDriver> SharedBrowser<D> {
    pub fn new(driver: Arc<D>, visibility: Visibility) -> Self {
        Self {
            driver,
            session: RwLock::new(None),
            visibility: RwLock::new(visibility),
            init: tokio::sync::Mutex::new(()),
            launches: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn current(&self) -> Option<Arc<D::Session>> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn store(&self, session: Option<Arc<D::Session>>) -> Option<Arc<D::Session>> {
        let mut slot = self.session.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, session)
    }

    pub fn visibility(&self) -> Visibility {
        *self.visibility.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.current().is_some()
    }

    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Driver("shared browser is shut down".to_string()));
        }
        Ok(())
    }

    /// Returns the live session, launching it first if needed.
    pub async fn get(&self) -> Result<Arc<D::Session>> {
        if let Some(s) = self.current() {
            return Ok(s);
        }
        let _init = self.init.lock().await;
        if let Some(s) = self.current() {
            return Ok(s);
        }
        self.ensure_open()?;
        let visibility = self.visibility();
        let session = Arc::new(self.driver.launch(visibility).await?);
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.store(Some(session.clone()));
        info!(headless = visibility.is_headless(), "shared browser ready");
        Ok(session)
    }

    /// Closes the current session and launches a new one with `visibility`.
    pub async fn relaunch(&self, visibility: Visibility) -> Result<Arc<D::Session>> {
        let _init = self.init.lock().await;
        self.ensure_open()?;
        if let Some(old) = self.store(None) {
            self.driver.close(&old).await;
        }
        *self.visibility.write().unwrap_or_else(|e| e.into_inner()) = visibility;
        let session = Arc::new(self.driver.launch(visibility).await?);
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.store(Some(session.clone()));
        warn!(headless = visibility.is_headless(), "shared browser relaunched");
        Ok(session)
    }

    pub async fn shutdown(&self) {
        let _init = self.init.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        if let Some(old) = self.store(None) {
            self.driver.close(&old).await;
            info!("shared browser closed");
        }
    }
}
