//! Reusable browser tabs.
//!
//! Tabs are expensive to set up (stealth script, network blocking), so released tabs are
//! kept for the next retrieval. Each tab records the browser generation it was opened on;
//! a relaunch bumps the generation and stale tabs are closed instead of pooled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use warmsearch_core::{BrowserDriver, Error, Result};

struct IdlePage<P> {
    page: P,
    generation: u64,
}

pub struct PagePool<D: BrowserDriver> {
    driver: Arc<D>,
    capacity: usize,
    idle: Mutex<Vec<IdlePage<D::Page>>>,
    generation: AtomicU64,
    opened: AtomicU64,
    reused: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    Pooled,
    Discarded,
}

impl<D: BrowserDriver> PagePool<D> {
    pub fn new(driver: Arc<D>, capacity: usize) -> Self {
        Self {
            driver,
            capacity: capacity.max(1),
            idle: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            opened: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    fn idle_lock(&self) -> std::sync::MutexGuard<'_, Vec<IdlePage<D::Page>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Reuses an idle tab from the current generation, else opens a new one on `session`.
    pub async fn checkout(self: &Arc<Self>, session: &D::Session) -> Result<PageLease<D>> {
        let generation = self.generation();
        let reused = {
            let mut idle = self.idle_lock();
            let mut found = None;
            while let Some(p) = idle.pop() {
                if p.generation == generation {
                    found = Some(p.page);
                    break;
                }
                self.close_detached(p.page);
            }
            found
        };
        let page = match reused {
            Some(page) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                page
            }
            None => {
                let page = self.driver.open_page(session).await?;
                self.opened.fetch_add(1, Ordering::Relaxed);
                debug!(generation, "opened tab");
                page
            }
        };
        Ok(PageLease {
            pool: self.clone(),
            page: Some(page),
            generation,
            reusable: false,
        })
    }

    /// Pools `page` when it is reusable, current, and there is room; otherwise closes it.
    pub fn release(&self, page: D::Page, generation: u64, reusable: bool) -> Released {
        if reusable && generation == self.generation() {
            let mut idle = self.idle_lock();
            if idle.len() < self.capacity {
                idle.push(IdlePage { page, generation });
                return Released::Pooled;
            }
        }
        self.close_detached(page);
        Released::Discarded
    }

    /// Bumps the generation and hands back every idle tab for closing.
    pub fn invalidate(&self) -> Vec<D::Page> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.idle_lock().drain(..).map(|p| p.page).collect()
    }

    pub async fn drain(&self) {
        let pages = self.invalidate();
        for page in pages {
            self.driver.close_page(page).await;
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle_lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    fn close_detached(&self, page: D::Page) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let driver = self.driver.clone();
                handle.spawn(async move { driver.close_page(page).await });
            }
            Err(_) => drop(page),
        }
    }
}

/// Exclusive use of one tab. Dropping the lease returns the tab to the pool only after
/// `keep()`; any other exit (error, deadline, panic) closes it.
pub struct PageLease<D: BrowserDriver> {
    pool: Arc<PagePool<D>>,
    page: Option<D::Page>,
    generation: u64,
    reusable: bool,
}

impl<D: BrowserDriver> PageLease<D> {
    pub fn page(&self) -> Result<&D::Page> {
        self.page
            .as_ref()
            .ok_or_else(|| Error::Driver("tab already released".to_string()))
    }

    pub fn keep(&mut self) {
        self.reusable = true;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<D: BrowserDriver> Drop for PageLease<D> {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            self.pool.release(page, self.generation, self.reusable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDriver, FakeSession};

    fn pool(capacity: usize) -> (Arc<FakeDriver>, Arc<PagePool<FakeDriver>>) {
        let driver = Arc::new(FakeDriver::new());
        let pool = Arc::new(PagePool::new(driver.clone(), capacity));
        (driver, pool)
    }

    #[tokio::test]
    async fn kept_page_is_reused_without_reopening() {
        let (driver, pool) = pool(2);
        let session = FakeSession::default();
        let mut lease = pool.checkout(&session).await.expect("checkout");
        let id = lease.page().expect("page").id;
        lease.keep();
        drop(lease);
        assert_eq!(pool.idle_len(), 1);

        let lease = pool.checkout(&session).await.expect("checkout");
        assert_eq!(lease.page().expect("page").id, id);
        assert_eq!(driver.pages_opened(), 1);
        assert_eq!(pool.reused(), 1);
    }

    #[tokio::test]
    async fn unkept_page_is_closed() {
        let (driver, pool) = pool(2);
        let session = FakeSession::default();
        drop(pool.checkout(&session).await.expect("checkout"));
        tokio::task::yield_now().await;
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(driver.pages_closed(), 1);
    }

    #[tokio::test]
    async fn release_at_capacity_discards() {
        let (driver, pool) = pool(1);
        let session = FakeSession::default();
        let mut a = pool.checkout(&session).await.expect("a");
        let mut b = pool.checkout(&session).await.expect("b");
        a.keep();
        b.keep();
        drop(a);
        drop(b);
        tokio::task::yield_now().await;
        assert_eq!(pool.idle_len(), 1);
        assert_eq!(driver.pages_closed(), 1);
    }

    #[tokio::test]
    async fn invalidate_drops_stale_generation() {
        let (driver, pool) = pool(2);
        let session = FakeSession::default();
        let mut lease = pool.checkout(&session).await.expect("checkout");
        lease.keep();
        pool.drain().await;
        assert_eq!(pool.generation(), 1);
        // Returned after the relaunch: closed, not pooled.
        drop(lease);
        tokio::task::yield_now().await;
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(driver.pages_closed(), 1);
    }

    #[tokio::test]
    async fn open_failure_propagates() {
        let (driver, pool) = pool(1);
        driver.fail_open_pages(true);
        let session = FakeSession::default();
        assert!(pool.checkout(&session).await.is_err());
        assert_eq!(pool.opened(), 0);
    }
}
