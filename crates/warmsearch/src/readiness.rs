//! First-of-N readiness race.
//!
//! A results page is considered ready when any independent check settles first: the
//! completion marker appears, the content container holds enough text, or the hard
//! timeout fires. This is a heuristic. A partially rendered page that already carries the
//! marker, or enough boilerplate text, is declared ready early and extraction sees
//! whatever was there at that moment.

use futures::future::{select_all, BoxFuture};
use futures::FutureExt;
use std::time::Duration;
use tracing::debug;
use warmsearch_core::{BrowserDriver, SearchTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Marker,
    ContentLength(usize),
    TimedOut,
    /// Every check errored out before the timeout.
    Unavailable,
}

/// A check resolves to `Some` when it observed readiness, `None` when it gave up.
pub type ReadinessCheck<'a> = BoxFuture<'a, Option<Readiness>>;

pub async fn first_ready(checks: Vec<ReadinessCheck<'_>>, hard_timeout: Duration) -> Readiness {
    let race = async move {
        let mut pending = checks;
        while !pending.is_empty() {
            let (res, _idx, rest) = select_all(pending).await;
            if let Some(r) = res {
                return r;
            }
            pending = rest;
        }
        Readiness::Unavailable
    };
    tokio::time::timeout(hard_timeout, race)
        .await
        .unwrap_or(Readiness::TimedOut)
}

/// Polls until `selector` exists. Gives up on the first driver error.
pub fn marker_check<'a, D: BrowserDriver>(
    driver: &'a D,
    page: &'a D::Page,
    selector: &'a str,
    every: Duration,
) -> ReadinessCheck<'a> {
    async move {
        loop {
            match driver.selector_present(page, selector).await {
                Ok(true) => return Some(Readiness::Marker),
                Ok(false) => {}
                Err(e) => {
                    debug!("marker check failed: {e}");
                    return None;
                }
            }
            tokio::time::sleep(every).await;
        }
    }
    .boxed()
}

/// Polls until the text under `selector` reaches `min_chars`.
pub fn content_check<'a, D: BrowserDriver>(
    driver: &'a D,
    page: &'a D::Page,
    selector: &'a str,
    min_chars: usize,
    every: Duration,
) -> ReadinessCheck<'a> {
    async move {
        loop {
            match driver.text_len(page, selector).await {
                Ok(n) if n >= min_chars => return Some(Readiness::ContentLength(n)),
                Ok(_) => {}
                Err(e) => {
                    debug!("content check failed: {e}");
                    return None;
                }
            }
            tokio::time::sleep(every).await;
        }
    }
    .boxed()
}

pub async fn wait_for_results<D: BrowserDriver>(
    driver: &D,
    page: &D::Page,
    target: &SearchTarget,
    every: Duration,
    hard_timeout: Duration,
) -> Readiness {
    first_ready(
        vec![
            marker_check(driver, page, &target.ready_selector, every),
            content_check(
                driver,
                page,
                &target.content_selector,
                target.min_content_chars,
                every,
            ),
        ],
        hard_timeout,
    )
    .await
}
