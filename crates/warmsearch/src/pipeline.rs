//! One search, end to end: cache, cooldown gate, admission, tab, navigation, readiness,
//! extraction, and challenge escalation.

use crate::cache::normalize_query;
use crate::challenge::Verdict;
use crate::config::Escalation;
use crate::context::DaemonContext;
use crate::hints::remediation_hint;
use crate::protocol::{Reply, SearchFailure, SearchSuccess};
use crate::readiness::wait_for_results;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warmsearch_core::{BrowserDriver, NavOutcome, Visibility};

#[derive(thiserror::Error, Debug)]
pub enum RetrievalError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error(transparent)]
    Browser(#[from] warmsearch_core::Error),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("anti-bot challenge detected ({consecutive}/{threshold} consecutive)")]
    Challenge { consecutive: u32, threshold: u32 },
    #[error("searching paused after repeated anti-bot challenges")]
    CoolingDown { retry_after: Duration },
    #[error("challenge was not cleared within {0}s")]
    ChallengeUnresolved(u64),
    #[error("no results could be extracted from the page")]
    ExtractionFailed,
    #[error("search did not finish within {0}ms")]
    DeadlineExceeded(u64),
    #[error("daemon is shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
}

impl RetrievalError {
    pub fn code(&self) -> &'static str {
        use warmsearch_core::Error as E;
        match self {
            Self::EmptyQuery => "empty_query",
            Self::Browser(E::ProfileLocked(_)) => "profile_locked",
            Self::Browser(E::ProfileUnavailable(_)) => "profile_unavailable",
            Self::Browser(E::Launch(_)) | Self::Browser(E::NotConfigured(_)) => {
                "browser_launch_failed"
            }
            Self::Browser(E::InvalidUrl(_)) => "navigation_failed",
            Self::Browser(_) => "browser_error",
            Self::Navigation(_) => "navigation_failed",
            Self::Challenge { .. } => "challenge_detected",
            Self::CoolingDown { .. } => "cooling_down",
            Self::ChallengeUnresolved(_) => "challenge_unresolved",
            Self::ExtractionFailed => "extraction_failed",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::ShuttingDown => "shutting_down",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        remediation_hint(self.code())
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CoolingDown { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn into_reply(self, time_ms: u64) -> Reply {
        Reply::Failure(SearchFailure {
            error: self.to_string(),
            time_ms,
            code: Some(self.code().to_string()),
            hint: self.hint().map(str::to_string),
            retry_after_ms: self.retry_after().map(|d| d.as_millis() as u64),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    pub markdown: String,
    pub from_cache: bool,
}

/// What the deadline-bounded part of a retrieval produced.
enum Fetched {
    Page(String),
    /// Escalation took over. The task answers the query on its own clock: interactive
    /// recovery waits on an operator for up to its own timeout, which may exceed the
    /// request deadline.
    Recovering(JoinHandle<Result<String, RetrievalError>>),
}

fn elapsed_ms(t0: Instant) -> u64 {
    t0.elapsed().as_millis() as u64
}

/// Puts the tracker into cooldown if a recovery ends without reporting back (panic or
/// cancellation).
struct RecoveryGuard<'a, D: BrowserDriver> {
    ctx: &'a DaemonContext<D>,
    armed: bool,
}

impl<D: BrowserDriver> RecoveryGuard<'_, D> {
    fn finish(mut self, cool_down: bool) {
        self.armed = false;
        self.ctx
            .challenge_lock()
            .finish_recovery(Instant::now(), cool_down);
    }
}

impl<D: BrowserDriver> Drop for RecoveryGuard<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            self.ctx
                .challenge_lock()
                .finish_recovery(Instant::now(), true);
        }
    }
}

impl<D: BrowserDriver> DaemonContext<D> {
    /// Runs one search and renders the outcome as a wire reply.
    pub async fn search(self: &Arc<Self>, raw: &str) -> Reply {
        let t0 = Instant::now();
        match self.retrieve(raw).await {
            Ok(found) => {
                let time_ms = elapsed_ms(t0);
                info!(from_cache = found.from_cache, time_ms, "search complete");
                Reply::Search(SearchSuccess {
                    markdown: found.markdown,
                    from_cache: found.from_cache,
                    time_ms,
                })
            }
            Err(e) => {
                let time_ms = elapsed_ms(t0);
                warn!(code = e.code(), time_ms, "search failed: {e}");
                e.into_reply(time_ms)
            }
        }
    }

    pub async fn retrieve(self: &Arc<Self>, raw: &str) -> Result<Retrieved, RetrievalError> {
        let query = raw.trim();
        let key = normalize_query(query);
        if key.is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        if let Some(markdown) = self.cache_lock().get(&key, Instant::now()) {
            debug!(%key, "cache hit");
            return Ok(Retrieved {
                markdown,
                from_cache: true,
            });
        }
        self.check_cooldown()?;

        let deadline = self.config.deadline;
        let fetched = tokio::time::timeout(deadline, self.retrieve_uncached(query, &key))
            .await
            .map_err(|_| RetrievalError::DeadlineExceeded(deadline.as_millis() as u64))??;
        let markdown = match fetched {
            Fetched::Page(markdown) => {
                self.cache_lock()
                    .put(key, markdown.clone(), Instant::now());
                markdown
            }
            // The recovery caches its own result.
            Fetched::Recovering(task) => task
                .await
                .map_err(|e| RetrievalError::Internal(format!("recovery task failed: {e}")))??,
        };
        Ok(Retrieved {
            markdown,
            from_cache: false,
        })
    }

    fn check_cooldown(&self) -> Result<(), RetrievalError> {
        match self.challenge_lock().cooldown_remaining(Instant::now()) {
            Some(retry_after) => Err(RetrievalError::CoolingDown { retry_after }),
            None => Ok(()),
        }
    }

    async fn retrieve_uncached(
        self: &Arc<Self>,
        query: &str,
        key: &str,
    ) -> Result<Fetched, RetrievalError> {
        let _slot = self
            .admission
            .acquire()
            .await
            .ok_or(RetrievalError::ShuttingDown)?;
        // A recovery may have started while this request was queued.
        self.check_cooldown()?;

        let target = &self.config.target;
        let url = target.url_for(query)?;
        let session = self.browser.get().await?;
        let mut lease = self.pool.checkout(&session).await?;
        let page = lease.page()?;

        match self
            .driver
            .navigate(page, &url, target, self.config.nav_timeout)
            .await
        {
            NavOutcome::Loaded { final_url } => debug!(%final_url, "page loaded"),
            NavOutcome::TimedOut => warn!("navigation timed out, extracting what rendered"),
            NavOutcome::Failed(msg) => return Err(RetrievalError::Navigation(msg)),
            NavOutcome::Challenge { marker } => {
                warn!(%marker, "challenge page detected");
                drop(lease);
                return self.on_challenge(query, key);
            }
        }

        let readiness = wait_for_results(
            &*self.driver,
            page,
            target,
            self.config.ready_poll,
            self.config.ready_timeout,
        )
        .await;
        debug!(?readiness, "results settled");
        let markdown = self.extract(page).await?;
        self.challenge_lock().record_success();
        lease.keep();
        Ok(Fetched::Page(markdown))
    }

    async fn extract(&self, page: &D::Page) -> Result<String, RetrievalError> {
        let html = self.driver.html(page).await?;
        self.parser
            .extract(&html, &self.config.target)
            .ok_or(RetrievalError::ExtractionFailed)
    }

    fn on_challenge(self: &Arc<Self>, query: &str, key: &str) -> Result<Fetched, RetrievalError> {
        let verdict = self.challenge_lock().record_challenge();
        match verdict {
            Verdict::Retryable {
                consecutive,
                threshold,
            } => Err(RetrievalError::Challenge {
                consecutive,
                threshold,
            }),
            Verdict::RecoveryInProgress => Err(RetrievalError::CoolingDown {
                retry_after: self.challenge_lock().cooldown(),
            }),
            Verdict::Escalate => {
                // Detached so neither the request deadline nor a dropped caller can strand
                // the tracker mid-recovery. The task outlives this request's admission slot,
                // so searches admitted meanwhile may fail on the old session; their tabs are
                // stale-generation and get closed on return.
                let ctx = self.clone();
                let query = query.to_string();
                let key = key.to_string();
                Ok(Fetched::Recovering(tokio::spawn(async move {
                    ctx.recover(&query, key).await
                })))
            }
        }
    }

    async fn recover(&self, query: &str, key: String) -> Result<String, RetrievalError> {
        let guard = RecoveryGuard {
            ctx: self,
            armed: true,
        };
        match self.config.escalation {
            Escalation::Restart => {
                warn!("challenge threshold reached, restarting browser");
                if let Err(e) = self.restart_browser(self.config.visibility).await {
                    warn!("browser restart failed, next search relaunches: {e}");
                }
                guard.finish(true);
                Err(RetrievalError::CoolingDown {
                    retry_after: self.challenge_lock().cooldown(),
                })
            }
            Escalation::Interactive { timeout } => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "challenge threshold reached, opening a visible browser for manual clearing"
                );
                let attempt = self.clear_interactively(query, timeout).await;
                if self.config.visibility == Visibility::Headless {
                    if let Err(e) = self.restart_browser(Visibility::Headless).await {
                        warn!("returning to headless failed, next search relaunches: {e}");
                    }
                }
                match attempt {
                    Ok(markdown) => {
                        info!("challenge cleared by operator");
                        guard.finish(false);
                        self.cache_lock()
                            .put(key, markdown.clone(), Instant::now());
                        Ok(markdown)
                    }
                    Err(e) => {
                        guard.finish(true);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Closes pooled tabs and relaunches the shared browser in `visibility`. Tabs still
    /// leased from the old session are closed when they come back.
    async fn restart_browser(&self, visibility: Visibility) -> warmsearch_core::Result<()> {
        for page in self.pool.invalidate() {
            self.driver.close_page(page).await;
        }
        self.browser.relaunch(visibility).await.map(|_| ())
    }

    async fn clear_interactively(
        &self,
        query: &str,
        timeout: Duration,
    ) -> Result<String, RetrievalError> {
        if self.browser.visibility() == Visibility::Headless {
            self.restart_browser(Visibility::Headed).await?;
        }
        let session = self.browser.get().await?;
        let lease = self.pool.checkout(&session).await?;
        let page = lease.page()?;
        let target = &self.config.target;
        let url = target.url_for(query)?;

        match self
            .driver
            .navigate(page, &url, target, self.config.nav_timeout)
            .await
        {
            NavOutcome::Failed(msg) => return Err(RetrievalError::Navigation(msg)),
            NavOutcome::Challenge { .. } => {
                let give_up = Instant::now() + timeout;
                while self.driver.challenge_present(page, target).await? {
                    if Instant::now() >= give_up {
                        return Err(RetrievalError::ChallengeUnresolved(timeout.as_secs()));
                    }
                    tokio::time::sleep(self.config.recovery_poll).await;
                }
            }
            NavOutcome::Loaded { .. } | NavOutcome::TimedOut => {}
        }

        wait_for_results(
            &*self.driver,
            page,
            target,
            self.config.ready_poll,
            self.config.ready_timeout,
        )
        .await;
        self.extract(page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::testing::FakeDriver;
    use warmsearch_local::ResultsMarkdownParser;

    fn ctx_with(driver: Arc<FakeDriver>, config: DaemonConfig) -> Arc<DaemonContext<FakeDriver>> {
        DaemonContext::new(config, driver, Arc::new(ResultsMarkdownParser::default()))
    }

    fn config() -> DaemonConfig {
        DaemonConfig {
            challenge_threshold: 2,
            cooldown: Duration::from_secs(60),
            ready_timeout: Duration::from_millis(500),
            ..DaemonConfig::default()
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let driver = Arc::new(FakeDriver::new());
        let ctx = ctx_with(driver.clone(), config());

        let first = ctx.retrieve("Capital of France").await.expect("first");
        assert!(!first.from_cache);
        assert!(first.markdown.contains("Paris"));

        let second = ctx.retrieve("  capital of FRANCE ").await.expect("second");
        assert!(second.from_cache);
        assert_eq!(second.markdown, first.markdown);
        assert_eq!(driver.navigations(), 1);
        assert_eq!(ctx.cache_len(), 1);
        // The tab went back to the pool.
        assert_eq!(ctx.pool().idle_len(), 1);
        assert_eq!(ctx.admission().active(), 0);
    }

    #[tokio::test]
    async fn empty_query_is_rejected_without_browser() {
        let driver = Arc::new(FakeDriver::new());
        let ctx = ctx_with(driver.clone(), config());
        let err = ctx.retrieve("   ").await.expect_err("empty");
        assert_eq!(err.code(), "empty_query");
        assert_eq!(driver.launches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn extraction_failure_is_not_cached() {
        let driver = Arc::new(FakeDriver::new());
        let ctx = ctx_with(driver.clone(), config());
        let err = ctx.retrieve("blank page").await.expect_err("blank");
        assert_eq!(err.code(), "extraction_failed");
        assert_eq!(ctx.cache_len(), 0);
        tokio::task::yield_now().await;
        assert_eq!(ctx.pool().idle_len(), 0);
        assert_eq!(driver.pages_closed(), 1);
        assert_eq!(ctx.admission().active(), 0);
    }

    #[tokio::test]
    async fn navigation_failure_maps_to_code() {
        let ctx = ctx_with(Arc::new(FakeDriver::new()), config());
        let reply = ctx.search("broken link").await;
        match reply {
            Reply::Failure(f) => {
                assert_eq!(f.code.as_deref(), Some("navigation_failed"));
                assert!(f.hint.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn timed_out_navigation_still_extracts() {
        let ctx = ctx_with(Arc::new(FakeDriver::new()), config());
        let found = ctx.retrieve("stall please").await.expect("partial page");
        assert!(found.markdown.contains("Example result"));
    }

    #[tokio::test]
    async fn launch_failure_surfaces_profile_code() {
        let driver = Arc::new(FakeDriver::new());
        driver.fail_launch(Some(warmsearch_core::Error::ProfileLocked));
        let ctx = ctx_with(driver, config());
        let err = ctx.retrieve("anything").await.expect_err("locked");
        assert_eq!(err.code(), "profile_locked");
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_restarts_browser_and_cools_down() {
        let driver = Arc::new(FakeDriver::new());
        let ctx = ctx_with(driver.clone(), config());
        ctx.retrieve("warm up").await.expect("warm");
        assert_eq!(driver.launches(), 1);

        let first = ctx.retrieve("challenge one").await.expect_err("first");
        assert_eq!(first.code(), "challenge_detected");
        assert_eq!(driver.launches(), 1);

        let second = ctx.retrieve("challenge two").await.expect_err("second");
        assert_eq!(second.code(), "cooling_down");
        assert_eq!(second.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(driver.launches(), 2);
        assert_eq!(ctx.challenge_lock().consecutive(), 0);

        // Uncached work is refused during the cooldown, cached work is still served.
        let refused = ctx.retrieve("fresh query").await.expect_err("cooldown");
        assert_eq!(refused.code(), "cooling_down");
        assert!(ctx.retrieve("warm up").await.expect("cached").from_cache);

        tokio::time::advance(Duration::from_secs(61)).await;
        ctx.retrieve("fresh query").await.expect("after cooldown");
        assert_eq!(ctx.status().challenge_state.as_deref(), Some("normal"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_between_challenges_resets_streak() {
        let driver = Arc::new(FakeDriver::new());
        let ctx = ctx_with(driver.clone(), config());
        ctx.retrieve("challenge a").await.expect_err("a");
        ctx.retrieve("plain").await.expect("ok");
        let err = ctx.retrieve("challenge b").await.expect_err("b");
        assert_eq!(err.code(), "challenge_detected");
        assert_eq!(driver.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_recovery_returns_results_and_goes_headless() {
        let driver = Arc::new(FakeDriver::new());
        let ctx = ctx_with(
            driver.clone(),
            DaemonConfig {
                challenge_threshold: 1,
                escalation: Escalation::Interactive {
                    timeout: Duration::from_secs(30),
                },
                recovery_poll: Duration::from_millis(200),
                ..config()
            },
        );
        driver.challenge_everything(true);
        driver.clear_challenge_after_polls(3);

        let found = ctx.retrieve("some query").await.expect("cleared");
        assert!(found.markdown.contains("Recovered result"));
        assert_eq!(driver.headed_launches(), 1);
        assert_eq!(ctx.browser().visibility(), Visibility::Headless);
        assert_eq!(ctx.status().challenge_state.as_deref(), Some("normal"));
        driver.challenge_everything(false);
        assert!(ctx.retrieve("some query").await.expect("cached").from_cache);
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_recovery_may_outlast_request_deadline() {
        let driver = Arc::new(FakeDriver::new());
        let defaults = DaemonConfig::default();
        let ctx = ctx_with(
            driver.clone(),
            DaemonConfig {
                challenge_threshold: 1,
                escalation: Escalation::Interactive {
                    timeout: Duration::from_secs(120),
                },
                ..DaemonConfig::default()
            },
        );
        driver.challenge_everything(true);
        // The operator needs about a minute, past the 45s request deadline.
        driver.clear_challenge_after_polls(60);

        let t0 = Instant::now();
        let found = ctx.retrieve("capital of France").await.expect("cleared late");
        assert!(t0.elapsed() > defaults.deadline);
        assert!(found.markdown.contains("Recovered result"));
        assert!(!found.from_cache);
        assert_eq!(ctx.status().challenge_state.as_deref(), Some("normal"));
        assert_eq!(ctx.admission().active(), 0);

        driver.challenge_everything(false);
        assert!(ctx.retrieve("capital of France").await.expect("cached").from_cache);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_interactive_recovery_cools_down() {
        let driver = Arc::new(FakeDriver::new());
        let ctx = ctx_with(
            driver.clone(),
            DaemonConfig {
                challenge_threshold: 1,
                deadline: Duration::from_secs(600),
                escalation: Escalation::Interactive {
                    timeout: Duration::from_secs(5),
                },
                ..config()
            },
        );
        driver.challenge_everything(true);
        driver.clear_challenge_after_polls(usize::MAX);

        let err = ctx.retrieve("stuck").await.expect_err("unresolved");
        assert_eq!(err.code(), "challenge_unresolved");
        assert_eq!(ctx.browser().visibility(), Visibility::Headless);
        assert_eq!(ctx.status().challenge_state.as_deref(), Some("cooldown"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_releases_slot_and_tab() {
        let driver = Arc::new(FakeDriver::new().with_nav_delay(Duration::from_secs(10)));
        let ctx = ctx_with(
            driver.clone(),
            DaemonConfig {
                deadline: Duration::from_secs(2),
                ..config()
            },
        );
        let err = ctx.retrieve("slow").await.expect_err("deadline");
        assert_eq!(err.code(), "deadline_exceeded");
        tokio::task::yield_now().await;
        assert_eq!(ctx.admission().active(), 0);
        assert_eq!(ctx.pool().idle_len(), 0);
        assert_eq!(driver.pages_closed(), 1);
    }

    #[tokio::test]
    async fn panic_releases_slot_and_tab() {
        let driver = Arc::new(FakeDriver::new());
        let ctx = ctx_with(driver.clone(), config());
        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.search("explode").await })
        };
        assert!(task.await.expect_err("panicked").is_panic());
        tokio::task::yield_now().await;
        assert_eq!(ctx.admission().active(), 0);
        assert_eq!(driver.pages_closed(), 1);

        // The daemon keeps serving.
        assert!(ctx.retrieve("after panic").await.is_ok());
    }

    #[tokio::test]
    async fn closed_admission_reports_shutting_down() {
        let ctx = ctx_with(Arc::new(FakeDriver::new()), config());
        ctx.admission().close();
        let err = ctx.retrieve("late").await.expect_err("closed");
        assert_eq!(err.code(), "shutting_down");
    }
}
