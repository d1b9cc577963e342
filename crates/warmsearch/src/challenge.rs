//! Consecutive anti-bot challenge tracking.
//!
//! ```text
//! Normal --challenge--> Escalating --(count >= threshold)--> Restarting --> Cooldown
//!    ^                      |                                                  |
//!    +------ success -------+------------------ cooldown elapsed --------------+
//! ```

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Normal,
    /// At least one challenge since the last success, still under the threshold.
    Escalating,
    /// A recovery (relaunch or interactive wait) is in progress.
    Restarting,
    Cooldown { until: Instant },
}

impl ChallengeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Escalating => "escalating",
            Self::Restarting => "restarting",
            Self::Cooldown { .. } => "cooldown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Under the threshold: report a retryable error, no automatic retry.
    Retryable { consecutive: u32, threshold: u32 },
    /// Threshold reached: the caller owns the recovery and must call `finish_recovery`.
    Escalate,
    /// Another caller is already recovering.
    RecoveryInProgress,
}

#[derive(Debug)]
pub struct ChallengeTracker {
    state: ChallengeState,
    consecutive: u32,
    threshold: u32,
    cooldown: Duration,
    total: u64,
    recoveries: u64,
}

impl ChallengeTracker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: ChallengeState::Normal,
            consecutive: 0,
            threshold: threshold.max(1),
            cooldown,
            total: 0,
            recoveries: 0,
        }
    }

    pub fn record_challenge(&mut self) -> Verdict {
        self.total += 1;
        if self.state == ChallengeState::Restarting {
            return Verdict::RecoveryInProgress;
        }
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.state = ChallengeState::Restarting;
            self.recoveries += 1;
            Verdict::Escalate
        } else {
            self.state = ChallengeState::Escalating;
            Verdict::Retryable {
                consecutive: self.consecutive,
                threshold: self.threshold,
            }
        }
    }

    /// Any non-challenge retrieval resets the streak.
    pub fn record_success(&mut self) {
        self.consecutive = 0;
        if self.state == ChallengeState::Escalating {
            self.state = ChallengeState::Normal;
        }
    }

    /// Ends a recovery. With `cool_down` the daemon refuses uncached work for the
    /// configured interval; without it (operator cleared the challenge) it resumes.
    pub fn finish_recovery(&mut self, now: Instant, cool_down: bool) {
        self.consecutive = 0;
        self.state = if cool_down && !self.cooldown.is_zero() {
            ChallengeState::Cooldown {
                until: now + self.cooldown,
            }
        } else {
            ChallengeState::Normal
        };
    }

    /// Remaining cooldown, if any. An elapsed cooldown returns the tracker to `Normal`.
    pub fn cooldown_remaining(&mut self, now: Instant) -> Option<Duration> {
        match self.state {
            ChallengeState::Cooldown { until } if now < until => Some(until - now),
            ChallengeState::Cooldown { .. } => {
                self.state = ChallengeState::Normal;
                None
            }
            _ => None,
        }
    }

    pub fn state(&self) -> ChallengeState {
        self.state
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }
}
