use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::{Instant, sleep};

use crate::error::SyncResult;

/// Stop conditions and backoff seed for one retry schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    /// `None` means attempts alone never stop the schedule.
    pub max_attempts: Option<u32>,
    pub max_duration: Duration,
    pub min_attempts_before_time_abort: u32,
}

impl RetryPolicy {
    /// Aggressive profile used when the caller prefers a quick failure.
    pub fn fail_early(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_attempts: Some(3),
            max_duration: Duration::from_secs(10),
            min_attempts_before_time_abort: 1,
        }
    }

    /// Patient profile for background updates over flaky links.
    pub fn patient(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_attempts: None,
            max_duration: Duration::from_secs(30),
            min_attempts_before_time_abort: 6,
        }
    }

    pub fn for_mode(fail_early: bool, initial_delay: Duration) -> Self {
        if fail_early {
            Self::fail_early(initial_delay)
        } else {
            Self::patient(initial_delay)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
    /// The schedule was not armed; the report was dropped.
    Ignored,
}

/// Per-operation retry state. Cloned from a template for every pending item.
#[derive(Clone, Debug)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    attempts: u32,
    next_delay: Duration,
    started: Option<Instant>,
    armed: bool,
}

impl RetrySchedule {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            next_delay: policy.initial_delay,
            started: None,
            armed: false,
        }
    }

    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Mark the start of an attempt. Failure and abort reports are only honoured while armed.
    pub fn arm(&mut self) {
        self.started.get_or_insert_with(Instant::now);
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn record_failure(&mut self) -> RetryDecision {
        if !self.armed {
            warn!("retry: failure reported while not armed; ignoring");
            return RetryDecision::Ignored;
        }
        self.armed = false;
        self.attempts += 1;

        let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
        let out_of_attempts = self
            .policy
            .max_attempts
            .is_some_and(|max| self.attempts >= max);
        let out_of_time = elapsed >= self.policy.max_duration
            && self.attempts >= self.policy.min_attempts_before_time_abort;
        if out_of_attempts || out_of_time {
            debug!(
                "retry: giving up after {} attempts ({:?} elapsed)",
                self.attempts, elapsed
            );
            return RetryDecision::GiveUp;
        }

        let delay = self.next_delay;
        self.next_delay = self.next_delay.saturating_mul(2);
        RetryDecision::RetryAfter(delay)
    }

    /// Abort bypasses the backoff schedule entirely.
    pub fn record_abort(&mut self) -> RetryDecision {
        if !self.armed {
            warn!("retry: abort reported while not armed; ignoring");
            return RetryDecision::Ignored;
        }
        self.armed = false;
        self.attempts += 1;
        RetryDecision::GiveUp
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the schedule gives up.
pub async fn with_retries<T, F, Fut>(
    schedule: &mut RetrySchedule,
    label: &str,
    mut op: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    loop {
        schedule.arm();
        let err = match op().await {
            Ok(value) => {
                schedule.disarm();
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            schedule.record_abort();
            warn!("retry: {label} aborted: {err}");
            return Err(err);
        }
        match schedule.record_failure() {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    "retry: {label} failed (attempt {}): {err}; retrying in {:?}",
                    schedule.attempts(),
                    delay
                );
                sleep(delay).await;
            }
            RetryDecision::GiveUp | RetryDecision::Ignored => {
                warn!("retry: {label} exhausted its budget: {err}");
                return Err(err);
            }
        }
    }
}
