//! Retry with exponential backoff
//!
//! A [`RetryPolicy`] runs one logical call as a bounded series of attempts.
//! Each attempt uses a fresh connection; between attempts the policy sleeps
//! `base_delay * 2^(n-1)` after the n-th failure, capped at `max_delay` and
//! optionally jittered.

use super::cancel::CancelHandle;
use super::{Error, ErrorKind, Method, Response, Result, TimeoutKind};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Statuses retried by default
pub const DEFAULT_RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Progress of one logical call
#[derive(Debug, Clone)]
pub struct RetryState {
    attempt: u32,
    started: Instant,
    last_error: Option<ErrorKind>,
    total_backoff: Duration,
}

impl RetryState {
    fn new() -> Self {
        RetryState {
            attempt: 0,
            started: Instant::now(),
            last_error: None,
            total_backoff: Duration::ZERO,
        }
    }

    /// Current attempt, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time since the first attempt started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Kind of the error that ended the previous attempt
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Total time slept between attempts
    pub fn total_backoff(&self) -> Duration {
        self.total_backoff
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    statuses: Vec<u16>,
    retry_non_idempotent: bool,
    respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: false,
            statuses: DEFAULT_RETRY_STATUSES.to_vec(),
            retry_non_idempotent: false,
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy making exactly one attempt
    ///
    /// Failures are reported as they are instead of as `RetryExhausted`.
    pub fn never() -> Self {
        Self::default().max_attempts(1)
    }

    /// Total attempts including the first; at least 1
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Scale every delay by a random factor in `[0.5, 1.0]`
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Response statuses treated as transient
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    /// Also retry POST and PATCH
    pub fn retry_non_idempotent(mut self, enabled: bool) -> Self {
        self.retry_non_idempotent = enabled;
        self
    }

    /// Wait at least as long as a `Retry-After` header asks, within `max_delay`
    pub fn respect_retry_after(mut self, enabled: bool) -> Self {
        self.respect_retry_after = enabled;
        self
    }

    pub fn get_max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn get_base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn get_max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn get_statuses(&self) -> &[u16] {
        &self.statuses
    }

    /// Unjittered delay after failed attempt `attempt` (1-indexed)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn delay_after(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let mut delay = self.backoff(attempt);
        if self.jitter {
            delay = delay.mul_f64(rand::random_range(0.5..=1.0));
        }
        match retry_after {
            Some(wait) if self.respect_retry_after => delay.max(wait.min(self.max_delay)),
            _ => delay,
        }
    }

    fn method_allowed(&self, method: Method) -> bool {
        method.is_idempotent() || self.retry_non_idempotent
    }

    /// Whether `err` from an attempt with `method` may be retried
    pub fn is_retryable_error(&self, method: Method, err: &Error) -> bool {
        err.is_transient() && self.method_allowed(method)
    }

    /// Whether a response with `status` to `method` may be retried
    pub fn is_retryable_status(&self, method: Method, status: u16) -> bool {
        self.statuses.contains(&status) && self.method_allowed(method)
    }

    /// Run `attempt` until it succeeds, fails permanently or attempts run out
    ///
    /// Never sleeps past `deadline`; a cancel between attempts ends the call
    /// with [`Error::Canceled`].
    pub fn execute<F>(
        &self,
        method: Method,
        deadline: Option<Instant>,
        cancel: Option<&CancelHandle>,
        attempt: F,
    ) -> Result<Response>
    where
        F: FnMut(&RetryState) -> Result<Response>,
    {
        self.execute_with_sleep(method, deadline, cancel, attempt, |delay| {
            sleep_unless_canceled(delay, cancel)
        })
    }

    pub(crate) fn execute_with_sleep<F, S>(
        &self,
        method: Method,
        deadline: Option<Instant>,
        cancel: Option<&CancelHandle>,
        mut attempt: F,
        mut sleep: S,
    ) -> Result<Response>
    where
        F: FnMut(&RetryState) -> Result<Response>,
        S: FnMut(Duration),
    {
        let mut state = RetryState::new();

        loop {
            if cancel.is_some_and(CancelHandle::is_canceled) {
                return Err(Error::Canceled);
            }
            state.attempt += 1;

            let (failure, retry_after) = match attempt(&state) {
                Ok(response) => {
                    let code = response.status_code();
                    if self.max_attempts == 1 || !self.is_retryable_status(method, code) {
                        return Ok(response);
                    }
                    if state.attempt >= self.max_attempts {
                        log::debug!("giving up after {} attempts: status {}", state.attempt, code);
                        return Err(Error::RetryExhausted {
                            attempts: state.attempt,
                            last: Box::new(Error::Status {
                                code,
                                reason: response.reason().to_string(),
                            }),
                        });
                    }
                    let retry_after = response.header("Retry-After").and_then(parse_retry_after);
                    (
                        Error::Status {
                            code,
                            reason: response.reason().to_string(),
                        },
                        retry_after,
                    )
                }
                Err(err) => {
                    if self.max_attempts == 1 || !self.is_retryable_error(method, &err) {
                        return Err(err);
                    }
                    if state.attempt >= self.max_attempts {
                        log::debug!("giving up after {} attempts: {}", state.attempt, err);
                        return Err(Error::RetryExhausted {
                            attempts: state.attempt,
                            last: Box::new(err),
                        });
                    }
                    (err, None)
                }
            };

            let delay = self.delay_after(state.attempt, retry_after);
            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    log::debug!("backoff of {:?} would pass the deadline", delay);
                    return Err(Error::Timeout(TimeoutKind::Total));
                }
            }
            log::debug!(
                "attempt {}/{} failed ({}), retrying in {:?}",
                state.attempt,
                self.max_attempts,
                failure,
                delay
            );
            state.last_error = Some(failure.kind());
            state.total_backoff += delay;
            sleep(delay);
        }
    }
}

/// `Retry-After` as seconds or an HTTP date
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
}

fn sleep_unless_canceled(delay: Duration, cancel: Option<&CancelHandle>) {
    let Some(cancel) = cancel else {
        thread::sleep(delay);
        return;
    };
    let until = Instant::now() + delay;
    while !cancel.is_canceled() {
        let now = Instant::now();
        if now >= until {
            break;
        }
        thread::sleep((until - now).min(SLEEP_SLICE));
    }
}
