//! Bounded polling shared by every wait in the engine.
//!
//! Reachability probing, server-status polling and port-collision retries all
//! follow the same shape: run an attempt, decide whether it is done, and if
//! not sleep a fixed interval before the next one. [`poll_until`] owns that
//! loop so the stop conditions are identical everywhere.
//!
//! # Example
//!
//! ```ignore
//! use orchestrator_shared_types::retry::{poll_until, Attempt, RetryPolicy};
//!
//! let server = poll_until(
//!     &RetryPolicy::for_duration(Duration::from_secs(300), Duration::from_secs(5)),
//!     "wait_server_active",
//!     |_| async {
//!         match compute.get_server(&id).await {
//!             Ok(Some(s)) if s.status == ServerStatus::Active => Attempt::Done(Ok(s)),
//!             Ok(other) => Attempt::Pending(format!("{:?}", other.map(|s| s.status))),
//!             Err(e) => Attempt::Done(Err(e)),
//!         }
//!     },
//! )
//! .await;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Stop conditions for [`poll_until`].
///
/// At least one of `max_attempts` and `max_duration` should be set; with
/// neither the loop only ends when an attempt reports [`Attempt::Done`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: Option<u32>,
    /// Another attempt is started only if it would begin no later than this.
    pub max_duration: Option<Duration>,
    /// Sleep between attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn for_duration(max_duration: Duration, interval: Duration) -> Self {
        Self {
            max_attempts: None,
            max_duration: Some(max_duration),
            interval,
        }
    }

    pub fn with_max_attempts(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            max_duration: None,
            interval,
        }
    }
}

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum Attempt<T, P> {
    /// Stop polling and return this value.
    Done(T),
    /// Not there yet; `P` describes why and is kept for the exhaustion report.
    Pending(P),
}

/// Returned when the policy runs out before an attempt reports done.
#[derive(Debug, Clone, PartialEq)]
pub struct Exhausted<P> {
    pub attempts: u32,
    pub elapsed: Duration,
    pub last: P,
}

impl<P> Exhausted<P> {
    /// Attempts made after the first one.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Run `attempt` until it reports done or the policy is exhausted.
///
/// The closure receives the 1-based attempt number. With
/// `max_duration = T` and `interval = I` the loop performs at most
/// `floor(T / I)` retries after the first attempt, so it returns within
/// `T + I` even when attempts themselves take time.
pub async fn poll_until<F, Fut, T, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut attempt: F,
) -> Result<T, Exhausted<P>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, P>>,
    P: std::fmt::Debug,
{
    let started = Instant::now();
    let mut count = 0u32;

    loop {
        count += 1;
        match attempt(count).await {
            Attempt::Done(value) => {
                debug!(operation = %operation_name, attempt = count, "Poll finished");
                return Ok(value);
            }
            Attempt::Pending(state) => {
                let elapsed = started.elapsed();
                let out_of_attempts = policy.max_attempts.is_some_and(|max| count >= max);
                let out_of_time = policy
                    .max_duration
                    .is_some_and(|max| elapsed + policy.interval > max);

                if out_of_attempts || out_of_time {
                    warn!(
                        operation = %operation_name,
                        attempts = count,
                        elapsed_ms = elapsed.as_millis() as u64,
                        last = ?state,
                        "Poll exhausted"
                    );
                    return Err(Exhausted {
                        attempts: count,
                        elapsed,
                        last: state,
                    });
                }

                debug!(
                    operation = %operation_name,
                    attempt = count,
                    state = ?state,
                    delay_ms = policy.interval.as_millis() as u64,
                    "Not done yet, retrying"
                );
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}
