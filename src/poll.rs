use std::fmt::Debug;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{PolicydError, PolicydResult, PollTimeout};
use crate::observability;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollOptions {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Repeatedly runs `query` until `predicate` accepts the observed value or
/// `options.timeout` elapses.
///
/// The query always runs at least once, so an already-satisfied condition
/// returns after a single observation without sleeping. Query errors are not
/// retried: a broken transport is reported as such, never as a timeout.
pub fn wait_until<V, Q, P>(
    description: &str,
    options: PollOptions,
    mut query: Q,
    predicate: P,
) -> PolicydResult<V>
where
    V: Debug,
    Q: FnMut() -> PolicydResult<V>,
    P: Fn(&V) -> bool,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);
        let observed = match query() {
            Ok(value) => value,
            Err(err) => {
                observability::record_poll(description, "error", attempts, started.elapsed());
                return Err(err);
            }
        };

        if predicate(&observed) {
            debug!(
                predicate = description,
                attempts = attempts,
                elapsed_ms = elapsed_ms(started),
                "predicate satisfied"
            );
            observability::record_poll(description, "satisfied", attempts, started.elapsed());
            return Ok(observed);
        }

        let elapsed = started.elapsed();
        if elapsed >= options.timeout {
            observability::record_poll(description, "timeout", attempts, elapsed);
            return Err(PolicydError::from(PollTimeout {
                predicate: description.to_string(),
                attempts,
                elapsed,
                last_observed: format!("{:?}", observed),
            }));
        }

        debug!(
            predicate = description,
            attempt = attempts,
            observed = ?observed,
            "predicate not yet satisfied"
        );
        let remaining = options.timeout - elapsed;
        thread::sleep(options.interval.min(remaining));
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
