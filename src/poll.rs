//! Bounded retry with a fixed interval.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::PollError;

/// Why a poll gave up.
#[derive(Debug)]
pub enum PollFailure<E> {
    /// An attempt failed with an error that is not worth retrying.
    Aborted(E),
    TimedOut(PollError),
}

/// Run `attempt` immediately and then every `interval` until it succeeds or
/// `timeout` has elapsed. The last failure message is kept for the error.
/// An error for which `retryable` returns false ends the poll at once.
pub async fn poll_immediate<F, Fut, E, R>(
    interval: Duration,
    timeout: Duration,
    retryable: R,
    mut attempt: F,
) -> Result<(), PollFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
    R: Fn(&E) -> bool,
{
    let start = Instant::now();
    let deadline = start + timeout;
    loop {
        let last = match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) if !retryable(&e) => return Err(PollFailure::Aborted(e)),
            Err(e) => e.to_string(),
        };
        debug!("Attempt failed, retrying in {:?}: {}", interval, last);

        if Instant::now() + interval > deadline {
            return Err(PollFailure::TimedOut(PollError {
                elapsed: start.elapsed(),
                last,
            }));
        }
        tokio::time::sleep(interval).await;
    }
}
