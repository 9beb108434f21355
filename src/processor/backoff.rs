//! Retry combinator shared by fetch workers, persist workers, head polling
//! and store connection.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Fixed delay between attempts, optionally cut short by a token.
#[derive(Clone, Copy)]
pub(crate) struct RetryBackoff<'a> {
    pub delay: Duration,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetryBackoff<'a> {
    pub(crate) fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            cancellation: None,
        }
    }

    pub(crate) fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

pub(crate) enum RetryDisposition {
    Retry,
    Abort,
}

#[derive(Debug)]
pub(crate) enum RetryError<E> {
    /// The token fired before a retry could be made.
    Cancelled,
    /// The classifier refused to retry this error.
    Aborted(E),
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Cancelled => f.write_str("retry cancelled"),
            RetryError::Aborted(err) => write!(f, "{err}"),
        }
    }
}

/// Runs `operation` until it succeeds, the classifier aborts, or cancellation
/// fires. There is no attempt limit.
///
/// The first attempt always runs, even when the token is already cancelled;
/// cancellation is only observed before retries and during the backoff wait.
pub(crate) async fn retry_with_backoff<'a, T, E, F, Fut, L, C>(
    config: RetryBackoff<'a>,
    mut operation: F,
    mut on_retry: L,
    mut classify_error: C,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    L: FnMut(usize, Duration, &E),
    C: FnMut(usize, &E) -> RetryDisposition,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        if attempt > 1 && is_cancelled(config.cancellation) {
            return Err(RetryError::Cancelled);
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if let RetryDisposition::Abort = classify_error(attempt, &err) {
            return Err(RetryError::Aborted(err));
        }

        on_retry(attempt, config.delay, &err);
        if !sleep_with_cancellation(config.delay, config.cancellation).await {
            return Err(RetryError::Cancelled);
        }
    }
}

fn is_cancelled(token: Option<&CancellationToken>) -> bool {
    token.map(CancellationToken::is_cancelled).unwrap_or(false)
}

/// Returns `false` if the wait was cut short by cancellation.
async fn sleep_with_cancellation(delay: Duration, cancellation: Option<&CancellationToken>) -> bool {
    if delay.is_zero() {
        yield_now().await;
        return !is_cancelled(cancellation);
    }

    match cancellation {
        Some(token) => tokio::select! {
            _ = token.cancelled() => false,
            _ = sleep(delay) => true,
        },
        None => {
            sleep(delay).await;
            true
        }
    }
}
