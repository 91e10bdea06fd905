//! Bounded retry and long-poll helpers.
//!
//! Every cloud mutation flows through one of these two primitives so that
//! deadlines, intervals and operation labels are explicit at the call site
//! and no error is ever silently swallowed.

use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Frequency at which long-running cloud operations are polled.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Overall deadline across all attempts
    pub timeout: Duration,
    /// Fixed pause between attempts
    pub interval: Duration,
    /// Operation name carried into timeout errors and logs
    pub label: &'static str,
}

impl RetryOptions {
    pub fn new(timeout: Duration, interval: Duration, label: &'static str) -> Self {
        Self {
            timeout,
            interval,
            label,
        }
    }
}

/// Invokes `op` until it succeeds, fails with a non-transient error, the
/// deadline passes, or the token is cancelled. The interval is fixed.
pub async fn retry<T, F, Fut>(
    opts: &RetryOptions,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = tokio::time::Instant::now() + opts.timeout;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let last_err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => err,
        };
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "{} gave up after {} attempts: {}",
                opts.label, attempt, last_err
            )));
        }
        debug!(
            "{}: attempt {} failed ({}), retrying in {:?}",
            opts.label, attempt, last_err, opts.interval
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Unavailable(format!(
                    "{} aborted by shutdown", opts.label
                )));
            }
            _ = tokio::time::sleep(opts.interval) => {}
        }
    }
}

/// Polls `is_done` every 2 s until it reports completion or `timeout` passes.
///
/// Transient poll errors keep the poll alive; anything else propagates.
pub async fn poll_until_done<F, Fut>(
    timeout: Duration,
    cancel: &CancellationToken,
    label: &'static str,
    mut is_done: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match is_done().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) if err.is_transient() => {
                debug!("{}: poll error tolerated: {}", label, err);
            }
            Err(err) => return Err(err),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!("{} still pending", label)));
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Unavailable(format!(
                    "{} aborted by shutdown", label
                )));
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn opts() -> RetryOptions {
        RetryOptions::new(Duration::from_secs(10), Duration::from_millis(100), "test-op")
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let c = calls.clone();
        let result = retry(&opts(), &cancel, move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Cloud("throttled".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_non_transient_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let c = calls.clone();
        let err = retry(&opts(), &cancel, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Invalid("bad input".into()))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "invalid");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_times_out_with_label() {
        let cancel = CancellationToken::new();
        let err = retry(&opts(), &cancel, || async {
            Err::<(), _>(Error::Cloud("still broken".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(err.to_string().contains("test-op"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_aborts_on_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = retry(&opts(), &cancel, || async {
            Err::<(), _>(Error::Cloud("transient".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn poll_completes_when_done() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let c = calls.clone();
        poll_until_done(Duration::from_secs(30), &cancel, "test-poll", move || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 3) }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out() {
        let cancel = CancellationToken::new();
        let err = poll_until_done(Duration::from_secs(5), &cancel, "test-poll", || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }
}
