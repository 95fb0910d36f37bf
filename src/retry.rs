// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
use std::future::Future;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::error::{is_retryable, Error};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Run `op` up to `max_retries` times.
///
/// Non-retryable failures return at once. Cancellation interrupts the running
/// attempt and returns the last failure seen, or [`Error::Cancelled`] when
/// there was none.
pub async fn with_retries<T, F, Fut>(
    cancel: &CancellationToken,
    max_retries: u32,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = max_retries.max(1);
    let mut last_error: Option<anyhow::Error> = None;
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            break;
        }
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = op() => outcome,
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(e),
            Err(e) => {
                tracing::debug!(attempt, attempts, error = %format!("{:#}", e), "{} failed", what);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::Cancelled.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let value = with_retries(&token, 3, "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("flaky"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_with_the_last_error() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let err = with_retries(&token, 2, "op", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow!("failure {}", n))
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "failure 1");
    }

    #[tokio::test]
    async fn stops_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let err = with_retries(&token, 5, "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::MissingPlatform("img".into()).into())
        })
        .await
        .unwrap_err();
        assert!(matches!(crate::error::kind_of(&err), Some(Error::MissingPlatform(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_surfaces_the_previous_error() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let err = with_retries(&token, 5, "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                token.cancel();
            }
            async move { Err::<(), _>(anyhow!("attempt {}", n)) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "attempt 0");

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = with_retries(&cancelled, 3, "op", || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(crate::error::kind_of(&err), Some(Error::Cancelled)));
    }
}
