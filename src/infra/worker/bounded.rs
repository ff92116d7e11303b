//! Deadline-bounded calls.
//!
//! Every operation that can block on the worker (spawn, line read, exit wait)
//! goes through here so that no caller ever waits past its deadline. A `None`
//! result always means "timed out".

use std::{future::Future, panic, time::Duration};

use tokio::task::{self, JoinError};
use tracing::warn;

/// What to do with a blocking operation that outlived its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// Return immediately and let the background thread finish on its own.
    Detach,
    /// Wait for the background thread before reporting the timeout. Its late
    /// result is dropped.
    Join,
}

/// Await `operation` for at most `deadline`.
pub async fn call<F>(deadline: Duration, operation: F) -> Option<F::Output>
where
    F: Future,
{
    tokio::time::timeout(deadline, operation).await.ok()
}

/// Run a blocking `operation` on the blocking pool for at most `deadline`.
///
/// Panics inside `operation` are resumed on the caller when they happen
/// before the deadline.
pub async fn call_blocking<T, F>(deadline: Duration, cleanup: Cleanup, operation: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let mut handle = task::spawn_blocking(operation);

    match tokio::time::timeout(deadline, &mut handle).await {
        Ok(joined) => settle(joined),
        Err(_) => {
            if cleanup == Cleanup::Join
                && let Err(err) = handle.await
            {
                warn!(
                    target = "infra::worker::bounded",
                    op = "bounded::call_blocking",
                    result = "late_failure",
                    error = %err,
                    "Blocking call failed after its deadline"
                );
            }
            None
        }
    }
}

fn settle<T>(joined: Result<T, JoinError>) -> Option<T> {
    match joined {
        Ok(value) => Some(value),
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        Err(err) => {
            warn!(
                target = "infra::worker::bounded",
                op = "bounded::call_blocking",
                result = "cancelled",
                error = %err,
                "Blocking call was cancelled by the runtime"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::Instant,
    };

    use super::*;

    #[tokio::test]
    async fn call_returns_value_within_deadline() {
        let value = call(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(value, Some(7));
    }

    #[tokio::test]
    async fn call_times_out() {
        let started = Instant::now();
        let value = call(
            Duration::from_millis(50),
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await;
        assert!(value.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn blocking_call_propagates_result() {
        let value = call_blocking(Duration::from_secs(1), Cleanup::Detach, || "done").await;
        assert_eq!(value, Some("done"));
    }

    #[tokio::test]
    async fn join_waits_for_background_unit() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let value = call_blocking(Duration::from_millis(20), Cleanup::Join, move || {
            thread::sleep(Duration::from_millis(200));
            flag.store(true, Ordering::SeqCst);
        })
        .await;

        assert!(value.is_none());
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn detach_returns_before_background_unit() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let value = call_blocking(Duration::from_millis(20), Cleanup::Detach, move || {
            thread::sleep(Duration::from_millis(500));
            flag.store(true, Ordering::SeqCst);
        })
        .await;

        assert!(value.is_none());
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn blocking_panics_reach_the_caller() {
        let _ = call_blocking(Duration::from_secs(1), Cleanup::Detach, || -> () {
            panic!("boom")
        })
        .await;
    }
}
