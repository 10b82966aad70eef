//! Cancellable periodic work.
//!
//! Every polling loop in the engine (health probes, readiness waits) runs
//! through this module, so a single cancellation token stops all of them.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;

/// A background task that runs a tick function on a fixed interval.
///
/// The task stops when the tick returns [`ControlFlow::Break`], when
/// [`stop`](Self::stop) is called, when the parent token is cancelled, or
/// when the handle is dropped.
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawns a periodic task.
    ///
    /// The first tick runs after `initial_delay`, then every `interval`.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        parent: &CancellationToken,
        initial_delay: Duration,
        interval: Duration,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let name = name.into();
        let token = parent.child_token();
        let task_token = token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut delay = initial_delay;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let flow = tokio::select! {
                    _ = task_token.cancelled() => break,
                    flow = tick() => flow,
                };
                if flow.is_break() {
                    break;
                }
                delay = interval;
            }
            debug!(task = %task_name, "Periodic task stopped");
        });

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    /// Signals the task to stop.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Returns true once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the task and waits for it to exit.
    pub async fn join(mut self) {
        debug!(task = %self.name, "Stopping periodic task");
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Outcome of [`poll_until`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check returned a value.
    Ready(T),
    /// The timeout elapsed first.
    TimedOut,
    /// The token was cancelled first.
    Cancelled,
}

/// Calls `check` every `interval` until it yields a value, fails, the
/// timeout elapses, or `token` is cancelled.
///
/// The first check runs immediately.
pub async fn poll_until<T, F, Fut>(
    token: &CancellationToken,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<PollOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if token.is_cancelled() {
            return Ok(PollOutcome::Cancelled);
        }

        let checked = tokio::select! {
            _ = token.cancelled() => return Ok(PollOutcome::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Ok(PollOutcome::TimedOut),
            checked = check() => checked?,
        };
        if let Some(value) = checked {
            return Ok(PollOutcome::Ready(value));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(PollOutcome::TimedOut);
        }
        let wake = (now + interval).min(deadline);

        tokio::select! {
            _ = token.cancelled() => return Ok(PollOutcome::Cancelled),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_periodic_task_ticks_until_break() {
        let count = Arc::new(AtomicU32::new(0));
        let ticks = count.clone();
        let parent = CancellationToken::new();

        let task = PeriodicTask::spawn(
            "counter",
            &parent,
            Duration::ZERO,
            Duration::from_millis(5),
            move || {
                let ticks = ticks.clone();
                async move {
                    if ticks.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
            },
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            while !task.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_periodic_task_stops_on_parent_cancel() {
        let parent = CancellationToken::new();
        let task = PeriodicTask::spawn(
            "idle",
            &parent,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            || async { ControlFlow::Continue(()) },
        );

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), task.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_poll_until_ready() {
        let token = CancellationToken::new();
        let mut calls = 0;
        let outcome = poll_until(&token, Duration::from_millis(1), Duration::from_secs(1), || {
            calls += 1;
            let ready = calls >= 3;
            async move { Ok(ready.then_some("done")) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready("done"));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let token = CancellationToken::new();
        let started = std::time::Instant::now();
        let outcome: PollOutcome<()> =
            poll_until(&token, Duration::from_millis(10), Duration::from_millis(50), || async {
                Ok(None)
            })
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_poll_until_cancelled() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let outcome: PollOutcome<()> =
            poll_until(&token, Duration::from_millis(5), Duration::from_secs(30), || async {
                Ok(None)
            })
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_poll_until_propagates_errors() {
        let token = CancellationToken::new();
        let result: Result<PollOutcome<()>> =
            poll_until(&token, Duration::from_millis(5), Duration::from_secs(1), || async {
                Err(crate::error::OrchestratorError::Cancelled)
            })
            .await;
        assert!(result.is_err());
    }
}
