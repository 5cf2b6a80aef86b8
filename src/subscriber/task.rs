//! Restart-on-panic wrapper for the subscriber's long-running loops
//!
//! Each loop runs inside an inner task. If that task panics the panic is
//! logged and a fresh instance of the loop is started after
//! [`RESTART_DELAY`]. A loop that returns normally, or a cancelled token, ends
//! supervision.
//!
//! The inner task is owned by the supervising task: aborting or dropping the
//! returned [`JoinHandle`]'s task aborts the running loop with it.

use crate::observability::SubscriberMetrics;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error};

/// Pause before restarting a loop that panicked
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Spawn `factory()` as a supervised task named `name`.
///
/// `factory` is called once per (re)start and must build a fresh future
/// from shared state.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    token: CancellationToken,
    metrics: Arc<SubscriberMetrics>,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let outcome = AbortOnDropHandle::new(tokio::spawn(factory())).await;

            match outcome {
                Ok(()) => {
                    debug!(task = name, "Task finished");
                    break;
                }
                Err(e) if e.is_panic() => {
                    error!(task = name, "Task panicked, restarting");
                }
                Err(e) => {
                    error!(task = name, error = %e, "Task was cancelled unexpectedly, restarting");
                }
            }

            metrics.record_task_restart();
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(task = name, "Shutdown requested, not restarting");
                    break;
                }
                _ = tokio::time::sleep(RESTART_DELAY) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_restarts_after_panic() {
        let runs = Arc::new(AtomicUsize::new(0));
        let metrics = Arc::new(SubscriberMetrics::new());
        let counter = runs.clone();

        let handle = spawn_supervised("flaky", CancellationToken::new(), metrics.clone(), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("simulated crash");
                }
            }
        });

        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.snapshot().task_restarts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_restart_after_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        token.cancel();
        let counter = runs.clone();

        let handle = spawn_supervised(
            "crashing",
            token,
            Arc::new(SubscriberMetrics::new()),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    panic!("always crashes");
                }
            },
        );

        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_running_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let handle = spawn_supervised(
            "ticker",
            CancellationToken::new(),
            Arc::new(SubscriberMetrics::new()),
            move || {
                let counter = counter.clone();
                async move {
                    loop {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(550)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        let stopped_at = ticks.load(Ordering::SeqCst);
        assert!(stopped_at > 0);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), stopped_at, "loop kept running after abort");
    }
}
