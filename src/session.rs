//! Cooperative cancellation for session tasks.
//!
//! A session runs as one spawned task. Stopping it flips a `watch` flag; the task
//! observes the flag at its next tick boundary, and every sleep between commands
//! wakes early when the flag flips. A command already submitted to the bridge is
//! never interrupted.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Receiving side of a stop request.
#[derive(Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// True once a stop has been requested or the requester is gone.
    pub fn is_set(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Sleeps for `duration` unless a stop arrives first. Returns true when stopped.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let interrupted = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.0.wait_for(|stop| *stop) => true,
        };
        interrupted || self.is_set()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&mut self) {
        if !self.is_set() {
            let _ = self.0.wait_for(|stop| *stop).await;
        }
    }
}

/// A running session task together with its stop switch.
pub struct SessionTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionTask {
    /// Spawns `body` with a fresh stop signal.
    pub fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, signal) = watch::channel(false);
        let task = tokio::spawn(body(StopSignal(signal)));
        Self { stop, task }
    }

    /// True once the task body has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Requests a stop and waits up to `grace` for the task to wind down.
    ///
    /// Returns false when the task had to be aborted; its final state was then never
    /// published and the caller must publish one itself.
    pub async fn stop(mut self, grace: Duration) -> bool {
        self.stop.send_replace(true);
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(error = %err, "Session task ended abnormally");
                false
            }
            Err(_) => {
                warn!(?grace, "Session task did not stop in time, aborting");
                self.task.abort();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn stop_wakes_a_sleeping_session() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let session = SessionTask::spawn(move |mut stop| async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                if stop.sleep(Duration::from_secs(3600)).await {
                    break;
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.stop(Duration::from_secs(1)).await);
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_session_is_aborted() {
        let session = SessionTask::spawn(|_stop| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert!(!session.stop(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn finished_session_reports_finished() {
        let session = SessionTask::spawn(|_stop| async {});
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.is_finished());
    }
}
