use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

/// Shared background executor for fire-and-forget work.
///
/// Tasks are tracked so shutdown can wait for them, and each may watch
/// [`TaskExecutor::cancelled`] to stop early.
#[derive(Clone, Default)]
pub struct TaskExecutor {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl TaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            warn!("Task {} submitted after executor shutdown began", name);
        }
        self.tracker.spawn(async move {
            debug!("⚙️ Task {} started", name);
            task.await;
            debug!("⚙️ Task {} finished", name);
        })
    }

    /// Token cancelled when shutdown starts.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Stops accepting work, signals cancellation and waits up to `grace` for tasks.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        self.cancel.cancel();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "⏱️ {} background tasks still running after {}",
                self.tracker.len(),
                humantime::format_duration(grace)
            );
        } else {
            info!("⚙️ Background executor drained");
        }
    }
}
