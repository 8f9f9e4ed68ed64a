//! Owned, cancellable background tasks scoped to one session.
//!
//! Every interval and subscription a session starts is spawned through a
//! [`SessionTasks`]. Dropping it cancels them all, so clearing the session
//! id (or dropping the controller) tears everything down.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct SessionTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SessionTasks {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Token the spawned tasks select on to notice teardown.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.retain(|h| !h.is_finished());
        self.handles.push(tokio::spawn(task));
    }

    /// Number of tasks that have not exited yet.
    pub fn running(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Signal every task to stop. Tasks finish their current step first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for every task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "Session task panicked");
                }
            }
        }
    }
}

impl Default for SessionTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionTasks {
    fn drop(&mut self) {
        // Only cancel: a task may be the one dropping us and must be allowed
        // to finish the step it is in.
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_running_tasks() {
        let mut tasks = SessionTasks::new();
        let token = tasks.token();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tasks.spawn(async move {
            token.cancelled().await;
            let _ = tx.send(());
        });
        assert_eq!(tasks.running(), 1);

        drop(tasks);
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_exit() {
        let mut tasks = SessionTasks::new();
        for _ in 0..3 {
            let token = tasks.token();
            tasks.spawn(async move { token.cancelled().await });
        }

        tasks.shutdown().await;
    }
}
