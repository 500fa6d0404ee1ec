//! Supervisor for background tasks
//!
//! Prompts, reminder pokes, and triggered reconciliations are spawned here
//! instead of being detached, so shutdown can wait for or abort them.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Tracks spawned background tasks
#[derive(Clone, Default)]
pub struct TaskSupervisor {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("running", &self.len())
            .finish()
    }
}

impl TaskSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task. Finished tasks are reaped on every call.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(result) = tasks.try_join_next() {
            log_join_result(result);
        }
        tasks.spawn(task);
    }

    /// Number of tasks not yet reaped
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every task, including ones spawned while waiting, has finished
    pub async fn drain(&self) {
        loop {
            let mut batch = {
                let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *tasks)
            };
            if batch.is_empty() {
                return;
            }
            while let Some(result) = batch.join_next().await {
                log_join_result(result);
            }
        }
    }

    /// Abort every running task
    pub async fn shutdown(&self) {
        let mut batch = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        debug!(tasks = batch.len(), "Aborting background tasks");
        batch.shutdown().await;
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Background task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_waits_for_nested_spawns() {
        let supervisor = TaskSupervisor::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let inner = supervisor.clone();
        let c = Arc::clone(&counter);
        supervisor.spawn(async move {
            c.fetch_add(1, Ordering::SeqCst);
            let c2 = Arc::clone(&c);
            inner.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        supervisor.drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_aborts() {
        let supervisor = TaskSupervisor::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&finished);
        supervisor.spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(supervisor.len(), 1);

        supervisor.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(supervisor.is_empty());
    }
}
