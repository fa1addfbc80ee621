//! Lifecycle of the daemon's background tasks.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a task gets to observe cancellation before it is abandoned.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns every spawned service task. Each task receives a child of
/// [`global_token`](Self::global_token) and is expected to return once it
/// is cancelled.
pub struct TaskManager {
    tasks: HashMap<String, JoinHandle<Result<()>>>,
    pub global_token: CancellationToken,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            global_token: CancellationToken::new(),
        }
    }

    /// Spawns `task_fn` under `name`. A task that ends early, successfully or
    /// not, is only reported; it is not restarted.
    pub async fn spawn_task<F, Fut>(&mut self, name: String, task_fn: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let token = self.global_token.child_token();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!("Starting task: {task_name}");
            let result = task_fn(token).await;
            match &result {
                Ok(()) => info!("Task '{task_name}' finished"),
                Err(e) => error!("Task '{task_name}' failed: {e:#}"),
            }
            result
        });

        if self.tasks.insert(name.clone(), handle).is_some() {
            warn!("Task '{name}' replaced a previous task with the same name");
        }
        Ok(())
    }

    /// Cancels every task and waits for each one. Returns the first failure.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());
        self.global_token.cancel();

        let mut first_error = None;
        for (name, handle) in self.tasks.drain() {
            let outcome = match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(anyhow!("task panicked: {e}")),
                Err(_) => Err(anyhow!("did not stop within {SHUTDOWN_TIMEOUT:?}")),
            };

            if let Err(e) = outcome {
                warn!("Task '{name}' stopped with error: {e:#}");
                first_error.get_or_insert(e.context(format!("task '{name}'")));
            }
        }

        match first_error {
            Some(error) => Err(error).context("One or more tasks failed during shutdown"),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
