use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::feedback;
use crate::metrics;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn spawn_pod_watch_task(&mut self, app: &Application) {
        let pod_snapshot = app.services().pod_snapshot.clone();
        let client = app.services().client.clone();
        let node_name = app.daemon_args().node_name.clone();
        let token = self.cancellation_token.clone();

        self.tasks.push(tokio::spawn(async move {
            tracing::info!("Starting pod snapshot task");
            if let Err(e) = pod_snapshot.run(client, &node_name, token).await {
                tracing::error!("Pod snapshot task failed: {e:?}");
            }
            tracing::info!("Pod snapshot task completed");
        }));
    }

    pub fn spawn_periodic_tasks(&mut self, app: &Application) {
        let args = app.daemon_args();

        let metrics_task = {
            let lister = app.services().container_lister.clone();
            let interval = Duration::from_secs(args.update_interval_secs.max(1));
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting metrics export task");
                metrics::run_metrics(lister, interval, token).await;
                tracing::info!("Metrics export task completed");
            })
        };
        self.tasks.push(metrics_task);

        let feedback_task = {
            let lister = app.services().container_lister.clone();
            let interval = Duration::from_secs(args.feedback_interval_secs.max(1));
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting feedback observer task");
                feedback::run_feedback(lister, interval, token).await;
                tracing::info!("Feedback observer task completed");
            })
        };
        self.tasks.push(feedback_task);
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, index, remaining) = result;
                drop(remaining);
                // A finished handle must not be polled again.
                drop(self.tasks.remove(index));
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    self.cancel_all().await;
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        self.cancel_all().await;
        Ok(())
    }

    /// Cancels every task and waits for them with a timeout.
    pub async fn cancel_all(&mut self) {
        self.cancellation_token.cancel();
        let timeout = Duration::from_secs(30);
        let tasks = std::mem::take(&mut self.tasks);
        tokio::time::timeout(timeout, async {
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}
