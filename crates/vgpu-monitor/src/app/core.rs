use std::time::Duration;

use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

/// Application core structure with explicit dependencies
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub async fn build(daemon_args: DaemonArgs) -> Result<Self> {
        let services = ApplicationServices::build(&daemon_args).await?;
        Ok(Self {
            services,
            daemon_args,
        })
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Starts the pod watch, waits for its first listing, then runs the
    /// periodic tasks until a shutdown signal arrives.
    pub async fn run(&self) -> Result<()> {
        let mut tasks = Tasks::new();

        tasks.spawn_pod_watch_task(self);
        let timeout = Duration::from_secs(self.daemon_args.sync_timeout_secs);
        if let Err(e) = self.services.pod_snapshot.wait_synced(timeout).await {
            tracing::error!("Initial pod sync failed: {e:?}");
            tasks.cancel_all().await;
            return Err(anyhow::anyhow!("initial pod sync failed: {e}"));
        }
        tracing::info!(
            pods = self.services.pod_snapshot.len(),
            "Initial pod sync completed"
        );

        tasks.spawn_periodic_tasks(self);
        tasks.wait_for_completion().await?;

        tracing::info!("Application run completed");
        Ok(())
    }

    /// Releases every mapping held by the tracker.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down application...");
        self.services.container_lister.shutdown();
        tracing::info!("Application shutdown completed");
    }
}
