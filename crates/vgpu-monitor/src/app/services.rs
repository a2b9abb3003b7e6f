use std::sync::Arc;

use anyhow::Result;
use kube::Client;

use crate::config::DaemonArgs;
use crate::config::ListerConfig;
use crate::container_lister::ContainerLister;
use crate::k8s::kube_client;
use crate::k8s::PodSnapshot;

/// Long-lived components shared by the daemon tasks
pub struct ApplicationServices {
    pub client: Client,
    pub pod_snapshot: Arc<PodSnapshot>,
    pub container_lister: Arc<ContainerLister>,
}

impl ApplicationServices {
    pub async fn build(args: &DaemonArgs) -> Result<Self> {
        let client = kube_client::init_kube_client(args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;

        let pod_snapshot = Arc::new(PodSnapshot::new());
        let lister_config = ListerConfig::from(args);
        tracing::info!(
            container_path = %lister_config.container_path.display(),
            grace_period = ?lister_config.grace_period,
            "tracking container caches"
        );
        let container_lister = Arc::new(ContainerLister::new(lister_config, pod_snapshot.clone()));

        Ok(Self {
            client,
            pod_snapshot,
            container_lister,
        })
    }
}
