use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;
use tracing::debug;

use crate::k8s::KubernetesError;

/// Builds a client from `kubeconfig` if given, else from the in-cluster
/// service account (falling back to `~/.kube/config`).
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<KubernetesError>> {
    match kubeconfig {
        Some(path) => client_from_kubeconfig(&path).await,
        None => {
            debug!("using default kubernetes client configuration");
            Client::try_default()
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: "Failed to create Kubernetes client".to_string(),
                })
        }
    }
}

async fn client_from_kubeconfig(path: &Path) -> Result<Client, Report<KubernetesError>> {
    let failed = |what: &str| KubernetesError::ConnectionFailed {
        message: format!("{what}: {}", path.display()),
    };

    debug!(kubeconfig = %path.display(), "loading kubeconfig");
    let kubeconfig =
        Kubeconfig::read_from(path).change_context_lazy(|| failed("Failed to read kubeconfig"))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context_lazy(|| failed("Failed to create config from kubeconfig"))?;
    Client::try_from(config).change_context_lazy(|| failed("Failed to create client from kubeconfig"))
}
