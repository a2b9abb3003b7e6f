//! Liveness oracle for pods scheduled on this node.
//!
//! Keeps the last seen object per pod UID, fed by a field-selected watch.
//! The container tracker only asks whether a UID is present.

use std::collections::HashMap;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::runtime::watcher::Config;
use kube::Api;
use kube::Client;
use parking_lot::RwLock;
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::container_lister::PodLiveness;
use crate::k8s::KubernetesError;

/// Pod UID to last known pod.
pub struct PodSnapshot {
    pods: RwLock<HashMap<String, Pod>>,
    synced: watch::Sender<bool>,
}

impl Default for PodSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl PodSnapshot {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            pods: RwLock::new(HashMap::new()),
            synced,
        }
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.pods.read().contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.pods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Inserts a new pod, or replaces a known one whose phase changed.
    ///
    /// Returns whether the snapshot changed.
    pub fn handle_applied(&self, mut pod: Pod) -> bool {
        let Some(uid) = pod.metadata.uid.clone() else {
            warn!(pod = ?pod.metadata.name, "ignoring pod without uid");
            return false;
        };
        pod.metadata.managed_fields = None;

        let mut pods = self.pods.write();
        if let Some(known) = pods.get(&uid) {
            if phase(known) == phase(&pod) {
                return false;
            }
            debug!(
                uid = %uid,
                from = ?phase(known),
                to = ?phase(&pod),
                "pod phase changed"
            );
        } else {
            debug!(uid = %uid, pod = ?pod.metadata.name, "pod added");
        }
        pods.insert(uid, pod);
        true
    }

    /// Returns whether the pod was known.
    pub fn handle_deleted(&self, pod: &Pod) -> bool {
        let Some(uid) = pod.metadata.uid.as_deref() else {
            return false;
        };
        let removed = self.pods.write().remove(uid).is_some();
        if removed {
            debug!(uid = %uid, pod = ?pod.metadata.name, "pod deleted");
        }
        removed
    }

    /// Replaces the whole snapshot with a fresh listing and marks it synced.
    pub fn handle_restarted(&self, pods: Vec<Pod>) {
        let fresh: HashMap<String, Pod> = pods
            .into_iter()
            .filter_map(|mut pod| {
                pod.metadata.managed_fields = None;
                pod.metadata.uid.clone().map(|uid| (uid, pod))
            })
            .collect();
        info!(pods = fresh.len(), "pod snapshot resynced");
        *self.pods.write() = fresh;
        self.synced.send_replace(true);
    }

    /// Waits until the first listing has been applied.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<(), Report<KubernetesError>> {
        let mut synced = self.synced.subscribe();
        let result = tokio::time::timeout(timeout, synced.wait_for(|synced| *synced))
            .await
            .map(|waited| waited.map(|_| ()));
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Report::new(KubernetesError::WatchFailed {
                message: "pod snapshot dropped before initial sync".to_string(),
            })),
            Err(_) => Err(Report::new(KubernetesError::SyncTimeout {
                timeout_secs: timeout.as_secs(),
            })),
        }
    }

    /// Watches pods on `node_name` until cancelled, reconnecting on failure.
    #[tracing::instrument(skip(self, client, cancellation_token))]
    pub async fn run(
        &self,
        client: Client,
        node_name: &str,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Starting pod snapshot watch");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pod snapshot shutdown requested");
                    break;
                }
                result = self.watch_pods(&client, node_name) => {
                    match result {
                        Ok(()) => {
                            warn!("Pod watch stream ended unexpectedly, restarting...");
                        }
                        Err(e) => {
                            error!("Pod watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn watch_pods(&self, client: &Client, node_name: &str) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(client.clone());
        let config = Config::default().fields(&format!("spec.nodeName={node_name}"));

        let mut stream = watcher::watcher(api, config).boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Applied(pod)) => {
                    self.handle_applied(pod);
                }
                Ok(watcher::Event::Deleted(pod)) => {
                    self.handle_deleted(&pod);
                }
                Ok(watcher::Event::Restarted(pods)) => {
                    self.handle_restarted(pods);
                }
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        message: format!("Watch stream error: {e}"),
                    }));
                }
            }
        }

        Ok(())
    }
}

impl PodLiveness for PodSnapshot {
    fn is_live(&self, pod_uid: &str) -> bool {
        self.contains(pod_uid)
    }
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|status| status.phase.as_deref())
}
