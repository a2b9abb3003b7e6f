pub mod kube_client;
pub mod pod_snapshot;
pub mod types;

pub use pod_snapshot::PodSnapshot;
pub use types::KubernetesError;
