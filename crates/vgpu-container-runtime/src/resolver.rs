//! Device identity lookup over the node-local runtime service.

use std::collections::BTreeMap;
use std::time::Duration;

use api_types::GetDeviceRequest;
use api_types::VgpuRuntimeServiceClient;
use api_types::CONTAINER_UID_ENV;
use api_types::RUNTIME_SOCKET_ENV;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;
use tracing::debug;
use tracing::info;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const CALL_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Display)]
pub enum ResolveError {
    #[display("no {} entry in container environment", RUNTIME_SOCKET_ENV)]
    NoSocket,
    #[display("failed to connect to runtime service at {socket}")]
    Connect { socket: String },
    #[display("GetDevice failed for container {ctr_uuid}")]
    Call { ctr_uuid: String },
    #[display("runtime service did not answer within {}s", CALL_DEADLINE.as_secs())]
    Timeout,
    #[display("failed to start resolver runtime")]
    Runtime,
}

impl std::error::Error for ResolveError {}

/// What the runtime service assigned to a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Env assignments to inject, merged over every looked-up UID.
    pub envs: BTreeMap<String, String>,
    /// `<podUID>_<ctrName>` of the first reply, when any UID was looked up.
    pub container_id: Option<String>,
}

/// Turns a container's declared environment into device assignments.
pub trait DeviceResolver {
    fn resolve(&self, container_env: &[String]) -> Result<Resolution, Report<ResolveError>>;
}

fn split_env(entry: &str) -> Option<(&str, &str)> {
    entry.split_once('=')
}

/// Socket path carried by the container's own environment.
pub fn socket_path(container_env: &[String]) -> Option<String> {
    container_env
        .iter()
        .filter_map(|entry| split_env(entry))
        .filter(|(key, _)| key.contains(RUNTIME_SOCKET_ENV))
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
        .last()
}

/// Container UIDs to look up, in declaration order.
pub fn container_uids(container_env: &[String]) -> Vec<String> {
    container_env
        .iter()
        .filter_map(|entry| split_env(entry))
        .filter(|(key, _)| key.contains(CONTAINER_UID_ENV))
        .map(|(_, value)| value.to_string())
        .collect()
}

/// Resolver talking gRPC over the runtime service's Unix socket.
///
/// The shim itself is synchronous; each lookup runs on a throwaway
/// current-thread runtime.
#[derive(Debug, Default)]
pub struct GrpcResolver;

impl GrpcResolver {
    pub fn new() -> Self {
        Self
    }

    async fn connect(socket: &str) -> Result<Channel, Report<ResolveError>> {
        info!(socket = %socket, "Connecting to runtime service");
        let path = socket.to_string();
        Endpoint::from_static("http://tonic")
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(CALL_DEADLINE)
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    match UnixStream::connect(path).await {
                        Ok(stream) => Ok(TokioIo::new(stream)),
                        Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                    }
                }
            }))
            .await
            .change_context_lazy(|| ResolveError::Connect {
                socket: socket.to_string(),
            })
    }

    async fn lookup(
        socket: &str,
        uids: Vec<String>,
    ) -> Result<Resolution, Report<ResolveError>> {
        let channel = tokio::time::timeout(DIAL_TIMEOUT, Self::connect(socket))
            .await
            .map_err(|_| {
                Report::new(ResolveError::Timeout).attach_printable(format!(
                    "dial did not complete within {}s",
                    DIAL_TIMEOUT.as_secs()
                ))
            })??;
        let mut client = VgpuRuntimeServiceClient::new(channel);

        let mut resolution = Resolution::default();
        for ctr_uuid in uids {
            debug!(ctr_uuid = %ctr_uuid, "Looking up container devices");
            let reply = client
                .get_device(GetDeviceRequest {
                    ctr_uuid: ctr_uuid.clone(),
                })
                .await
                .map_err(|status| {
                    Report::new(ResolveError::Call { ctr_uuid }).attach_printable(status.to_string())
                })?
                .into_inner();
            info!(
                pod_uid = %reply.pod_uid,
                container = %reply.ctr_name,
                envs = reply.envs.len(),
                "Runtime service assigned devices"
            );
            if resolution.container_id.is_none() {
                resolution.container_id = Some(reply.container_id());
            }
            resolution.envs.extend(reply.envs);
        }
        Ok(resolution)
    }
}

impl DeviceResolver for GrpcResolver {
    fn resolve(&self, container_env: &[String]) -> Result<Resolution, Report<ResolveError>> {
        let socket = socket_path(container_env).ok_or_else(|| Report::new(ResolveError::NoSocket))?;
        let uids = container_uids(container_env);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .change_context(ResolveError::Runtime)?;
        runtime.block_on(async {
            tokio::time::timeout(CALL_DEADLINE, Self::lookup(&socket, uids))
                .await
                .map_err(|_| Report::new(ResolveError::Timeout))?
        })
    }
}
