//! Shared API type definitions
//!
//! The contract between the container runtime shim and the node-local device
//! runtime service: the `GetDevice` request/reply messages, a unary client,
//! and the names and paths both sides agree on.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use tonic::codec::ProstCodec;
use tonic::codegen::http;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::Body;
use tonic::codegen::BoxFuture;
use tonic::codegen::StdError;
use tonic::server::NamedService;
use tonic::server::UnaryService;
use tonic::transport::Channel;
use tonic::IntoRequest;
use tonic::Request;
use tonic::Response;
use tonic::Status;

/// Substring of the container env var whose value is the runtime socket path.
pub const RUNTIME_SOCKET_ENV: &str = "VGPU_RUNTIME_SOCKET";

/// Substring of the container env vars whose values are container UIDs to look up.
pub const CONTAINER_UID_ENV: &str = "VGPU_CONTAINER_UID";

/// Env var pointing the in-container agent at its cache file.
pub const SHARED_CACHE_ENV: &str = "CUDA_DEVICE_MEMORY_SHARED_CACHE";

/// In-container path of the cache file.
pub const SHARED_CACHE_PATH: &str = "/tmp/vgpu/cudevshr.cache";

/// In-container directory the per-container cache directory is mounted at.
pub const SHARED_CACHE_DIR: &str = "/tmp/vgpu/";

/// Host directory holding one symlink per container, named `<podUID>_<ctrName>`.
pub const CONTAINERS_LINK_DIR: &str = "/tmp/vgpu/containers/";

/// Name of the env side file written into the bundle directory.
pub const ENV_FILE_NAME: &str = "envfile.vgpu";

/// In-container path the env side file is mounted at.
pub const ENV_FILE_MOUNT: &str = "/tmp/envfile.vgpu";

/// Per-bundle subdirectory backing the shared cache mount.
pub const BUNDLE_CACHE_DIR: &str = "vgpucache";

const SERVICE_NAME: &str = "pluginrpc.VGPURuntimeService";
const GET_DEVICE_PATH: &str = "/pluginrpc.VGPURuntimeService/GetDevice";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDeviceRequest {
    #[prost(string, tag = "1")]
    pub ctr_uuid: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDeviceReply {
    /// Env assignments for the container's devices.
    #[prost(map = "string, string", tag = "1")]
    pub envs: HashMap<String, String>,
    #[prost(string, tag = "2")]
    pub pod_uid: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub ctr_name: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub pod_namespace: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub pod_name: ::prost::alloc::string::String,
}

impl GetDeviceReply {
    /// `<podUID>_<ctrName>`, the name of the container's cache directory.
    pub fn container_id(&self) -> String {
        format!("{}_{}", self.pod_uid, self.ctr_name)
    }
}

/// Unary client for `VGPURuntimeService`.
#[derive(Debug, Clone)]
pub struct VgpuRuntimeServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl VgpuRuntimeServiceClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn get_device(
        &mut self,
        request: impl IntoRequest<GetDeviceRequest>,
    ) -> Result<Response<GetDeviceReply>, Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("{SERVICE_NAME} was not ready: {e}")))?;
        let codec: ProstCodec<GetDeviceRequest, GetDeviceReply> = ProstCodec::default();
        let path = PathAndQuery::from_static(GET_DEVICE_PATH);
        self.inner.unary(request.into_request(), path, codec).await
    }
}

/// Server side of `VGPURuntimeService`.
#[tonic::async_trait]
pub trait VgpuRuntimeService: Send + Sync + 'static {
    async fn get_device(
        &self,
        request: Request<GetDeviceRequest>,
    ) -> Result<Response<GetDeviceReply>, Status>;
}

/// Routes `VGPURuntimeService` calls to a [`VgpuRuntimeService`].
#[derive(Debug)]
pub struct VgpuRuntimeServiceServer<T> {
    inner: Arc<T>,
}

impl<T> VgpuRuntimeServiceServer<T> {
    pub fn new(service: T) -> Self {
        Self {
            inner: Arc::new(service),
        }
    }
}

impl<T> Clone for VgpuRuntimeServiceServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> NamedService for VgpuRuntimeServiceServer<T> {
    const NAME: &'static str = SERVICE_NAME;
}

struct GetDeviceSvc<T>(Arc<T>);

impl<T: VgpuRuntimeService> UnaryService<GetDeviceRequest> for GetDeviceSvc<T> {
    type Response = GetDeviceReply;
    type Future = BoxFuture<Response<GetDeviceReply>, Status>;

    fn call(&mut self, request: Request<GetDeviceRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.get_device(request).await })
    }
}

impl<T, B> tonic::codegen::Service<http::Request<B>> for VgpuRuntimeServiceServer<T>
where
    T: VgpuRuntimeService,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        if req.uri().path() != GET_DEVICE_PATH {
            let status = Status::unimplemented(format!("{} is not served", req.uri().path()));
            return Box::pin(async move { Ok(status.into_http()) });
        }
        let method = GetDeviceSvc(Arc::clone(&self.inner));
        Box::pin(async move {
            let codec: ProstCodec<GetDeviceReply, GetDeviceRequest> = ProstCodec::default();
            let mut grpc = tonic::server::Grpc::new(codec);
            Ok(grpc.unary(method, req).await)
        })
    }
}
