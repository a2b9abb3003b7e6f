//! Node monitor for containers sharing GPUs through the vGPU agent.

pub mod app;
pub mod cmd;
pub mod config;
pub mod container_lister;
pub mod feedback;
pub mod k8s;
pub mod logging;
pub mod metrics;
