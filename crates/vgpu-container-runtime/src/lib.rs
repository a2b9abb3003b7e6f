//! OCI runtime shim that wires vGPU devices into containers at create time.

pub mod args;
pub mod config;
pub mod resolver;
pub mod runtime;
pub mod shim;
pub mod spec;
