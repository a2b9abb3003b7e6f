use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// The OCI runtime the shim forwards to.
pub trait Runtime {
    /// Runs the runtime with `args`. Only returns on failure when the
    /// runtime replaces the current process.
    fn exec(&self, args: &[String]) -> io::Result<()>;
}

/// Replaces the shim process with `binary`, looked up in `PATH`.
#[derive(Debug, Clone)]
pub struct ExecRuntime {
    binary: String,
}

impl ExecRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Runtime for ExecRuntime {
    fn exec(&self, args: &[String]) -> io::Result<()> {
        tracing::info!(runtime = %self.binary, ?args, "Forwarding to runtime");
        Err(Command::new(&self.binary).args(args).exec())
    }
}
