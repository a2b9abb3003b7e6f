use std::env;
use std::path::PathBuf;

/// Environment variable naming the wrapped OCI runtime.
pub const RUNTIME_BINARY_ENV: &str = "VGPU_RUNTIME_BINARY";
/// Environment variable naming the shim's log file.
pub const LOG_FILE_ENV: &str = "VGPU_RUNTIME_LOG_FILE";

const DEFAULT_RUNTIME_BINARY: &str = "runc";
const DEFAULT_LOG_FILE: &str = "/var/log/vgpu-container-runtime.log";
const HOOK_NAME: &str = "nvidia-container-runtime-hook";
const DEFAULT_HOOK_PATH: &str = "/usr/bin/nvidia-container-runtime-hook";

/// Settings of one shim invocation, read once in `main`.
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Runtime the arguments are forwarded to, looked up in `PATH`.
    pub runtime_binary: String,
    pub log_file: PathBuf,
    /// Name of the prestart hook binary, also used for the idempotency check.
    pub hook_name: String,
    /// Used when the hook is not in `PATH`.
    pub hook_default_path: PathBuf,
    /// Host directory for the per-container symlinks.
    pub containers_link_dir: PathBuf,
    /// Where `envfile.vgpu` is written. Unset means the working directory
    /// the runtime was started in.
    pub env_file_dir: Option<PathBuf>,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            runtime_binary: DEFAULT_RUNTIME_BINARY.to_string(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            hook_name: HOOK_NAME.to_string(),
            hook_default_path: PathBuf::from(DEFAULT_HOOK_PATH),
            containers_link_dir: PathBuf::from(api_types::CONTAINERS_LINK_DIR),
            env_file_dir: None,
        }
    }
}

impl ShimConfig {
    /// Absolute directory for the env side file.
    pub fn env_file_dir(&self) -> std::io::Result<PathBuf> {
        match &self.env_file_dir {
            Some(dir) => Ok(dir.clone()),
            None => env::current_dir(),
        }
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(binary) = non_empty_var(RUNTIME_BINARY_ENV) {
            config.runtime_binary = binary;
        }
        if let Some(log_file) = non_empty_var(LOG_FILE_ENV) {
            config.log_file = PathBuf::from(log_file);
        }
        config
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn defaults_wrap_runc() {
        let config = ShimConfig::default();
        assert_eq!(config.runtime_binary, "runc");
        assert_eq!(config.hook_name, "nvidia-container-runtime-hook");
        assert_eq!(config.containers_link_dir, PathBuf::from("/tmp/vgpu/containers/"));
    }

    #[test]
    fn env_file_goes_to_the_working_directory_by_default() {
        let config = ShimConfig::default();
        assert_eq!(config.env_file_dir().unwrap(), env::current_dir().unwrap());

        let pinned = ShimConfig {
            env_file_dir: Some(PathBuf::from("/run/vgpu")),
            ..ShimConfig::default()
        };
        assert_eq!(pinned.env_file_dir().unwrap(), PathBuf::from("/run/vgpu"));
    }
}
