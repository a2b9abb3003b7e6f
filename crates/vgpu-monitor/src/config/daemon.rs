use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "HOOK_PATH",
        value_hint = clap::ValueHint::DirPath,
        help = "Host directory the container hook was installed to; caches live under <hook-path>/containers"
    )]
    pub hook_path: PathBuf,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Node name for filtering pods to this node only"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "HAMI_RESYNC_INTERVAL",
        default_value = "300",
        help = "Seconds a container directory without a live pod is kept before it is reclaimed"
    )]
    pub resync_interval_secs: u64,

    #[arg(
        long,
        default_value = "30",
        help = "Minimum seconds between two scans of the cache directory"
    )]
    pub update_interval_secs: u64,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds between two utilization feedback passes"
    )]
    pub feedback_interval_secs: u64,

    #[arg(
        long,
        default_value = "30",
        help = "Seconds to wait for the initial pod list before giving up"
    )]
    pub sync_timeout_secs: u64,

    #[arg(
        long,
        env = "VGPU_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/logs/vgpu-metrics.log",
        help = "Path for container usage metrics in influx line protocol"
    )]
    pub metrics_file: PathBuf,
}

/// Settings of the container usage tracker.
#[derive(Debug, Clone)]
pub struct ListerConfig {
    /// `<hook-path>/containers`
    pub container_path: PathBuf,
    /// Minimum time between two scans.
    pub update_interval: Duration,
    /// How long a directory with no live pod is kept.
    pub grace_period: Duration,
}

impl From<&DaemonArgs> for ListerConfig {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            container_path: args.hook_path.join("containers"),
            update_interval: Duration::from_secs(args.update_interval_secs),
            grace_period: Duration::from_secs(args.resync_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use similar_asserts::assert_eq;

    use super::*;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: DaemonArgs,
    }

    #[test]
    fn lister_config_derives_container_path_and_intervals() {
        let wrapper = Wrapper::parse_from([
            "vgpu-monitor",
            "--hook-path",
            "/usr/local/vgpu",
            "--node-name",
            "node-a",
            "--resync-interval-secs",
            "60",
        ]);

        let config = ListerConfig::from(&wrapper.args);

        assert_eq!(config.container_path, PathBuf::from("/usr/local/vgpu/containers"));
        assert_eq!(config.grace_period, Duration::from_secs(60));
        assert_eq!(config.update_interval, Duration::from_secs(30));
    }
}
