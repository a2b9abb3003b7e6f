use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::show_cache::ShowCacheArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node monitor daemon
    Daemon(Box<DaemonArgs>),
    /// Decode a single cache file and print it as JSON
    #[command(name = "show-cache")]
    ShowCache(ShowCacheArgs),
}
