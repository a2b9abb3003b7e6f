use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
pub struct ShowCacheArgs {
    #[arg(
        help = "Path of the cache file, e.g. /usr/local/vgpu/containers/<pod>_<ctr>/0.cache",
        value_hint = clap::ValueHint::FilePath
    )]
    pub path: PathBuf,

    #[arg(long, help = "Include in-use process slots", default_value_t = false)]
    pub processes: bool,
}
