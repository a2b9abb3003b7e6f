pub mod cli;
pub mod daemon;
pub mod show_cache;

pub use cli::*;
pub use daemon::*;
pub use show_cache::*;
