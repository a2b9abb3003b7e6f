use anyhow::Result;
use clap::Parser;
use utils::version;
use vgpu_monitor::app::Application;
use vgpu_monitor::cmd::show_cache::run_show_cache;
use vgpu_monitor::config::Cli;
use vgpu_monitor::config::Commands;
use vgpu_monitor::config::DaemonArgs;
use vgpu_monitor::logging;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ShowCache(show_cache_args) => run_show_cache(show_cache_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(&daemon_args.metrics_file)?;

    tracing::info!("Starting vgpu monitor {}", &**version::VERSION);

    let app = Application::build(daemon_args).await?;

    let result = app.run().await;
    app.shutdown();

    result
}
