use std::env;
use std::process::ExitCode;

use utils::version;
use vgpu_container_runtime::config::ShimConfig;
use vgpu_container_runtime::resolver::GrpcResolver;
use vgpu_container_runtime::runtime::ExecRuntime;
use vgpu_container_runtime::shim::Shim;

fn main() -> ExitCode {
    let config = ShimConfig::from_env();
    let guard = match utils::logging::init_to_file(&config.log_file) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("vgpu-container-runtime: logging to {} disabled: {e}", config.log_file.display());
            None
        }
    };

    let args: Vec<String> = env::args().skip(1).collect();
    tracing::info!(version = %&**version::VERSION, ?args, "Running vgpu container runtime");

    let runtime = ExecRuntime::new(config.runtime_binary.clone());
    let shim = Shim::new(config, GrpcResolver::new(), runtime);

    let prepared = shim.prepare(&args);
    if let Err(e) = &prepared {
        tracing::error!("Error running vgpu container runtime: {e:?}");
    }
    // The runtime replaces this process; flush buffered log lines first.
    drop(guard);

    match prepared.and_then(|()| shim.forward(&args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vgpu-container-runtime: {e:?}");
            ExitCode::FAILURE
        }
    }
}
