use anyhow::Context;
use anyhow::Result;
use serde::Serialize;
use utils::shared_region::Header;
use utils::shared_region::ProcessSlot;
use utils::shared_region::SharedRegion;
use utils::shared_region::UsageInfo;
use utils::shared_region::WireVersion;

use crate::config::ShowCacheArgs;

#[derive(Debug, Serialize)]
struct CacheReport {
    path: String,
    header: Header,
    version: WireVersion,
    device_count: usize,
    priority: i32,
    recent_kernel: i32,
    utilization_switch: i32,
    last_kernel_time: i64,
    devices: Vec<DeviceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    processes: Option<Vec<ProcessSlot>>,
}

#[derive(Debug, Serialize)]
struct DeviceReport {
    index: usize,
    uuid: String,
    memory_limit: u64,
    sm_limit: u64,
    memory_total: u64,
    context_size: u64,
    module_size: u64,
    buffer_size: u64,
    offset: u64,
    monitor_used: u64,
    sm_util: u64,
    enc_util: u64,
    dec_util: u64,
}

fn report<U: UsageInfo>(region: &U, path: String, header: Header, version: WireVersion, processes: bool) -> CacheReport {
    let devices = (0..region.device_num())
        .map(|index| DeviceReport {
            index,
            uuid: region.device_uuid(index),
            memory_limit: region.device_memory_limit(index),
            sm_limit: region.device_sm_limit(index),
            memory_total: region.device_memory_total(index),
            context_size: region.device_memory_context_size(index),
            module_size: region.device_memory_module_size(index),
            buffer_size: region.device_memory_buffer_size(index),
            offset: region.device_memory_offset(index),
            monitor_used: region.device_monitor_used(index),
            sm_util: region.device_sm_util(index),
            enc_util: region.device_enc_util(index),
            dec_util: region.device_dec_util(index),
        })
        .collect();

    CacheReport {
        path,
        header,
        version,
        device_count: region.device_num(),
        priority: region.priority(),
        recent_kernel: region.recent_kernel(),
        utilization_switch: region.utilization_switch(),
        last_kernel_time: region.last_kernel_time(),
        devices,
        processes: processes.then(|| region.process_slots()),
    }
}

pub fn run_show_cache(args: ShowCacheArgs) -> Result<()> {
    utils::logging::init();

    tracing::debug!(path = %args.path.display(), "opening cache file");
    let region = SharedRegion::open(&args.path)
        .with_context(|| format!("failed to open cache file {}", args.path.display()))?;

    let report = report(
        &region,
        args.path.display().to_string(),
        region.header(),
        region.version(),
        args.processes,
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
