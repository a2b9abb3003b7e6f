use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tokio_util::sync::CancellationToken;
use utils::shared_region::UsageInfo;

use crate::container_lister::ContainerLister;
use crate::container_lister::ContainerUsage;

pub mod encoders;
use encoders::influx::InfluxEncoder;
use encoders::ContainerMetricsParams;
use encoders::MetricsEncoder;

// Wrapper struct for Vec<u8> that implements Display
pub struct BytesWrapper(Vec<u8>);

impl fmt::Display for BytesWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => {
                tracing::error!(msg = "Failed to convert metrics bytes to string");
                Err(fmt::Error)
            }
        }
    }
}

impl From<Vec<u8>> for BytesWrapper {
    fn from(bytes: Vec<u8>) -> Self {
        BytesWrapper(bytes)
    }
}

/// Encodes one line per device below `deviceCount` of `usage`.
pub fn encode_container(
    encoder: &dyn MetricsEncoder,
    usage: &ContainerUsage,
    timestamp: i64,
) -> Vec<String> {
    let region = &usage.region;
    (0..region.device_num())
        .map(|idx| {
            let device_uuid = region.device_uuid(idx);
            encoder.encode_container_metrics(&ContainerMetricsParams {
                pod_uid: &usage.pod_uid,
                container: &usage.container_name,
                device_index: idx,
                device_uuid: &device_uuid,
                memory_usage_bytes: region.device_memory_total(idx),
                memory_limit_bytes: region.device_memory_limit(idx),
                context_bytes: region.device_memory_context_size(idx),
                module_bytes: region.device_memory_module_size(idx),
                buffer_bytes: region.device_memory_buffer_size(idx),
                offset_bytes: region.device_memory_offset(idx),
                sm_util: region.device_sm_util(idx),
                sm_limit: region.device_sm_limit(idx),
                priority: region.priority(),
                last_kernel_time: region.last_kernel_time(),
                timestamp,
            })
        })
        .collect()
}

/// Refreshes the tracker and writes usage lines for every tracked container.
pub fn export_once(lister: &ContainerLister, encoder: &dyn MetricsEncoder) {
    match lister.update() {
        Ok(Some(summary)) if summary.added > 0 || summary.reclaimed > 0 => {
            tracing::info!(
                added = summary.added,
                reclaimed = summary.reclaimed,
                tracked = lister.len(),
                "container lister updated"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::error!("Container lister update failed: {e:?}"),
    }

    let timestamp = current_time_nanos();
    lister.with_containers(|containers| {
        for usage in containers.values() {
            for line in encode_container(encoder, usage, timestamp) {
                tracing::info!(
                    target: "metrics",
                    msg = %line,
                );
            }
        }
    });
}

/// Exports metrics every `interval` until cancelled.
pub async fn run_metrics(
    lister: Arc<ContainerLister>,
    interval: Duration,
    cancellation_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                tracing::info!("Metrics export shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let lister = lister.clone();
                // Mapping and directory removal block; keep them off the runtime workers.
                if let Err(e) = tokio::task::spawn_blocking(move || export_once(&lister, &InfluxEncoder)).await {
                    tracing::error!("Metrics export task failed: {e}");
                }
            }
        }
    }
}

fn current_time_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
