//! Utilization feedback between containers sharing a device.
//!
//! Agents raise `recentKernel` when they launch work. Each pass decays it and
//! counts, per device UUID and priority, how many containers are still busy.
//! A container then gets blocked (`recentKernel = -1`) while a higher priority
//! one is busy on a shared device, and its utilization switch turned on while
//! it competes with anyone on a device.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use utils::shared_region::UsageInfo;

use crate::container_lister::ContainerLister;

/// Priorities the agent knows about: 0 is high, 1 is low.
const PRIORITY_LEVELS: usize = 2;

type ActiveTasks = HashMap<String, [u32; PRIORITY_LEVELS]>;

fn priority_slot(priority: i32) -> usize {
    priority.clamp(0, PRIORITY_LEVELS as i32 - 1) as usize
}

fn device_uuids<U: UsageInfo + ?Sized>(region: &U) -> Vec<String> {
    (0..region.device_max())
        .filter(|idx| region.is_valid_uuid(*idx))
        .map(|idx| region.device_uuid(idx))
        .collect()
}

/// One feedback pass over `regions`, keyed by container name for logging.
pub fn observe<U: UsageInfo>(regions: &[(&str, &U)]) {
    let mut active = ActiveTasks::new();

    for (_, region) in regions {
        let recent = region.recent_kernel();
        if recent <= 0 {
            continue;
        }
        region.set_recent_kernel(recent - 1);
        if recent - 1 > 0 {
            let slot = priority_slot(region.priority());
            for uuid in device_uuids(*region) {
                active.entry(uuid).or_default()[slot] += 1;
            }
        }
    }

    if !active.is_empty() {
        debug!(?active, "active tasks per device");
    }

    for (name, region) in regions {
        let slot = priority_slot(region.priority());
        let uuids = device_uuids(*region);
        let higher_busy = uuids.iter().any(|uuid| {
            active
                .get(uuid)
                .is_some_and(|counts| counts[..slot].iter().any(|n| *n > 0))
        });
        let shared = uuids
            .iter()
            .any(|uuid| active.get(uuid).is_some_and(|counts| counts[slot] > 1));

        if higher_busy {
            if region.recent_kernel() >= 0 {
                info!(container = %name, "Setting blocking on");
                region.set_recent_kernel(-1);
            }
        } else if region.recent_kernel() < 0 {
            info!(container = %name, "Setting blocking off");
            region.set_recent_kernel(0);
        }

        let switch = i32::from(higher_busy || shared);
        if region.utilization_switch() != switch {
            info!(
                container = %name,
                on = switch == 1,
                "Setting utilization switch"
            );
            region.set_utilization_switch(switch);
        }
    }
}

/// One [`observe`] pass over every container `lister` tracks.
pub fn observe_tracked(lister: &ContainerLister) {
    lister.with_containers(|containers| {
        let regions: Vec<_> = containers
            .iter()
            .map(|(name, usage)| (name.as_str(), &usage.region))
            .collect();
        observe(&regions);
    });
}

/// Runs [`observe_tracked`] until cancelled.
pub async fn run_feedback(
    lister: Arc<ContainerLister>,
    interval: Duration,
    cancellation_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                info!("Feedback observer shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let lister = lister.clone();
                // The map lock can be held across directory removal.
                let pass = tokio::task::spawn_blocking(move || observe_tracked(&lister));
                if let Err(e) = pass.await {
                    error!("Feedback pass failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use utils::shared_region::anonymous_copy;
    use utils::shared_region::MmapMut;
    use utils::shared_region::SharedRegion;
    use utils::shared_region::SHARED_REGION_MAGIC_FLAG;
    use utils::shared_region::UUID_LEN;
    use utils::shared_region::V1_REGION_SIZE;

    use super::*;

    // v1 offsets of the fields the agent owns.
    const NUM: usize = 56;
    const UUIDS: usize = 64;
    const PRIORITY: usize = 2_008_908;
    const RECENT_KERNEL: usize = 2_008_904;

    fn region_bytes(devices: &[&str], priority: i32) -> Vec<u8> {
        let mut bytes = vec![0u8; V1_REGION_SIZE];
        bytes[0..4].copy_from_slice(&SHARED_REGION_MAGIC_FLAG.to_ne_bytes());
        bytes[4..8].copy_from_slice(&1i32.to_ne_bytes());
        bytes[NUM..NUM + 8].copy_from_slice(&(devices.len() as u64).to_ne_bytes());
        for (idx, uuid) in devices.iter().enumerate() {
            let at = UUIDS + idx * UUID_LEN;
            bytes[at..at + uuid.len()].copy_from_slice(uuid.as_bytes());
        }
        bytes[PRIORITY..PRIORITY + 4].copy_from_slice(&priority.to_ne_bytes());
        bytes
    }

    fn region(devices: &[&str], priority: i32, recent_kernel: i32) -> SharedRegion<MmapMut> {
        let bytes = region_bytes(devices, priority);
        let region = SharedRegion::new(anonymous_copy(&bytes).unwrap()).unwrap();
        region.set_recent_kernel(recent_kernel);
        region
    }

    #[test]
    fn idle_region_is_left_alone() {
        let idle = region(&["GPU-a"], 1, 0);

        observe(&[("idle", &idle)]);

        assert_eq!(idle.recent_kernel(), 0);
        assert_eq!(idle.utilization_switch(), 0);
    }

    #[test]
    fn recent_kernel_decays_each_pass() {
        let busy = region(&["GPU-a"], 1, 3);

        observe(&[("busy", &busy)]);
        assert_eq!(busy.recent_kernel(), 2);

        observe(&[("busy", &busy)]);
        observe(&[("busy", &busy)]);
        assert_eq!(busy.recent_kernel(), 0);
    }

    #[test_log::test]
    fn low_priority_is_blocked_by_busy_high_priority_on_shared_device() {
        let high = region(&["GPU-a"], 0, 5);
        let low = region(&["GPU-a"], 1, 5);

        observe(&[("high", &high), ("low", &low)]);

        assert_eq!(high.recent_kernel(), 4);
        assert_eq!(high.utilization_switch(), 0);
        assert_eq!(low.recent_kernel(), -1);
        assert_eq!(low.utilization_switch(), 1);
    }

    #[test]
    fn blocked_region_stays_blocked_without_counting_as_busy() {
        let high = region(&["GPU-a"], 0, 5);
        let low = region(&["GPU-a"], 1, 5);
        observe(&[("high", &high), ("low", &low)]);

        observe(&[("high", &high), ("low", &low)]);

        assert_eq!(low.recent_kernel(), -1);
        assert_eq!(high.utilization_switch(), 0);
    }

    #[test_log::test]
    fn block_is_lifted_once_high_priority_goes_idle() {
        let high = region(&["GPU-a"], 0, 2);
        let low = region(&["GPU-a"], 1, 5);
        observe(&[("high", &high), ("low", &low)]);
        assert_eq!(low.recent_kernel(), -1);

        // high decays from 1 to 0 and no longer counts.
        observe(&[("high", &high), ("low", &low)]);

        assert_eq!(high.recent_kernel(), 0);
        assert_eq!(low.recent_kernel(), 0);
        assert_eq!(low.utilization_switch(), 0);
    }

    #[test]
    fn same_priority_neighbours_share_without_blocking() {
        let first = region(&["GPU-a"], 1, 5);
        let second = region(&["GPU-a"], 1, 5);

        observe(&[("first", &first), ("second", &second)]);

        for r in [&first, &second] {
            assert_eq!(r.recent_kernel(), 4);
            assert_eq!(r.utilization_switch(), 1);
        }
    }

    #[test]
    fn containers_on_different_devices_do_not_interact() {
        let high = region(&["GPU-a"], 0, 5);
        let low = region(&["GPU-b"], 1, 5);

        observe(&[("high", &high), ("low", &low)]);

        assert_eq!(low.recent_kernel(), 4);
        assert_eq!(low.utilization_switch(), 0);
    }

    #[test]
    fn out_of_range_priorities_are_clamped() {
        let high = region(&["GPU-a"], -3, 5);
        let low = region(&["GPU-a"], 9, 5);

        observe(&[("high", &high), ("low", &low)]);

        assert_eq!(low.recent_kernel(), -1);
        assert_eq!(high.recent_kernel(), 4);
    }

    #[test]
    fn switch_is_turned_off_when_contention_ends() {
        let lone = region(&["GPU-a"], 1, 5);
        lone.set_utilization_switch(1);

        observe(&[("lone", &lone)]);

        assert_eq!(lone.utilization_switch(), 0);
    }

    struct AllLive;

    impl crate::container_lister::PodLiveness for AllLive {
        fn is_live(&self, _pod_uid: &str) -> bool {
            true
        }
    }

    #[test_log::test(tokio::test)]
    async fn feedback_loop_decays_tracked_cache_files_off_the_async_workers() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("pod-a_trainer");
        std::fs::create_dir_all(&dir).unwrap();
        let mut bytes = region_bytes(&["GPU-a"], 1);
        bytes[RECENT_KERNEL..RECENT_KERNEL + 4].copy_from_slice(&3i32.to_ne_bytes());
        std::fs::write(dir.join("0.cache"), &bytes).unwrap();

        let config = crate::config::ListerConfig {
            container_path: root.path().to_path_buf(),
            update_interval: Duration::ZERO,
            grace_period: Duration::from_secs(300),
        };
        let lister = Arc::new(ContainerLister::new(config, Arc::new(AllLive)));
        lister.update().unwrap();
        assert_eq!(lister.len(), 1);

        let token = CancellationToken::new();
        let task = tokio::spawn(run_feedback(
            lister.clone(),
            Duration::from_millis(5),
            token.clone(),
        ));
        let recent_kernel = || {
            lister.with_containers(|containers| containers["pod-a_trainer"].region.recent_kernel())
        };
        for _ in 0..200 {
            if recent_kernel() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();
        task.await.unwrap();

        assert_eq!(recent_kernel(), 0);
        let on_disk = std::fs::read(dir.join("0.cache")).unwrap();
        assert_eq!(&on_disk[RECENT_KERNEL..RECENT_KERNEL + 4], &0i32.to_ne_bytes());
    }
}
