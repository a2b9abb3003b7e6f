//! Tracks the shared regions of containers running on this node.
//!
//! Every container that loads the agent gets a directory
//! `<hook-path>/containers/<podUID>_<containerName>/` holding the agent
//! library and one cache file. A pass over that directory maps cache files
//! of newly seen containers and reclaims directories whose pod is gone.

use std::collections::HashMap;
use std::fs;
use std::fs::DirEntry;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use error_stack::Report;
use error_stack::ResultExt;
use parking_lot::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::shared_region::MappedFile;
use utils::shared_region::SharedRegion;
use utils::shared_region::HEADER_SIZE;

use crate::config::ListerConfig;

/// Answers whether a pod still exists.
pub trait PodLiveness: Send + Sync {
    fn is_live(&self, pod_uid: &str) -> bool;
}

#[derive(Debug, derive_more::Display)]
pub enum ListerError {
    #[display("failed to list {}", path.display())]
    ListDir { path: PathBuf },
    #[display("{} holds {count} entries, expected at most 2", path.display())]
    TooManyEntries { path: PathBuf, count: usize },
    #[display("cache file {} is {size} bytes, smaller than the {} byte header", path.display(), HEADER_SIZE)]
    TooSmall { path: PathBuf, size: u64 },
    #[display("failed to load cache file {}", path.display())]
    Load { path: PathBuf },
}

impl std::error::Error for ListerError {}

/// One tracked container and the mapping of its cache file.
///
/// Dropping it unmaps the region.
#[derive(Debug)]
pub struct ContainerUsage {
    pub pod_uid: String,
    pub container_name: String,
    pub cache_path: PathBuf,
    pub region: SharedRegion<MappedFile>,
}

/// Outcome of a pass that was not rate limited.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSummary {
    pub added: usize,
    pub reclaimed: usize,
}

#[derive(Default)]
struct ListerState {
    containers: HashMap<String, ContainerUsage>,
    last_update: Option<Instant>,
}

pub struct ContainerLister {
    config: ListerConfig,
    pods: Arc<dyn PodLiveness>,
    state: Mutex<ListerState>,
}

impl ContainerLister {
    pub fn new(config: ListerConfig, pods: Arc<dyn PodLiveness>) -> Self {
        Self {
            config,
            pods,
            state: Mutex::new(ListerState::default()),
        }
    }

    pub fn container_path(&self) -> &Path {
        &self.config.container_path
    }

    /// Runs one pass unless the previous one finished less than
    /// `update_interval` ago, in which case `Ok(None)` is returned.
    ///
    /// The map lock is held for the whole pass. Failing to list the base
    /// directory aborts the pass and does not count as an update; problems
    /// with a single container are logged and that container is skipped.
    pub fn update(&self) -> Result<Option<UpdateSummary>, Report<ListerError>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some(last) = state.last_update {
            if now.duration_since(last) < self.config.update_interval {
                return Ok(None);
            }
        }

        let base = &self.config.container_path;
        let list_failed = || ListerError::ListDir { path: base.clone() };
        let mut summary = UpdateSummary::default();

        for entry in fs::read_dir(base).change_context_lazy(list_failed)? {
            let entry = entry.change_context_lazy(list_failed)?;
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!(dir = ?entry.path(), "skipping non utf-8 container directory");
                continue;
            };
            let dir = entry.path();

            let live = name
                .split_once('_')
                .is_some_and(|(pod_uid, _)| self.pods.is_live(pod_uid));
            if !live {
                if self.within_grace(&dir) {
                    continue;
                }
                info!(dir = %dir.display(), "Removing container directory without live pod");
                // Dropping the entry unmaps the region before the file goes away.
                state.containers.remove(&name);
                if let Err(e) = fs::remove_dir_all(&dir) {
                    warn!(dir = %dir.display(), error = %e, "failed to remove container directory");
                }
                summary.reclaimed += 1;
                continue;
            }

            if state.containers.contains_key(&name) {
                continue;
            }

            match load_cache(&dir) {
                Ok(Some((cache_path, region))) => {
                    let (pod_uid, container_name) = name.split_once('_').unwrap_or((name.as_str(), ""));
                    info!(
                        dir = %dir.display(),
                        version = %region.version(),
                        "Adding container"
                    );
                    let usage = ContainerUsage {
                        pod_uid: pod_uid.to_string(),
                        container_name: container_name.to_string(),
                        cache_path,
                        region,
                    };
                    state.containers.insert(name, usage);
                    summary.added += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(dir = %dir.display(), "Failed to load cache: {e:?}");
                }
            }
        }

        state.last_update = Some(now);
        Ok(Some(summary))
    }

    /// Runs `f` over the tracked containers with the map locked.
    pub fn with_containers<R>(&self, f: impl FnOnce(&HashMap<String, ContainerUsage>) -> R) -> R {
        f(&self.state.lock().containers)
    }

    pub fn len(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases every mapping.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        let released = state.containers.len();
        state.containers.clear();
        state.last_update = None;
        info!(released, "container lister shut down");
    }

    fn within_grace(&self, dir: &Path) -> bool {
        match fs::metadata(dir).and_then(|m| m.modified()) {
            // An mtime in the future counts as fresh.
            Ok(modified) => modified
                .elapsed()
                .map_or(true, |age| age < self.config.grace_period),
            Err(_) => false,
        }
    }
}

/// Maps the cache file in `dir`.
///
/// `Ok(None)` means the agent has not created a cache file yet.
fn load_cache(
    dir: &Path,
) -> Result<Option<(PathBuf, SharedRegion<MappedFile>)>, Report<ListerError>> {
    debug!(dir = %dir.display(), "Checking container directory");
    let entries = fs::read_dir(dir)
        .and_then(|entries| entries.collect::<Result<Vec<DirEntry>, _>>())
        .change_context_lazy(|| ListerError::ListDir {
            path: dir.to_path_buf(),
        })?;

    if entries.len() > 2 {
        return Err(Report::new(ListerError::TooManyEntries {
            path: dir.to_path_buf(),
            count: entries.len(),
        }));
    }
    if entries.is_empty() {
        return Ok(None);
    }

    let Some(cache_path) = entries
        .iter()
        .find(|entry| is_cache_file(&entry.file_name().to_string_lossy()))
        .map(DirEntry::path)
    else {
        info!(dir = %dir.display(), "No cache file yet");
        return Ok(None);
    };

    let load_failed = || ListerError::Load {
        path: cache_path.clone(),
    };
    let size = fs::metadata(&cache_path)
        .change_context_lazy(load_failed)?
        .len();
    if size < HEADER_SIZE as u64 {
        return Err(Report::new(ListerError::TooSmall {
            path: cache_path,
            size,
        }));
    }

    let region = SharedRegion::open(&cache_path).change_context_lazy(load_failed)?;
    Ok(Some((cache_path, region)))
}

fn is_cache_file(name: &str) -> bool {
    name.contains(".cache") && !name.contains("libvgpu.so")
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use utils::shared_region::UsageInfo;
    use utils::shared_region::WireVersion;
    use utils::shared_region::LEGACY_FILE_SIZE;
    use utils::shared_region::SHARED_REGION_MAGIC_FLAG;
    use utils::shared_region::V1_REGION_SIZE;

    use super::*;

    #[derive(Default)]
    struct FakePods(Mutex<HashSet<String>>);

    impl FakePods {
        fn add(&self, uid: &str) {
            self.0.lock().insert(uid.to_string());
        }

        fn remove(&self, uid: &str) {
            self.0.lock().remove(uid);
        }
    }

    impl PodLiveness for FakePods {
        fn is_live(&self, pod_uid: &str) -> bool {
            self.0.lock().contains(pod_uid)
        }
    }

    struct Harness {
        root: tempfile::TempDir,
        pods: Arc<FakePods>,
    }

    impl Harness {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            fs::create_dir(root.path().join("containers")).unwrap();
            Self {
                root,
                pods: Arc::new(FakePods::default()),
            }
        }

        fn lister(&self, update_interval: Duration, grace_period: Duration) -> ContainerLister {
            let config = ListerConfig {
                container_path: self.root.path().join("containers"),
                update_interval,
                grace_period,
            };
            ContainerLister::new(config, self.pods.clone())
        }

        fn container_dir(&self, name: &str) -> PathBuf {
            let dir = self.root.path().join("containers").join(name);
            fs::create_dir_all(&dir).unwrap();
            dir
        }
    }

    fn region_bytes(size: usize, major: i32) -> Vec<u8> {
        let mut bytes = vec![0u8; size];
        bytes[0..4].copy_from_slice(&SHARED_REGION_MAGIC_FLAG.to_ne_bytes());
        bytes[4..8].copy_from_slice(&major.to_ne_bytes());
        bytes
    }

    fn write_agent_files(dir: &Path, cache: &[u8]) {
        fs::write(dir.join("libvgpu.so"), b"\x7fELF").unwrap();
        fs::write(dir.join("0.cache"), cache).unwrap();
    }

    #[test_log::test]
    fn maps_cache_file_of_live_pod() {
        let harness = Harness::new();
        harness.pods.add("pod-a");
        let dir = harness.container_dir("pod-a_trainer");
        write_agent_files(&dir, &region_bytes(V1_REGION_SIZE, 1));
        let lister = harness.lister(Duration::ZERO, Duration::from_secs(300));

        let summary = lister.update().unwrap();

        assert_eq!(summary, Some(UpdateSummary { added: 1, reclaimed: 0 }));
        lister.with_containers(|containers| {
            let usage = &containers["pod-a_trainer"];
            assert_eq!(usage.pod_uid, "pod-a");
            assert_eq!(usage.container_name, "trainer");
            assert_eq!(usage.cache_path, dir.join("0.cache"));
            assert_eq!(usage.region.version(), WireVersion::V1 { minor: 0 });
        });
    }

    #[test]
    fn legacy_cache_file_is_detected_by_size() {
        let harness = Harness::new();
        harness.pods.add("pod-a");
        let dir = harness.container_dir("pod-a_old");
        write_agent_files(&dir, &region_bytes(LEGACY_FILE_SIZE, 0));
        let lister = harness.lister(Duration::ZERO, Duration::from_secs(300));

        lister.update().unwrap();

        lister.with_containers(|containers| {
            assert_eq!(containers["pod-a_old"].region.version(), WireVersion::Legacy);
        });
    }

    #[test]
    fn container_name_keeps_everything_after_first_underscore() {
        let harness = Harness::new();
        harness.pods.add("pod-a");
        let dir = harness.container_dir("pod-a_side_car");
        write_agent_files(&dir, &region_bytes(V1_REGION_SIZE, 1));
        let lister = harness.lister(Duration::ZERO, Duration::from_secs(300));

        lister.update().unwrap();

        lister.with_containers(|containers| {
            assert_eq!(containers["pod-a_side_car"].container_name, "side_car");
        });
    }

    #[test]
    fn empty_directory_is_skipped_silently() {
        let harness = Harness::new();
        harness.pods.add("pod-a");
        harness.container_dir("pod-a_trainer");
        let lister = harness.lister(Duration::ZERO, Duration::from_secs(300));

        let summary = lister.update().unwrap();

        assert_eq!(summary, Some(UpdateSummary::default()));
        assert!(lister.is_empty());
    }

    #[test_log::test]
    fn directory_with_too_many_entries_is_skipped() {
        let harness = Harness::new();
        harness.pods.add("pod-a");
        let dir = harness.container_dir("pod-a_trainer");
        write_agent_files(&dir, &region_bytes(V1_REGION_SIZE, 1));
        fs::write(dir.join("1.cache"), b"").unwrap();
        let lister = harness.lister(Duration::ZERO, Duration::from_secs(300));

        assert!(lister.update().is_ok());
        assert!(lister.is_empty());

        let err = load_cache(&dir).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ListerError::TooManyEntries { count: 3, .. }
        ));
    }

    #[test]
    fn directory_with_only_the_library_is_skipped() {
        let harness = Harness::new();
        let dir = harness.container_dir("pod-a_trainer");
        fs::write(dir.join("libvgpu.so"), b"\x7fELF").unwrap();

        assert!(load_cache(&dir).unwrap().is_none());
    }

    #[test_log::test]
    fn malformed_cache_files_are_skipped() {
        let harness = Harness::new();
        harness.pods.add("pod-a");
        let small = harness.container_dir("pod-a_small");
        fs::write(small.join("0.cache"), [0u8; 8]).unwrap();
        let bad_magic = harness.container_dir("pod-a_magic");
        fs::write(bad_magic.join("0.cache"), vec![0u8; V1_REGION_SIZE]).unwrap();
        let unknown = harness.container_dir("pod-a_future");
        fs::write(unknown.join("0.cache"), region_bytes(V1_REGION_SIZE, 7)).unwrap();
        let good = harness.container_dir("pod-a_good");
        write_agent_files(&good, &region_bytes(V1_REGION_SIZE, 1));
        let lister = harness.lister(Duration::ZERO, Duration::from_secs(300));

        let summary = lister.update().unwrap();

        assert_eq!(summary, Some(UpdateSummary { added: 1, reclaimed: 0 }));
        assert!(matches!(
            load_cache(&small).unwrap_err().current_context(),
            ListerError::TooSmall { size: 8, .. }
        ));
        assert!(matches!(
            load_cache(&unknown).unwrap_err().current_context(),
            ListerError::Load { .. }
        ));
    }

    #[test]
    fn directory_of_vanished_pod_is_kept_within_grace_period() {
        let harness = Harness::new();
        harness.pods.add("pod-a");
        let dir = harness.container_dir("pod-a_trainer");
        write_agent_files(&dir, &region_bytes(V1_REGION_SIZE, 1));
        let lister = harness.lister(Duration::ZERO, Duration::from_secs(3600));
        lister.update().unwrap();

        harness.pods.remove("pod-a");
        let summary = lister.update().unwrap();

        assert_eq!(summary, Some(UpdateSummary::default()));
        assert!(dir.exists());
        assert_eq!(lister.len(), 1);
    }

    #[test_log::test]
    fn directory_of_vanished_pod_is_reclaimed_after_grace_period() {
        let harness = Harness::new();
        harness.pods.add("pod-a");
        let dir = harness.container_dir("pod-a_trainer");
        write_agent_files(&dir, &region_bytes(V1_REGION_SIZE, 1));
        let lister = harness.lister(Duration::ZERO, Duration::ZERO);
        lister.update().unwrap();
        assert_eq!(lister.len(), 1);

        harness.pods.remove("pod-a");
        let summary = lister.update().unwrap();

        assert_eq!(summary, Some(UpdateSummary { added: 0, reclaimed: 1 }));
        assert!(!dir.exists());
        assert!(lister.is_empty());
    }

    #[test]
    fn directory_without_separator_is_never_live() {
        let harness = Harness::new();
        harness.pods.add("orphan");
        let dir = harness.container_dir("orphan");
        let lister = harness.lister(Duration::ZERO, Duration::ZERO);

        let summary = lister.update().unwrap();

        assert_eq!(summary, Some(UpdateSummary { added: 0, reclaimed: 1 }));
        assert!(!dir.exists());
    }

    #[test]
    fn plain_files_in_base_directory_are_ignored() {
        let harness = Harness::new();
        fs::write(harness.root.path().join("containers").join("stray"), b"").unwrap();
        let lister = harness.lister(Duration::ZERO, Duration::ZERO);

        assert_eq!(lister.update().unwrap(), Some(UpdateSummary::default()));
        assert!(harness.root.path().join("containers").join("stray").exists());
    }

    #[test]
    fn passes_are_rate_limited() {
        let harness = Harness::new();
        harness.pods.add("pod-a");
        let lister = harness.lister(Duration::from_secs(3600), Duration::from_secs(300));
        assert!(lister.update().unwrap().is_some());

        let dir = harness.container_dir("pod-a_trainer");
        write_agent_files(&dir, &region_bytes(V1_REGION_SIZE, 1));

        assert_eq!(lister.update().unwrap(), None);
        assert!(lister.is_empty());
    }

    #[test]
    fn listing_failure_aborts_pass_without_consuming_rate_limit() {
        let harness = Harness::new();
        harness.pods.add("pod-a");
        let base = harness.root.path().join("containers");
        fs::remove_dir(&base).unwrap();
        let lister = harness.lister(Duration::from_secs(3600), Duration::from_secs(300));

        let err = lister.update().unwrap_err();
        assert!(matches!(err.current_context(), ListerError::ListDir { .. }));

        fs::create_dir(&base).unwrap();
        assert!(lister.update().unwrap().is_some());
    }

    #[test]
    fn already_tracked_container_is_not_remapped() {
        let harness = Harness::new();
        harness.pods.add("pod-a");
        let dir = harness.container_dir("pod-a_trainer");
        write_agent_files(&dir, &region_bytes(V1_REGION_SIZE, 1));
        let lister = harness.lister(Duration::ZERO, Duration::from_secs(300));
        lister.update().unwrap();

        assert_eq!(lister.update().unwrap(), Some(UpdateSummary::default()));
        assert_eq!(lister.len(), 1);
    }

    #[test]
    fn shutdown_releases_every_mapping() {
        let harness = Harness::new();
        harness.pods.add("pod-a");
        for name in ["pod-a_one", "pod-a_two"] {
            write_agent_files(&harness.container_dir(name), &region_bytes(V1_REGION_SIZE, 1));
        }
        let lister = harness.lister(Duration::ZERO, Duration::from_secs(300));
        lister.update().unwrap();
        assert_eq!(lister.len(), 2);

        lister.shutdown();

        assert!(lister.is_empty());
    }

    #[test]
    fn limits_written_by_host_reach_the_cache_file() {
        // v1 keeps deviceCount at byte 56 and the memory limits at 1600.
        const NUM_OFFSET: usize = 56;
        const LIMIT_OFFSET: usize = 1600;

        let harness = Harness::new();
        harness.pods.add("pod-a");
        let dir = harness.container_dir("pod-a_trainer");
        let mut cache = region_bytes(V1_REGION_SIZE, 1);
        cache[NUM_OFFSET..NUM_OFFSET + 8].copy_from_slice(&2u64.to_ne_bytes());
        write_agent_files(&dir, &cache);
        let lister = harness.lister(Duration::ZERO, Duration::from_secs(300));
        lister.update().unwrap();

        lister.with_containers(|c| c["pod-a_trainer"].region.set_device_memory_limit(1 << 20));

        let on_disk = fs::read(dir.join("0.cache")).unwrap();
        let limit = |idx: usize| {
            let at = LIMIT_OFFSET + idx * 8;
            u64::from_ne_bytes(on_disk[at..at + 8].try_into().unwrap())
        };
        assert_eq!(limit(0), 1 << 20);
        assert_eq!(limit(1), 1 << 20);
        assert_eq!(limit(2), 0);
    }

    #[test]
    fn cache_file_filter_excludes_agent_library() {
        assert!(is_cache_file("0.cache"));
        assert!(is_cache_file("cudevshr.cache"));
        assert!(!is_cache_file("libvgpu.so"));
        assert!(!is_cache_file("libvgpu.so.cache"));
        assert!(!is_cache_file("config.json"));
    }
}
