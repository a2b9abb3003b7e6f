//! OCI spec rewriting for GPU containers.
//!
//! On `create`, the bundle's `config.json` gets the device envs handed out by
//! the runtime service, an env side file, the shared cache mount, and the
//! prestart hook. Every invocation is then forwarded unchanged to the
//! wrapped runtime.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::path::PathBuf;

use api_types::BUNDLE_CACHE_DIR;
use api_types::ENV_FILE_MOUNT;
use api_types::ENV_FILE_NAME;
use api_types::SHARED_CACHE_DIR;
use api_types::SHARED_CACHE_ENV;
use api_types::SHARED_CACHE_PATH;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use oci_spec::runtime::HookBuilder;
use oci_spec::runtime::Hooks;
use oci_spec::runtime::Mount;
use oci_spec::runtime::MountBuilder;
use oci_spec::runtime::Spec;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::args::bundle_dir;
use crate::args::modification_required;
use crate::config::ShimConfig;
use crate::resolver::DeviceResolver;
use crate::resolver::Resolution;
use crate::runtime::Runtime;
use crate::spec::FileSpec;
use crate::spec::SpecStore;

#[derive(Debug, Display)]
pub enum ShimError {
    #[display("failed to determine bundle directory")]
    Bundle,
    #[display("error loading OCI specification for modification: {}", path.display())]
    Load { path: PathBuf },
    #[display("error injecting vGPU settings into OCI specification")]
    Modify,
    #[display("error writing modified OCI specification: {}", path.display())]
    Flush { path: PathBuf },
    #[display("failed to execute runtime `{binary}`")]
    Exec { binary: String },
}

impl std::error::Error for ShimError {}

#[derive(Debug, Display)]
pub enum ModifyError {
    #[display("prestart hook `{name}` not found in PATH or at {}", default_path.display())]
    HookNotFound { name: String, default_path: PathBuf },
    #[display("failed to determine working directory")]
    WorkDir,
    #[display("failed to write env file {}", path.display())]
    EnvFile { path: PathBuf },
    #[display("failed to build {what}")]
    Build { what: &'static str },
    #[display("failed to link container cache {}", link.display())]
    CacheLink { link: PathBuf },
}

impl std::error::Error for ModifyError {}

pub struct Shim<D, R> {
    config: ShimConfig,
    resolver: D,
    runtime: R,
}

impl<D: DeviceResolver, R: Runtime> Shim<D, R> {
    pub fn new(config: ShimConfig, resolver: D, runtime: R) -> Self {
        Self {
            config,
            resolver,
            runtime,
        }
    }

    /// Rewrites the bundle spec when `args` create a container, then hands
    /// `args` to the wrapped runtime.
    pub fn exec(&self, args: &[String]) -> Result<(), Report<ShimError>> {
        self.prepare(args)?;
        self.forward(args)
    }

    /// The spec half of [`Shim::exec`].
    pub fn prepare(&self, args: &[String]) -> Result<(), Report<ShimError>> {
        if modification_required(args) {
            let bundle = bundle_dir(args).change_context(ShimError::Bundle)?;
            self.modify_bundle(&bundle)?;
        }
        Ok(())
    }

    pub fn forward(&self, args: &[String]) -> Result<(), Report<ShimError>> {
        info!("Forwarding command to runtime");
        self.runtime
            .exec(args)
            .change_context_lazy(|| ShimError::Exec {
                binary: self.config.runtime_binary.clone(),
            })
    }

    /// Load, modify and flush `<bundle>/config.json`.
    pub fn modify_bundle(&self, bundle: &Path) -> Result<(), Report<ShimError>> {
        let store = FileSpec::in_bundle(bundle);
        self.modify_with(&store, bundle)
    }

    fn modify_with<S: SpecStore>(&self, store: &S, bundle: &Path) -> Result<(), Report<ShimError>> {
        let path = bundle.join(FileSpec::FILE_NAME);
        let mut spec = store
            .load()
            .change_context_lazy(|| ShimError::Load { path: path.clone() })?;
        self.apply(&mut spec, bundle)
            .change_context(ShimError::Modify)?;
        store
            .flush(&spec)
            .change_context_lazy(|| ShimError::Flush { path })
    }

    /// Applies every edit to `spec` in place.
    pub fn apply(&self, spec: &mut Spec, bundle: &Path) -> Result<(), Report<ModifyError>> {
        let hook_path = locate_hook(
            &self.config.hook_name,
            &self.config.hook_default_path,
            env::var_os("PATH").as_deref(),
        )?;
        info!(hook = %hook_path.display(), "prestart hook path");

        let container_env = spec
            .process()
            .as_ref()
            .and_then(|process| process.env().clone())
            .unwrap_or_default();
        match self.resolver.resolve(&container_env) {
            Ok(resolution) => self.inject_devices(spec, bundle, resolution)?,
            Err(e) => warn!("Device resolution skipped: {e:?}"),
        }

        add_prestart_hook(spec, &self.config.hook_name, &hook_path)
    }

    fn inject_devices(
        &self,
        spec: &mut Spec,
        bundle: &Path,
        resolution: Resolution,
    ) -> Result<(), Report<ModifyError>> {
        if !resolution.envs.is_empty() {
            let mut envs = resolution.envs;
            envs.insert(SHARED_CACHE_ENV.to_string(), SHARED_CACHE_PATH.to_string());

            let mut process = spec.process().clone().unwrap_or_default();
            let mut process_env = process.env().clone().unwrap_or_default();
            upsert_env(&mut process_env, &envs);
            process.set_env(Some(process_env));
            spec.set_process(Some(process));

            let env_dir = self
                .config
                .env_file_dir()
                .change_context(ModifyError::WorkDir)?;
            let env_file = write_env_file(&env_dir, &envs)?;
            add_bind_mount(spec, &env_file, Path::new(ENV_FILE_MOUNT))?;
        }

        if let Some(container_id) = resolution.container_id {
            match link_container_cache(&self.config.containers_link_dir, bundle, &container_id) {
                Ok(cache_dir) => add_bind_mount(spec, &cache_dir, Path::new(SHARED_CACHE_DIR))?,
                Err(e) => error!("Failed to link container cache: {e:?}"),
            }
        }
        Ok(())
    }
}

/// `name` from `search_path`, else `default_path` if it exists.
pub fn locate_hook(
    name: &str,
    default_path: &Path,
    search_path: Option<&OsStr>,
) -> Result<PathBuf, Report<ModifyError>> {
    let found = search_path
        .into_iter()
        .flat_map(env::split_paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file());
    if let Some(path) = found {
        return Ok(path);
    }
    if default_path.exists() {
        return Ok(default_path.to_path_buf());
    }
    Err(Report::new(ModifyError::HookNotFound {
        name: name.to_string(),
        default_path: default_path.to_path_buf(),
    }))
}

/// Overwrites entries whose key matches, appends the rest.
pub fn upsert_env(process_env: &mut Vec<String>, envs: &BTreeMap<String, String>) {
    for (key, value) in envs {
        let assignment = format!("{key}={value}");
        let mut found = false;
        for entry in process_env.iter_mut() {
            let entry_key = entry.split_once('=').map_or(entry.as_str(), |(k, _)| k);
            if entry_key == key {
                *entry = assignment.clone();
                found = true;
            }
        }
        if found {
            info!(env = %assignment, "modified env");
        } else {
            info!(env = %assignment, "appended env");
            process_env.push(assignment);
        }
    }
}

fn write_env_file(
    dir: &Path,
    envs: &BTreeMap<String, String>,
) -> Result<PathBuf, Report<ModifyError>> {
    let path = dir.join(ENV_FILE_NAME);
    let contents: String = envs
        .iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect();
    fs::write(&path, contents).change_context_lazy(|| ModifyError::EnvFile { path: path.clone() })?;
    Ok(path)
}

/// Points `<link_dir>/<container_id>` at `<bundle>/vgpucache/`, creating both
/// directories. Returns the cache directory.
fn link_container_cache(
    link_dir: &Path,
    bundle: &Path,
    container_id: &str,
) -> Result<PathBuf, Report<ModifyError>> {
    let link = link_dir.join(container_id);
    let result = (|| -> io::Result<PathBuf> {
        fs::create_dir_all(link_dir)?;
        let cache_dir = bundle.join(BUNDLE_CACHE_DIR);
        fs::create_dir_all(&cache_dir)?;
        match fs::remove_file(&link) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        symlink(&cache_dir, &link)?;
        Ok(cache_dir)
    })();
    let cache_dir = result.change_context_lazy(|| ModifyError::CacheLink { link: link.clone() })?;
    info!(
        link = %link.display(),
        target = %cache_dir.display(),
        "linked container cache"
    );
    Ok(cache_dir)
}

/// Adds an `rbind,rw` mount unless `destination` is already mounted.
fn add_bind_mount(
    spec: &mut Spec,
    source: &Path,
    destination: &Path,
) -> Result<(), Report<ModifyError>> {
    let mut mounts = spec.mounts().clone().unwrap_or_default();
    if mounts.iter().any(|m| m.destination() == destination) {
        info!(destination = %destination.display(), "mount already present");
        return Ok(());
    }
    let mount: Mount = MountBuilder::default()
        .destination(destination)
        .typ("bind")
        .source(source)
        .options(vec!["rbind".to_string(), "rw".to_string()])
        .build()
        .change_context(ModifyError::Build { what: "mount" })?;
    mounts.push(mount);
    spec.set_mounts(Some(mounts));
    Ok(())
}

/// Appends `<hook_path> prestart` unless a hook named `hook_name` is present.
pub fn add_prestart_hook(
    spec: &mut Spec,
    hook_name: &str,
    hook_path: &Path,
) -> Result<(), Report<ModifyError>> {
    let mut hooks = spec.hooks().clone().unwrap_or_else(Hooks::default);
    let mut prestart = hooks.prestart().clone().unwrap_or_default();
    if prestart
        .iter()
        .any(|hook| hook.path().to_string_lossy().contains(hook_name))
    {
        info!("existing prestart hook in OCI spec file");
        return Ok(());
    }

    let hook = HookBuilder::default()
        .path(hook_path)
        .args(vec![
            hook_path.to_string_lossy().into_owned(),
            "prestart".to_string(),
        ])
        .build()
        .change_context(ModifyError::Build { what: "hook" })?;
    prestart.push(hook);
    hooks.set_prestart(Some(prestart));
    spec.set_hooks(Some(hooks));
    Ok(())
}
