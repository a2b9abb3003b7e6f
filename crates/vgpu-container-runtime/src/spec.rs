//! Loading and persisting a bundle's OCI runtime spec.

use std::path::Path;
use std::path::PathBuf;

use oci_spec::runtime::Spec;
use oci_spec::OciSpecError;

/// Source and sink of the spec a shim invocation edits.
pub trait SpecStore {
    fn load(&self) -> Result<Spec, OciSpecError>;

    fn flush(&self, spec: &Spec) -> Result<(), OciSpecError>;
}

/// `config.json` inside a bundle directory.
#[derive(Debug, Clone)]
pub struct FileSpec {
    path: PathBuf,
}

impl FileSpec {
    pub const FILE_NAME: &'static str = "config.json";

    pub fn in_bundle(bundle_dir: &Path) -> Self {
        Self {
            path: bundle_dir.join(Self::FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SpecStore for FileSpec {
    fn load(&self) -> Result<Spec, OciSpecError> {
        Spec::load(&self.path)
    }

    fn flush(&self, spec: &Spec) -> Result<(), OciSpecError> {
        spec.save(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn flushed_spec_loads_back() {
        let bundle = tempfile::tempdir().unwrap();
        let store = FileSpec::in_bundle(bundle.path());
        let mut spec = Spec::default();
        spec.set_hostname(Some("trainer-0".to_string()));

        store.flush(&spec).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(store.path(), bundle.path().join("config.json"));
        assert_eq!(loaded.hostname().as_deref(), Some("trainer-0"));
    }

    #[test]
    fn missing_config_is_an_error() {
        let bundle = tempfile::tempdir().unwrap();
        assert!(FileSpec::in_bundle(bundle.path()).load().is_err());
    }
}
