//! Scanning of the arguments the shim was invoked with.

use std::env;
use std::path::PathBuf;

fn is_bundle_flag(arg: &str) -> bool {
    matches!(arg.trim_start_matches('-'), "bundle" | "b") && arg.starts_with('-')
}

/// Whether `args` carry a bare `create` verb.
///
/// The value following a bundle flag is a path, so a bundle directory that
/// happens to be named `create` does not count.
pub fn modification_required<S: AsRef<str>>(args: &[S]) -> bool {
    let mut previous_was_bundle = false;
    for arg in args.iter().map(AsRef::as_ref) {
        if !previous_was_bundle && is_bundle_flag(arg) {
            previous_was_bundle = true;
            continue;
        }
        if !previous_was_bundle && arg == "create" {
            tracing::info!("'create' command detected; modification required");
            return true;
        }
        previous_was_bundle = false;
    }
    tracing::debug!("No modification required");
    false
}

/// The bundle directory from `--bundle`/`-b` (either `flag value` or
/// `flag=value`), if present.
pub fn bundle_arg<S: AsRef<str>>(args: &[S]) -> Option<PathBuf> {
    let mut args = args.iter().map(AsRef::as_ref);
    while let Some(arg) = args.next() {
        if is_bundle_flag(arg) {
            return args.next().map(PathBuf::from);
        }
        if let Some((flag, value)) = arg.split_once('=') {
            if is_bundle_flag(flag) {
                return Some(PathBuf::from(value));
            }
        }
    }
    None
}

/// The bundle directory, falling back to the working directory.
pub fn bundle_dir<S: AsRef<str>>(args: &[S]) -> std::io::Result<PathBuf> {
    match bundle_arg(args) {
        Some(dir) => Ok(dir),
        None => env::current_dir(),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn bundle_named_create_is_not_a_verb() {
        assert!(!modification_required(&["--bundle", "create"]));
        assert!(!modification_required(&["-b", "create"]));
    }

    #[test]
    fn trailing_create_after_bundle_named_create_is_a_verb() {
        assert!(modification_required(&["--bundle", "create", "create"]));
    }

    #[test]
    fn create_verb_triggers_modification() {
        assert!(modification_required(&[
            "--root",
            "/run/containerd/runc/k8s.io",
            "create",
            "--bundle",
            "/run/containerd/io.containerd.runtime.v2.task/k8s.io/abc",
            "abc",
        ]));
    }

    #[test]
    fn other_verbs_are_forwarded_untouched() {
        assert!(!modification_required(&["start", "abc"]));
        assert!(!modification_required(&["delete", "--force", "create-ish"]));
        assert!(!modification_required::<&str>(&[]));
    }

    #[test]
    fn single_dash_long_bundle_flag_is_recognised() {
        assert!(!modification_required(&["-bundle", "create"]));
    }

    #[test]
    fn bundle_arg_accepts_both_spellings() {
        assert_eq!(bundle_arg(&["create", "--bundle", "/b1", "id"]), Some(PathBuf::from("/b1")));
        assert_eq!(bundle_arg(&["create", "-b", "/b2"]), Some(PathBuf::from("/b2")));
        assert_eq!(bundle_arg(&["create", "--bundle=/b3"]), Some(PathBuf::from("/b3")));
        assert_eq!(bundle_arg(&["create", "id"]), None);
        assert_eq!(bundle_arg(&["create", "--bundle"]), None);
    }
}
