//! Scoped temporary directories for a run and its phases.
//!
//! A [`TempScope`] owns one directory and removes it when dropped unless it was
//! created with `keep = true`. Scopes nest: a child lives inside its parent's
//! directory, and removing either one tolerates the other being gone already.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct TempScope {
    path: PathBuf,
    keep: bool,
}

impl TempScope {
    /// Create the top-level run directory under `parent` (created if missing).
    pub fn create_top_level(parent: &Path, prefix: &str, keep: bool) -> Result<Self> {
        fs::create_dir_all(parent)
            .with_context(|| format!("create temporaries directory {}", parent.display()))?;
        let scope = create_scope(parent, prefix, keep)?;
        debug!(path = %scope.path.display(), keep, "created run temp directory");
        Ok(scope)
    }

    /// Create a uniquely named directory nested under this scope.
    pub fn child(&self, name: &str, keep: bool) -> Result<TempScope> {
        create_scope(&self.path, name, keep)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempScope {
    fn drop(&mut self) {
        if !self.keep {
            remove_scope(&self.path);
        }
    }
}

/// Create a new directory named `<name><random>` inside `parent`. Fails if
/// `parent` does not exist.
pub fn create_scope(parent: &Path, name: &str, keep: bool) -> Result<TempScope> {
    let dir = tempfile::Builder::new()
        .prefix(name)
        .tempdir_in(parent)
        .with_context(|| format!("create temp scope '{name}' in {}", parent.display()))?;
    Ok(TempScope {
        path: dir.keep(),
        keep,
    })
}

/// Recursively delete `path`. Already-removed directories are fine; other
/// failures are logged and swallowed.
pub fn remove_scope(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "removed temp scope"),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "temp scope already removed");
        }
        Err(err) => warn!(path = %path.display(), err = %err, "failed to remove temp scope"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_are_removed_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = TempScope::create_top_level(&temp.path().join("tmp"), "job_", false)
            .expect("root");
        let child = root.child("iter_", false).expect("child");
        let grandchild = child.child("align_", false).expect("grandchild");
        let (root_path, child_path, gc_path) = (
            root.path().to_path_buf(),
            child.path().to_path_buf(),
            grandchild.path().to_path_buf(),
        );
        assert!(gc_path.starts_with(&child_path));
        assert!(child_path.starts_with(&root_path));

        drop(grandchild);
        assert!(!gc_path.exists());
        assert!(child_path.exists());
        drop(child);
        drop(root);
        assert!(!root_path.exists());
    }

    #[test]
    fn parent_removed_first_does_not_break_child_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = TempScope::create_top_level(temp.path(), "job_", false).expect("root");
        let child = root.child("step_", false).expect("child");
        let child_path = child.path().to_path_buf();
        drop(root);
        assert!(!child_path.exists());
        drop(child);
    }

    #[test]
    fn kept_scope_survives() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = TempScope::create_top_level(temp.path(), "job_", true).expect("root");
        let path = root.path().to_path_buf();
        drop(root);
        assert!(path.exists());
    }

    #[test]
    fn missing_parent_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = create_scope(&temp.path().join("absent"), "x", false).unwrap_err();
        assert!(err.to_string().contains("create temp scope"));
    }

    #[test]
    fn sibling_scopes_get_distinct_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = create_scope(temp.path(), "same", false).expect("a");
        let b = create_scope(temp.path(), "same", false).expect("b");
        assert_ne!(a.path(), b.path());
    }
}
