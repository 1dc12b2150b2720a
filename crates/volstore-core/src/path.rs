//! Path normalization between caller paths and volume-relative paths.
//!
//! Callers always write absolute paths, which may or may not include the
//! mount prefix of a remote volume. The remote client wants paths relative
//! to the volume's own root. Everything here is lexical: no filesystem
//! access, no symlink resolution, and no failure cases.

use std::path::{Component, Path, PathBuf};

/// Normalize a path to an absolute, dot-resolved form.
///
/// Relative inputs are anchored at `/`, `.` components are dropped and `..`
/// pops the previous component (never above the root). The result has no
/// trailing separator.
pub fn normalize_absolute(path: impl AsRef<Path>) -> PathBuf {
    let mut result = PathBuf::from("/");
    for component in path.as_ref().components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            Component::Normal(s) => result.push(s),
        }
    }
    result
}

/// Join a root with a path relative to it and normalize the result.
///
/// A leading `/` on `relative` is ignored, so `join_relative("/r", "/a")` is
/// `/r/a` rather than `/a`.
pub fn join_relative(root: impl AsRef<Path>, relative: impl AsRef<Path>) -> PathBuf {
    let relative = relative.as_ref();
    let relative = relative.strip_prefix("/").unwrap_or(relative);
    normalize_absolute(root.as_ref().join(relative))
}

/// Returns true when the path was written with a trailing separator.
pub fn has_trailing_separator(path: impl AsRef<Path>) -> bool {
    let s = path.as_ref().as_os_str().to_string_lossy();
    s.len() > 1 && s.ends_with(std::path::MAIN_SEPARATOR)
}

/// Final component of a path as an owned string.
pub fn file_name(path: impl AsRef<Path>) -> Option<String> {
    path.as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// Translates between mount-prefixed paths and volume-relative paths for one
/// mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    mount_path: PathBuf,
}

impl PathResolver {
    /// Create a resolver for the given mount path (normalized here).
    pub fn new(mount_path: impl AsRef<Path>) -> Self {
        Self {
            mount_path: normalize_absolute(mount_path),
        }
    }

    /// The normalized mount path.
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Returns true iff the normalized path starts with the mount path.
    ///
    /// Matching is per component: `/mnt2/x` is not under `/mnt`.
    pub fn path_has_root_prefix(&self, path: impl AsRef<Path>) -> bool {
        normalize_absolute(path).starts_with(&self.mount_path)
    }

    /// Normalize `path` and remove the mount prefix if present.
    ///
    /// The prefix is removed until none remains, which keeps the function
    /// idempotent even for paths like `/mnt/mnt/x`. Exactly the mount path
    /// maps to `/`.
    pub fn strip_root_prefix(&self, path: impl AsRef<Path>) -> PathBuf {
        let mut current = normalize_absolute(path);
        if self.mount_path.parent().is_none() {
            // Mounted at `/`: every absolute path is already volume-absolute.
            return current;
        }
        while let Ok(rest) = current.strip_prefix(&self.mount_path) {
            current = normalize_absolute(rest);
        }
        current
    }

    /// Normalize `path` and remove the mount prefix at most once.
    ///
    /// Unlike [`strip_root_prefix`](Self::strip_root_prefix) this is
    /// one-to-one: with mount `/data`, `/data/a` and `/data/data/a` stay
    /// distinct.
    pub fn strip_mount_once(&self, path: impl AsRef<Path>) -> PathBuf {
        let normalized = normalize_absolute(path);
        if self.mount_path.parent().is_none() {
            return normalized;
        }
        match normalized.strip_prefix(&self.mount_path) {
            Ok(rest) => normalize_absolute(rest),
            Err(_) => normalized,
        }
    }

    /// The form the remote client takes: the mount prefix removed once and
    /// no leading `/`. The volume root is the empty string.
    pub fn volume_relative(&self, path: impl AsRef<Path>) -> String {
        let stripped = self.strip_mount_once(path);
        stripped
            .to_string_lossy()
            .trim_start_matches('/')
            .to_string()
    }

    /// Rebuild an absolute, mount-prefixed path from a volume entry path.
    pub fn mount_join(&self, entry_path: &str) -> PathBuf {
        join_relative(&self.mount_path, entry_path)
    }
}
