//! Directory handles and watermark-based change detection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::backend::StorageBackend;
use crate::config::{ExecutionContext, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::path::{join_relative, normalize_absolute};
use crate::remote::VolumeConnector;

/// Added by [`Watermark::nudged`] to step past a whole-second remote mtime.
const REMOTE_EPSILON: f64 = 1e-3;

/// Lower bound for "changed since", in seconds since the epoch.
///
/// Comparison is inclusive: an entry whose mtime equals the watermark counts
/// as changed.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(f64);

impl Watermark {
    pub fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    pub fn as_secs(&self) -> f64 {
        self.0
    }

    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// The watermark moved just past itself.
    ///
    /// Remote stores may only keep whole seconds; a watermark taken from a
    /// remote mtime would otherwise select that same entry again.
    pub fn nudged(self) -> Self {
        Self(self.0 + REMOTE_EPSILON)
    }

    /// True if an entry with modification time `mtime` counts as changed.
    pub fn includes(&self, mtime: f64) -> bool {
        mtime >= self.0
    }
}

impl From<SystemTime> for Watermark {
    fn from(time: SystemTime) -> Self {
        let secs = match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs_f64(),
            Err(e) => -e.duration().as_secs_f64(),
        };
        Self(secs)
    }
}

impl From<DateTime<Utc>> for Watermark {
    fn from(time: DateTime<Utc>) -> Self {
        Self(time.timestamp_micros() as f64 / 1_000_000.0)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Files and directories found new or modified under a root, in walk order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub new_or_modified_files: Vec<PathBuf>,
    pub new_or_modified_directories: Vec<PathBuf>,
}

impl ChangeReport {
    pub fn is_empty(&self) -> bool {
        self.new_or_modified_files.is_empty() && self.new_or_modified_directories.is_empty()
    }

    /// Total number of reported entries.
    pub fn len(&self) -> usize {
        self.new_or_modified_files.len() + self.new_or_modified_directories.len()
    }
}

/// A storage backend bound to one root directory.
///
/// Every path taken by the delegating methods is relative to the root; a
/// leading `/` is ignored.
#[derive(Debug, Clone)]
pub struct DirectoryHandle {
    root: PathBuf,
    backend: Arc<StorageBackend>,
}

impl fmt::Display for DirectoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirectoryHandle(root={}, backend={})", self.root.display(), self.backend)
    }
}

impl DirectoryHandle {
    /// Bind `backend` to `root`.
    ///
    /// The root is normalized. On a remote-backed backend it must lie under
    /// the mount path.
    pub fn new(root: impl AsRef<Path>, backend: Arc<StorageBackend>) -> StorageResult<Self> {
        let root = root.as_ref();
        let absolute =
            std::path::absolute(root).map_err(|e| StorageError::from_io("open_dir", root, e))?;
        let root = normalize_absolute(absolute);

        if let Some(resolver) = backend.resolver() {
            if !resolver.path_has_root_prefix(&root) {
                return Err(StorageError::configuration(format!(
                    "directory {} on volume {} must start with the mount path {}",
                    root.display(),
                    backend.volume_name().unwrap_or_default(),
                    resolver.mount_path().display()
                )));
            }
        }
        Ok(Self { root, backend })
    }

    /// Build the backend from configuration and bind it to `root`.
    pub fn open(
        root: impl AsRef<Path>,
        config: &StorageConfig,
        connector: &dyn VolumeConnector,
        context: ExecutionContext,
    ) -> StorageResult<Self> {
        let backend = StorageBackend::open(config, connector, context)?;
        Self::new(root, Arc::new(backend))
    }

    /// A handle on the local filesystem.
    pub fn local(root: impl AsRef<Path>) -> StorageResult<Self> {
        Self::new(root, Arc::new(StorageBackend::local(ExecutionContext::outside())))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backend(&self) -> &Arc<StorageBackend> {
        &self.backend
    }

    /// Root joined with `relative`.
    pub fn full_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        join_relative(&self.root, relative)
    }

    /// Path of `full_path` relative to the root, if it lies under it.
    pub fn relative_path(&self, full_path: impl AsRef<Path>) -> Option<PathBuf> {
        normalize_absolute(full_path)
            .strip_prefix(&self.root)
            .ok()
            .map(Path::to_path_buf)
    }

    pub fn get_mtime(&self, relative: impl AsRef<Path>) -> StorageResult<f64> {
        self.backend.get_mtime(self.full_path(relative))
    }

    pub fn exists(&self, relative: impl AsRef<Path>) -> StorageResult<bool> {
        self.backend.exists(self.full_path(relative))
    }

    pub fn read_json<T: DeserializeOwned>(&self, relative: impl AsRef<Path>) -> StorageResult<T> {
        self.backend.read_json(self.full_path(relative))
    }

    pub fn write_json<T: Serialize + ?Sized>(
        &self,
        relative: impl AsRef<Path>,
        value: &T,
        force: bool,
    ) -> StorageResult<()> {
        self.backend.write_json(self.full_path(relative), value, force)
    }

    pub fn read_bytes(&self, relative: impl AsRef<Path>) -> StorageResult<Vec<u8>> {
        self.backend.read_bytes(self.full_path(relative))
    }

    pub fn write_bytes(&self, relative: impl AsRef<Path>, data: &[u8], force: bool) -> StorageResult<()> {
        self.backend.write_bytes(self.full_path(relative), data, force)
    }

    /// Names of the entries directly under the root.
    pub fn list_dir(&self) -> StorageResult<Vec<String>> {
        self.backend.list_dir(&self.root)
    }

    pub fn create_directory(&self, relative: impl AsRef<Path>) -> StorageResult<()> {
        self.backend.create_directory(self.full_path(relative))
    }

    pub fn remove(&self, relative: impl AsRef<Path>, missing_ok: bool) -> StorageResult<()> {
        self.backend.remove(self.full_path(relative), missing_ok)
    }

    /// Collect files and directories under the root that changed since
    /// `since` (everything when `None`). The root itself is not reported.
    ///
    /// File detection is exact. Directory detection is best-effort on remote
    /// volumes, whose directory mtimes do not move when children are added.
    #[instrument(skip_all, fields(root = %self.root.display(), since = ?since.map(|w| w.as_secs())))]
    pub fn report_changes(&self, since: Option<Watermark>) -> StorageResult<ChangeReport> {
        let mut report = ChangeReport::default();
        let mut zero_mtime_dirs = 0usize;

        for step in self.backend.walk(&self.root) {
            let step = step?;
            debug!(dir = %step.dir.display(), dirs = step.subdirs.len(), files = step.files.len(), "walking");

            for file in &step.files {
                let path = step.dir.join(file);
                if self.changed(&path, since, &mut zero_mtime_dirs, false)? {
                    report.new_or_modified_files.push(path);
                }
            }
            for dir in &step.subdirs {
                let path = step.dir.join(dir);
                if self.changed(&path, since, &mut zero_mtime_dirs, true)? {
                    report.new_or_modified_directories.push(path);
                }
            }
        }

        if zero_mtime_dirs > 0 {
            warn!(
                count = zero_mtime_dirs,
                "directories without a modification time; directory changes may be under-reported"
            );
        }
        debug!(
            files = report.new_or_modified_files.len(),
            directories = report.new_or_modified_directories.len(),
            "change report ready"
        );
        Ok(report)
    }

    fn changed(
        &self,
        path: &Path,
        since: Option<Watermark>,
        zero_mtime_dirs: &mut usize,
        is_dir: bool,
    ) -> StorageResult<bool> {
        let Some(since) = since else {
            return Ok(true);
        };
        let mtime = self.backend.get_mtime(path)?;
        if is_dir && mtime == 0.0 {
            *zero_mtime_dirs += 1;
        }
        Ok(since.includes(mtime))
    }

    /// Replay `source`'s changes since `since` onto this directory.
    ///
    /// Reported directories are created first, then every reported file is
    /// written to the same relative path here, overwriting. Stops at the first
    /// failure; whatever was already copied stays. Returns the applied report.
    #[instrument(skip_all, fields(source = %source.root.display(), destination = %self.root.display()))]
    pub fn copy_changes_from(
        &self,
        source: &DirectoryHandle,
        since: Option<Watermark>,
    ) -> StorageResult<ChangeReport> {
        let report = source.report_changes(since)?;

        for dir in &report.new_or_modified_directories {
            let relative = source.relative_to_root("copy_changes_from", dir)?;
            self.create_directory(&relative)?;
        }

        let mut bytes = 0usize;
        for file in &report.new_or_modified_files {
            let relative = source.relative_to_root("copy_changes_from", file)?;
            let data = source.backend.read_bytes(file)?;
            bytes += data.len();
            self.write_bytes(&relative, &data, true)?;
        }

        info!(
            files = report.new_or_modified_files.len(),
            directories = report.new_or_modified_directories.len(),
            bytes,
            "copied changes"
        );
        Ok(report)
    }

    fn relative_to_root(&self, op: &'static str, path: &Path) -> StorageResult<PathBuf> {
        self.relative_path(path).ok_or_else(|| {
            StorageError::configuration(format!(
                "{}: {} is outside {}",
                op,
                path.display(),
                self.root.display()
            ))
        })
    }
}
