//! Dual-mode storage backend.
//!
//! A `StorageBackend` either talks to the local filesystem or to a remote
//! volume client. The choice is made per call:
//!
//! | configured volume | managed worker | calls used          |
//! |-------------------|----------------|---------------------|
//! | no                | either         | local filesystem    |
//! | yes               | no             | remote volume API   |
//! | yes               | yes            | local filesystem (the volume is mounted) |
//!
//! Paths are always absolute paths as the caller writes them, with or
//! without the mount prefix; they are translated to volume-relative paths
//! only on the remote branch.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::config::{ExecutionContext, StorageConfig};
use crate::dir::Watermark;
use crate::error::{StorageError, StorageResult};
use crate::path::{normalize_absolute, PathResolver};
use crate::remote::{batch_upload, EntryKind, RemoteVolume, VolumeConnector, VolumeEntry};
use crate::scratch;

/// A configured remote volume: its client plus the mount point it appears at.
struct VolumeBinding {
    name: String,
    resolver: PathResolver,
    client: Arc<dyn RemoteVolume>,
}

/// Storage operations over either the local filesystem or a remote volume.
pub struct StorageBackend {
    context: ExecutionContext,
    volume: Option<VolumeBinding>,
}

impl fmt::Debug for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageBackend")
            .field("context", &self.context)
            .field("volume_name", &self.volume_name())
            .field("mount_path", &self.mount_path())
            .finish()
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.volume {
            Some(volume) => write!(
                f,
                "StorageBackend(volume={}, mount_path={})",
                volume.name,
                volume.resolver.mount_path().display()
            ),
            None => write!(f, "StorageBackend(local)"),
        }
    }
}

impl StorageBackend {
    /// Plain local filesystem backend.
    pub fn local(context: ExecutionContext) -> Self {
        Self {
            context,
            volume: None,
        }
    }

    /// Backend for a remote volume mounted at `mount_path`.
    pub fn with_volume(
        client: Arc<dyn RemoteVolume>,
        mount_path: impl AsRef<Path>,
        context: ExecutionContext,
    ) -> StorageResult<Self> {
        let mount_path = mount_path.as_ref();
        if !mount_path.is_absolute() {
            return Err(StorageError::configuration(format!(
                "mount path must be absolute, got {}",
                mount_path.display()
            )));
        }
        Ok(Self {
            context,
            volume: Some(VolumeBinding {
                name: client.name().to_string(),
                resolver: PathResolver::new(mount_path),
                client,
            }),
        })
    }

    /// Build a backend from configuration, connecting to the volume if one is
    /// named. Partial configuration is rejected.
    pub fn open(
        config: &StorageConfig,
        connector: &dyn VolumeConnector,
        context: ExecutionContext,
    ) -> StorageResult<Self> {
        match config.validate()? {
            Some((name, mount_path)) => {
                let client = connector.connect(name)?;
                debug!(volume = name, mount_path = %mount_path.display(), "connected to volume");
                Self::with_volume(client, mount_path, context)
            }
            None => Ok(Self::local(context)),
        }
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn volume_name(&self) -> Option<&str> {
        self.volume.as_ref().map(|v| v.name.as_str())
    }

    pub fn mount_path(&self) -> Option<&Path> {
        self.volume.as_ref().map(|v| v.resolver.mount_path())
    }

    /// Path translation for the configured volume, if any.
    pub fn resolver(&self) -> Option<&PathResolver> {
        self.volume.as_ref().map(|v| &v.resolver)
    }

    /// True when a remote volume is configured (whatever the context).
    pub fn is_remote_backed(&self) -> bool {
        self.volume.is_some()
    }

    /// True when calls go through the remote client API.
    pub fn uses_remote_client(&self) -> bool {
        self.remote().is_some()
    }

    /// Where `path` is stored: the volume name when the remote client serves
    /// it (`None` for the filesystem), and the path as that store sees it.
    pub(crate) fn location(&self, op: &'static str, path: &Path) -> StorageResult<(Option<&str>, PathBuf)> {
        match self.remote() {
            Some(volume) => Ok((
                Some(volume.name.as_str()),
                volume.resolver.strip_mount_once(path),
            )),
            None => {
                let absolute =
                    std::path::absolute(path).map_err(|e| StorageError::from_io(op, path, e))?;
                Ok((None, normalize_absolute(absolute)))
            }
        }
    }

    fn remote(&self) -> Option<&VolumeBinding> {
        if self.context.managed_worker {
            None
        } else {
            self.volume.as_ref()
        }
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Read the whole file.
    #[instrument(skip_all, level = "debug", fields(path = %path.as_ref().display()))]
    pub fn read_bytes(&self, path: impl AsRef<Path>) -> StorageResult<Vec<u8>> {
        let path = path.as_ref();
        match self.remote() {
            Some(volume) => {
                let rel = volume.resolver.volume_relative(path);
                let chunks = volume
                    .client
                    .read_chunks(&rel)
                    .map_err(|e| e.at("read_bytes", path))?;
                Ok(chunks.concat())
            }
            None => fs::read(path).map_err(|e| StorageError::from_io("read_bytes", path, e)),
        }
    }

    /// Read and decode a JSON file.
    pub fn read_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> StorageResult<T> {
        let path = path.as_ref();
        let data = self.read_bytes(path)?;
        serde_json::from_slice(&data).map_err(|e| StorageError::serialization("read_json", path, e))
    }

    /// True if a file or directory exists at `path`.
    pub fn exists(&self, path: impl AsRef<Path>) -> StorageResult<bool> {
        Ok(self.kind_of(path.as_ref())?.is_some())
    }

    /// True if a regular file exists at `path`.
    pub fn is_file(&self, path: impl AsRef<Path>) -> StorageResult<bool> {
        Ok(self.kind_of(path.as_ref())?.is_some_and(|k| k.is_file()))
    }

    /// True if a directory exists at `path`.
    pub fn is_dir(&self, path: impl AsRef<Path>) -> StorageResult<bool> {
        Ok(self.kind_of(path.as_ref())?.is_some_and(|k| k.is_dir()))
    }

    /// Names of the entries directly inside `path`.
    ///
    /// Local listings are sorted; remote listings keep the client's order.
    #[instrument(skip_all, level = "debug", fields(path = %path.as_ref().display()))]
    pub fn list_dir(&self, path: impl AsRef<Path>) -> StorageResult<Vec<String>> {
        let path = path.as_ref();
        Ok(self
            .entries("list_dir", path)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Absolute paths of the entries directly inside `path`.
    ///
    /// Remote entries are rebuilt as mount path + entry path.
    pub fn list_dir_paths(&self, path: impl AsRef<Path>) -> StorageResult<Vec<PathBuf>> {
        let path = path.as_ref();
        match self.remote() {
            Some(volume) => Ok(self
                .remote_children(volume, "list_dir", path)?
                .into_iter()
                .map(|entry| volume.resolver.mount_join(&entry.path))
                .collect()),
            None => Ok(self
                .local_children("list_dir", path)?
                .into_iter()
                .map(|(name, _)| path.join(name))
                .collect()),
        }
    }

    /// Recursive top-down walk starting at `path`.
    ///
    /// Each step yields a directory with the names of its immediate
    /// subdirectories and files, before any subdirectory is visited.
    pub fn walk(&self, path: impl AsRef<Path>) -> Walk<'_> {
        Walk {
            backend: self,
            stack: vec![path.as_ref().to_path_buf()],
        }
    }

    /// Modification time in seconds since the epoch.
    ///
    /// Local times have sub-second precision. Remote precision depends on the
    /// store and may be whole seconds.
    #[instrument(skip_all, level = "debug", fields(path = %path.as_ref().display()))]
    pub fn get_mtime(&self, path: impl AsRef<Path>) -> StorageResult<f64> {
        let path = path.as_ref();
        match self.remote() {
            Some(volume) => self
                .remote_entry(volume, path)?
                .map(|entry| entry.mtime)
                .ok_or_else(|| StorageError::not_found("get_mtime", path)),
            None => {
                let modified = fs::metadata(path)
                    .and_then(|m| m.modified())
                    .map_err(|e| StorageError::from_io("get_mtime", path, e))?;
                Ok(Watermark::from(modified).as_secs())
            }
        }
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Write `data` to `path`, creating parent directories.
    ///
    /// With `force == false` an existing destination is left untouched and
    /// `AlreadyExists` is returned.
    #[instrument(skip_all, level = "debug", fields(path = %path.as_ref().display(), len = data.len(), force = force))]
    pub fn write_bytes(&self, path: impl AsRef<Path>, data: &[u8], force: bool) -> StorageResult<()> {
        let path = path.as_ref();
        match self.remote() {
            Some(volume) => {
                let rel = volume.resolver.volume_relative(path);
                batch_upload(volume.client.as_ref(), force, |batch| {
                    batch.put_file(data, rel);
                    Ok(())
                })
                .map_err(|e| e.at("write_bytes", path))
            }
            None => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .map_err(|e| StorageError::from_io("write_bytes", parent, e))?;
                }
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(force)
                    .create_new(!force)
                    .truncate(force)
                    .open(path)
                    .map_err(|e| StorageError::from_io("write_bytes", path, e))?;
                file.write_all(data)
                    .map_err(|e| StorageError::from_io("write_bytes", path, e))
            }
        }
    }

    /// Encode `value` as JSON (4-space indent, field order preserved) and
    /// write it.
    pub fn write_json<T: Serialize + ?Sized>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
        force: bool,
    ) -> StorageResult<()> {
        let path = path.as_ref();
        let data = to_pretty_json(value)
            .map_err(|e| StorageError::serialization("write_json", path, e))?;
        self.write_bytes(path, &data, force)
    }

    /// Remove a file or a directory tree.
    ///
    /// With `missing_ok` a missing path is not an error.
    #[instrument(skip_all, level = "debug", fields(path = %path.as_ref().display(), missing_ok = missing_ok))]
    pub fn remove(&self, path: impl AsRef<Path>, missing_ok: bool) -> StorageResult<()> {
        let path = path.as_ref();
        let result = match self.remote() {
            Some(volume) => {
                let rel = volume.resolver.volume_relative(path);
                volume
                    .client
                    .remove(&rel, true)
                    .map_err(|e| e.at("remove", path))
            }
            None => remove_local(path).map_err(|e| StorageError::from_io("remove", path, e)),
        };
        match result {
            Err(e) if missing_ok && e.is_not_found() => {
                debug!("nothing to remove");
                Ok(())
            }
            other => other,
        }
    }

    /// Create `path` and any missing parents. Existing directories are fine.
    #[instrument(skip_all, level = "debug", fields(path = %path.as_ref().display()))]
    pub fn create_directory(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        let path = path.as_ref();
        match self.remote() {
            Some(volume) => {
                let rel = volume.resolver.volume_relative(path);
                scratch::ensure_remote_directory(volume.client.as_ref(), &rel)
                    .map_err(|e| e.at("create_directory", path))
            }
            None => fs::create_dir_all(path)
                .map_err(|e| StorageError::from_io("create_directory", path, e)),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn kind_of(&self, path: &Path) -> StorageResult<Option<EntryKind>> {
        match self.remote() {
            Some(volume) => Ok(self.remote_entry(volume, path)?.map(|e| e.kind)),
            None => match fs::metadata(path) {
                Ok(meta) if meta.is_dir() => Ok(Some(EntryKind::Directory)),
                Ok(_) => Ok(Some(EntryKind::File)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(StorageError::from_io("exists", path, e)),
            },
        }
    }

    /// Look an entry up by listing its parent and matching the basename; the
    /// client has no direct stat primitive.
    fn remote_entry(&self, volume: &VolumeBinding, path: &Path) -> StorageResult<Option<VolumeEntry>> {
        let rel = volume.resolver.volume_relative(path);
        if rel.is_empty() {
            return Ok(Some(VolumeEntry {
                path: rel,
                kind: EntryKind::Directory,
                mtime: 0.0,
                size: 0,
            }));
        }
        let (parent, name) = rel.rsplit_once('/').unwrap_or(("", rel.as_str()));
        match volume.client.iterate_directory(parent) {
            Ok(entries) => Ok(entries
                .into_iter()
                .find(|entry| entry.name() == name && entry.path.trim_end_matches('/') != parent)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.at("stat", path)),
        }
    }

    /// Entries of a remote directory; a file path is an error, not a listing
    /// of one.
    fn remote_children(
        &self,
        volume: &VolumeBinding,
        op: &'static str,
        path: &Path,
    ) -> StorageResult<Vec<VolumeEntry>> {
        let rel = volume.resolver.volume_relative(path);
        let entries = volume
            .client
            .iterate_directory(&rel)
            .map_err(|e| e.at(op, path))?;
        if let [only] = entries.as_slice() {
            if only.kind.is_file() && only.path.trim_end_matches('/') == rel {
                return Err(StorageError::remote(op, path, "not a directory"));
            }
        }
        Ok(entries)
    }

    fn local_children(&self, op: &'static str, path: &Path) -> StorageResult<Vec<(String, EntryKind)>> {
        let mut children = Vec::new();
        let read_dir = fs::read_dir(path).map_err(|e| StorageError::from_io(op, path, e))?;
        for entry in read_dir {
            let entry = entry.map_err(|e| StorageError::from_io(op, path, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| StorageError::from_io(op, entry.path(), e))?;
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            children.push((entry.file_name().to_string_lossy().into_owned(), kind));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(children)
    }

    fn entries(&self, op: &'static str, path: &Path) -> StorageResult<Vec<(String, EntryKind)>> {
        match self.remote() {
            Some(volume) => Ok(self
                .remote_children(volume, op, path)?
                .into_iter()
                .map(|entry| (entry.name().to_string(), entry.kind))
                .collect()),
            None => self.local_children(op, path),
        }
    }
}

fn remove_local(path: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(buf)
}

/// One step of [`StorageBackend::walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Directory being visited.
    pub dir: PathBuf,
    /// Names of its immediate subdirectories.
    pub subdirs: Vec<String>,
    /// Names of its immediate files.
    pub files: Vec<String>,
}

/// Lazy pre-order walk over a directory tree.
///
/// Directories are listed when reached, not up front. The first error ends
/// the walk.
pub struct Walk<'a> {
    backend: &'a StorageBackend,
    stack: Vec<PathBuf>,
}

impl Iterator for Walk<'_> {
    type Item = StorageResult<WalkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let dir = self.stack.pop()?;
        let children = match self.backend.entries("walk", &dir) {
            Ok(children) => children,
            Err(e) => {
                self.stack.clear();
                return Some(Err(e));
            }
        };

        let mut subdirs = Vec::new();
        let mut files = Vec::new();
        for (name, kind) in children {
            match kind {
                EntryKind::Directory => subdirs.push(name),
                EntryKind::File => files.push(name),
            }
        }
        self.stack
            .extend(subdirs.iter().rev().map(|name| dir.join(name)));

        Some(Ok(WalkEntry {
            dir,
            subdirs,
            files,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConnector, MemoryVolume};
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    const MOUNT: &str = "/vol_mnt";

    fn local() -> (StorageBackend, TempDir) {
        (StorageBackend::local(ExecutionContext::outside()), TempDir::new().unwrap())
    }

    fn remote() -> (StorageBackend, Arc<MemoryVolume>) {
        let volume = Arc::new(MemoryVolume::new("test-volume"));
        let backend =
            StorageBackend::with_volume(volume.clone(), MOUNT, ExecutionContext::outside()).unwrap();
        (backend, volume)
    }

    #[test]
    fn test_open_rejects_partial_config() {
        let connector = MemoryConnector::new();
        let config = StorageConfig {
            volume_name: Some("vol".into()),
            mount_path: None,
        };
        let err = StorageBackend::open(&config, &connector, ExecutionContext::outside()).unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));
    }

    #[test]
    fn test_open_modes() {
        let connector = MemoryConnector::new();
        let local = StorageBackend::open(&StorageConfig::local(), &connector, ExecutionContext::outside())
            .unwrap();
        assert!(!local.is_remote_backed());
        assert!(!local.uses_remote_client());

        let config = StorageConfig::volume("vol", MOUNT);
        let outside = StorageBackend::open(&config, &connector, ExecutionContext::outside()).unwrap();
        assert!(outside.uses_remote_client());
        assert_eq!(outside.volume_name(), Some("vol"));

        let inside =
            StorageBackend::open(&config, &connector, ExecutionContext::managed_worker()).unwrap();
        assert!(inside.is_remote_backed());
        assert!(!inside.uses_remote_client());
    }

    #[test]
    fn test_relative_mount_rejected() {
        let volume = Arc::new(MemoryVolume::new("v"));
        let err = StorageBackend::with_volume(volume, "vol_mnt", ExecutionContext::outside());
        assert!(matches!(err, Err(StorageError::Configuration(_))));
    }

    #[test]
    fn test_local_json_round_trip() {
        let (backend, temp) = local();
        let path = temp.path().join("sub/x.json");
        let value = json!({"b": 2, "a": 1, "nested": {"z": null}});
        backend.write_json(&path, &value, true).unwrap();

        let read: serde_json::Value = backend.read_json(&path).unwrap();
        assert_eq!(read, value);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\n    \"b\": 2,\n    \"a\": 1,"));
    }

    #[test]
    fn test_remote_json_round_trip() {
        let (backend, volume) = remote();
        let value = json!({"name": "Heather", "age": null});
        backend.write_json("/vol_mnt/myfile.json", &value, true).unwrap();

        let read: serde_json::Value = backend.read_json("/vol_mnt/myfile.json").unwrap();
        assert_eq!(read, value);
        assert!(volume.read_chunks("myfile.json").is_ok());
    }

    #[test]
    fn test_read_missing() {
        let (backend, temp) = local();
        let err = backend.read_bytes(temp.path().join("nope")).unwrap_err();
        assert!(err.is_not_found());

        let (backend, _) = remote();
        let err = backend.read_bytes("/vol_mnt/nope").unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("/vol_mnt/nope"));
    }

    #[test]
    fn test_write_without_force() {
        let (backend, temp) = local();
        let path = temp.path().join("a.txt");
        backend.write_bytes(&path, b"one", false).unwrap();
        let err = backend.write_bytes(&path, b"two", false).unwrap_err();
        assert!(err.is_already_exists());
        backend.write_bytes(&path, b"three", true).unwrap();
        assert_eq!(backend.read_bytes(&path).unwrap(), b"three");

        let (backend, _) = remote();
        backend.write_bytes("/vol_mnt/a.txt", b"one", false).unwrap();
        let err = backend.write_bytes("/vol_mnt/a.txt", b"two", false).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_overwrite_truncates() {
        let (backend, temp) = local();
        let path = temp.path().join("a.txt");
        backend.write_bytes(&path, b"a longer payload", true).unwrap();
        backend.write_bytes(&path, b"short", true).unwrap();
        assert_eq!(backend.read_bytes(&path).unwrap(), b"short");
    }

    #[test]
    fn test_exists_and_remove() {
        let (backend, temp) = local();
        let path = temp.path().join("dir/a.txt");
        backend.write_bytes(&path, b"", true).unwrap();
        assert!(backend.exists(&path).unwrap());
        assert!(backend.is_file(&path).unwrap());
        assert!(backend.is_dir(temp.path().join("dir")).unwrap());

        backend.remove(temp.path().join("dir"), false).unwrap();
        assert!(!backend.exists(&path).unwrap());
        assert!(backend.remove(&path, false).unwrap_err().is_not_found());
        backend.remove(&path, true).unwrap();
    }

    #[test]
    fn test_remote_exists_and_remove() {
        let (backend, _) = remote();
        backend.write_bytes("/vol_mnt/dir/a.txt", b"a", true).unwrap();
        assert!(backend.exists("/vol_mnt/dir/a.txt").unwrap());
        assert!(backend.is_dir("/vol_mnt/dir").unwrap());
        assert!(backend.exists("/vol_mnt").unwrap());
        assert!(!backend.exists("/vol_mnt/dir/b.txt").unwrap());
        assert!(!backend.exists("/vol_mnt/missing/b.txt").unwrap());

        backend.remove("/vol_mnt/dir", false).unwrap();
        assert!(!backend.exists("/vol_mnt/dir").unwrap());
        assert!(backend.remove("/vol_mnt/dir", false).unwrap_err().is_not_found());
        backend.remove("/vol_mnt/dir", true).unwrap();
    }

    #[test]
    fn test_create_directory_twice() {
        let (backend, temp) = local();
        let path = temp.path().join("my/set/of/dirs");
        backend.create_directory(&path).unwrap();
        assert!(backend.exists(&path).unwrap());
        backend.create_directory(&path).unwrap();
        assert!(backend.exists(&path).unwrap());

        let (backend, volume) = remote();
        backend.create_directory("/vol_mnt/my/set/of/dirs").unwrap();
        assert!(backend.is_dir("/vol_mnt/my/set/of/dirs").unwrap());
        backend.create_directory("/vol_mnt/my/set/of/dirs").unwrap();
        assert!(backend.is_dir("/vol_mnt/my/set/of/dirs").unwrap());
        assert!(volume.iterate_directory("my/set/of/dirs").unwrap().is_empty());
    }

    #[test]
    fn test_list_dir() {
        let (backend, temp) = local();
        backend.write_bytes(temp.path().join("b.txt"), b"b", true).unwrap();
        backend.write_bytes(temp.path().join("a.txt"), b"a", true).unwrap();
        backend.create_directory(temp.path().join("c")).unwrap();

        assert_eq!(backend.list_dir(temp.path()).unwrap(), vec!["a.txt", "b.txt", "c"]);
        assert_eq!(
            backend.list_dir_paths(temp.path()).unwrap(),
            vec![
                temp.path().join("a.txt"),
                temp.path().join("b.txt"),
                temp.path().join("c")
            ]
        );

        let (backend, _) = remote();
        backend.write_bytes("/vol_mnt/x/a.json", b"{}", true).unwrap();
        backend.write_bytes("/vol_mnt/x/b.json", b"{}", true).unwrap();
        assert_eq!(backend.list_dir("/vol_mnt/x").unwrap(), vec!["a.json", "b.json"]);
        assert_eq!(
            backend.list_dir_paths("/vol_mnt/x").unwrap(),
            vec![PathBuf::from("/vol_mnt/x/a.json"), PathBuf::from("/vol_mnt/x/b.json")]
        );
        assert!(backend.list_dir("/vol_mnt/x/a.json").is_err());
    }

    #[test]
    fn test_walk_is_pre_order() {
        let (backend, temp) = local();
        let root = temp.path();
        backend.write_bytes(root.join("top.txt"), b"", true).unwrap();
        backend.write_bytes(root.join("a/one.txt"), b"", true).unwrap();
        backend.write_bytes(root.join("a/deep/two.txt"), b"", true).unwrap();
        backend.create_directory(root.join("b")).unwrap();

        let steps: Vec<WalkEntry> = backend.walk(root).collect::<StorageResult<_>>().unwrap();
        let dirs: Vec<_> = steps.iter().map(|s| s.dir.clone()).collect();
        assert_eq!(
            dirs,
            vec![
                root.to_path_buf(),
                root.join("a"),
                root.join("a/deep"),
                root.join("b")
            ]
        );
        assert_eq!(steps[0].subdirs, vec!["a", "b"]);
        assert_eq!(steps[0].files, vec!["top.txt"]);
        assert_eq!(steps[2].files, vec!["two.txt"]);
    }

    #[test]
    fn test_remote_walk_matches_local_shape() {
        let (backend, _) = remote();
        backend.write_bytes("/vol_mnt/root/top.txt", b"", true).unwrap();
        backend.write_bytes("/vol_mnt/root/a/one.txt", b"", true).unwrap();
        backend.create_directory("/vol_mnt/root/b").unwrap();

        let steps: Vec<WalkEntry> = backend
            .walk("/vol_mnt/root")
            .collect::<StorageResult<_>>()
            .unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].dir, PathBuf::from("/vol_mnt/root"));
        assert_eq!(steps[0].subdirs, vec!["a", "b"]);
        assert_eq!(steps[1].dir, PathBuf::from("/vol_mnt/root/a"));
        assert_eq!(steps[1].files, vec!["one.txt"]);
        assert!(steps[2].files.is_empty());
    }

    #[test]
    fn test_walk_missing_root() {
        let (backend, temp) = local();
        let mut walk = backend.walk(temp.path().join("nope"));
        assert!(walk.next().unwrap().unwrap_err().is_not_found());
        assert!(walk.next().is_none());
    }

    #[test]
    fn test_get_mtime() {
        let (backend, temp) = local();
        let path = temp.path().join("a.txt");
        backend.write_bytes(&path, b"a", true).unwrap();
        let mtime = backend.get_mtime(&path).unwrap();
        assert!(mtime > 0.0);

        let (backend, volume) = remote();
        backend.write_bytes("/vol_mnt/a.txt", b"a", true).unwrap();
        volume.set_mtime("a.txt", 1234.0).unwrap();
        assert_eq!(backend.get_mtime("/vol_mnt/a.txt").unwrap(), 1234.0);
        assert!(backend.get_mtime("/vol_mnt/b.txt").unwrap_err().is_not_found());
    }

    #[test]
    fn test_get_mtime_before_epoch() {
        let (backend, temp) = local();
        let path = temp.path().join("old.txt");
        backend.write_bytes(&path, b"old", true).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(std::time::UNIX_EPOCH - std::time::Duration::from_secs(10))
            .unwrap();

        assert_eq!(backend.get_mtime(&path).unwrap(), -10.0);
    }

    #[test]
    fn test_nested_mount_name_stays_distinct() {
        let volume = Arc::new(MemoryVolume::new("data-volume"));
        let backend =
            StorageBackend::with_volume(volume.clone(), "/data", ExecutionContext::outside()).unwrap();

        backend.write_bytes("/data/a.json", b"top", true).unwrap();
        backend.write_bytes("/data/data/a.json", b"nested", true).unwrap();

        assert_eq!(backend.read_bytes("/data/a.json").unwrap(), b"top");
        assert_eq!(backend.read_bytes("/data/data/a.json").unwrap(), b"nested");
        assert_eq!(backend.list_dir("/data").unwrap(), vec!["a.json", "data"]);
        assert_eq!(
            backend.list_dir_paths("/data/data").unwrap(),
            vec![PathBuf::from("/data/data/a.json")]
        );
    }

    #[test]
    fn test_managed_worker_uses_mounted_filesystem() {
        let temp = TempDir::new().unwrap();
        let volume = Arc::new(MemoryVolume::new("mounted"));
        let backend =
            StorageBackend::with_volume(volume.clone(), temp.path(), ExecutionContext::managed_worker())
                .unwrap();

        let path = temp.path().join("inside.json");
        backend.write_json(&path, &json!({"k": "v"}), true).unwrap();

        assert!(path.exists());
        assert!(volume.iterate_directory("").unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_bytes_round_trip(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let (backend, temp) = local();
            let path = temp.path().join("blob.bin");
            backend.write_bytes(&path, &data, true).unwrap();
            prop_assert_eq!(backend.read_bytes(&path).unwrap(), data.clone());

            let (backend, _) = remote();
            backend.write_bytes("/vol_mnt/blob.bin", &data, true).unwrap();
            prop_assert_eq!(backend.read_bytes("/vol_mnt/blob.bin").unwrap(), data);
        }

        #[test]
        fn prop_json_round_trip(value in json_value()) {
            let (backend, temp) = local();
            let path = temp.path().join("value.json");
            backend.write_json(&path, &value, true).unwrap();
            let read: serde_json::Value = backend.read_json(&path).unwrap();
            prop_assert_eq!(&read, &value);

            let (backend, _) = remote();
            backend.write_json("/vol_mnt/value.json", &value, true).unwrap();
            let read: serde_json::Value = backend.read_json("/vol_mnt/value.json").unwrap();
            prop_assert_eq!(read, value);
        }
    }

    /// Arbitrary JSON trees. Numbers are integers so equality after a text
    /// round trip is exact.
    fn json_value() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            any::<u64>().prop_map(serde_json::Value::from),
            ".{0,12}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(serde_json::Value::Array),
                prop::collection::vec(("[a-z]{0,6}", inner), 0..6).prop_map(|fields| {
                    serde_json::Value::Object(fields.into_iter().collect())
                }),
            ]
        })
    }
}
