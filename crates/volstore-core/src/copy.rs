//! One-directional copies between two backends.
//!
//! Source and destination may be different kinds of backend, so a copy can
//! move data from a remote volume to the local disk, the other way round, or
//! between two volumes.

use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::path::{file_name, has_trailing_separator};

/// Where a copied file should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// The path is the destination file name.
    File(PathBuf),
    /// The path is a directory; the copy keeps the source's file name.
    Directory(PathBuf),
}

impl Destination {
    /// Decide once whether `path` names a directory on `backend`: it does if
    /// it ends with a separator or already exists as a directory.
    pub fn infer(backend: &StorageBackend, path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if has_trailing_separator(path) || backend.is_dir(path)? {
            Ok(Self::Directory(path.to_path_buf()))
        } else {
            Ok(Self::File(path.to_path_buf()))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::File(path) | Self::Directory(path) => path,
        }
    }

    /// The file path a copy of `source_path` ends up at.
    pub fn target_for(&self, source_path: &Path) -> StorageResult<PathBuf> {
        match self {
            Self::File(path) => Ok(path.clone()),
            Self::Directory(dir) => file_name(source_path)
                .map(|name| dir.join(name))
                .ok_or_else(|| StorageError::not_found("copy_file", source_path)),
        }
    }
}

/// Totals for a copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub directories: usize,
    pub bytes: usize,
}

/// Copy one file. Returns the path written on the destination.
#[instrument(skip_all, fields(source = %source_path.as_ref().display(), destination = %destination_path.path().display()))]
pub fn copy_file(
    source: &StorageBackend,
    source_path: impl AsRef<Path>,
    destination: &StorageBackend,
    destination_path: &Destination,
) -> StorageResult<PathBuf> {
    copy_one(source, source_path.as_ref(), destination, destination_path).map(|(target, _)| target)
}

fn copy_one(
    source: &StorageBackend,
    source_path: &Path,
    destination: &StorageBackend,
    destination_path: &Destination,
) -> StorageResult<(PathBuf, usize)> {
    if !source.is_file(source_path)? {
        return Err(StorageError::not_found("copy_file", source_path));
    }
    let target = destination_path.target_for(source_path)?;
    let data = source.read_bytes(source_path)?;
    destination.write_bytes(&target, &data, true)?;
    debug!(target = %target.display(), bytes = data.len(), "copied file");
    Ok((target, data.len()))
}

/// Mirror the tree under `source_root` into `destination_root`.
///
/// Directories are created before their files and empty directories are
/// kept. The first failure stops the copy; nothing is rolled back. A
/// destination inside the source on the same store is rejected before
/// anything is written.
#[instrument(skip_all, fields(source = %source_root.as_ref().display(), destination = %destination_root.as_ref().display()))]
pub fn copy_dir(
    source: &StorageBackend,
    source_root: impl AsRef<Path>,
    destination: &StorageBackend,
    destination_root: impl AsRef<Path>,
) -> StorageResult<CopyStats> {
    let source_root = source_root.as_ref();
    let destination_root = destination_root.as_ref();
    if !source.is_dir(source_root)? {
        return Err(StorageError::not_found("copy_dir", source_root));
    }
    let (source_store, source_at) = source.location("copy_dir", source_root)?;
    let (destination_store, destination_at) = destination.location("copy_dir", destination_root)?;
    if source_store == destination_store && destination_at.starts_with(&source_at) {
        return Err(StorageError::configuration(format!(
            "copy_dir: destination {} is inside source {}",
            destination_root.display(),
            source_root.display()
        )));
    }

    let mut stats = CopyStats::default();
    destination.create_directory(destination_root)?;

    for step in source.walk(source_root) {
        let step = step?;
        let relative = step.dir.strip_prefix(source_root).map_err(|_| {
            StorageError::configuration(format!(
                "copy_dir: walked outside {}: {}",
                source_root.display(),
                step.dir.display()
            ))
        })?;
        let target_dir = destination_root.join(relative);

        for dir in &step.subdirs {
            destination.create_directory(target_dir.join(dir))?;
            stats.directories += 1;
        }
        for file in &step.files {
            let data = source.read_bytes(step.dir.join(file))?;
            destination.write_bytes(target_dir.join(file), &data, true)?;
            stats.files += 1;
            stats.bytes += data.len();
        }
    }

    info!(
        files = stats.files,
        directories = stats.directories,
        bytes = stats.bytes,
        "copied directory"
    );
    Ok(stats)
}

/// Copy whatever is at `source_path`: a single file through [`copy_file`]
/// (with the destination intent inferred) or a tree through [`copy_dir`].
pub fn copy_path(
    source: &StorageBackend,
    source_path: impl AsRef<Path>,
    destination: &StorageBackend,
    destination_path: impl AsRef<Path>,
) -> StorageResult<CopyStats> {
    let source_path = source_path.as_ref();
    let destination_path = destination_path.as_ref();

    if source.is_dir(source_path)? {
        return copy_dir(source, source_path, destination, destination_path);
    }
    if !source.is_file(source_path)? {
        return Err(StorageError::not_found("copy", source_path));
    }

    let target = Destination::infer(destination, destination_path)?;
    let (_, bytes) = copy_one(source, source_path, destination, &target)?;
    Ok(CopyStats {
        files: 1,
        directories: 0,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionContext;
    use crate::memory::MemoryVolume;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn local() -> StorageBackend {
        StorageBackend::local(ExecutionContext::outside())
    }

    #[test]
    fn test_destination_infer() {
        let temp = TempDir::new().unwrap();
        let backend = local();

        let dir = Destination::infer(&backend, temp.path()).unwrap();
        assert_eq!(dir, Destination::Directory(temp.path().to_path_buf()));

        let slash = format!("{}/new/", temp.path().display());
        assert!(matches!(
            Destination::infer(&backend, &slash).unwrap(),
            Destination::Directory(_)
        ));

        let file = Destination::infer(&backend, temp.path().join("x.json")).unwrap();
        assert!(matches!(file, Destination::File(_)));
    }

    #[test]
    fn test_target_for() {
        let dest = Destination::Directory(PathBuf::from("/root2"));
        assert_eq!(
            dest.target_for(Path::new("/root/a.json")).unwrap(),
            PathBuf::from("/root2/a.json")
        );
        let dest = Destination::File(PathBuf::from("/root2/b.json"));
        assert_eq!(
            dest.target_for(Path::new("/root/a.json")).unwrap(),
            PathBuf::from("/root2/b.json")
        );
    }

    #[test]
    fn test_copy_file_missing_source() {
        let temp = TempDir::new().unwrap();
        let backend = local();
        let err = copy_file(
            &backend,
            temp.path().join("nope"),
            &backend,
            &Destination::File(temp.path().join("out")),
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_copy_dir_to_remote() {
        let temp = TempDir::new().unwrap();
        let source = local();
        source.write_bytes(temp.path().join("a.txt"), b"a", true).unwrap();
        source.write_bytes(temp.path().join("sub/b.txt"), b"bb", true).unwrap();
        source.create_directory(temp.path().join("empty")).unwrap();

        let volume = Arc::new(MemoryVolume::new("v"));
        let remote =
            StorageBackend::with_volume(volume, "/vol_mnt", ExecutionContext::outside()).unwrap();

        let stats = copy_dir(&source, temp.path(), &remote, "/vol_mnt/copy").unwrap();
        assert_eq!(
            stats,
            CopyStats {
                files: 2,
                directories: 2,
                bytes: 3
            }
        );
        assert_eq!(remote.read_bytes("/vol_mnt/copy/sub/b.txt").unwrap(), b"bb");
        assert!(remote.is_dir("/vol_mnt/copy/empty").unwrap());
    }

    #[test]
    fn test_copy_dir_missing_source() {
        let temp = TempDir::new().unwrap();
        let backend = local();
        let err = copy_dir(&backend, temp.path().join("nope"), &backend, temp.path().join("out"))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!temp.path().join("out").exists());
    }

    #[test]
    fn test_copy_dir_into_itself_rejected() {
        let temp = TempDir::new().unwrap();
        let backend = local();
        let src = temp.path().join("src");
        backend.write_bytes(src.join("a.txt"), b"a", true).unwrap();

        let err = copy_dir(&backend, &src, &backend, src.join("backup")).unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));
        assert!(!src.join("backup").exists());

        let err = copy_dir(&backend, &src, &local(), &src).unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));

        let stats = copy_dir(&backend, &src, &backend, temp.path().join("src-backup")).unwrap();
        assert_eq!(stats.files, 1);
    }

    #[test]
    fn test_copy_dir_into_itself_on_volume_rejected() {
        let volume = Arc::new(MemoryVolume::new("v"));
        let remote =
            StorageBackend::with_volume(volume, "/vol_mnt", ExecutionContext::outside()).unwrap();
        remote.write_bytes("/vol_mnt/src/a.txt", b"a", true).unwrap();

        let err = copy_dir(&remote, "/vol_mnt/src", &remote, "/vol_mnt/src/backup").unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));
        assert!(!remote.exists("/vol_mnt/src/backup").unwrap());

        // The local disk is a different store.
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("src/backup");
        copy_dir(&remote, "/vol_mnt/src", &local(), &target).unwrap();
        assert_eq!(std::fs::read(target.join("a.txt")).unwrap(), b"a");
    }

    #[test]
    fn test_copy_path_dispatch() {
        let temp = TempDir::new().unwrap();
        let backend = local();
        backend.write_bytes(temp.path().join("src/a.txt"), b"abc", true).unwrap();
        backend.create_directory(temp.path().join("dst")).unwrap();

        let stats = copy_path(&backend, temp.path().join("src/a.txt"), &backend, temp.path().join("dst"))
            .unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.bytes, 3);
        assert_eq!(backend.read_bytes(temp.path().join("dst/a.txt")).unwrap(), b"abc");

        let stats = copy_path(&backend, temp.path().join("src"), &backend, temp.path().join("tree"))
            .unwrap();
        assert_eq!(stats.files, 1);
        assert!(backend.is_file(temp.path().join("tree/a.txt")).unwrap());

        assert!(copy_path(&backend, temp.path().join("nope"), &backend, temp.path().join("x"))
            .unwrap_err()
            .is_not_found());
    }
}
