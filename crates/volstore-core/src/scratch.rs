//! Remote directory creation.
//!
//! The remote client has no "mkdir": the only way to make a directory appear
//! is to upload a local directory tree. We upload a scratch tree holding a
//! single marker file, then delete the marker remotely, leaving an empty
//! directory behind.

use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::remote::{batch_upload, RemoteVolume};

/// Name of the throwaway marker uploaded to materialize a directory.
pub(crate) const DIR_MARKER: &str = ".volstore-dir-marker";

const MARKER_TEXT: &str =
    "Temporary file uploaded to create a directory; it can be safely removed.\n";

/// Make sure the volume directory `dest` (volume-relative) exists.
///
/// The local scratch tree lives in a `TempDir` and is removed when this
/// returns, on success and on every error path.
pub(crate) fn ensure_remote_directory(volume: &dyn RemoteVolume, dest: &str) -> StorageResult<()> {
    let scratch = tempfile::Builder::new()
        .prefix("volstore-mkdir-")
        .tempdir()
        .map_err(|e| StorageError::from_io("create_directory", std::env::temp_dir(), e))?;

    let marker = scratch.path().join(DIR_MARKER);
    std::fs::write(&marker, MARKER_TEXT)
        .map_err(|e| StorageError::from_io("create_directory", &marker, e))?;

    debug!(volume = volume.name(), dest, "uploading scratch tree");
    batch_upload(volume, true, |batch| {
        batch.put_directory(scratch.path(), dest)?;
        Ok(())
    })?;

    let marker_dest = if dest.is_empty() {
        DIR_MARKER.to_string()
    } else {
        format!("{}/{}", dest, DIR_MARKER)
    };
    volume.remove(&marker_dest, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryVolume;

    #[test]
    fn test_creates_empty_directory() {
        let volume = MemoryVolume::new("test");
        ensure_remote_directory(&volume, "a/b/c").unwrap();

        let entries = volume.iterate_directory("a/b").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "a/b/c");
        assert!(entries[0].kind.is_dir());
        assert!(volume.iterate_directory("a/b/c").unwrap().is_empty());
    }

    #[test]
    fn test_idempotent() {
        let volume = MemoryVolume::new("test");
        ensure_remote_directory(&volume, "dir").unwrap();
        ensure_remote_directory(&volume, "dir").unwrap();
        assert_eq!(volume.iterate_directory("").unwrap().len(), 1);
    }

    #[test]
    fn test_keeps_existing_children() {
        let volume = MemoryVolume::new("test");
        batch_upload(&volume, true, |batch| {
            batch.put_file(b"x".to_vec(), "dir/x.txt");
            Ok(())
        })
        .unwrap();
        ensure_remote_directory(&volume, "dir").unwrap();

        let names: Vec<_> = volume
            .iterate_directory("dir")
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(names, vec!["dir/x.txt".to_string()]);
    }
}
