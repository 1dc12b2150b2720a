//! Capability surface of a remote content volume.
//!
//! The core never speaks a wire protocol. It needs exactly four primitives
//! from a remote store (chunked read, batch upload, recursive remove and
//! directory iteration) plus a way to obtain a client by volume name.
//! All paths handed to a `RemoteVolume` are relative to the volume root, with
//! no leading `/`; the empty string is the root itself.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Kind of a volume entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn is_file(&self) -> bool {
        matches!(self, EntryKind::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }
}

/// One entry returned by [`RemoteVolume::iterate_directory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeEntry {
    /// Path relative to the volume root (e.g. `sub/a.json`).
    pub path: String,
    pub kind: EntryKind,
    /// Modification time, seconds since epoch. Stores may only keep whole
    /// seconds, and directory times may not move when children change.
    pub mtime: f64,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

impl VolumeEntry {
    /// Final component of the entry path.
    pub fn name(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

/// One queued upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOp {
    /// Write `data` to the volume path `dest`, creating parents.
    File { data: Vec<u8>, dest: String },
    /// Ensure the volume directory `dest` exists.
    Directory { dest: String },
}

/// A set of uploads submitted to the volume as a unit.
///
/// Submission is not atomic across operations: a failure part-way leaves
/// whatever was already applied in place.
#[derive(Debug, Clone)]
pub struct UploadBatch {
    force: bool,
    ops: Vec<UploadOp>,
}

impl UploadBatch {
    /// Create an empty batch. With `force == false` the volume must refuse to
    /// overwrite existing files.
    pub fn new(force: bool) -> Self {
        Self {
            force,
            ops: Vec::new(),
        }
    }

    pub fn force(&self) -> bool {
        self.force
    }

    pub fn ops(&self) -> &[UploadOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<UploadOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Queue a file upload from in-memory bytes.
    pub fn put_file(&mut self, data: impl Into<Vec<u8>>, dest: impl Into<String>) -> &mut Self {
        self.ops.push(UploadOp::File {
            data: data.into(),
            dest: trim_dest(dest.into()),
        });
        self
    }

    /// Queue a local directory tree for upload under `dest`.
    ///
    /// The tree is read when queued, so the local directory may be removed as
    /// soon as this returns. Every directory (including the top one) is
    /// queued as well, so empty directories survive the upload.
    pub fn put_directory(&mut self, local_dir: &Path, dest: impl Into<String>) -> StorageResult<&mut Self> {
        let dest = trim_dest(dest.into());
        self.ops.push(UploadOp::Directory { dest: dest.clone() });

        let mut entries: Vec<_> = std::fs::read_dir(local_dir)
            .map_err(|e| StorageError::from_io("put_directory", local_dir, e))?
            .collect::<Result<_, _>>()
            .map_err(|e| StorageError::from_io("put_directory", local_dir, e))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let local_path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = if dest.is_empty() {
                name
            } else {
                format!("{}/{}", dest, name)
            };
            let file_type = entry
                .file_type()
                .map_err(|e| StorageError::from_io("put_directory", &local_path, e))?;
            if file_type.is_dir() {
                self.put_directory(&local_path, child)?;
            } else {
                let data = std::fs::read(&local_path)
                    .map_err(|e| StorageError::from_io("put_directory", &local_path, e))?;
                self.put_file(data, child);
            }
        }
        Ok(self)
    }
}

fn trim_dest(dest: String) -> String {
    dest.trim_matches('/').to_string()
}

/// Remote content volume client.
pub trait RemoteVolume: Send + Sync {
    /// Volume name (for logs and error messages).
    fn name(&self) -> &str;

    /// Read a file as a sequence of chunks; the caller concatenates them.
    fn read_chunks(&self, path: &str) -> StorageResult<Vec<Vec<u8>>>;

    /// Apply a batch of uploads.
    fn apply_batch(&self, batch: UploadBatch) -> StorageResult<()>;

    /// Remove a file or directory. Removing a non-empty directory requires
    /// `recursive`. Fails with `NotFound` when nothing is at `path`.
    fn remove(&self, path: &str, recursive: bool) -> StorageResult<()>;

    /// Entries directly inside the directory at `path`.
    fn iterate_directory(&self, path: &str) -> StorageResult<Vec<VolumeEntry>>;
}

/// Obtains a volume client by name, creating the volume if it is missing.
pub trait VolumeConnector {
    fn connect(&self, volume_name: &str) -> StorageResult<Arc<dyn RemoteVolume>>;
}

/// Build a batch inside `fill` and submit it to `volume` once `fill` returns.
///
/// Nothing is submitted if `fill` fails.
pub fn batch_upload<F>(volume: &dyn RemoteVolume, force: bool, fill: F) -> StorageResult<()>
where
    F: FnOnce(&mut UploadBatch) -> StorageResult<()>,
{
    let mut batch = UploadBatch::new(force);
    fill(&mut batch)?;
    if batch.is_empty() {
        return Ok(());
    }
    volume.apply_batch(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_entry_name() {
        let entry = VolumeEntry {
            path: "sub/deep/a.json".into(),
            kind: EntryKind::File,
            mtime: 0.0,
            size: 1,
        };
        assert_eq!(entry.name(), "a.json");

        let dir = VolumeEntry {
            path: "sub/".into(),
            kind: EntryKind::Directory,
            mtime: 0.0,
            size: 0,
        };
        assert_eq!(dir.name(), "sub");
    }

    #[test]
    fn test_put_directory_reads_tree() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("nested/empty")).unwrap();
        std::fs::write(temp.path().join("top.txt"), b"top").unwrap();
        std::fs::write(temp.path().join("nested/inner.txt"), b"inner").unwrap();

        let mut batch = UploadBatch::new(true);
        batch.put_directory(temp.path(), "/dest/").unwrap();

        assert_eq!(
            batch.ops(),
            &[
                UploadOp::Directory { dest: "dest".into() },
                UploadOp::Directory {
                    dest: "dest/nested".into()
                },
                UploadOp::Directory {
                    dest: "dest/nested/empty".into()
                },
                UploadOp::File {
                    data: b"inner".to_vec(),
                    dest: "dest/nested/inner.txt".into()
                },
                UploadOp::File {
                    data: b"top".to_vec(),
                    dest: "dest/top.txt".into()
                },
            ]
        );
    }

    #[test]
    fn test_put_directory_missing_source() {
        let temp = TempDir::new().unwrap();
        let mut batch = UploadBatch::new(true);
        let err = batch
            .put_directory(&temp.path().join("nope"), "dest")
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
