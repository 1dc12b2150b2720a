//! In-memory remote volume.
//!
//! Behaves like a network content volume as far as the core can observe:
//! whole-second modification times, directory times that do not move when
//! children are added, and iteration of a file path yielding the file itself.
//! Used by tests and for dry runs. All data is lost when dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::path::normalize_absolute;
use crate::remote::{EntryKind, RemoteVolume, UploadBatch, UploadOp, VolumeConnector, VolumeEntry};

/// Size of the chunks returned by `read_chunks`.
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct Node {
    kind: EntryKind,
    data: Vec<u8>,
    mtime: f64,
}

impl Node {
    fn directory(mtime: f64) -> Self {
        Self {
            kind: EntryKind::Directory,
            data: Vec::new(),
            mtime,
        }
    }
}

/// In-memory volume keyed by volume-relative path (`""` is the root).
#[derive(Debug)]
pub struct MemoryVolume {
    name: String,
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl MemoryVolume {
    /// Create an empty volume.
    pub fn new(name: impl Into<String>) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::new(), Node::directory(now_secs()));
        Self {
            name: name.into(),
            nodes: RwLock::new(nodes),
        }
    }

    /// Normalize a volume path: drop the leading `/`, resolve `.` and `..`.
    fn key(path: &str) -> String {
        normalize_absolute(path)
            .to_string_lossy()
            .trim_start_matches('/')
            .to_string()
    }

    fn parent_key(key: &str) -> Option<&str> {
        if key.is_empty() {
            return None;
        }
        Some(key.rsplit_once('/').map(|(parent, _)| parent).unwrap_or(""))
    }

    /// Override the modification time of an entry.
    pub fn set_mtime(&self, path: &str, mtime: f64) -> StorageResult<()> {
        let key = Self::key(path);
        let mut nodes = self.write("set_mtime", &key)?;
        let node = nodes
            .get_mut(&key)
            .ok_or_else(|| StorageError::not_found("set_mtime", &key))?;
        node.mtime = mtime;
        Ok(())
    }

    /// Number of entries, the root included.
    pub fn len(&self) -> usize {
        self.nodes.read().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    fn read(
        &self,
        op: &'static str,
        key: &str,
    ) -> StorageResult<std::sync::RwLockReadGuard<'_, BTreeMap<String, Node>>> {
        self.nodes
            .read()
            .map_err(|_| StorageError::remote(op, key, "lock poisoned"))
    }

    fn write(
        &self,
        op: &'static str,
        key: &str,
    ) -> StorageResult<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Node>>> {
        self.nodes
            .write()
            .map_err(|_| StorageError::remote(op, key, "lock poisoned"))
    }

    /// Create missing ancestors of `key`. Existing directories keep their mtime.
    fn ensure_parents(nodes: &mut BTreeMap<String, Node>, key: &str, mtime: f64) -> StorageResult<()> {
        let mut current = key;
        let mut missing = Vec::new();
        while let Some(parent) = Self::parent_key(current) {
            match nodes.get(parent) {
                Some(node) if node.kind.is_dir() => break,
                Some(_) => {
                    return Err(StorageError::remote(
                        "apply_batch",
                        parent,
                        "parent is a file",
                    ))
                }
                None => missing.push(parent.to_string()),
            }
            current = parent;
        }
        for dir in missing {
            nodes.insert(dir, Node::directory(mtime));
        }
        Ok(())
    }

    fn entry(key: &str, node: &Node) -> VolumeEntry {
        VolumeEntry {
            path: key.to_string(),
            kind: node.kind,
            mtime: node.mtime,
            size: node.data.len() as u64,
        }
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as f64)
        .unwrap_or(0.0)
}

impl RemoteVolume for MemoryVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_chunks(&self, path: &str) -> StorageResult<Vec<Vec<u8>>> {
        let key = Self::key(path);
        let nodes = self.read("read_chunks", &key)?;
        match nodes.get(&key) {
            Some(node) if node.kind.is_file() => {
                Ok(node.data.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect())
            }
            Some(_) => Err(StorageError::remote("read_chunks", &key, "is a directory")),
            None => Err(StorageError::not_found("read_chunks", &key)),
        }
    }

    fn apply_batch(&self, batch: UploadBatch) -> StorageResult<()> {
        let force = batch.force();
        let mtime = now_secs();
        let mut nodes = self.write("apply_batch", "")?;

        for op in batch.into_ops() {
            match op {
                UploadOp::File { data, dest } => {
                    let key = Self::key(&dest);
                    match nodes.get(&key) {
                        Some(node) if node.kind.is_dir() => {
                            return Err(StorageError::remote("apply_batch", &key, "is a directory"));
                        }
                        Some(_) if !force => {
                            return Err(StorageError::already_exists("apply_batch", &key));
                        }
                        _ => {}
                    }
                    Self::ensure_parents(&mut nodes, &key, mtime)?;
                    debug!(volume = %self.name, key = %key, len = data.len(), "put file");
                    nodes.insert(
                        key,
                        Node {
                            kind: EntryKind::File,
                            data,
                            mtime,
                        },
                    );
                }
                UploadOp::Directory { dest } => {
                    let key = Self::key(&dest);
                    match nodes.get(&key) {
                        Some(node) if node.kind.is_file() => {
                            return Err(StorageError::remote("apply_batch", &key, "is a file"));
                        }
                        Some(_) => {}
                        None => {
                            Self::ensure_parents(&mut nodes, &key, mtime)?;
                            nodes.insert(key, Node::directory(mtime));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn remove(&self, path: &str, recursive: bool) -> StorageResult<()> {
        let key = Self::key(path);
        if key.is_empty() {
            return Err(StorageError::remote("remove", "/", "cannot remove the volume root"));
        }
        let mut nodes = self.write("remove", &key)?;
        let node = nodes
            .get(&key)
            .ok_or_else(|| StorageError::not_found("remove", &key))?;

        let prefix = format!("{}/", key);
        if node.kind.is_dir() {
            let descendants: Vec<String> = nodes
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect();
            if !descendants.is_empty() && !recursive {
                return Err(StorageError::remote("remove", &key, "directory not empty"));
            }
            for k in descendants {
                nodes.remove(&k);
            }
        }
        nodes.remove(&key);
        debug!(volume = %self.name, key = %key, "removed");
        Ok(())
    }

    fn iterate_directory(&self, path: &str) -> StorageResult<Vec<VolumeEntry>> {
        let key = Self::key(path);
        let nodes = self.read("iterate_directory", &key)?;
        let node = nodes
            .get(&key)
            .ok_or_else(|| StorageError::not_found("iterate_directory", &key))?;

        if node.kind.is_file() {
            return Ok(vec![Self::entry(&key, node)]);
        }

        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        };
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k.is_empty() && !k[prefix.len()..].contains('/'))
            .map(|(k, n)| Self::entry(k, n))
            .collect())
    }
}

/// Hands out named in-memory volumes, creating them on first use.
///
/// Connecting twice with the same name returns the same volume.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    volumes: Mutex<HashMap<String, Arc<MemoryVolume>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed access to a volume (created if missing).
    pub fn volume(&self, name: &str) -> StorageResult<Arc<MemoryVolume>> {
        let mut volumes = self
            .volumes
            .lock()
            .map_err(|_| StorageError::remote("connect", name, "lock poisoned"))?;
        Ok(volumes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryVolume::new(name)))
            .clone())
    }
}

impl VolumeConnector for MemoryConnector {
    fn connect(&self, volume_name: &str) -> StorageResult<Arc<dyn RemoteVolume>> {
        let volume: Arc<dyn RemoteVolume> = self.volume(volume_name)?;
        Ok(volume)
    }
}
