use std::path::{Path, PathBuf};
use std::sync::Arc;

use volstore_core::{
    DirectoryHandle, ExecutionContext, StorageBackend, StorageConfig, StorageError, StorageResult,
    VolumeConnector,
};

/// Picks a backend per path: paths under the mount path go to the volume,
/// everything else to the local filesystem.
#[derive(Debug, Clone)]
pub struct Router {
    local: Arc<StorageBackend>,
    volume: Option<Arc<StorageBackend>>,
}

impl Router {
    /// Local filesystem only.
    pub fn local(context: ExecutionContext) -> Self {
        Self {
            local: Arc::new(StorageBackend::local(context)),
            volume: None,
        }
    }

    /// Connect to the configured volume, if any.
    pub fn open(
        config: &StorageConfig,
        connector: &dyn VolumeConnector,
        context: ExecutionContext,
    ) -> StorageResult<Self> {
        let backend = StorageBackend::open(config, connector, context)?;
        let volume = backend.is_remote_backed().then(|| Arc::new(backend));
        Ok(Self {
            local: Arc::new(StorageBackend::local(context)),
            volume,
        })
    }

    /// The backend serving `path`, with `path` made absolute against the
    /// working directory.
    pub fn route(&self, path: &Path) -> StorageResult<(&Arc<StorageBackend>, PathBuf)> {
        let absolute =
            std::path::absolute(path).map_err(|e| StorageError::from_io("route", path, e))?;
        Ok((self.backend_for(&absolute), absolute))
    }

    /// The backend serving an absolute `path`.
    pub fn backend_for(&self, path: &Path) -> &Arc<StorageBackend> {
        match &self.volume {
            Some(volume)
                if volume
                    .resolver()
                    .is_some_and(|resolver| resolver.path_has_root_prefix(path)) =>
            {
                volume
            }
            _ => &self.local,
        }
    }

    pub fn directory(&self, root: &Path) -> StorageResult<DirectoryHandle> {
        let (backend, root) = self.route(root)?;
        DirectoryHandle::new(root, backend.clone())
    }
}
