use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Environment variable the binary reads to learn it runs inside the managed
/// worker (where the remote volume is filesystem-mounted).
pub const MANAGED_WORKER_ENV: &str = "VOLSTORE_MANAGED_WORKER";

/// Where the current process executes.
///
/// Injected into every `StorageBackend` at construction; never read from the
/// environment at call time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// True inside the managed remote worker, where configured volumes are
    /// mounted and reachable through ordinary filesystem calls.
    pub managed_worker: bool,
}

impl ExecutionContext {
    /// Running outside the managed worker (the remote client API is used).
    pub fn outside() -> Self {
        Self {
            managed_worker: false,
        }
    }

    /// Running inside the managed worker.
    pub fn managed_worker() -> Self {
        Self {
            managed_worker: true,
        }
    }

    /// Read `VOLSTORE_MANAGED_WORKER` (`1`, `true`, `yes`, case-insensitive).
    pub fn from_env() -> Self {
        let managed_worker = std::env::var(MANAGED_WORKER_ENV)
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        Self { managed_worker }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Remote volume configuration for one storage root.
///
/// Both fields set selects a remote-backed backend, both unset selects plain
/// local mode. Anything else is rejected by [`StorageConfig::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Name of the remote volume.
    #[serde(default)]
    pub volume_name: Option<String>,
    /// Absolute path the volume is mounted at inside the managed worker.
    #[serde(default)]
    pub mount_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Plain local filesystem.
    pub fn local() -> Self {
        Self::default()
    }

    /// Remote volume mounted at `mount_path`.
    pub fn volume(name: impl Into<String>, mount_path: impl Into<PathBuf>) -> Self {
        Self {
            volume_name: Some(name.into()),
            mount_path: Some(mount_path.into()),
        }
    }

    /// Check the both-or-neither invariant and return the remote pair, if any.
    pub fn validate(&self) -> StorageResult<Option<(&str, &PathBuf)>> {
        match (self.volume_name.as_deref(), self.mount_path.as_ref()) {
            (Some(name), Some(mount)) if !name.is_empty() => Ok(Some((name, mount))),
            (None, None) => Ok(None),
            (name, mount) => Err(StorageError::configuration(format!(
                "expected both volume_name and mount_path to be set if either is, got volume_name={:?}, mount_path={:?}",
                name, mount
            ))),
        }
    }
}
