//! Storage abstraction over a local filesystem or a remote content volume.
//!
//! The same calling code works against both kinds of storage root:
//! - `StorageBackend`: per-call choice between local filesystem calls and the
//!   remote volume client, based on the injected `ExecutionContext`
//! - `DirectoryHandle`: a backend bound to one root, with root-relative
//!   operations and watermark-based change detection
//! - `copy`: one-directional file / subtree copies between two backends
//! - `RemoteVolume` / `VolumeConnector`: the capability surface a remote store
//!   has to provide (see `memory` for an in-process implementation)

mod backend;
mod config;
pub mod copy;
mod dir;
mod error;
pub mod memory;
pub mod path;
mod remote;
mod scratch;

pub use backend::{StorageBackend, Walk, WalkEntry};
pub use config::{ExecutionContext, StorageConfig, MANAGED_WORKER_ENV};
pub use copy::{copy_dir, copy_file, copy_path, CopyStats, Destination};
pub use dir::{ChangeReport, DirectoryHandle, Watermark};
pub use error::{StorageError, StorageResult};
pub use path::PathResolver;
pub use remote::{
    batch_upload, EntryKind, RemoteVolume, UploadBatch, UploadOp, VolumeConnector, VolumeEntry,
};
