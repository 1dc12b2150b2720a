use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use volstore_core::{ExecutionContext, StorageConfig, Watermark};
use volstore_s3::S3Config;

/// Configuration for the volstore command-line tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "volstore")]
#[command(author, version, about = "Read, write and sync files on local disks and remote volumes")]
pub struct Config {
    /// Remote volume name
    #[arg(long, env = "VOLSTORE_VOLUME", global = true)]
    pub volume: Option<String>,

    /// Absolute path the volume is mounted at; paths under it go to the volume
    #[arg(long, env = "VOLSTORE_MOUNT_PATH", global = true)]
    pub mount_path: Option<PathBuf>,

    /// Running inside the managed worker, where the volume is mounted
    /// (falls back to VOLSTORE_MANAGED_WORKER)
    #[arg(long, global = true)]
    pub managed_worker: bool,

    #[command(flatten)]
    pub s3: S3Config,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            volume_name: self.volume.clone(),
            mount_path: self.mount_path.clone(),
        }
    }

    pub fn execution_context(&self) -> ExecutionContext {
        if self.managed_worker {
            ExecutionContext::managed_worker()
        } else {
            ExecutionContext::from_env()
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List a directory
    Ls {
        path: PathBuf,
        /// Print absolute paths instead of names
        #[arg(long)]
        full_paths: bool,
    },

    /// Print a file to stdout
    Cat { path: PathBuf },

    /// Write a file from stdin or from a local file
    Put {
        path: PathBuf,
        /// Local file to upload instead of reading stdin
        #[arg(long)]
        from: Option<PathBuf>,
        /// Fail instead of overwriting an existing file
        #[arg(long)]
        no_clobber: bool,
    },

    /// Create a directory and its parents
    Mkdir { path: PathBuf },

    /// Remove a file or directory tree
    Rm {
        path: PathBuf,
        /// Succeed when nothing is there
        #[arg(short, long)]
        force: bool,
    },

    /// Print whether a path exists
    Exists { path: PathBuf },

    /// Print a modification time in seconds since the epoch
    Mtime { path: PathBuf },

    /// Copy a file or directory tree, possibly across storage kinds
    Cp {
        source: PathBuf,
        /// Destination; a trailing `/` or an existing directory receives the
        /// file under its own name
        destination: PathBuf,
    },

    /// Print the files and directories changed under a root, as JSON
    Changes {
        root: PathBuf,
        /// Watermark: seconds since the epoch or an RFC 3339 timestamp
        #[arg(long, value_parser = parse_watermark)]
        since: Option<Watermark>,
    },

    /// Copy everything changed under SOURCE into DESTINATION
    Sync {
        source: PathBuf,
        destination: PathBuf,
        /// Watermark: seconds since the epoch or an RFC 3339 timestamp
        #[arg(long, value_parser = parse_watermark)]
        since: Option<Watermark>,
    },
}

/// Parse `1700000000.5` or `2023-11-14T22:13:20Z`.
pub fn parse_watermark(value: &str) -> Result<Watermark, String> {
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() {
            return Ok(Watermark::from_secs(secs));
        }
    }
    DateTime::parse_from_rfc3339(value)
        .map(|time| Watermark::from(time.with_timezone(&Utc)))
        .map_err(|e| format!("expected seconds or an RFC 3339 timestamp: {}", e))
}
