use std::io::{Read, Write};

use anyhow::{Context, Result};
use tracing::info;
use volstore_core::copy_path;

use crate::config::Command;
use crate::router::Router;

/// Execute one subcommand. `input` feeds `put` when no `--from` file is
/// given; results go to `out`.
pub fn run(command: &Command, router: &Router, input: &mut dyn Read, out: &mut dyn Write) -> Result<()> {
    match command {
        Command::Ls { path, full_paths } => {
            let (backend, path) = router.route(path)?;
            if *full_paths {
                for entry in backend.list_dir_paths(&path)? {
                    writeln!(out, "{}", entry.display())?;
                }
            } else {
                for name in backend.list_dir(&path)? {
                    writeln!(out, "{}", name)?;
                }
            }
        }
        Command::Cat { path } => {
            let (backend, path) = router.route(path)?;
            let data = backend.read_bytes(&path)?;
            out.write_all(&data)?;
        }
        Command::Put {
            path,
            from,
            no_clobber,
        } => {
            let data = match from {
                Some(local) => std::fs::read(local)
                    .with_context(|| format!("failed to read {}", local.display()))?,
                None => {
                    let mut data = Vec::new();
                    input.read_to_end(&mut data).context("failed to read stdin")?;
                    data
                }
            };
            let (backend, path) = router.route(path)?;
            backend.write_bytes(&path, &data, !*no_clobber)?;
            info!(path = %path.display(), bytes = data.len(), "written");
        }
        Command::Mkdir { path } => {
            let (backend, path) = router.route(path)?;
            backend.create_directory(&path)?;
        }
        Command::Rm { path, force } => {
            let (backend, path) = router.route(path)?;
            backend.remove(&path, *force)?;
        }
        Command::Exists { path } => {
            let (backend, path) = router.route(path)?;
            writeln!(out, "{}", backend.exists(&path)?)?;
        }
        Command::Mtime { path } => {
            let (backend, path) = router.route(path)?;
            writeln!(out, "{}", backend.get_mtime(&path)?)?;
        }
        Command::Cp {
            source,
            destination,
        } => {
            let (source_backend, source) = router.route(source)?;
            let (destination_backend, destination) = router.route(destination)?;
            let stats = copy_path(source_backend, &source, destination_backend, &destination)?;
            info!(
                files = stats.files,
                directories = stats.directories,
                bytes = stats.bytes,
                "copy complete"
            );
        }
        Command::Changes { root, since } => {
            let report = router.directory(root)?.report_changes(*since)?;
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
        Command::Sync {
            source,
            destination,
            since,
        } => {
            let source = router.directory(source)?;
            let destination = router.directory(destination)?;
            let report = destination.copy_changes_from(&source, *since)?;
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
