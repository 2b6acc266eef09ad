// keg-aio/src/fs.rs
// Primitive synchronous filesystem operations.
use std::fs::{self, Permissions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keg_common::error::{KegError, Result};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

/// Creates a directory and all its parent components if they are missing.
pub fn create_dir_all(path: &Path) -> Result<()> {
    debug!("Creating directory recursively: {}", path.display());
    fs::create_dir_all(path).map_err(|e| {
        error!("Failed create dir {}: {}", path.display(), e);
        KegError::from(e)
    })
}

/// Creates (or replaces) a symbolic link at `link` pointing to `target`.
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    debug!("Creating symlink {} -> {}", link.display(), target.display());
    if let Ok(meta) = link.symlink_metadata() {
        if meta.file_type().is_symlink() {
            fs::remove_file(link)?;
        } else {
            return Err(KegError::InstallError(format!(
                "refusing to replace non-link {} with a symlink",
                link.display()
            )));
        }
    }
    if let Some(parent) = link.parent() {
        create_dir_all(parent)?;
    }
    symlink(target, link).map_err(|e| {
        error!(
            "Failed create symlink {} -> {}: {}",
            link.display(),
            target.display(),
            e
        );
        KegError::from(e)
    })
}

#[cfg(not(unix))]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    warn!(
        "Symlink creation not supported on this platform: {} -> {}",
        link.display(),
        target.display()
    );
    Err(KegError::Generic(
        "Symlinks not supported on this platform".to_string(),
    ))
}

/// Sets file permissions (Unix only). Mode is standard Unix octal mode.
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    debug!("Setting permissions on {}: {:o}", path.display(), mode);
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| {
        error!("Failed set permissions on {}: {}", path.display(), e);
        KegError::from(e)
    })
}

#[cfg(not(unix))]
pub fn set_permissions(path: &Path, _mode: u32) -> Result<()> {
    warn!(
        "Setting permissions not fully supported on this platform: {}",
        path.display()
    );
    Ok(())
}

/// Atomically writes data to a file using a temporary file in the same
/// directory. Preserves original permissions if the file existed.
pub fn atomic_write_file(original_path: &Path, content: &[u8]) -> Result<()> {
    let dir = original_path.parent().ok_or_else(|| {
        KegError::Generic(format!(
            "Cannot get parent directory for {}",
            original_path.display()
        ))
    })?;
    create_dir_all(dir)?;

    let original_perms = fs::metadata(original_path).map(|m| m.permissions()).ok();

    let mut temp_file = NamedTempFile::new_in(dir)?;
    let temp_path = temp_file.path().to_path_buf();
    debug!(
        "Atomically writing {} bytes to {} via temp file {}",
        content.len(),
        original_path.display(),
        temp_path.display()
    );
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;

    temp_file.persist(original_path).map_err(|e| {
        error!(
            "Failed to persist temporary file {} over {}: {}",
            temp_path.display(),
            original_path.display(),
            e.error
        );
        KegError::Io(Arc::new(e.error))
    })?;

    match original_perms {
        Some(perms) => {
            if let Err(e) = fs::set_permissions(original_path, perms) {
                warn!(
                    "Failed to restore original permissions on {}: {}",
                    original_path.display(),
                    e
                );
            }
        }
        None if cfg!(unix) => {
            if let Err(e) = set_permissions(original_path, 0o644) {
                warn!(
                    "Failed to set default permissions on new file {}: {}",
                    original_path.display(),
                    e
                );
            }
        }
        None => {}
    }
    Ok(())
}

/// Removes a file, symlink or directory tree. A missing path is not an error.
pub fn remove_path(path: &Path) -> Result<()> {
    match path.symlink_metadata() {
        Ok(metadata) => {
            let result = if metadata.file_type().is_dir() {
                debug!("Removing directory at: {}", path.display());
                fs::remove_dir_all(path)
            } else {
                debug!("Removing file at: {}", path.display());
                fs::remove_file(path)
            };
            match result {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    error!("Failed to remove {}: {}", path.display(), e);
                    Err(e.into())
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Removes `start` and its ancestors while they are empty directories,
/// stopping at (and never removing) `stop_at`.
pub fn prune_empty_dirs(start: &Path, stop_at: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        match fs::read_dir(dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                current = dir.parent();
                continue;
            }
            Err(_) => break,
        }
        debug!("Pruning empty directory {}", dir.display());
        fs::remove_dir(dir)?;
        removed.push(dir.to_path_buf());
        current = dir.parent();
    }
    Ok(removed)
}

/// Copies `src` to `dest`, creating parent directories and keeping the mode.
pub fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        create_dir_all(parent)?;
    }
    debug!("Copying {} -> {}", src.display(), dest.display());
    fs::copy(src, dest).map_err(|e| {
        error!("Failed to copy {} to {}: {}", src.display(), dest.display(), e);
        KegError::from(e)
    })?;
    Ok(())
}
