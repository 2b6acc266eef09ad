// keg-aio/src/uninstall.rs
// Removal of the files recorded in an install manifest.

use std::path::{Path, PathBuf};

use keg_common::error::Result;
use tracing::{debug, warn};

use crate::fs::{prune_empty_dirs, remove_path};

/// Deletes manifest entries deepest-first, then prunes directories left
/// empty, up to but never including `prefix_root`. Entries outside
/// `prefix_root` are ignored. Returns the paths actually removed.
pub fn remove_manifest(manifest: &[PathBuf], prefix_root: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<&PathBuf> = manifest
        .iter()
        .filter(|p| {
            let inside = p.starts_with(prefix_root) && p.as_path() != prefix_root;
            if !inside {
                warn!(
                    "Ignoring manifest entry {} outside {}",
                    p.display(),
                    prefix_root.display()
                );
            }
            inside
        })
        .collect();
    // Reverse lexical order visits children before their parents.
    entries.sort();
    entries.reverse();

    let mut removed = Vec::new();
    for path in &entries {
        if path.symlink_metadata().is_err() {
            debug!("Manifest entry {} already gone", path.display());
            continue;
        }
        remove_path(path)?;
        removed.push(path.to_path_buf());
    }
    for path in &entries {
        if let Some(parent) = path.parent() {
            removed.extend(prune_empty_dirs(parent, prefix_root)?);
        }
    }
    Ok(removed)
}
