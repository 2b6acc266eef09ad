// keg-core/src/install/bottle/link.rs
// Linking a finished keg into the shared prefix.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use keg_aio::fs::create_symlink;
use keg_common::config::Config;
use keg_common::error::Result;
use once_cell::sync::Lazy;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Keg subdirectories whose files are linked into the prefix.
pub const LINKED_DIRS: [&str; 6] = ["bin", "sbin", "lib", "include", "share", "etc"];

/// Serializes every mutation of the shared prefix across workers.
static PREFIX_LINK_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Links `keg_path` into the prefix: `opt/<name>` (plus an un-versioned
/// `opt/<base>` alias for `base@x` names when free) and a symlink for every
/// file below the keg's [`LINKED_DIRS`]. Returns the links created.
///
/// A link path already occupied by a regular file is left alone with a
/// warning; links owned by another keg are replaced.
pub fn link_keg(name: &str, keg_path: &Path, config: &Config) -> Result<Vec<PathBuf>> {
    let _guard = PREFIX_LINK_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    debug!("Linking artifacts for {} from {}", name, keg_path.display());

    let mut links = Vec::new();
    let opt_link_path = config.formula_opt_path(name);
    create_symlink(keg_path, &opt_link_path)?;
    links.push(opt_link_path.clone());
    debug!(
        "  Linked opt path: {} -> {}",
        opt_link_path.display(),
        keg_path.display()
    );

    if let Some((base, _version)) = name.split_once('@') {
        let alias_path = config.opt_dir().join(base);
        if alias_path.symlink_metadata().is_err() {
            create_symlink(keg_path, &alias_path)?;
            debug!(
                "  Added un-versioned opt alias: {} -> {}",
                alias_path.display(),
                keg_path.display()
            );
            links.push(alias_path);
        }
    }

    for dir_name in LINKED_DIRS {
        let source_dir = keg_path.join(dir_name);
        if !source_dir.is_dir() {
            continue;
        }
        let target_dir = config.keg_root().join(dir_name);
        for entry in WalkDir::new(&source_dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_dir() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&source_dir) else {
                continue;
            };
            if relative
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            {
                continue;
            }
            let target_link = target_dir.join(relative);
            if let Ok(meta) = target_link.symlink_metadata() {
                if !meta.file_type().is_symlink() {
                    warn!(
                        "Not linking {}: {} exists and is not a symlink",
                        entry.path().display(),
                        target_link.display()
                    );
                    continue;
                }
                if let Ok(existing) = fs::read_link(&target_link) {
                    if !existing.starts_with(keg_path) {
                        warn!(
                            "Replacing link {} (was -> {})",
                            target_link.display(),
                            existing.display()
                        );
                    }
                }
            }
            create_symlink(entry.path(), &target_link)?;
            links.push(target_link);
        }
    }
    debug!("Linked {} paths for {}", links.len(), name);
    Ok(links)
}
