// keg-core/src/uninstall/mod.rs
// Removing installed kegs, their prefix links and their state records.

use std::fs;
use std::path::PathBuf;

use keg_aio::fs::{prune_empty_dirs, remove_path};
use keg_aio::uninstall::remove_manifest;
use keg_common::config::Config;
use keg_common::error::{KegError, Result};
use keg_common::model::version::VersionConstraint;
use keg_common::state::{InstallRecord, InstallStateStore};
use tracing::{debug, info, warn};

use crate::install::bottle::link_keg;

#[derive(Debug, Clone, Default)]
pub struct UninstallOptions {
    /// Remove the formula even when installed formulae still depend on it.
    pub ignore_dependencies: bool,
}

/// Uninstalls every installed version of `name` matching `constraint`
/// (all versions when `None`). Returns the removed records.
///
/// Removing the last version of a formula other installs depend on is
/// refused unless [`UninstallOptions::ignore_dependencies`] is set. When
/// versions remain, the highest one is linked again.
pub fn uninstall_formula(
    name: &str,
    constraint: Option<&VersionConstraint>,
    config: &Config,
    state: &InstallStateStore,
    options: &UninstallOptions,
) -> Result<Vec<InstallRecord>> {
    let installed = state.versions(name);
    if installed.is_empty() {
        return Err(KegError::NotInstalled(name.to_string()));
    }
    let targets: Vec<InstallRecord> = installed
        .iter()
        .filter(|r| r.satisfies(constraint))
        .cloned()
        .collect();
    if targets.is_empty() {
        let wanted = constraint.map(|c| c.as_str()).unwrap_or_default();
        return Err(KegError::NotInstalled(format!("{name} matching '{wanted}'")));
    }

    if targets.len() == installed.len() {
        let dependents = state.dependents_of(name);
        if !dependents.is_empty() {
            if options.ignore_dependencies {
                warn!(
                    "Uninstalling {} although {} depend on it",
                    name,
                    dependents.join(", ")
                );
            } else {
                return Err(KegError::DependencyError(format!(
                    "Refusing to uninstall {name} because it is required by {}",
                    dependents.join(", ")
                )));
            }
        }
    }

    let mut removed = Vec::with_capacity(targets.len());
    for record in &targets {
        removed.push(uninstall_record(record, config, state)?);
    }

    if let Some(remaining) = state.find_satisfying(name, None) {
        debug!(
            "Relinking remaining version {} of {}",
            remaining.version, name
        );
        link_keg(name, &remaining.keg_path, config)?;
    }
    Ok(removed)
}

fn uninstall_record(
    record: &InstallRecord,
    config: &Config,
    state: &InstallStateStore,
) -> Result<InstallRecord> {
    info!("Uninstalling {} {}", record.name, record.version);
    let owned: Vec<PathBuf> = record
        .manifest
        .iter()
        .filter(|path| {
            if path.starts_with(&record.keg_path) {
                return true;
            }
            // Prefix links may since have been taken over by another keg.
            match fs::read_link(path) {
                Ok(target) => target.starts_with(&record.keg_path),
                Err(_) => false,
            }
        })
        .cloned()
        .collect();
    let removed = remove_manifest(&owned, config.keg_root())?;
    debug!("Removed {} manifest entries of {}", removed.len(), record.name);

    if record.keg_path.exists() {
        remove_path(&record.keg_path)?;
    }
    prune_empty_dirs(&config.formula_cellar_dir(&record.name), &config.cellar_dir())?;
    state.remove(&record.name, &record.version)
}
