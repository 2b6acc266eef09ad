// keg-common/src/state.rs
// Persistent record of installed formulae, kept at `{prefix}/var/keg/state.json`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{KegError, Result};
use crate::model::version::{parse_version_lenient, VersionConstraint};

const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallKind {
    Bottle,
    Source,
    Head,
}

impl fmt::Display for InstallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallKind::Bottle => f.write_str("bottle"),
            InstallKind::Source => f.write_str("source"),
            InstallKind::Head => f.write_str("HEAD"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub name: String,
    /// Full version string as used for the keg directory (`1.11.0_1`, `HEAD-1a2b3c4`).
    pub version: String,
    pub keg_path: PathBuf,
    /// Every file, link and directory created for this install outside
    /// bookkeeping, including the links into the prefix.
    #[serde(default)]
    pub manifest: BTreeSet<PathBuf>,
    pub installed_at: DateTime<Utc>,
    pub install_kind: InstallKind,
    #[serde(default)]
    pub installed_on_request: bool,
    #[serde(default)]
    pub runtime_dependencies: Vec<String>,
}

impl InstallRecord {
    /// Semantic version of the install; `None` for HEAD installs.
    pub fn semver(&self) -> Option<Version> {
        if self.install_kind == InstallKind::Head {
            return None;
        }
        let base = self
            .version
            .rsplit_once('_')
            .filter(|(_, rev)| rev.chars().all(|c| c.is_ascii_digit()))
            .map_or(self.version.as_str(), |(base, _)| base);
        parse_version_lenient(base).ok()
    }

    pub fn satisfies(&self, constraint: Option<&VersionConstraint>) -> bool {
        match constraint {
            None => true,
            Some(c) => self.semver().is_some_and(|v| c.matches(&v)),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    format_version: u32,
    #[serde(default)]
    formulae: BTreeMap<String, BTreeMap<String, InstallRecord>>,
}

/// Owner of all `InstallRecord`s. Every mutation is persisted before it
/// returns.
#[derive(Debug)]
pub struct InstallStateStore {
    path: PathBuf,
    state: Mutex<StateFile>,
}

impl InstallStateStore {
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(config.state_file())
    }

    /// Loads the state file. A missing file is empty state; an unreadable or
    /// malformed one is logged and also treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StateFile>(&raw) {
                Ok(state) => {
                    debug!(
                        "Loaded install state for {} formulae from {}",
                        state.formulae.len(),
                        path.display()
                    );
                    state
                }
                Err(e) => {
                    let err = KegError::StateCorruption {
                        path: path.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{}; continuing with empty install state", err);
                    StateFile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No install state at {}, starting empty", path.display());
                StateFile::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, StateFile> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds or replaces the record for `(record.name, record.version)`.
    pub fn record(&self, record: InstallRecord) -> Result<()> {
        let mut state = self.lock();
        debug!("Recording install of {} {}", record.name, record.version);
        state
            .formulae
            .entry(record.name.clone())
            .or_default()
            .insert(record.version.clone(), record);
        self.persist(&mut state)
    }

    pub fn remove(&self, name: &str, version: &str) -> Result<InstallRecord> {
        let mut state = self.lock();
        let versions = state
            .formulae
            .get_mut(name)
            .ok_or_else(|| KegError::NotInstalled(name.to_string()))?;
        let removed = versions
            .remove(version)
            .ok_or_else(|| KegError::NotInstalled(format!("{name} {version}")))?;
        if versions.is_empty() {
            state.formulae.remove(name);
        }
        self.persist(&mut state)?;
        debug!("Removed install record for {} {}", name, version);
        Ok(removed)
    }

    /// All records, ordered by name then version string.
    pub fn list_installed(&self) -> Vec<InstallRecord> {
        self.lock()
            .formulae
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect()
    }

    pub fn is_installed(&self, name: &str, constraint: Option<&VersionConstraint>) -> bool {
        self.find_satisfying(name, constraint).is_some()
    }

    pub fn get(&self, name: &str, version: &str) -> Option<InstallRecord> {
        self.lock().formulae.get(name)?.get(version).cloned()
    }

    pub fn versions(&self, name: &str) -> Vec<InstallRecord> {
        self.lock()
            .formulae
            .get(name)
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest installed version of `name` satisfying `constraint`. HEAD
    /// installs only satisfy the absence of a constraint.
    pub fn find_satisfying(
        &self,
        name: &str,
        constraint: Option<&VersionConstraint>,
    ) -> Option<InstallRecord> {
        let state = self.lock();
        let versions = state.formulae.get(name)?;
        versions
            .values()
            .filter(|r| r.satisfies(constraint))
            .max_by(|a, b| match (a.semver(), b.semver()) {
                (Some(va), Some(vb)) => va.cmp(&vb),
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, None) => a.installed_at.cmp(&b.installed_at),
            })
            .cloned()
    }

    /// Names of installed formulae that depend on `name` at runtime.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let state = self.lock();
        let mut dependents: Vec<String> = state
            .formulae
            .iter()
            .filter(|(other, _)| other.as_str() != name)
            .filter(|(_, versions)| {
                versions
                    .values()
                    .any(|r| r.runtime_dependencies.iter().any(|d| d == name))
            })
            .map(|(other, _)| other.clone())
            .collect();
        dependents.dedup();
        dependents
    }

    fn persist(&self, state: &mut StateFile) -> Result<()> {
        state.format_version = STATE_FORMAT_VERSION;
        let parent = self
            .path
            .parent()
            .ok_or_else(|| KegError::Generic(format!("{} has no parent", self.path.display())))?;
        fs::create_dir_all(parent)?;
        let json = serde_json::to_vec_pretty(&*state)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| KegError::Io(std::sync::Arc::new(e.error)))?;
        debug!("Wrote install state to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: &str, deps: &[&str]) -> InstallRecord {
        InstallRecord {
            name: name.to_string(),
            version: version.to_string(),
            keg_path: PathBuf::from(format!("/opt/keg/Cellar/{name}/{version}")),
            manifest: BTreeSet::new(),
            installed_at: Utc::now(),
            install_kind: InstallKind::Source,
            installed_on_request: true,
            runtime_dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn record_list_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstallStateStore::open(dir.path().join("state.json")).unwrap();
        store.record(record("rabbitmq-c", "0.14.0", &[])).unwrap();
        store.record(record("amqp@8.1", "1.11.0", &["rabbitmq-c"])).unwrap();

        let names: Vec<String> = store.list_installed().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["amqp@8.1", "rabbitmq-c"]);

        store.remove("amqp@8.1", "1.11.0").unwrap();
        assert!(!store.is_installed("amqp@8.1", None));
        assert!(matches!(
            store.remove("amqp@8.1", "1.11.0"),
            Err(KegError::NotInstalled(_))
        ));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("var/keg/state.json");
        {
            let store = InstallStateStore::open(&path).unwrap();
            store.record(record("imap@7.0", "7.0.33", &[])).unwrap();
        }
        let reopened = InstallStateStore::open(&path).unwrap();
        assert_eq!(reopened.get("imap@7.0", "7.0.33").unwrap().version, "7.0.33");
    }

    #[test]
    fn recording_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstallStateStore::open(dir.path().join("state.json")).unwrap();
        store.record(record("x", "1.0.0", &[])).unwrap();
        store.record(record("x", "1.0.0", &[])).unwrap();
        assert_eq!(store.list_installed().len(), 1);
    }

    #[test]
    fn corrupt_state_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let store = InstallStateStore::open(&path).unwrap();
        assert!(store.list_installed().is_empty());
        store.record(record("x", "1.0.0", &[])).unwrap();
        assert!(InstallStateStore::open(&path).unwrap().is_installed("x", None));
    }

    #[test]
    fn constraints_match_installed_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstallStateStore::open(dir.path().join("state.json")).unwrap();
        store.record(record("php", "8.1.2_1", &[])).unwrap();
        let c81 = VersionConstraint::parse("8.1").unwrap();
        let c82 = VersionConstraint::parse("8.2").unwrap();
        assert!(store.is_installed("php", Some(&c81)));
        assert!(!store.is_installed("php", Some(&c82)));
    }

    #[test]
    fn finds_runtime_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstallStateStore::open(dir.path().join("state.json")).unwrap();
        store.record(record("rabbitmq-c", "0.14.0", &[])).unwrap();
        store.record(record("amqp@8.1", "1.11.0", &["rabbitmq-c"])).unwrap();
        assert_eq!(store.dependents_of("rabbitmq-c"), vec!["amqp@8.1"]);
        assert!(store.dependents_of("amqp@8.1").is_empty());
    }
}
