// keg-common/src/formulary.rs
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use super::config::Config;
use super::error::{KegError, Result};
use super::model::formula::{Formula, FormulaDescriptor};
use super::model::step::{StepTemplate, AUTOTOOLS_TEMPLATE};
use super::model::version::VersionConstraint;

const TEMPLATE_DIR: &str = "Abstract";

static GLOBAL_FORMULARY: OnceCell<Arc<Formulary>> = OnceCell::new();

/// A formula requested on the command line, e.g. `amqp@8.1` or `imap@7.0@7.0.33`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    pub name: String,
    pub constraint: Option<VersionConstraint>,
}

impl fmt::Display for InstallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "{}@{}", self.name, c),
            None => f.write_str(&self.name),
        }
    }
}

/// In-memory catalogue of every formula found in the configured formula
/// directories, indexed by name with versions in ascending order.
#[derive(Debug, Default)]
pub struct Formulary {
    formulae: HashMap<String, Vec<Arc<Formula>>>,
    templates: HashMap<String, StepTemplate>,
}

impl Formulary {
    pub fn new(config: &Config) -> Result<Self> {
        Self::load_from_dirs(&config.formula_dirs)
    }

    /// Loads the process-wide registry. Later calls return the first instance.
    pub fn init_global(config: &Config) -> Result<Arc<Formulary>> {
        GLOBAL_FORMULARY
            .get_or_try_init(|| Self::new(config).map(Arc::new))
            .cloned()
    }

    pub fn load_from_dirs(dirs: &[PathBuf]) -> Result<Self> {
        let mut formulary = Formulary::default();
        formulary
            .templates
            .insert(AUTOTOOLS_TEMPLATE.to_string(), StepTemplate::autotools());

        for dir in dirs {
            formulary.load_templates(&dir.join(TEMPLATE_DIR))?;
        }
        for dir in dirs {
            formulary.load_formula_dir(dir)?;
        }
        for versions in formulary.formulae.values_mut() {
            versions.sort_by(|a, b| a.version.cmp(&b.version).then(a.revision.cmp(&b.revision)));
        }
        debug!(
            "Loaded {} formulae and {} templates from {:?}",
            formulary.formulae.len(),
            formulary.templates.len(),
            dirs
        );
        Ok(formulary)
    }

    /// Builds a registry from already-resolved formulae.
    pub fn from_formulae(formulae: impl IntoIterator<Item = Formula>) -> Self {
        let mut formulary = Formulary::default();
        for formula in formulae {
            formulary.insert(formula);
        }
        for versions in formulary.formulae.values_mut() {
            versions.sort_by(|a, b| a.version.cmp(&b.version));
        }
        formulary
    }

    fn load_templates(&mut self, dir: &Path) -> Result<()> {
        for path in json_files(dir)? {
            let parsed = fs::read_to_string(&path)
                .map_err(KegError::from)
                .and_then(|raw| serde_json::from_str::<StepTemplate>(&raw).map_err(KegError::from));
            match parsed {
                Ok(template) => {
                    debug!("Loaded step template '{}' from {}", template.name, path.display());
                    self.templates.insert(template.name.clone(), template);
                }
                Err(e) => warn!("Skipping malformed template {}: {}", path.display(), e),
            }
        }
        Ok(())
    }

    fn load_formula_dir(&mut self, dir: &Path) -> Result<()> {
        for path in json_files(dir)? {
            let parsed = fs::read_to_string(&path)
                .map_err(KegError::from)
                .and_then(|raw| FormulaDescriptor::from_json(&raw))
                .and_then(|descriptor| descriptor.resolve(&self.templates));
            match parsed {
                Ok(formula) => self.insert(formula),
                Err(e) => warn!("Skipping malformed formula {}: {}", path.display(), e),
            }
        }
        Ok(())
    }

    fn insert(&mut self, formula: Formula) {
        let versions = self.formulae.entry(formula.name.clone()).or_default();
        if versions
            .iter()
            .any(|f| f.version_str_full() == formula.version_str_full())
        {
            warn!(
                "Duplicate formula {} {}; keeping the first definition",
                formula.name,
                formula.version_str_full()
            );
            return;
        }
        versions.push(Arc::new(formula));
    }

    /// Highest version of `name` satisfying `constraint`.
    pub fn lookup(&self, name: &str, constraint: Option<&VersionConstraint>) -> Result<Arc<Formula>> {
        let unknown = || KegError::UnknownFormula {
            name: name.to_string(),
            constraint: constraint.map(|c| c.to_string()),
            required_by: Vec::new(),
        };
        let versions = self.formulae.get(name).ok_or_else(unknown)?;
        versions
            .iter()
            .rev()
            .find(|f| constraint.is_none_or(|c| c.matches(&f.version)))
            .cloned()
            .ok_or_else(unknown)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formulae.contains_key(name)
    }

    pub fn versions(&self, name: &str) -> &[Arc<Formula>] {
        self.formulae.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formulae.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.formulae.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulae.is_empty()
    }

    pub fn template(&self, name: &str) -> Option<&StepTemplate> {
        self.templates.get(name)
    }

    /// Interprets `raw` as a formula name first (names such as `amqp@8.1`
    /// contain `@`), then as `name@constraint` split at the last `@`.
    pub fn parse_target(&self, raw: &str) -> Result<InstallTarget> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(KegError::Usage("empty formula name".to_string()));
        }
        if self.contains(raw) {
            return Ok(InstallTarget {
                name: raw.to_string(),
                constraint: None,
            });
        }
        match raw.rsplit_once('@') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                let constraint = VersionConstraint::parse(version)
                    .map_err(|e| KegError::Usage(format!("invalid target '{raw}': {e}")))?;
                Ok(InstallTarget {
                    name: name.to_string(),
                    constraint: Some(constraint),
                })
            }
            _ => Ok(InstallTarget {
                name: raw.to_string(),
                constraint: None,
            }),
        }
    }
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        debug!("Formula directory {} does not exist, skipping", dir.display());
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}
