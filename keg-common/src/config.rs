// keg-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};

use directories::UserDirs;
use tracing::debug;

use super::error::{KegError, Result};
use crate::model::platform::PlatformTag;

// Fallback if KEG_PREFIX is not set or is empty.
const DEFAULT_FALLBACK_KEG_ROOT: &str = "/opt/keg";
const STATE_FILENAME: &str = "state.json";
const MAX_DEFAULT_WORKERS: usize = 6;

/// How the runner reacts to the first failed formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Skip everything not yet started.
    #[default]
    FailFast,
    /// Skip only the dependents of the failed formula.
    ContinueIndependent,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub keg_root: PathBuf,
    pub formula_dirs: Vec<PathBuf>,
    pub platform_tag: PlatformTag,
    pub jobs: usize,
    pub max_concurrent_downloads: usize,
    pub build_from_source: bool,
    pub keep_work_dir_on_failure: bool,
    pub failure_policy: FailurePolicy,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading keg configuration");

        let keg_root_str = env::var("KEG_PREFIX")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                debug!(
                    "KEG_PREFIX environment variable not set or empty, falling back to default: {}",
                    DEFAULT_FALLBACK_KEG_ROOT
                );
                DEFAULT_FALLBACK_KEG_ROOT.to_string()
            });
        let mut config = Self::with_root(PathBuf::from(&keg_root_str));
        debug!("Effective KEG_PREFIX set to: {}", config.keg_root.display());

        if let Some(paths) = env::var_os("KEG_FORMULA_PATH").filter(|p| !p.is_empty()) {
            let home = config.home_dir();
            config.formula_dirs = env::split_paths(&paths)
                .map(|p| expand_tilde(&p, &home))
                .collect();
        }
        if let Ok(tag) = env::var("KEG_PLATFORM_TAG") {
            if !tag.is_empty() {
                config.platform_tag = PlatformTag::new(tag);
            }
        }
        if let Ok(jobs) = env::var("KEG_JOBS") {
            let parsed = jobs.parse::<usize>().map_err(|e| {
                KegError::Config(format!("KEG_JOBS must be a positive integer, got '{jobs}': {e}"))
            })?;
            config.jobs = parsed.max(1);
        }
        config.build_from_source = env_flag("KEG_BUILD_FROM_SOURCE");
        config.keep_work_dir_on_failure = env_flag("KEG_KEEP_WORK_DIR");
        if env_flag("KEG_CONTINUE_ON_FAILURE") {
            config.failure_policy = FailurePolicy::ContinueIndependent;
        }

        debug!("Configuration loaded successfully.");
        Ok(config)
    }

    /// Configuration rooted at `keg_root` with defaults for everything else.
    /// Does not consult the environment, so tests can build isolated prefixes.
    pub fn with_root(keg_root: impl Into<PathBuf>) -> Self {
        let keg_root = keg_root.into();
        let formula_dirs = vec![keg_root.join("Library").join("Formula")];
        Self {
            keg_root,
            formula_dirs,
            platform_tag: PlatformTag::current(),
            jobs: default_worker_count(),
            max_concurrent_downloads: 8,
            build_from_source: false,
            keep_work_dir_on_failure: false,
            failure_policy: FailurePolicy::FailFast,
        }
    }

    pub fn keg_root(&self) -> &Path {
        &self.keg_root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.keg_root.join("bin")
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.keg_root.join("Cellar")
    }

    pub fn opt_dir(&self) -> PathBuf {
        self.keg_root.join("opt")
    }

    pub fn var_dir(&self) -> PathBuf {
        self.keg_root.join("var").join("keg")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.var_dir().join("cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.var_dir().join("logs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.keg_root.join("tmp")
    }

    pub fn state_file(&self) -> PathBuf {
        self.var_dir().join(STATE_FILENAME)
    }

    pub fn formula_cellar_dir(&self, formula_name: &str) -> PathBuf {
        self.cellar_dir().join(formula_name)
    }

    pub fn formula_keg_path(&self, formula_name: &str, version_str: &str) -> PathBuf {
        self.formula_cellar_dir(formula_name).join(version_str)
    }

    pub fn formula_opt_path(&self, formula_name: &str) -> PathBuf {
        self.opt_dir().join(formula_name)
    }

    pub fn home_dir(&self) -> PathBuf {
        UserDirs::new().map_or_else(|| PathBuf::from("/"), |ud| ud.home_dir().to_path_buf())
    }
}

/// Expands a leading `~/` to the user's home directory.
pub(crate) fn expand_tilde(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn default_worker_count() -> usize {
    std::cmp::max(1, num_cpus::get_physical().saturating_sub(1)).min(MAX_DEFAULT_WORKERS)
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
