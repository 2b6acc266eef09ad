// keg-common/src/cache.rs
// Content-addressed store for downloaded artifacts and HEAD checkouts.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::{KegError, Result};
use crate::Config;

const DOWNLOADS_DIR: &str = "downloads";
const HEAD_DIR: &str = "head";

/// Download cache under `{prefix}/var/keg/cache`. Artifacts are stored as
/// `downloads/<sha256>--<file name>`, so a file can only ever be found under
/// the digest it was verified against.
#[derive(Debug, Clone)]
pub struct Cache {
    cache_dir: PathBuf,
}

impl Cache {
    pub fn new(config: &Config) -> Result<Self> {
        Self::at(config.cache_dir())
    }

    pub fn at(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(cache_dir.join(DOWNLOADS_DIR))?;
        Ok(Self { cache_dir })
    }

    /// Where an artifact with `sha256` fetched from `url` is stored.
    pub fn artifact_path(&self, sha256: &str, url: &str) -> Result<PathBuf> {
        if sha256.is_empty() || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(KegError::Cache(format!(
                "refusing to cache '{url}' under non-hex digest '{sha256}'"
            )));
        }
        let file_name = file_name_from_url(url);
        Ok(self
            .cache_dir
            .join(DOWNLOADS_DIR)
            .join(format!("{}--{file_name}", sha256.to_ascii_lowercase())))
    }

    /// A previously stored artifact for `sha256`, if any.
    pub fn lookup(&self, sha256: &str) -> Option<PathBuf> {
        let prefix = format!("{}--", sha256.to_ascii_lowercase());
        let entries = fs::read_dir(self.cache_dir.join(DOWNLOADS_DIR)).ok()?;
        let found = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
            });
        if let Some(path) = &found {
            debug!("Cache hit for {}: {}", sha256, path.display());
        }
        found
    }

    /// Checkout directory for a formula's HEAD source.
    pub fn head_checkout_dir(&self, name: &str) -> PathBuf {
        self.cache_dir.join(HEAD_DIR).join(name)
    }

    /// Removes a cached artifact, e.g. after it failed verification.
    pub fn evict(&self, path: &Path) -> Result<()> {
        if path.starts_with(&self.cache_dir) && path.exists() {
            debug!("Evicting cached file {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Last path segment of `url` without query or fragment.
pub fn file_name_from_url(url: &str) -> String {
    let trimmed = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .trim_end_matches('/');
    match trimmed.rsplit('/').next() {
        Some(name) if !name.is_empty() && !name.contains(':') => name.to_string(),
        _ => "download".to_string(),
    }
}
