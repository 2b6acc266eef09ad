// keg-net/src/head.rs
// Checkouts of a formula's development head.

use std::path::PathBuf;

use git2::{build::RepoBuilder, Repository, ResetType};
use keg_common::cache::Cache;
use keg_common::error::Result;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct HeadCheckout {
    pub path: PathBuf,
    pub commit: String,
}

impl HeadCheckout {
    /// Abbreviated commit id used in `HEAD-<sha>` versions.
    pub fn short_sha(&self) -> &str {
        &self.commit[..self.commit.len().min(7)]
    }
}

/// Clones `url` into the cache's checkout directory for `name`, or fetches
/// and hard-resets an existing checkout to the remote tip of `branch` (the
/// remote HEAD when `None`).
pub fn checkout_head(
    cache: &Cache,
    name: &str,
    url: &str,
    branch: Option<&str>,
) -> Result<HeadCheckout> {
    let dir = cache.head_checkout_dir(name);
    let repo = if dir.join(".git").exists() {
        debug!("Updating HEAD checkout for {} in {}", name, dir.display());
        let repo = Repository::open(&dir)?;
        {
            let mut remote = repo.find_remote("origin")?;
            remote.fetch(&[branch.unwrap_or("HEAD")], None, None)?;
            let fetch_head = repo.find_reference("FETCH_HEAD")?;
            let target = fetch_head.peel_to_commit()?;
            repo.reset(target.as_object(), ResetType::Hard, None)?;
        }
        repo
    } else {
        info!("Cloning {} for {} HEAD", url, name);
        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut builder = RepoBuilder::new();
        if let Some(branch) = branch {
            builder.branch(branch);
        }
        builder.clone(url, &dir)?
    };
    let commit = repo.head()?.peel_to_commit()?.id().to_string();
    debug!("{} HEAD is at {}", name, commit);
    Ok(HeadCheckout { path: dir, commit })
}
