// keg-net/src/http.rs
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use keg_aio::checksum::{verify_checksum_async, verify_checksum_sync};
use keg_common::cache::Cache;
use keg_common::error::{KegError, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use tempfile::{NamedTempFile, TempPath};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};
use url::Url;

use crate::validation::{validate_url, ArtifactLocation};

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT_STRING: &str = concat!("keg/", env!("CARGO_PKG_VERSION"));

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers
}

pub fn build_http_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .default_headers(default_headers())
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(KegError::from)
}

fn build_blocking_client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .default_headers(default_headers())
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(KegError::from)
}

/// A uniquely named staging file next to `final_path`. Concurrent fetches of
/// the same artifact each stage separately and the last rename wins; the
/// file is deleted on drop unless persisted.
fn staging_file(final_path: &Path) -> Result<NamedTempFile> {
    let dir = final_path.parent().ok_or_else(|| {
        KegError::Cache(format!("no parent directory for {}", final_path.display()))
    })?;
    tempfile::Builder::new()
        .prefix(".keg-")
        .suffix(".download")
        .tempfile_in(dir)
        .map_err(KegError::from)
}

fn persist(temp_path: TempPath, final_path: &Path) -> Result<PathBuf> {
    temp_path
        .persist(final_path)
        .map_err(|e| KegError::from(e.error))?;
    debug!("Moved verified file to final location: {}", final_path.display());
    Ok(final_path.to_path_buf())
}

fn status_error(subject: &str, url: &Url, status: StatusCode) -> KegError {
    let reason = match status {
        StatusCode::NOT_FOUND => "Resource not found (404)".to_string(),
        StatusCode::FORBIDDEN => "Access forbidden (403)".to_string(),
        other => format!("HTTP error {other}"),
    };
    KegError::DownloadError(subject.to_string(), url.to_string(), reason)
}

/// Fetches the artifact `url` (or one of its `mirrors`) into the cache and
/// returns the cached path. Nothing is stored unless its SHA-256 equals
/// `sha256`; a cached copy that no longer verifies is evicted and fetched
/// again. `subject` names the artifact in errors, usually the formula.
pub async fn fetch_artifact(
    client: &Client,
    cache: &Cache,
    subject: &str,
    url: &str,
    mirrors: &[String],
    sha256: &str,
) -> Result<PathBuf> {
    if let Some(cached) = cache.lookup(sha256) {
        match verify_checksum_async(&cached, sha256, subject).await {
            Ok(()) => {
                debug!("Using valid cached file: {}", cached.display());
                return Ok(cached);
            }
            Err(e) => {
                debug!("Cached file {} is stale ({}). Refetching.", cached.display(), e);
                cache.evict(&cached)?;
            }
        }
    }
    let cache_path = cache.artifact_path(sha256, url)?;
    debug!(
        "Preparing to fetch '{}' from {} into {}",
        subject,
        url,
        cache_path.display()
    );

    let mut last_error: Option<KegError> = None;
    for current_url in std::iter::once(url).chain(mirrors.iter().map(String::as_str)) {
        let attempt = match validate_url(current_url) {
            Ok(ArtifactLocation::Local(src)) => {
                stage_local_async(&src, &cache_path, sha256, subject).await
            }
            Ok(ArtifactLocation::Remote(remote)) => {
                download_and_verify(client, &remote, &cache_path, sha256, subject).await
            }
            Err(e) => Err(e),
        };
        match attempt {
            Ok(path) => {
                debug!("Successfully fetched and verified: {}", path.display());
                return Ok(path);
            }
            Err(e) => {
                error!("Fetch attempt failed from {}: {}", current_url, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        KegError::DownloadError(
            subject.to_string(),
            url.to_string(),
            "All download attempts failed.".to_string(),
        )
    }))
}

async fn stage_local_async(
    src: &Path,
    final_path: &Path,
    sha256: &str,
    subject: &str,
) -> Result<PathBuf> {
    let temp_path = staging_file(final_path)?.into_temp_path();
    debug!("Copying local artifact {} to {}", src.display(), temp_path.display());
    tokio::fs::copy(src, &temp_path).await.map_err(|e| {
        KegError::DownloadError(
            subject.to_string(),
            src.display().to_string(),
            format!("Failed to read local artifact: {e}"),
        )
    })?;
    finish_async(temp_path, final_path, sha256, subject).await
}

async fn download_and_verify(
    client: &Client,
    url: &Url,
    final_path: &Path,
    sha256: &str,
    subject: &str,
) -> Result<PathBuf> {
    let response = client.get(url.clone()).send().await?;
    let status = response.status();
    debug!("Received HTTP status: {} for {}", status, url);
    if !status.is_success() {
        return Err(status_error(subject, url, status));
    }

    let (std_file, temp_path) = staging_file(final_path)?.into_parts();
    debug!("Downloading to temporary path: {}", temp_path.display());
    let mut temp_file = tokio::fs::File::from_std(std_file);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        temp_file.write_all(&chunk?).await?;
    }
    temp_file.flush().await?;
    drop(temp_file);
    debug!("Finished writing download stream to temp file.");

    finish_async(temp_path, final_path, sha256, subject).await
}

/// Verifies a staged file and moves it into the cache. A rejected file is
/// removed when `temp_path` drops.
async fn finish_async(
    temp_path: TempPath,
    final_path: &Path,
    sha256: &str,
    subject: &str,
) -> Result<PathBuf> {
    verify_checksum_async(&temp_path, sha256, subject).await?;
    persist(temp_path, final_path)
}

/// Blocking counterpart of [`fetch_artifact`] for callers running on worker
/// threads outside the async runtime.
pub fn fetch_artifact_blocking(
    cache: &Cache,
    subject: &str,
    url: &str,
    mirrors: &[String],
    sha256: &str,
) -> Result<PathBuf> {
    if let Some(cached) = cache.lookup(sha256) {
        if verify_checksum_sync(&cached, sha256, subject).is_ok() {
            return Ok(cached);
        }
        cache.evict(&cached)?;
    }
    let cache_path = cache.artifact_path(sha256, url)?;

    let mut last_error: Option<KegError> = None;
    for current_url in std::iter::once(url).chain(mirrors.iter().map(String::as_str)) {
        let attempt = staging_file(&cache_path).and_then(|staging| {
            let temp_path = staging.into_temp_path();
            match validate_url(current_url)? {
                ArtifactLocation::Local(src) => {
                    fs::copy(&src, &temp_path)?;
                }
                ArtifactLocation::Remote(remote) => {
                    download_blocking(&remote, &temp_path, subject)?;
                }
            }
            verify_checksum_sync(&temp_path, sha256, subject)?;
            persist(temp_path, &cache_path)
        });
        match attempt {
            Ok(path) => return Ok(path),
            Err(e) => {
                error!("Fetch attempt failed from {}: {}", current_url, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        KegError::DownloadError(
            subject.to_string(),
            url.to_string(),
            "All download attempts failed.".to_string(),
        )
    }))
}

fn download_blocking(url: &Url, temp_path: &Path, subject: &str) -> Result<()> {
    let client = build_blocking_client()?;
    let mut response = client.get(url.clone()).send()?;
    if !response.status().is_success() {
        return Err(status_error(subject, url, response.status()));
    }
    let mut file = fs::File::create(temp_path)?;
    response.copy_to(&mut file)?;
    file.flush()?;
    Ok(())
}
