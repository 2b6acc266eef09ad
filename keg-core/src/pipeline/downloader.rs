// keg-core/src/pipeline/downloader.rs
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use keg_common::cache::Cache;
use keg_common::error::{KegError, Result};
use keg_common::pipeline::{
    ArtifactChoice, CancellationFlag, DownloadOutcome, PipelineEvent, PlannedJob,
};
use keg_net::fetch_artifact;
use reqwest::Client as HttpClient;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, warn};

use super::engine::get_panic_message;

/// Prefetches and verifies artifacts ahead of the worker pool, at most
/// `max_concurrent` at a time.
pub struct DownloadCoordinator {
    cache: Arc<Cache>,
    http_client: Arc<HttpClient>,
    event_tx: broadcast::Sender<PipelineEvent>,
    cancel: CancellationFlag,
    max_concurrent: usize,
}

impl DownloadCoordinator {
    pub fn new(
        cache: Arc<Cache>,
        http_client: Arc<HttpClient>,
        event_tx: broadcast::Sender<PipelineEvent>,
        cancel: CancellationFlag,
        max_concurrent: usize,
    ) -> Self {
        Self {
            cache,
            http_client,
            event_tx,
            cancel,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Downloads every job's artifact, sending one [`DownloadOutcome`] per
    /// job. Returns once all downloads have finished.
    #[instrument(skip_all, fields(jobs = planned_jobs.len()))]
    pub async fn coordinate_downloads(
        self,
        planned_jobs: Vec<PlannedJob>,
        download_outcome_tx: mpsc::Sender<DownloadOutcome>,
    ) {
        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut download_tasks = JoinSet::new();

        for planned_job in planned_jobs {
            let permits = Arc::clone(&permits);
            let cache = Arc::clone(&self.cache);
            let http_client = Arc::clone(&self.http_client);
            let event_tx = self.event_tx.clone();
            let outcome_tx = download_outcome_tx.clone();
            let cancel = self.cancel.clone();

            download_tasks.spawn(async move {
                let job_id = planned_job.target_id.clone();
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        download_one(&planned_job, &cache, &http_client, &event_tx, &cancel).await
                    }
                    Err(e) => Err(KegError::Generic(format!(
                        "download slots closed: {e}"
                    ))),
                };
                let outcome = DownloadOutcome {
                    planned_job,
                    result,
                };
                if outcome_tx.send(outcome).await.is_err() {
                    error!(
                        "[Downloader] Failed to send DownloadOutcome for job {}: receiver dropped.",
                        job_id
                    );
                }
            });
        }
        drop(download_outcome_tx);

        while let Some(result) = download_tasks.join_next().await {
            if let Err(join_error) = result {
                if join_error.is_panic() {
                    let panic_message = get_panic_message(join_error.into_panic());
                    error!("[Downloader] Download task panicked: {}", panic_message);
                } else {
                    debug!("[Downloader] Download task cancelled.");
                }
            }
        }
    }
}

async fn download_one(
    job: &PlannedJob,
    cache: &Cache,
    http_client: &HttpClient,
    event_tx: &broadcast::Sender<PipelineEvent>,
    cancel: &CancellationFlag,
) -> Result<PathBuf> {
    cancel.check(&format!("download of {}", job.target_id))?;
    event_tx
        .send(PipelineEvent::DownloadStarted {
            target_id: job.target_id.clone(),
            url: job.url.clone(),
        })
        .ok();

    let mirrors: &[String] = match job.artifact {
        ArtifactChoice::Source => &job.node.formula.mirrors,
        _ => &[],
    };
    match fetch_artifact(
        http_client,
        cache,
        &job.target_id,
        &job.url,
        mirrors,
        &job.sha256,
    )
    .await
    {
        Ok(path) => {
            let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            event_tx
                .send(PipelineEvent::DownloadFinished {
                    target_id: job.target_id.clone(),
                    path: path.clone(),
                    size_bytes,
                })
                .ok();
            Ok(path)
        }
        Err(e) => {
            warn!(
                "[Downloader:{}] Download failed from {}: {}",
                job.target_id, job.url, e
            );
            event_tx
                .send(PipelineEvent::download_failed(
                    job.target_id.clone(),
                    job.url.clone(),
                    &e,
                ))
                .ok();
            Err(e)
        }
    }
}
