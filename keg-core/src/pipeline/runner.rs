// keg-core/src/pipeline/runner.rs
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded as crossbeam_bounded, Sender as CrossbeamSender};
use keg_common::config::FailurePolicy;
use keg_common::error::{KegError, Result};
use keg_common::formulary::Formulary;
use keg_common::pipeline::{
    ArtifactChoice, DownloadOutcome, InstallReport, JobOutcome, JobProcessingState,
    PipelineEvent, PlannedJob, WorkerJob,
};
use keg_net::build_http_client;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

use super::downloader::DownloadCoordinator;
use super::engine::{get_panic_message, start_worker_pool_manager, PipelineContext};
use super::planner::OperationPlanner;

const WORKER_JOB_CHANNEL_SIZE: usize = 100;
const DOWNLOAD_OUTCOME_CHANNEL_SIZE: usize = 100;
const SUPERVISION_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct PipelineFlags {
    /// Build every formula in the tree from source.
    pub build_from_source: bool,
    pub include_optional: bool,
    /// Install the requested formulae from their HEAD sources.
    pub head: bool,
}

/// Runner-side bookkeeping for every planned job.
struct JobBoard {
    jobs: Vec<PlannedJob>,
    states: HashMap<String, JobProcessingState>,
    jobs_pending_or_active: usize,
    policy: FailurePolicy,
    report: InstallReport,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl JobBoard {
    fn new(
        jobs: Vec<PlannedJob>,
        policy: FailurePolicy,
        event_tx: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        let states = jobs
            .iter()
            .map(|j| (j.target_id.clone(), JobProcessingState::PendingDownload))
            .collect();
        let jobs_pending_or_active = jobs.len();
        Self {
            jobs,
            states,
            jobs_pending_or_active,
            policy,
            report: InstallReport::default(),
            event_tx,
        }
    }

    fn is_finished(&self, job_id: &str) -> bool {
        self.states.get(job_id).is_some_and(|s| s.is_finished())
    }

    fn is_not_started(&self, job_id: &str) -> bool {
        match self.states.get(job_id) {
            Some(JobProcessingState::DispatchedToCore(_)) | None => false,
            Some(state) => !state.is_finished(),
        }
    }

    fn finish(&mut self, job_id: &str, state: JobProcessingState) {
        self.states.insert(job_id.to_string(), state);
        self.jobs_pending_or_active = self.jobs_pending_or_active.saturating_sub(1);
    }

    fn succeed(&mut self, job_id: &str) {
        if self.is_finished(job_id) {
            debug!("[{}] Already finished; ignoring success.", job_id);
            return;
        }
        self.finish(job_id, JobProcessingState::Succeeded);
        self.report.succeeded.push(job_id.to_string());
    }

    fn fail(&mut self, job_id: &str, error: KegError) {
        if self.is_finished(job_id) {
            debug!("[{}] Already finished; ignoring failure: {}", job_id, error);
            return;
        }
        self.finish(job_id, JobProcessingState::Failed(Arc::new(error.clone())));
        self.report.failed.push((job_id.to_string(), error));
        self.propagate_failure(job_id);
    }

    fn skip(&mut self, job_id: &str, reason: String) {
        if self.is_finished(job_id) {
            return;
        }
        debug!("[{}] Skipped: {}", job_id, reason);
        self.event_tx
            .send(PipelineEvent::JobSkipped {
                target_id: job_id.to_string(),
                reason: reason.clone(),
            })
            .ok();
        self.finish(job_id, JobProcessingState::Skipped(reason.clone()));
        self.report.skipped.push((job_id.to_string(), reason));
    }

    fn propagate_failure(&mut self, failed_id: &str) {
        match self.policy {
            FailurePolicy::FailFast => {
                self.skip_not_started(&format!("{failed_id} failed"));
            }
            FailurePolicy::ContinueIndependent => {
                for dependent in self.dependents_of(failed_id) {
                    self.skip(&dependent, format!("depends on {failed_id}, which failed"));
                }
            }
        }
    }

    /// Unfinished jobs that depend on `failed_id`, directly or transitively.
    fn dependents_of(&self, failed_id: &str) -> Vec<String> {
        let mut broken: HashSet<&str> = HashSet::from([failed_id]);
        let mut dependents = Vec::new();
        // Jobs are in dependency order, so one pass sees every chain.
        for job in &self.jobs {
            if job
                .node
                .dependencies
                .iter()
                .any(|d| broken.contains(d.as_str()))
            {
                broken.insert(&job.target_id);
                if !self.is_finished(&job.target_id) {
                    dependents.push(job.target_id.clone());
                }
            }
        }
        dependents
    }

    fn skip_not_started(&mut self, reason: &str) {
        let not_started: Vec<String> = self
            .jobs
            .iter()
            .filter(|j| self.is_not_started(&j.target_id))
            .map(|j| j.target_id.clone())
            .collect();
        for job_id in not_started {
            self.skip(&job_id, reason.to_string());
        }
    }

    fn process_download_outcome(&mut self, outcome: DownloadOutcome) {
        let job_id = outcome.planned_job.target_id;
        if self.is_finished(&job_id) {
            debug!("[{}] Download outcome for a finished job ignored.", job_id);
            return;
        }
        match outcome.result {
            Ok(path) => {
                debug!("[{}] Downloaded to {}", job_id, path.display());
                self.states
                    .insert(job_id, JobProcessingState::WaitingForDependencies(path));
            }
            Err(e) => {
                warn!("[{}] Download failed: {}", job_id, e);
                self.event_tx
                    .send(PipelineEvent::job_failed(job_id.clone(), &e))
                    .ok();
                self.fail(&job_id, e);
            }
        }
    }

    fn process_job_outcome(&mut self, outcome: JobOutcome) {
        match outcome.result {
            Ok(record) => {
                debug!(
                    "[{}] Installed {} ({})",
                    outcome.target_id, record.version, record.install_kind
                );
                self.succeed(&outcome.target_id);
            }
            Err(e) => self.fail(&outcome.target_id, e),
        }
    }

    /// Hands every job whose in-plan dependencies have all succeeded to the
    /// worker pool.
    fn dispatch_ready(&mut self, worker_job_tx: &CrossbeamSender<WorkerJob>) {
        let mut ready = Vec::new();
        for job in &self.jobs {
            let Some(JobProcessingState::WaitingForDependencies(path)) =
                self.states.get(&job.target_id)
            else {
                continue;
            };
            let dependencies_done = job
                .node
                .dependencies
                .iter()
                .filter_map(|d| self.states.get(d.as_str()))
                .all(|s| matches!(s, JobProcessingState::Succeeded));
            if dependencies_done {
                ready.push(WorkerJob {
                    request: job.clone(),
                    download_path: path.clone(),
                    download_size_bytes: fs::metadata(path).map(|m| m.len()).unwrap_or(0),
                });
            }
        }

        for worker_job in ready {
            let job_id = worker_job.request.target_id.clone();
            self.states.insert(
                job_id.clone(),
                JobProcessingState::DispatchedToCore(worker_job.download_path.clone()),
            );
            if worker_job_tx.send(worker_job).is_err() {
                error!("[{}] Worker pool is gone; cannot dispatch.", job_id);
                self.fail(
                    &job_id,
                    KegError::Generic("worker pool stopped accepting jobs".to_string()),
                );
                continue;
            }
            debug!("[{}] Dispatched to worker pool.", job_id);
            self.event_tx
                .send(PipelineEvent::JobDispatchedToCore { target_id: job_id })
                .ok();
        }
    }

    fn has_work_in_flight(&self, downloads_closed: bool, core_closed: bool) -> bool {
        self.states.values().any(|s| match s {
            JobProcessingState::DispatchedToCore(_) => !core_closed,
            JobProcessingState::PendingDownload | JobProcessingState::Downloading => {
                !downloads_closed
            }
            _ => false,
        })
    }

    /// Finishes jobs that can no longer make progress.
    fn resolve_stall(&mut self) {
        let stuck: Vec<(String, bool)> = self
            .jobs
            .iter()
            .filter_map(|j| match self.states.get(&j.target_id) {
                Some(JobProcessingState::WaitingForDependencies(_)) => {
                    Some((j.target_id.clone(), false))
                }
                Some(s) if !s.is_finished() => Some((j.target_id.clone(), true)),
                _ => None,
            })
            .collect();
        if stuck.is_empty() {
            return;
        }
        warn!("Pipeline stalled with {} unfinished job(s)", stuck.len());
        for (job_id, lost) in stuck {
            if lost {
                self.fail(
                    &job_id,
                    KegError::Generic(format!("{job_id} ended without reporting a result")),
                );
            } else {
                self.skip(&job_id, "dependencies never completed".to_string());
            }
        }
    }
}

/// Plans `initial_targets`, downloads their artifacts and installs them on
/// the worker pool in dependency order.
///
/// Planning errors (unknown formulae, cycles) are returned before anything
/// is fetched. Failures during installation are collected into the returned
/// [`InstallReport`]; completed installs are kept.
#[instrument(skip_all, fields(targets = ?initial_targets))]
pub async fn run_pipeline(
    initial_targets: &[String],
    formulary: &Formulary,
    flags: &PipelineFlags,
    ctx: PipelineContext,
) -> Result<InstallReport> {
    let start_time = Instant::now();
    let event_tx = ctx.event_tx.clone();

    let planned = {
        let planner =
            OperationPlanner::new(&ctx.config, formulary, &ctx.state, flags, event_tx.clone());
        planner.plan_operations(initial_targets).map_err(|e| {
            error!("Fatal planning error: {}", e);
            e
        })?
    };

    for name in &planned.already_installed {
        event_tx
            .send(PipelineEvent::LogInfo {
                message: format!("{name} is already installed"),
            })
            .ok();
    }
    let mut board = JobBoard::new(planned.jobs, ctx.config.failure_policy, event_tx.clone());
    board.report.already_installed = planned.already_installed;

    if board.jobs.is_empty() {
        debug!("Nothing to install.");
        event_tx
            .send(PipelineEvent::PipelineFinished {
                duration_secs: start_time.elapsed().as_secs_f64(),
                success_count: 0,
                fail_count: 0,
                skipped_count: 0,
            })
            .ok();
        return Ok(board.report);
    }

    let mut downloads = Vec::new();
    for job in &board.jobs {
        let state = if job.artifact == ArtifactChoice::Head {
            JobProcessingState::WaitingForDependencies(ctx.cache.head_checkout_dir(&job.target_id))
        } else {
            downloads.push(job.clone());
            JobProcessingState::Downloading
        };
        board.states.insert(job.target_id.clone(), state);
    }
    let http_client = if downloads.is_empty() {
        None
    } else {
        Some(Arc::new(build_http_client()?))
    };

    event_tx
        .send(PipelineEvent::PipelineStarted {
            total_jobs: board.jobs.len(),
        })
        .ok();

    let (worker_job_tx, worker_job_rx) = crossbeam_bounded::<WorkerJob>(WORKER_JOB_CHANNEL_SIZE);
    let (job_outcome_tx, mut job_outcome_rx) = mpsc::unbounded_channel::<JobOutcome>();
    let core_ctx = ctx.clone();
    let core_handle = std::thread::spawn(move || {
        start_worker_pool_manager(core_ctx, worker_job_rx, job_outcome_tx)
    });

    let (download_outcome_tx, mut download_outcome_rx) =
        mpsc::channel::<DownloadOutcome>(DOWNLOAD_OUTCOME_CHANNEL_SIZE);
    let mut downloads_closed = downloads.is_empty();
    let download_handle = match http_client {
        Some(http_client) => {
            let coordinator = DownloadCoordinator::new(
                ctx.cache.clone(),
                http_client,
                event_tx.clone(),
                ctx.cancel.clone(),
                ctx.config.max_concurrent_downloads,
            );
            Some(tokio::spawn(
                coordinator.coordinate_downloads(downloads, download_outcome_tx),
            ))
        }
        None => {
            drop(download_outcome_tx);
            None
        }
    };

    board.dispatch_ready(&worker_job_tx);

    let mut ticker = tokio::time::interval(SUPERVISION_INTERVAL);
    let mut core_closed = false;
    let mut cancellation_seen = false;
    debug!(
        "Entering runner loop with {} job(s) pending",
        board.jobs_pending_or_active
    );
    while board.jobs_pending_or_active > 0 {
        tokio::select! {
            biased;
            outcome = job_outcome_rx.recv(), if !core_closed => match outcome {
                Some(outcome) => board.process_job_outcome(outcome),
                None => {
                    warn!("Worker pool closed its outcome channel early");
                    core_closed = true;
                }
            },
            outcome = download_outcome_rx.recv(), if !downloads_closed => match outcome {
                Some(outcome) => board.process_download_outcome(outcome),
                None => downloads_closed = true,
            },
            _ = ticker.tick() => {
                if ctx.cancel.is_cancelled() && !cancellation_seen {
                    cancellation_seen = true;
                    warn!("Cancellation requested; skipping jobs that have not started");
                    event_tx
                        .send(PipelineEvent::LogWarn {
                            message: "Interrupted; jobs that had not started were skipped".to_string(),
                        })
                        .ok();
                    board.skip_not_started("cancelled");
                } else if !board.has_work_in_flight(downloads_closed, core_closed) {
                    board.resolve_stall();
                }
            }
        }
        if !ctx.cancel.is_cancelled() {
            board.dispatch_ready(&worker_job_tx);
        }
    }
    debug!("Runner loop finished");

    drop(worker_job_tx);
    if let Some(handle) = download_handle {
        handle.abort();
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(
                    "Download coordinator panicked: {}",
                    get_panic_message(e.into_panic())
                );
            }
        }
    }
    match core_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Core worker pool manager failed: {}", e),
        Err(e) => error!(
            "Core worker pool manager panicked: {}",
            get_panic_message(e)
        ),
    }

    let report = board.report;
    let duration = start_time.elapsed();
    info!(
        "Pipeline finished in {:.2}s: {} installed, {} failed, {} skipped",
        duration.as_secs_f64(),
        report.succeeded.len(),
        report.failed.len(),
        report.skipped.len()
    );
    event_tx
        .send(PipelineEvent::PipelineFinished {
            duration_secs: duration.as_secs_f64(),
            success_count: report.succeeded.len(),
            fail_count: report.failed.len(),
            skipped_count: report.skipped.len(),
        })
        .ok();
    Ok(report)
}
