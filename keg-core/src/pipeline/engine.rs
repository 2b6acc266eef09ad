// keg-core/src/pipeline/engine.rs
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::Receiver as CrossbeamReceiver;
use keg_common::cache::Cache;
use keg_common::config::Config;
use keg_common::error::{KegError, Result};
use keg_common::pipeline::{CancellationFlag, JobOutcome, PipelineEvent, WorkerJob};
use keg_common::state::InstallStateStore;
use threadpool::ThreadPool;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, instrument, warn};

use super::worker;

/// Handles shared by the runner loop, the download coordinator and every worker.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Config,
    pub cache: Arc<Cache>,
    pub state: Arc<InstallStateStore>,
    pub cancel: CancellationFlag,
    pub event_tx: broadcast::Sender<PipelineEvent>,
}

pub fn get_panic_message(e: Box<dyn Any + Send>) -> String {
    match e.downcast_ref::<&'static str>() {
        Some(s) => (*s).to_string(),
        None => match e.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "Unknown panic payload".to_string(),
        },
    }
}

/// Runs jobs from `worker_job_rx` on a pool of `config.jobs` threads until
/// the channel closes, reporting each result on `outcome_tx`. Blocks until
/// every submitted job has finished.
#[instrument(skip_all, name = "core_worker_manager")]
pub fn start_worker_pool_manager(
    ctx: PipelineContext,
    worker_job_rx: CrossbeamReceiver<WorkerJob>,
    outcome_tx: mpsc::UnboundedSender<JobOutcome>,
) -> Result<()> {
    let num_workers = ctx.config.jobs.max(1);
    let pool = ThreadPool::new(num_workers);
    debug!("Core worker pool manager started with {} workers.", num_workers);

    for worker_job in worker_job_rx {
        let job_id = worker_job.request.target_id.clone();
        debug!("[{}] Submitting job to worker pool.", job_id);
        let ctx = ctx.clone();
        let outcome_tx = outcome_tx.clone();

        pool.execute(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                worker::execute_sync_job(worker_job, &ctx)
            }))
            .unwrap_or_else(|payload| {
                Err(KegError::Generic(format!(
                    "worker panicked: {}",
                    get_panic_message(payload)
                )))
            });

            match &result {
                Ok(record) => {
                    debug!("[{}] Worker finished successfully.", job_id);
                    let _ = ctx.event_tx.send(PipelineEvent::JobSuccess {
                        target_id: job_id.clone(),
                        version: record.version.clone(),
                        kind: record.install_kind,
                    });
                }
                Err(e) => {
                    let _ = ctx
                        .event_tx
                        .send(PipelineEvent::job_failed(job_id.clone(), e));
                }
            }
            if outcome_tx
                .send(JobOutcome {
                    target_id: job_id.clone(),
                    result,
                })
                .is_err()
            {
                warn!("[{}] Runner stopped listening; outcome dropped.", job_id);
            }
        });
    }
    pool.join();
    debug!("Core worker pool drained.");
    Ok(())
}
