// keg-core/src/pipeline/worker.rs
use keg_common::error::Result;
use keg_common::pipeline::{ArtifactChoice, PipelineEvent, WorkerJob};
use keg_common::state::InstallRecord;
use tracing::{debug, instrument};

use super::engine::PipelineContext;
use crate::build::BuildExecutor;

#[instrument(skip_all, fields(job_id = %worker_job.request.target_id, artifact = %worker_job.request.artifact))]
pub(super) fn execute_sync_job(worker_job: WorkerJob, ctx: &PipelineContext) -> Result<InstallRecord> {
    let job = worker_job.request;
    // HEAD checkouts happen inside the executor; everything else arrives downloaded.
    let download_path = match job.artifact {
        ArtifactChoice::Head => None,
        _ => Some(worker_job.download_path),
    };
    debug!(
        "[{}] Starting executor ({} bytes prefetched)",
        job.target_id, worker_job.download_size_bytes
    );

    let target_id = job.target_id.clone();
    let event_tx = ctx.event_tx.clone();
    let mut executor = BuildExecutor::new(&ctx.config, &ctx.cache, &ctx.state, ctx.cancel.clone())
        .with_observer(move |phase| {
            let _ = event_tx.send(PipelineEvent::PhaseChanged {
                target_id: target_id.clone(),
                phase,
            });
        });
    executor.execute(&job, download_path.as_deref())
}
