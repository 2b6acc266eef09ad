// keg/src/cli/install.rs
use std::num::NonZeroUsize;
use std::sync::Arc;

use clap::Args;
use keg_common::cache::Cache;
use keg_common::config::{Config, FailurePolicy};
use keg_common::error::Result;
use keg_common::formulary::Formulary;
use keg_common::pipeline::{CancellationFlag, PipelineEvent};
use keg_common::state::InstallStateStore;
use keg_core::{run_pipeline, PipelineContext, PipelineFlags};
use tokio::sync::broadcast;
use tracing::{instrument, warn};

use super::status;

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Args)]
pub struct InstallArgs {
    #[arg(required = true, value_name = "FORMULA[@VERSION]")]
    names: Vec<String>,

    #[arg(
        long,
        help = "Build every formula in the tree from source, even if bottles are available"
    )]
    build_from_source: bool,
    #[arg(long = "HEAD", help = "Install the requested formulae from their HEAD sources")]
    head: bool,
    #[arg(long, help = "Also install optional dependencies")]
    include_optional: bool,
    #[arg(
        long,
        help = "After a failure, keep installing formulae that do not depend on it"
    )]
    continue_on_failure: bool,
    #[arg(long, help = "Keep the working directory of a failed source build")]
    keep_work_dir: bool,
    #[arg(short, long, value_name = "N", help = "Number of concurrent builds")]
    jobs: Option<NonZeroUsize>,
}

impl InstallArgs {
    #[instrument(skip(self, config, cancel), fields(targets = ?self.names))]
    pub async fn run(&self, mut config: Config, cancel: CancellationFlag) -> Result<i32> {
        if let Some(jobs) = self.jobs {
            config.jobs = jobs.get();
        }
        if self.keep_work_dir {
            config.keep_work_dir_on_failure = true;
        }
        if self.continue_on_failure {
            config.failure_policy = FailurePolicy::ContinueIndependent;
        }

        let formulary = Formulary::init_global(&config)?;
        let state = Arc::new(InstallStateStore::from_config(&config)?);
        let cache = Arc::new(Cache::new(&config)?);
        let flags = PipelineFlags {
            build_from_source: self.build_from_source,
            include_optional: self.include_optional,
            head: self.head,
        };

        let (event_tx, event_rx) = broadcast::channel::<PipelineEvent>(EVENT_CHANNEL_SIZE);
        let status_handle = tokio::spawn(status::handle_events(event_rx));
        let ctx = PipelineContext {
            config,
            cache,
            state,
            cancel,
            event_tx,
        };

        let result = run_pipeline(&self.names, &formulary, &flags, ctx).await;
        if let Err(e) = status_handle.await {
            warn!("Status handler task failed: {}", e);
        }
        Ok(result?.exit_code())
    }
}
