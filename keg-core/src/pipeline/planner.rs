// keg-core/src/pipeline/planner.rs
// Turns command-line targets into an ordered list of planned jobs.

use keg_common::config::Config;
use keg_common::dependency::resolver::{
    DependencyResolver, NodeInstallStrategy, PerTargetInstallPreferences, PlanNode,
    ResolutionContext,
};
use keg_common::error::{KegError, Result};
use keg_common::formulary::Formulary;
use keg_common::model::formula::Formula;
use keg_common::pipeline::{ArtifactChoice, PipelineEvent, PlannedJob, PlannedOperations};
use keg_common::state::InstallStateStore;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use super::runner::PipelineFlags;
use crate::install::bottle::{best_bottle, select_artifact};

pub struct OperationPlanner<'a> {
    config: &'a Config,
    formulary: &'a Formulary,
    state: &'a InstallStateStore,
    flags: &'a PipelineFlags,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl<'a> OperationPlanner<'a> {
    pub fn new(
        config: &'a Config,
        formulary: &'a Formulary,
        state: &'a InstallStateStore,
        flags: &'a PipelineFlags,
        event_tx: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            config,
            formulary,
            state,
            flags,
            event_tx,
        }
    }

    /// Resolves `targets` and picks an artifact for every formula that has
    /// to be installed. Fails as a whole; no partial plan is returned.
    #[instrument(skip(self), name = "plan_operations")]
    pub fn plan_operations(&self, targets: &[String]) -> Result<PlannedOperations> {
        self.event_tx.send(PipelineEvent::PlanningStarted).ok();

        let install_targets = targets
            .iter()
            .map(|raw| self.formulary.parse_target(raw))
            .collect::<Result<Vec<_>>>()?;

        let mut preferences = PerTargetInstallPreferences::default();
        if self.flags.head {
            for target in &install_targets {
                preferences.head_targets.insert(target.name.clone());
            }
        }

        let cellar = self.config.cellar_dir();
        let host = &self.config.platform_tag;
        let has_bottle = |formula: &Formula| best_bottle(formula, host, &cellar).is_some();
        let context = ResolutionContext {
            formulary: self.formulary,
            state: self.state,
            include_optional: self.flags.include_optional,
            include_test: false,
            skip_recommended: false,
            initial_target_preferences: &preferences,
            build_all_from_source: self.flags.build_from_source || self.config.build_from_source,
            has_bottle_for_current_platform: &has_bottle,
        };
        let plan = DependencyResolver::new(context).resolve_targets(&install_targets)?;
        debug!("Resolved build order: {:?}", plan.names());

        let jobs = plan
            .nodes
            .into_iter()
            .map(|node| self.plan_job(node))
            .collect::<Result<Vec<_>>>()?;

        self.event_tx
            .send(PipelineEvent::PlanningFinished {
                job_count: jobs.len(),
            })
            .ok();
        Ok(PlannedOperations {
            jobs,
            already_installed: plan.already_satisfied,
        })
    }

    fn plan_job(&self, node: PlanNode) -> Result<PlannedJob> {
        let formula = node.formula.clone();
        let artifact = if node.head {
            ArtifactChoice::Head
        } else {
            select_artifact(
                &formula,
                &self.config.platform_tag,
                node.strategy == NodeInstallStrategy::SourceOnly,
                &self.config.cellar_dir(),
            )
        };

        let (url, sha256) = match &artifact {
            ArtifactChoice::Bottle(bottle) => {
                let url = formula.bottle_url(bottle).ok_or_else(|| {
                    KegError::InstallError(format!(
                        "bottle {} of {} has no download location",
                        bottle.platform_tag,
                        formula.name()
                    ))
                })?;
                (url, bottle.sha256.clone())
            }
            ArtifactChoice::Source => {
                if !formula.has_source() {
                    return Err(KegError::InstallError(format!(
                        "{} has no usable bottle for {} and no source url",
                        formula.name(),
                        self.config.platform_tag
                    )));
                }
                (formula.url.clone(), formula.sha256.clone())
            }
            ArtifactChoice::Head => {
                let head = formula.head.as_ref().ok_or_else(|| {
                    KegError::InstallError(format!("{} has no HEAD source", formula.name()))
                })?;
                (head.url.clone(), String::new())
            }
        };
        debug!("[{}] Planned {} from {}", formula.name(), artifact, url);

        Ok(PlannedJob {
            target_id: node.name().to_string(),
            node,
            artifact,
            url,
            sha256,
        })
    }
}
