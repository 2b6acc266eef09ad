// keg-common/src/pipeline.rs
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dependency::PlanNode;
use crate::error::{KegError, Result};
use crate::model::formula::BottleDescriptor;
use crate::state::{InstallKind, InstallRecord};

// --- Build executor phases ---

/// Phases of a single formula build, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BuildPhase {
    Pending,
    Fetching,
    Verifying,
    Extracting,
    Unpacking,
    Configuring,
    Compiling,
    Installing,
    Done,
    Failed,
}

impl BuildPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildPhase::Done | BuildPhase::Failed)
    }

    /// Whether the executor may move from `self` to `next`.
    ///
    /// Phases only move forward and may skip phases a formula has no steps
    /// for. Source builds extract and bottles unpack, never both. `Done` is
    /// only reachable from `Installing`; `Failed` from any non-terminal phase.
    pub fn can_transition_to(self, next: BuildPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            BuildPhase::Failed => true,
            BuildPhase::Done => self == BuildPhase::Installing,
            BuildPhase::Pending => false,
            BuildPhase::Unpacking if self == BuildPhase::Extracting => false,
            BuildPhase::Configuring | BuildPhase::Compiling if self == BuildPhase::Unpacking => {
                false
            }
            _ => next > self,
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildPhase::Pending => "pending",
            BuildPhase::Fetching => "fetching",
            BuildPhase::Verifying => "verifying",
            BuildPhase::Extracting => "extracting",
            BuildPhase::Unpacking => "unpacking",
            BuildPhase::Configuring => "configuring",
            BuildPhase::Compiling => "compiling",
            BuildPhase::Installing => "installing",
            BuildPhase::Done => "done",
            BuildPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

// --- Planning ---

/// What the executor installs for a planned formula.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactChoice {
    Bottle(BottleDescriptor),
    Source,
    Head,
}

impl ArtifactChoice {
    pub fn install_kind(&self) -> InstallKind {
        match self {
            ArtifactChoice::Bottle(_) => InstallKind::Bottle,
            ArtifactChoice::Source => InstallKind::Source,
            ArtifactChoice::Head => InstallKind::Head,
        }
    }

    pub fn is_source_build(&self) -> bool {
        !matches!(self, ArtifactChoice::Bottle(_))
    }
}

impl fmt::Display for ArtifactChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactChoice::Bottle(b) if b.rebuild > 0 => {
                write!(f, "bottle ({}, rebuild {})", b.platform_tag, b.rebuild)
            }
            ArtifactChoice::Bottle(b) => write!(f, "bottle ({})", b.platform_tag),
            ArtifactChoice::Source => f.write_str("source"),
            ArtifactChoice::Head => f.write_str("HEAD"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub target_id: String,
    pub node: PlanNode,
    pub artifact: ArtifactChoice,
    /// Location to fetch the artifact from; a git url for HEAD checkouts.
    pub url: String,
    /// Expected SHA-256 of the artifact; empty for HEAD checkouts.
    pub sha256: String,
}

/// Structure returned by the planner.
#[derive(Debug, Default)]
pub struct PlannedOperations {
    /// Topologically sorted; every job follows its in-plan dependencies.
    pub jobs: Vec<PlannedJob>,
    pub already_installed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub request: PlannedJob,
    pub download_path: PathBuf,
    pub download_size_bytes: u64,
}

/// Outcome of a download attempt, sent from the download coordinator to the
/// runner loop.
#[derive(Debug)]
pub struct DownloadOutcome {
    pub planned_job: PlannedJob,
    pub result: Result<PathBuf>,
}

/// Outcome of a worker job, sent from the worker pool to the runner loop.
#[derive(Debug)]
pub struct JobOutcome {
    pub target_id: String,
    pub result: Result<InstallRecord>,
}

/// Current processing state of a job in the runner.
#[derive(Debug, Clone)]
pub enum JobProcessingState {
    PendingDownload,
    Downloading,
    /// Downloaded, but waiting for in-plan dependencies to succeed.
    WaitingForDependencies(PathBuf),
    DispatchedToCore(PathBuf),
    Succeeded,
    Failed(Arc<KegError>),
    Skipped(String),
}

impl JobProcessingState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobProcessingState::Succeeded
                | JobProcessingState::Failed(_)
                | JobProcessingState::Skipped(_)
        )
    }
}

// --- Events ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        total_jobs: usize,
    },
    PipelineFinished {
        duration_secs: f64,
        success_count: usize,
        fail_count: usize,
        skipped_count: usize,
    },
    PlanningStarted,
    PlanningFinished {
        job_count: usize,
    },
    DownloadStarted {
        target_id: String,
        url: String,
    },
    DownloadFinished {
        target_id: String,
        path: PathBuf,
        size_bytes: u64,
    },
    DownloadFailed {
        target_id: String,
        url: String,
        error: String,
    },
    JobDispatchedToCore {
        target_id: String,
    },
    PhaseChanged {
        target_id: String,
        phase: BuildPhase,
    },
    JobSuccess {
        target_id: String,
        version: String,
        kind: InstallKind,
    },
    JobFailed {
        target_id: String,
        error: String,
    },
    JobSkipped {
        target_id: String,
        reason: String,
    },
    LogInfo {
        message: String,
    },
    LogWarn {
        message: String,
    },
}

impl PipelineEvent {
    pub fn job_failed(target_id: String, error: &KegError) -> Self {
        PipelineEvent::JobFailed {
            target_id,
            error: error.to_string(),
        }
    }

    pub fn download_failed(target_id: String, url: String, error: &KegError) -> Self {
        PipelineEvent::DownloadFailed {
            target_id,
            url,
            error: error.to_string(),
        }
    }
}

// --- Run summary ---

#[derive(Debug, Default)]
pub struct InstallReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, KegError)>,
    pub skipped: Vec<(String, String)>,
    pub already_installed: Vec<String>,
}

impl InstallReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn first_error(&self) -> Option<&KegError> {
        self.failed.first().map(|(_, e)| e)
    }

    pub fn exit_code(&self) -> i32 {
        match self.first_error() {
            Some(e) => e.exit_code(),
            None if self.skipped.is_empty() => 0,
            None => 1,
        }
    }
}

// --- Cancellation ---

/// Cooperative cancellation shared by the runner, the download coordinator
/// and every executor. Checked between steps, never mid-command.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self, context: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(KegError::Cancelled(context.to_string()))
        } else {
            Ok(())
        }
    }
}
