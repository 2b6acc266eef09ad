// keg-core/src/lib.rs

pub mod build;
pub mod install;
pub mod pipeline;
pub mod uninstall;

pub use build::BuildExecutor;
pub use install::bottle::{best_bottle, select_artifact};
pub use pipeline::{run_pipeline, PipelineContext, PipelineFlags};
pub use uninstall::{uninstall_formula, UninstallOptions};
