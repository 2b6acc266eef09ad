// keg-core/src/pipeline/mod.rs
pub mod downloader;
pub mod engine;
pub mod planner;
pub mod runner;
mod worker;

pub use engine::{get_panic_message, start_worker_pool_manager, PipelineContext};
pub use planner::OperationPlanner;
pub use runner::{run_pipeline, PipelineFlags};
