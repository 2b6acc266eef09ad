// keg-common/src/lib.rs
pub mod cache;
pub mod config;
pub mod dependency;
pub mod error;
pub mod formulary;
pub mod model;
pub mod pipeline;
pub mod state;

// Re-export key types
pub use cache::Cache;
pub use config::Config;
pub use error::{KegError, Result};
pub use formulary::{Formulary, InstallTarget};
pub use model::Formula;
pub use state::{InstallKind, InstallRecord, InstallStateStore};
